//! Well-known topic names shared across the fleet.

/// Discovery heartbeats, one [`meshkit_types::Heartbeat`] per message.
pub const HEARTBEAT_TOPIC: &str = "micro.discovery.heartbeat";

/// Discovery watch events mirrored onto the broker.
pub const WATCH_TOPIC: &str = "micro.discovery.watch";

/// KV ring membership announcements.
pub const GOSSIP_TOPIC: &str = "go.micro.kv.announce";

/// Router call-stats batches.
pub const STATS_TOPIC: &str = "go.micro.router.stats";

/// Finished trace spans.
pub const TRACE_TOPIC: &str = "platform.trace.span";

/// Platform event records.
pub const EVENT_TOPIC: &str = "platform.event.record";
