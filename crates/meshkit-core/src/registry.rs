//! The service registry capability.

use async_trait::async_trait;

use meshkit_types::{Result, Service, WatchEvent};

/// A registry of service records, watchable for mutations.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn register(&self, service: &Service) -> Result<()>;

    async fn deregister(&self, service: &Service) -> Result<()>;

    /// Returns one `Service` per registered version of `name`.
    async fn get_service(&self, name: &str) -> Result<Vec<Service>>;

    async fn list_services(&self) -> Result<Vec<Service>>;

    async fn watch(&self) -> Result<Box<dyn Watcher>>;
}

/// A server-streamed sequence of registry mutation events.
#[async_trait]
pub trait Watcher: Send + Sync {
    /// Blocks until the next event. After [`stop`](Watcher::stop) the
    /// stream ends with an error.
    async fn next(&mut self) -> Result<WatchEvent>;

    fn stop(&self);
}
