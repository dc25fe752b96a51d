//! Watch-event reconciliation.
//!
//! The cache maps a service name to one entry per version. Every watch
//! event folds into the cache through [`apply`]; the worker is the
//! only writer, and each entry is replaced wholesale so readers never
//! see a half-merged list.

use std::collections::HashMap;

use meshkit_types::{Service, WatchAction, WatchEvent};

/// Folds one watch event into the cache.
///
/// - Unknown name: `create`/`update` with a non-empty version inserts
///   the service; anything else is a no-op.
/// - An event with no nodes only acts on `delete`, which drops the
///   whole name.
/// - `create`/`update` for a known version merges: nodes from the old
///   entry survive unless the event carries a node with the same id.
/// - `delete` removes exactly the listed nodes, collapsing the version
///   when none remain and the name when no versions remain.
pub(crate) fn apply(cache: &mut HashMap<String, Vec<Service>>, event: &WatchEvent) {
    let name = &event.service.name;

    let Some(versions) = cache.get(name) else {
        if matches!(event.action, WatchAction::Create | WatchAction::Update)
            && !event.service.version.is_empty()
        {
            cache.insert(name.clone(), vec![event.service.clone()]);
        }
        return;
    };

    if event.service.nodes.is_empty() {
        if event.action == WatchAction::Delete {
            cache.remove(name);
        }
        return;
    }

    let slot = versions
        .iter()
        .position(|s| s.version == event.service.version);
    let mut next = versions.clone();

    match event.action {
        WatchAction::Create | WatchAction::Update => {
            match slot {
                None => next.push(event.service.clone()),
                Some(i) => {
                    let mut merged = event.service.clone();
                    for old in &next[i].nodes {
                        if !merged.nodes.iter().any(|n| n.id == old.id) {
                            merged.nodes.push(old.clone());
                        }
                    }
                    next[i] = merged;
                }
            }
            cache.insert(name.clone(), next);
        }
        WatchAction::Delete => {
            let Some(i) = slot else { return };

            let remaining: Vec<_> = next[i]
                .nodes
                .iter()
                .filter(|n| !event.service.nodes.iter().any(|d| d.id == n.id))
                .cloned()
                .collect();

            if remaining.is_empty() {
                next.remove(i);
                if next.is_empty() {
                    cache.remove(name);
                } else {
                    cache.insert(name.clone(), next);
                }
            } else {
                next[i].nodes = remaining;
                cache.insert(name.clone(), next);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use meshkit_types::Node;

    use super::*;

    fn event(action: WatchAction, name: &str, version: &str, nodes: &[&str]) -> WatchEvent {
        let mut service = Service::new(name, version);
        for id in nodes {
            service.nodes.push(Node::new(*id, format!("{id}.host:8080")));
        }
        WatchEvent::new(action, service)
    }

    #[test]
    fn create_update_delete_merge_chain() {
        let mut cache = HashMap::new();

        apply(&mut cache, &event(WatchAction::Create, "s", "v1", &["n1"]));
        apply(&mut cache, &event(WatchAction::Update, "s", "v1", &["n2"]));
        apply(&mut cache, &event(WatchAction::Delete, "s", "v1", &["n1"]));

        let entry = &cache["s"];
        assert_eq!(entry.len(), 1);
        let ids: Vec<_> = entry[0].nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, ["n2"]);
    }

    #[test]
    fn deleting_the_final_node_drops_the_name() {
        let mut cache = HashMap::new();

        apply(&mut cache, &event(WatchAction::Create, "s", "v1", &["n1"]));
        apply(&mut cache, &event(WatchAction::Update, "s", "v1", &["n2"]));
        apply(&mut cache, &event(WatchAction::Delete, "s", "v1", &["n1"]));
        apply(&mut cache, &event(WatchAction::Delete, "s", "v1", &["n2"]));

        assert!(!cache.contains_key("s"));
    }

    #[test]
    fn delete_of_one_version_keeps_the_others() {
        let mut cache = HashMap::new();

        apply(&mut cache, &event(WatchAction::Create, "s", "v1", &["n1"]));
        apply(&mut cache, &event(WatchAction::Create, "s", "v2", &["n2"]));
        apply(&mut cache, &event(WatchAction::Delete, "s", "v1", &["n1"]));

        let entry = &cache["s"];
        assert_eq!(entry.len(), 1);
        assert_eq!(entry[0].version, "v2");
    }

    #[test]
    fn unknown_name_ignores_delete_and_versionless_create() {
        let mut cache = HashMap::new();

        apply(&mut cache, &event(WatchAction::Delete, "s", "v1", &["n1"]));
        assert!(cache.is_empty());

        apply(&mut cache, &event(WatchAction::Create, "s", "", &["n1"]));
        assert!(cache.is_empty());
    }

    #[test]
    fn empty_node_delete_drops_the_whole_name() {
        let mut cache = HashMap::new();

        apply(&mut cache, &event(WatchAction::Create, "s", "v1", &["n1"]));
        apply(&mut cache, &event(WatchAction::Create, "s", "v2", &["n2"]));
        apply(&mut cache, &event(WatchAction::Delete, "s", "v1", &[]));

        assert!(!cache.contains_key("s"));
    }

    /// Order-insensitive view for comparing terminal states.
    fn normalize(
        cache: &HashMap<String, Vec<Service>>,
    ) -> BTreeMap<String, BTreeMap<String, Vec<String>>> {
        cache
            .iter()
            .map(|(name, versions)| {
                let by_version = versions
                    .iter()
                    .map(|s| {
                        let mut ids: Vec<_> =
                            s.nodes.iter().map(|n| n.id.clone()).collect();
                        ids.sort();
                        (s.version.clone(), ids)
                    })
                    .collect();
                (name.clone(), by_version)
            })
            .collect()
    }

    fn arb_event() -> impl Strategy<Value = WatchEvent> {
        (
            prop_oneof![
                Just(WatchAction::Create),
                Just(WatchAction::Update),
                Just(WatchAction::Delete),
            ],
            prop_oneof![Just("alpha"), Just("beta")],
            prop_oneof![Just("v1"), Just("v2")],
            proptest::collection::vec(prop_oneof![Just("n1"), Just("n2"), Just("n3")], 0..3),
        )
            .prop_map(|(action, name, version, nodes)| {
                let nodes: Vec<&str> = nodes;
                event(action, name, version, &nodes)
            })
    }

    proptest! {
        // The cache is exactly the fold of `apply` over the event
        // sequence, and replaying the sequence onto the terminal
        // state reproduces it.
        #[test]
        fn replay_reaches_the_same_terminal_state(
            events in proptest::collection::vec(arb_event(), 0..12)
        ) {
            let mut once = HashMap::new();
            for ev in &events {
                apply(&mut once, ev);
            }

            let mut twice = once.clone();
            for ev in &events {
                apply(&mut twice, ev);
            }

            prop_assert_eq!(normalize(&once), normalize(&twice));
        }

        // Folding is deterministic across runs.
        #[test]
        fn fold_is_deterministic(
            events in proptest::collection::vec(arb_event(), 0..12)
        ) {
            let mut a = HashMap::new();
            let mut b = HashMap::new();
            for ev in &events {
                apply(&mut a, ev);
                apply(&mut b, ev);
            }
            prop_assert_eq!(normalize(&a), normalize(&b));
        }
    }
}
