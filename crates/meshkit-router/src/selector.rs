//! The selector contract and the registry-backed fallback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use meshkit_core::Registry;
use meshkit_types::{Error, Node, Result, Service};

/// Narrows the candidate services before node selection.
pub type Filter = Arc<dyn Fn(Vec<Service>) -> Vec<Service> + Send + Sync>;

/// Per-select options.
#[derive(Clone, Default)]
pub struct SelectOptions {
    pub filters: Vec<Filter>,
}

impl SelectOptions {
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }
}

/// Keeps only services of one version.
pub fn filter_version(version: &str) -> Filter {
    let version = version.to_string();
    Arc::new(move |services| {
        services
            .into_iter()
            .filter(|s| s.version == version)
            .collect()
    })
}

/// Keeps only services carrying a metadata entry.
pub fn filter_metadata(key: &str, value: &str) -> Filter {
    let key = key.to_string();
    let value = value.to_string();
    Arc::new(move |services| {
        services
            .into_iter()
            .filter(|s| s.metadata.get(&key).map(String::as_str) == Some(value.as_str()))
            .collect()
    })
}

pub(crate) fn apply_filters(services: Vec<Service>, options: &SelectOptions) -> Vec<Service> {
    options
        .filters
        .iter()
        .fold(services, |candidates, filter| filter(candidates))
}

/// Yields one candidate node per call, round-robin.
pub struct Next {
    nodes: Vec<Node>,
    cursor: AtomicUsize,
}

impl Next {
    pub(crate) fn new(nodes: Vec<Node>) -> Self {
        Self { nodes, cursor: AtomicUsize::new(0) }
    }

    /// # Errors
    ///
    /// `NotAvailable` when the candidate set is empty.
    pub fn next(&self) -> Result<Node> {
        if self.nodes.is_empty() {
            return Err(Error::NotAvailable);
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed);
        Ok(self.nodes[i % self.nodes.len()].clone())
    }
}

/// The routing-decision interface exposed to callers.
#[async_trait]
pub trait Selector: Send + Sync {
    /// Resolves `service` into a [`Next`] iterator over its candidate
    /// nodes, honouring the filter options.
    async fn select(&self, service: &str, options: SelectOptions) -> Result<Next>;

    /// Feeds a call outcome back into the selection policy.
    async fn mark(&self, service: &str, node: &Node, error: Option<&Error>);

    /// Forgets everything learned about `service`.
    async fn reset(&self, service: &str);

    async fn close(&self);
}

/// Consecutive errors before a node is benched.
const BAN_THRESHOLD: u32 = 3;

#[derive(Debug, Default)]
struct MarkState {
    fails: u32,
    banned_until: Option<Instant>,
}

/// The fallback selector: raw registry lookups with a blacklist.
///
/// A node marked with [`BAN_THRESHOLD`] consecutive errors is skipped
/// for the penalty window; one successful mark clears it.
pub struct RegistrySelector {
    registry: Arc<dyn Registry>,
    penalty: Duration,
    marks: Mutex<HashMap<String, HashMap<String, MarkState>>>,
}

impl RegistrySelector {
    pub fn new(registry: Arc<dyn Registry>, penalty: Duration) -> Self {
        Self {
            registry,
            penalty,
            marks: Mutex::new(HashMap::new()),
        }
    }

    fn usable(&self, service: &str, node: &Node) -> bool {
        let marks = self.marks.lock().unwrap();
        let Some(state) = marks.get(service).and_then(|m| m.get(&node.id)) else {
            return true;
        };
        match state.banned_until {
            Some(until) => until <= Instant::now(),
            None => true,
        }
    }
}

#[async_trait]
impl Selector for RegistrySelector {
    async fn select(&self, service: &str, options: SelectOptions) -> Result<Next> {
        let services = self.registry.get_service(service).await?;
        let nodes: Vec<Node> = apply_filters(services, &options)
            .into_iter()
            .flat_map(|s| s.nodes)
            .filter(|node| self.usable(service, node))
            .collect();

        if nodes.is_empty() {
            return Err(Error::NotAvailable);
        }
        Ok(Next::new(nodes))
    }

    async fn mark(&self, service: &str, node: &Node, error: Option<&Error>) {
        let mut marks = self.marks.lock().unwrap();
        let for_service = marks.entry(service.to_string()).or_default();
        match error {
            Some(_) => {
                let state = for_service.entry(node.id.clone()).or_default();
                state.fails += 1;
                if state.fails >= BAN_THRESHOLD {
                    state.banned_until = Some(Instant::now() + self.penalty);
                }
            }
            None => {
                for_service.remove(&node.id);
            }
        }
    }

    async fn reset(&self, service: &str) {
        self.marks.lock().unwrap().remove(service);
    }

    async fn close(&self) {
        self.marks.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use meshkit_memory::MemoryRegistry;

    use super::*;

    fn service(version: &str, nodes: &[&str]) -> Service {
        let mut svc = Service::new("greeter", version);
        for id in nodes {
            svc.nodes.push(Node::new(*id, format!("{id}:8080")));
        }
        svc
    }

    async fn registry_with(services: &[Service]) -> Arc<MemoryRegistry> {
        let registry = Arc::new(MemoryRegistry::new());
        for svc in services {
            registry.register(svc).await.unwrap();
        }
        registry
    }

    #[tokio::test]
    async fn next_round_robins() {
        let next = Next::new(vec![
            Node::new("a", "a:1"),
            Node::new("b", "b:1"),
        ]);
        let picks: Vec<String> = (0..4).map(|_| next.next().unwrap().id).collect();
        assert_eq!(picks, ["a", "b", "a", "b"]);
    }

    #[tokio::test]
    async fn empty_candidates_are_not_available() {
        let next = Next::new(Vec::new());
        assert!(matches!(next.next(), Err(Error::NotAvailable)));
    }

    #[tokio::test]
    async fn version_filter_narrows_selection() {
        let registry =
            registry_with(&[service("v1", &["a"]), service("v2", &["b"])]).await;
        let selector = RegistrySelector::new(registry, Duration::from_secs(30));

        let options = SelectOptions::default().with_filter(filter_version("v2"));
        let next = selector.select("greeter", options).await.unwrap();
        assert_eq!(next.next().unwrap().id, "b");
    }

    #[tokio::test]
    async fn three_errors_bench_a_node_until_marked_good() {
        let registry = registry_with(&[service("v1", &["a", "b"])]).await;
        let selector = RegistrySelector::new(registry, Duration::from_secs(30));
        let bad = Node::new("a", "a:8080");

        for _ in 0..3 {
            selector
                .mark("greeter", &bad, Some(&Error::NotAvailable))
                .await;
        }

        let next = selector
            .select("greeter", SelectOptions::default())
            .await
            .unwrap();
        for _ in 0..4 {
            assert_eq!(next.next().unwrap().id, "b");
        }

        // A good mark clears the bench.
        selector.mark("greeter", &bad, None).await;
        let next = selector
            .select("greeter", SelectOptions::default())
            .await
            .unwrap();
        let picks: Vec<String> = (0..2).map(|_| next.next().unwrap().id).collect();
        assert!(picks.contains(&"a".to_string()));
    }

    #[tokio::test]
    async fn reset_forgets_the_bench() {
        let registry = registry_with(&[service("v1", &["a"])]).await;
        let selector = RegistrySelector::new(registry, Duration::from_secs(30));
        let node = Node::new("a", "a:8080");

        for _ in 0..3 {
            selector
                .mark("greeter", &node, Some(&Error::NotAvailable))
                .await;
        }
        assert!(matches!(
            selector.select("greeter", SelectOptions::default()).await,
            Err(Error::NotAvailable)
        ));

        selector.reset("greeter").await;
        assert!(
            selector
                .select("greeter", SelectOptions::default())
                .await
                .is_ok()
        );
    }
}
