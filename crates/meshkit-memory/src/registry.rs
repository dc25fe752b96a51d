//! An in-process service registry with watch streams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};

use meshkit_core::{Registry, Watcher};
use meshkit_types::{Error, Result, Service, WatchAction, WatchEvent};

#[derive(Default)]
struct Inner {
    services: Mutex<HashMap<String, Vec<Service>>>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<WatchEvent>>>,
}

/// A registry backed by a process-local map.
#[derive(Clone, Default)]
pub struct MemoryRegistry {
    inner: Arc<Inner>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn emit(&self, event: WatchEvent) {
        let mut watchers = self.inner.watchers.lock().unwrap();
        watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn register(&self, service: &Service) -> Result<()> {
        let action = {
            let mut services = self.inner.services.lock().unwrap();
            let versions = services.entry(service.name.clone()).or_default();
            match versions.iter_mut().find(|s| s.version == service.version) {
                Some(existing) => {
                    for node in &service.nodes {
                        if !existing.nodes.iter().any(|n| n.id == node.id) {
                            existing.nodes.push(node.clone());
                        }
                    }
                    WatchAction::Update
                }
                None => {
                    versions.push(service.clone());
                    WatchAction::Create
                }
            }
        };

        self.emit(WatchEvent::new(action, service.clone()));
        Ok(())
    }

    async fn deregister(&self, service: &Service) -> Result<()> {
        {
            let mut services = self.inner.services.lock().unwrap();
            if let Some(versions) = services.get_mut(&service.name) {
                if let Some(existing) = versions.iter_mut().find(|s| s.version == service.version)
                {
                    existing
                        .nodes
                        .retain(|n| !service.nodes.iter().any(|d| d.id == n.id));
                    if existing.nodes.is_empty() {
                        versions.retain(|s| s.version != service.version);
                    }
                }
                if versions.is_empty() {
                    services.remove(&service.name);
                }
            }
        }

        self.emit(WatchEvent::new(WatchAction::Delete, service.clone()));
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<Vec<Service>> {
        let services = self.inner.services.lock().unwrap();
        services.get(name).cloned().ok_or(Error::NotFound)
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        let services = self.inner.services.lock().unwrap();
        Ok(services.values().flatten().cloned().collect())
    }

    async fn watch(&self) -> Result<Box<dyn Watcher>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.watchers.lock().unwrap().push(tx);
        Ok(Box::new(MemoryWatcher {
            rx,
            stopped: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        }))
    }
}

struct MemoryWatcher {
    rx: mpsc::UnboundedReceiver<WatchEvent>,
    stopped: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

#[async_trait]
impl Watcher for MemoryWatcher {
    async fn next(&mut self) -> Result<WatchEvent> {
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return Err(Error::Watch("watcher stopped".into()));
            }
            tokio::select! {
                event = self.rx.recv() => {
                    return event.ok_or_else(|| Error::Watch("registry closed".into()));
                }
                () = self.wake.notified() => {}
            }
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wake.notify_waiters();
    }
}
