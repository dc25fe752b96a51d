//! # meshkit-trace: distributed trace pipeline
//!
//! Three pieces:
//!
//! - span identity: mint or adopt ids, propagate them in metadata
//!   headers ([`Trace::new_span`], [`Trace::from_metadata`],
//!   [`Trace::write_metadata`])
//! - export: a bounded queue fronting a single worker that batches
//!   finished spans out to the publisher collaborator
//!   ([`Trace::collect`])
//! - wrappers: [`TraceClient`] and [`TraceHandler`] apply the
//!   request/response annotation protocol around RPC boundaries
//!
//! Backpressure is the only delivery guarantee: `collect` fails with
//! `CollectTimeout` when the queue stays full, and the span is gone.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use meshkit_core::topics::TRACE_TOPIC;
use meshkit_core::{Client, Context, Metadata};
use meshkit_types::{Error, Result, Service, unix_micros};

mod header;
mod pipeline;
mod span;
mod wrapper;

pub use header::HeaderFormat;
pub use span::{Annotation, AnnotationType, ROOT_PARENT_ID, Span};
pub use wrapper::{TraceClient, TraceHandler};

/// How span and trace ids are minted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IdFormat {
    /// Random UUIDs, the platform format.
    #[default]
    Uuid,
    /// Random 53-bit integers printed base-10, for tooling that
    /// parses ids into doubles.
    Decimal53,
}

impl IdFormat {
    fn mint(self) -> String {
        match self {
            IdFormat::Uuid => uuid::Uuid::new_v4().to_string(),
            IdFormat::Decimal53 => {
                (rand::random::<u64>() & 0x001f_ffff_ffff_ffff).to_string()
            }
        }
    }
}

/// Trace subsystem configuration.
#[derive(Debug, Clone)]
pub struct TraceConfig {
    /// Spans per exported batch.
    pub batch_size: usize,
    /// Flush cadence when the batch stays under `batch_size`.
    pub batch_interval: Duration,
    /// How long `collect` may wait for queue space.
    pub collect_timeout: Duration,
    /// Queue depth between `collect` and the worker.
    pub queue_size: usize,
    /// Topic the batches are published on.
    pub topic: String,
    pub id_format: IdFormat,
    pub header_format: HeaderFormat,
    /// This process's identity, stamped as `source` on root spans.
    pub service: Option<Service>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_interval: Duration::from_secs(1),
            collect_timeout: Duration::from_millis(100),
            queue_size: 100,
            topic: TRACE_TOPIC.to_string(),
            id_format: IdFormat::default(),
            header_format: HeaderFormat::default(),
            service: None,
        }
    }
}

/// The trace subsystem.
pub struct Trace {
    config: TraceConfig,
    client: Arc<dyn Client>,
    tx: mpsc::Sender<Span>,
    rx: Mutex<Option<mpsc::Receiver<Span>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Trace {
    pub fn new(client: Arc<dyn Client>, config: TraceConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        Self {
            config,
            client,
            tx,
            rx: Mutex::new(Some(rx)),
            shutdown: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Mints a span, or completes a partial one.
    ///
    /// With no base: fresh ids, `parent_id = "0"`, started now,
    /// `source` set to the configured service. With a base: blank
    /// fields are filled, existing trace/parent ids are kept, and the
    /// result is an id-only child context stub so the caller's
    /// annotations are never shared.
    pub fn new_span(&self, base: Option<&Span>) -> Span {
        let fmt = self.config.id_format;
        match base {
            None => Span {
                id: fmt.mint(),
                trace_id: fmt.mint(),
                parent_id: ROOT_PARENT_ID.to_string(),
                timestamp: unix_micros(),
                source: self.config.service.clone(),
                ..Span::default()
            },
            Some(base) => Span {
                id: if base.id.is_empty() { fmt.mint() } else { base.id.clone() },
                trace_id: if base.trace_id.is_empty() { fmt.mint() } else { base.trace_id.clone() },
                parent_id: if base.parent_id.is_empty() {
                    ROOT_PARENT_ID.to_string()
                } else {
                    base.parent_id.clone()
                },
                timestamp: if base.timestamp == 0 { unix_micros() } else { base.timestamp },
                debug: base.debug,
                ..Span::default()
            },
        }
    }

    /// Parses span identity out of propagation headers.
    ///
    /// The second element is false when neither the span nor the trace
    /// header was set; the returned span is then a fresh root.
    pub fn from_metadata(&self, metadata: &Metadata) -> (Span, bool) {
        let (partial, present) = header::read(metadata, self.config.header_format);
        if !present {
            return (self.new_span(None), false);
        }
        (self.new_span(Some(&partial)), true)
    }

    /// Writes the four propagation headers for `span`.
    pub fn write_metadata(&self, metadata: &mut Metadata, span: &Span) {
        header::write(metadata, self.config.header_format, span);
    }

    /// Clones `ctx` with `span`'s headers injected.
    pub fn context_with_span(&self, ctx: &Context, span: &Span) -> Context {
        let mut next = ctx.clone();
        self.write_metadata(&mut next.metadata, span);
        next
    }

    /// Queues a finished span for export.
    ///
    /// # Errors
    ///
    /// `CollectTimeout` when the queue stayed full for
    /// `collect_timeout`; `NotAvailable` after `stop`.
    pub async fn collect(&self, span: Span) -> Result<()> {
        self.tx
            .send_timeout(span, self.config.collect_timeout)
            .await
            .map_err(|err| match err {
                mpsc::error::SendTimeoutError::Timeout(_) => Error::CollectTimeout,
                mpsc::error::SendTimeoutError::Closed(_) => Error::NotAvailable,
            })
    }

    /// Starts the export worker. Idempotent.
    pub fn start(&self) -> Result<()> {
        let Some(rx) = self.rx.lock().unwrap().take() else {
            return Ok(());
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = pipeline::spawn(
            Arc::clone(&self.client),
            self.config.clone(),
            rx,
            shutdown_rx,
        );

        *self.shutdown.lock().unwrap() = Some(shutdown_tx);
        *self.worker.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stops the worker, flushing residual spans first. Idempotent.
    /// Every span accepted by `collect` before this call is handed to
    /// the publisher before `stop` returns.
    pub async fn stop(&self) -> Result<()> {
        let shutdown = self.shutdown.lock().unwrap().take();
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        Ok(())
    }
}
