//! The export worker.

use std::mem;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use meshkit_core::{Client, Context, Publication};

use crate::{Span, TraceConfig};

pub(crate) fn spawn(
    client: Arc<dyn Client>,
    config: TraceConfig,
    mut rx: mpsc::Receiver<Span>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(config.batch_interval);
        // The first tick of a tokio interval is immediate; skip it so
        // an empty startup buffer is not an instant flush.
        tick.tick().await;

        let mut buf: Vec<Span> = Vec::new();
        let mut flushes = JoinSet::new();

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(span) => {
                        buf.push(span);
                        if buf.len() >= config.batch_size {
                            flush(&client, &config, mem::take(&mut buf), &mut flushes);
                        }
                    }
                    // Sender side gone: drain and exit.
                    None => break,
                },
                _ = tick.tick() => {
                    if !buf.is_empty() {
                        flush(&client, &config, mem::take(&mut buf), &mut flushes);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        // Residual spans already accepted by the queue still export.
        while let Ok(span) = rx.try_recv() {
            buf.push(span);
        }
        if !buf.is_empty() {
            flush(&client, &config, mem::take(&mut buf), &mut flushes);
        }
        while flushes.join_next().await.is_some() {}
        debug!("trace worker stopped");
    })
}

/// Dispatches a full batch on its own task; intake continues on a
/// fresh buffer meanwhile.
fn flush(
    client: &Arc<dyn Client>,
    config: &TraceConfig,
    batch: Vec<Span>,
    flushes: &mut JoinSet<()>,
) {
    let client = Arc::clone(client);
    let topic = config.topic.clone();
    flushes.spawn(async move {
        debug!(spans = batch.len(), topic = %topic, "flushing trace batch");
        for span in batch {
            let publication = match Publication::new(&topic, &span) {
                Ok(publication) => publication,
                Err(err) => {
                    warn!(error = %err, "span failed to encode, dropping");
                    continue;
                }
            };
            if let Err(err) = client.publish(&Context::new(), &publication).await {
                warn!(error = %err, "span publish failed, dropping");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::{sleep, timeout};

    use meshkit_core::topics::TRACE_TOPIC;
    use meshkit_core::ServerOptions;
    use meshkit_memory::MemoryMesh;
    use meshkit_types::Error;

    use crate::{Trace, TraceConfig};

    fn trace_over(mesh: &MemoryMesh, config: TraceConfig) -> Trace {
        let transport = mesh.join(ServerOptions {
            name: "host".into(),
            address: "10.0.0.1:8080".into(),
            ..ServerOptions::default()
        });
        Trace::new(Arc::new(transport), config)
    }

    #[tokio::test]
    async fn every_collected_span_exports_before_stop_returns() {
        let mesh = MemoryMesh::new();
        let trace = trace_over(
            &mesh,
            TraceConfig { batch_size: 2, ..TraceConfig::default() },
        );
        trace.start().unwrap();

        for _ in 0..5 {
            trace.collect(trace.new_span(None)).await.unwrap();
        }
        trace.stop().await.unwrap();

        // Two full batches plus the residual flushed on shutdown.
        assert_eq!(mesh.published(TRACE_TOPIC).len(), 5);
    }

    #[tokio::test]
    async fn interval_flushes_a_partial_batch() {
        let mesh = MemoryMesh::new();
        let trace = trace_over(
            &mesh,
            TraceConfig {
                batch_interval: Duration::from_millis(20),
                ..TraceConfig::default()
            },
        );
        trace.start().unwrap();

        trace.collect(trace.new_span(None)).await.unwrap();

        timeout(Duration::from_secs(2), async {
            while mesh.published(TRACE_TOPIC).is_empty() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("the timed flush should export the span");

        trace.stop().await.unwrap();
    }

    #[tokio::test]
    async fn full_queue_times_out_collect() {
        let mesh = MemoryMesh::new();
        // No worker: the queue wedges at one span.
        let trace = trace_over(
            &mesh,
            TraceConfig {
                queue_size: 1,
                collect_timeout: Duration::from_millis(20),
                ..TraceConfig::default()
            },
        );

        trace.collect(trace.new_span(None)).await.unwrap();
        assert!(matches!(
            trace.collect(trace.new_span(None)).await,
            Err(Error::CollectTimeout)
        ));
    }

    #[tokio::test]
    async fn collect_after_stop_is_not_available() {
        let mesh = MemoryMesh::new();
        let trace = trace_over(&mesh, TraceConfig::default());
        trace.start().unwrap();
        trace.stop().await.unwrap();

        assert!(matches!(
            trace.collect(trace.new_span(None)).await,
            Err(Error::NotAvailable)
        ));
    }
}
