//! RPC boundary wrappers applying the annotation protocol.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use meshkit_core::{Client, Context, Publication, Request, RpcHandler};
use meshkit_types::{Node, Result, Service, unix_micros};

use crate::span::{Annotation, AnnotationType, Span};
use crate::Trace;

/// Wraps an outbound [`Client`], tracing every call.
///
/// Protocol per call: adopt or mint a span from the caller's metadata
/// (an absent or malformed header set starts a new root), record
/// `clientRequest`, inject headers, dispatch, record `clientResponse`.
/// The frame that created the root also records `end` (with any error
/// text in the annotation debug map) and stamps the duration. The
/// finished span is queued with `collect`; a full queue drops it
/// silently.
///
/// Inbound `parent_id` is preserved as-is: a mid-chain call keeps the
/// caller's parent rather than re-parenting onto the local span.
pub struct TraceClient {
    inner: Arc<dyn Client>,
    trace: Arc<Trace>,
    service: Option<Service>,
}

impl TraceClient {
    pub fn new(inner: Arc<dyn Client>, trace: Arc<Trace>, service: Option<Service>) -> Self {
        Self { inner, trace, service }
    }

    async fn traced<F>(&self, ctx: &Context, method: &str, dispatch: F) -> Result<Value>
    where
        F: AsyncFnOnce(Context) -> Result<Value>,
    {
        let (mut span, found) = self.trace.from_metadata(&ctx.metadata);
        let created_root = !found;
        if span.name.is_empty() {
            span.name = method.to_string();
        }

        span.annotations
            .push(Annotation::event(AnnotationType::ClientRequest, self.service.clone()));

        let next = self.trace.context_with_span(ctx, &span);
        let result = dispatch(next).await;

        span.annotations
            .push(Annotation::event(AnnotationType::ClientResponse, self.service.clone()));

        if created_root {
            let mut end = Annotation::event(AnnotationType::End, self.service.clone());
            if let Err(err) = &result {
                end.debug.insert("error".to_string(), err.to_string());
            }
            span.annotations.push(end);
            span.duration = unix_micros() - span.timestamp;
        }

        // Collect failure is the pipeline's backpressure, not the
        // caller's problem.
        let _ = self.trace.collect(span).await;

        result
    }
}

#[async_trait]
impl Client for TraceClient {
    async fn call(&self, ctx: &Context, req: &Request) -> Result<Value> {
        self.traced(ctx, &req.method, async |next| self.inner.call(&next, req).await)
            .await
    }

    async fn call_remote(&self, ctx: &Context, node: &Node, req: &Request) -> Result<Value> {
        self.traced(ctx, &req.method, async |next| {
            self.inner.call_remote(&next, node, req).await
        })
        .await
    }

    async fn publish(&self, ctx: &Context, publication: &Publication) -> Result<()> {
        self.inner.publish(ctx, publication).await
    }
}

/// Wraps an inbound [`RpcHandler`], the server half of the protocol:
/// `serverRequest`/`serverResponse` annotations around the handler.
pub struct TraceHandler {
    inner: Arc<dyn RpcHandler>,
    trace: Arc<Trace>,
    service: Option<Service>,
}

impl TraceHandler {
    pub fn new(inner: Arc<dyn RpcHandler>, trace: Arc<Trace>, service: Option<Service>) -> Self {
        Self { inner, trace, service }
    }
}

#[async_trait]
impl RpcHandler for TraceHandler {
    async fn handle(&self, ctx: &Context, method: &str, body: Value) -> Result<Value> {
        let (mut span, found) = self.trace.from_metadata(&ctx.metadata);
        let created_root = !found;
        if span.name.is_empty() {
            span.name = method.to_string();
        }

        span.annotations
            .push(Annotation::event(AnnotationType::ServerRequest, self.service.clone()));

        let next = self.trace.context_with_span(ctx, &span);
        let result = self.inner.handle(&next, method, body).await;

        span.annotations
            .push(Annotation::event(AnnotationType::ServerResponse, self.service.clone()));

        if created_root {
            let mut end = Annotation::event(AnnotationType::End, self.service.clone());
            if let Err(err) = &result {
                end.debug.insert("error".to_string(), err.to_string());
            }
            span.annotations.push(end);
            span.duration = unix_micros() - span.timestamp;
        }

        let _ = self.trace.collect(span).await;

        result
    }
}
