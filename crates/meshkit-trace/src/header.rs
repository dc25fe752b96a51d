//! Propagation header codec.
//!
//! Two fixed key quartets carry span identity across a service
//! boundary: the platform-native set and the B3 set spoken by zipkin
//! tooling. Debug/sampled serialises as `"0"`/`"1"`.

use meshkit_core::Metadata;

use crate::span::Span;

/// Which header key set to read and write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HeaderFormat {
    #[default]
    Platform,
    B3,
}

impl HeaderFormat {
    pub fn span_key(self) -> &'static str {
        match self {
            HeaderFormat::Platform => "X-Micro-Span-Id",
            HeaderFormat::B3 => "X-B3-SpanId",
        }
    }

    pub fn trace_key(self) -> &'static str {
        match self {
            HeaderFormat::Platform => "X-Micro-Trace-Id",
            HeaderFormat::B3 => "X-B3-TraceId",
        }
    }

    pub fn parent_key(self) -> &'static str {
        match self {
            HeaderFormat::Platform => "X-Micro-Parent-Id",
            HeaderFormat::B3 => "X-B3-ParentSpanId",
        }
    }

    pub fn debug_key(self) -> &'static str {
        match self {
            HeaderFormat::Platform => "X-Micro-Debug",
            HeaderFormat::B3 => "X-B3-Sampled",
        }
    }
}

/// Reads the quartet into a partial span.
///
/// Returns `(span, present)`; `present` is true only when at least the
/// span or trace header is set. The partial span carries ids and the
/// debug flag only.
pub fn read(metadata: &Metadata, format: HeaderFormat) -> (Span, bool) {
    let get = |key: &str| metadata.get(key).unwrap_or_default().to_string();

    let present =
        metadata.contains(format.span_key()) || metadata.contains(format.trace_key());

    let span = Span {
        id: get(format.span_key()),
        trace_id: get(format.trace_key()),
        parent_id: get(format.parent_key()),
        debug: metadata.get(format.debug_key()) == Some("1"),
        ..Span::default()
    };

    (span, present)
}

/// Writes all four headers for `span`. Idempotent: writing the same
/// span twice leaves the metadata unchanged.
pub fn write(metadata: &mut Metadata, format: HeaderFormat, span: &Span) {
    metadata.set(format.span_key(), span.id.clone());
    metadata.set(format.trace_key(), span.trace_id.clone());
    metadata.set(format.parent_key(), span.parent_id.clone());
    metadata.set(format.debug_key(), if span.debug { "1" } else { "0" });
}
