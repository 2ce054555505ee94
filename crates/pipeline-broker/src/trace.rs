// SPDX-License-Identifier: MIT OR Apache-2.0
//! W3C trace-context propagation through broker message headers.
//!
//! Headers carry `traceparent` and `tracestate` exactly as specified by the
//! W3C Trace Context recommendation; this module only moves the two header
//! values in and out of [`rdkafka::message::OwnedHeaders`] and an envelope's
//! `metadata.trace_id`. Span creation and export are `pipeline-supervisor`'s
//! job (it owns the `tracer` provider lifecycle).

use rdkafka::message::{Headers, OwnedHeaders};

const TRACEPARENT_HEADER: &str = "traceparent";
const TRACESTATE_HEADER: &str = "tracestate";

/// Trace context extracted from or destined for broker message headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceContext {
    /// The W3C `traceparent` header value, e.g.
    /// `00-<trace-id>-<parent-id>-<flags>`.
    pub traceparent: Option<String>,
    /// The W3C `tracestate` header value, vendor-specific key-value pairs.
    pub tracestate: Option<String>,
}

impl TraceContext {
    /// The trace id segment of `traceparent` (the second `-`-delimited
    /// field), used as the `trace_id` bound into a handler's context and
    /// written to `metadata.trace_id`.
    #[must_use]
    pub fn trace_id(&self) -> Option<&str> {
        self.traceparent.as_deref()?.split('-').nth(1)
    }
}

/// Read `traceparent`/`tracestate` out of a consumed message's headers.
pub fn extract_trace_context(headers: Option<&rdkafka::message::BorrowedHeaders>) -> TraceContext {
    let Some(headers) = headers else {
        return TraceContext::default();
    };

    let mut ctx = TraceContext::default();
    for header in headers.iter() {
        let Some(value) = header.value else { continue };
        let Ok(value) = std::str::from_utf8(value) else {
            continue;
        };
        match header.key {
            TRACEPARENT_HEADER => ctx.traceparent = Some(value.to_string()),
            TRACESTATE_HEADER => ctx.tracestate = Some(value.to_string()),
            _ => {}
        }
    }
    ctx
}

/// Write `traceparent`/`tracestate` into a new message's headers, building
/// on whatever headers the caller already populated.
pub fn inject_trace_context(ctx: &TraceContext, mut headers: OwnedHeaders) -> OwnedHeaders {
    if let Some(ref traceparent) = ctx.traceparent {
        headers = headers.insert(rdkafka::message::Header {
            key: TRACEPARENT_HEADER,
            value: Some(traceparent.as_str()),
        });
    }
    if let Some(ref tracestate) = ctx.tracestate {
        headers = headers.insert(rdkafka::message::Header {
            key: TRACESTATE_HEADER,
            value: Some(tracestate.as_str()),
        });
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_id_parsed_from_traceparent() {
        let ctx = TraceContext {
            traceparent: Some(
                "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".to_string(),
            ),
            tracestate: None,
        };
        assert_eq!(ctx.trace_id(), Some("4bf92f3577b34da6a3ce929d0e0e4736"));
    }

    #[test]
    fn trace_id_absent_without_traceparent() {
        let ctx = TraceContext::default();
        assert_eq!(ctx.trace_id(), None);
    }

    #[test]
    fn inject_then_extract_roundtrips() {
        let ctx = TraceContext {
            traceparent: Some("00-abc-def-01".to_string()),
            tracestate: Some("vendor=value".to_string()),
        };
        let headers = inject_trace_context(&ctx, OwnedHeaders::new());
        assert_eq!(headers.count(), 2);
    }

    #[test]
    fn extract_handles_missing_headers() {
        let ctx = extract_trace_context(None);
        assert_eq!(ctx, TraceContext::default());
    }
}
