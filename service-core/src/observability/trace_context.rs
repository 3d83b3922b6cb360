//! Outbound trace propagation for provider HTTP calls.
//!
//! Gateway requests carry the current span's W3C `traceparent` (and
//! `tracestate` when present), so a slow provider call lines up with the
//! booking or payment request that triggered it.

use opentelemetry::trace::{SpanContext, TraceContextExt};
use reqwest::header::{HeaderMap, HeaderValue};
use tracing_opentelemetry::OpenTelemetrySpanExt;

pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const TRACESTATE_HEADER: &str = "tracestate";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// `00-{trace_id}-{span_id}-{flags}`, or `None` for an invalid context.
pub fn format_traceparent(span_context: &SpanContext) -> Option<String> {
    span_context.is_valid().then(|| {
        format!(
            "00-{}-{}-{:02x}",
            span_context.trace_id(),
            span_context.span_id(),
            span_context.trace_flags().to_u8()
        )
    })
}

/// Trace headers for the current span. Empty when OTLP export is off.
pub fn current_trace_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    let context = tracing::Span::current().context();
    let span = context.span();
    let span_context = span.span_context();

    let Some(traceparent) = format_traceparent(span_context) else {
        return headers;
    };
    if let Ok(value) = HeaderValue::from_str(&traceparent) {
        headers.insert(TRACEPARENT_HEADER, value);
    }
    let state = span_context.trace_state().header();
    if !state.is_empty()
        && let Ok(value) = HeaderValue::from_str(&state)
    {
        headers.insert(TRACESTATE_HEADER, value);
    }
    headers
}

/// Request builder that attaches trace headers at send time, inside the
/// caller's span.
pub struct TracedRequest(reqwest::RequestBuilder);

impl TracedRequest {
    pub fn header(self, key: &str, value: &str) -> Self {
        Self(self.0.header(key, value))
    }

    pub fn json<T: serde::Serialize + ?Sized>(self, body: &T) -> Self {
        Self(self.0.json(body))
    }

    pub async fn send(self) -> Result<reqwest::Response, reqwest::Error> {
        self.0.headers(current_trace_headers()).send().await
    }
}

pub trait TracedClientExt {
    fn traced_get(&self, url: &str) -> TracedRequest;
    fn traced_post(&self, url: &str) -> TracedRequest;
}

impl TracedClientExt for reqwest::Client {
    fn traced_get(&self, url: &str) -> TracedRequest {
        TracedRequest(self.get(url))
    }

    fn traced_post(&self, url: &str) -> TracedRequest {
        TracedRequest(self.post(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{SpanId, TraceFlags, TraceId, TraceState};

    #[test]
    fn formats_sampled_context() {
        let context = SpanContext::new(
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
            SpanId::from_hex("00f067aa0ba902b7").unwrap(),
            TraceFlags::SAMPLED,
            false,
            TraceState::default(),
        );
        assert_eq!(
            format_traceparent(&context).as_deref(),
            Some("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
        );
    }

    #[test]
    fn no_headers_outside_an_exported_span() {
        assert_eq!(format_traceparent(&SpanContext::empty_context()), None);
        assert!(current_trace_headers().is_empty());
    }
}
