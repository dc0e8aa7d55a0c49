use reqwest_tracing::{SpanBackendWithUrl, TracingMiddleware};

/// Returns a tracing middleware for outgoing requests made through reqwest_middleware, like
/// artifact uploads.
/// Every request gets its own span with the `url` recorded into `http.url`. With the otlp
/// feature enabled, the `traceparent` header is set too, so the receiving server can continue
/// the trace.
///
/// `traceparent` => https://www.w3.org/TR/trace-context/#trace-context-http-headers-format
pub fn tracing_middleware() -> TracingMiddleware<SpanBackendWithUrl> {
    TracingMiddleware::<SpanBackendWithUrl>::new()
}
