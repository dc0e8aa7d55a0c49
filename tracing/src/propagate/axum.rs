#[cfg(feature = "otlp")]
use opentelemetry::global;
#[cfg(feature = "otlp")]
use opentelemetry_http::HeaderExtractor;
#[cfg(feature = "otlp")]
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Trace context propagation: associate the current span with the otlp trace of the given request,
/// if any and valid. This only sets the parent trace if the otlp feature is also enabled.
///
/// Meant to be used with `tower::ServiceBuilder::map_request`, inside the span
/// created by `tower_http::trace::TraceLayer`.
pub fn accept_trace<B>(request: axum::http::Request<B>) -> axum::http::Request<B> {
    // we only extract and set a parent trace if otlp feature is enabled, otherwise this feature is
    // an noop and we return the request as is
    #[cfg(feature = "otlp")]
    {
        // Current context, if no or invalid data is received.
        let parent_context = global::get_text_map_propagator(|propagator| {
            propagator.extract(&HeaderExtractor(request.headers()))
        });
        tracing::Span::current().set_parent(parent_context);
    }
    request
}

#[cfg(test)]
mod tests {
    use super::accept_trace;

    #[test]
    fn passes_request_through() {
        let request = axum::http::Request::builder()
            .uri("/compile")
            .header("traceparent", "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01")
            .body(())
            .unwrap();

        let request = accept_trace(request);

        assert_eq!("/compile", request.uri().path());
        assert!(request.headers().contains_key("traceparent"));
    }
}
