use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::{header::CONTENT_TYPE, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;
use webcompile_build::CompileService;

mod compile;

#[derive(Clone)]
pub struct AppState {
    service: Arc<CompileService>,
}

impl AppState {
    pub fn new(service: Arc<CompileService>) -> Self {
        Self { service }
    }
}

/// Options of the HTTP frontend.
#[derive(clap::Args, Debug, Clone)]
pub struct HttpArgs {
    /// Maximum size of a compile request body, in bytes.
    #[arg(long, env, default_value_t = 100 * 1024 * 1024)]
    pub max_request_size: usize,

    /// Origins allowed to send cross-origin requests, comma separated.
    /// `*` allows any origin.
    #[arg(long, env, value_delimiter = ',', default_value = "*")]
    pub allowed_origins: Vec<String>,
}

impl Default for HttpArgs {
    fn default() -> Self {
        Self {
            max_request_size: 100 * 1024 * 1024,
            allowed_origins: vec!["*".into()],
        }
    }
}

pub fn gen_router(args: &HttpArgs) -> Router<AppState> {
    Router::new()
        .route("/", get(root))
        .route("/compile", post(compile::post))
        .layer(DefaultBodyLimit::max(args.max_request_size))
        .layer(cors_layer(&args.allowed_origins))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .map_request(webcompile_tracing::propagate::axum::accept_trace),
        )
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods([Method::GET, Method::POST]);

    if allowed_origins.is_empty() || allowed_origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any).allow_headers(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(err=%e, origin=%origin, "ignoring invalid origin");
                None
            }
        })
        .collect();

    layer
        .allow_origin(AllowOrigin::list(origins))
        .allow_headers([CONTENT_TYPE])
}

async fn root() -> &'static str {
    "Hello from webcompile"
}
