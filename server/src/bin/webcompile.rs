use std::sync::Arc;

use clap::Parser;
use mimalloc::MiMalloc;
use tracing::{info, Level};
use webcompile_build::{CompileService, ServiceArgs};
use webcompile_server::{AppState, HttpArgs};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Compile source files with a trusted recipe, on behalf of remote clients.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// A global log level to use when printing logs.
    /// It's also possible to set `RUST_LOG` according to
    /// `tracing_subscriber::filter::EnvFilter`, which will always have
    /// priority.
    #[arg(long, default_value_t=Level::INFO)]
    log_level: Level,

    /// The address to listen on.
    #[clap(flatten)]
    listen_args: tokio_listener::ListenerAddressLFlag,

    #[clap(flatten)]
    service: ServiceArgs,

    #[clap(flatten)]
    http: HttpArgs,

    #[cfg(feature = "otlp")]
    /// Whether to configure OTLP. Set --otlp=false to disable.
    #[arg(long, default_missing_value = "true", default_value = "true", num_args(0..=1), require_equals(true), action(clap::ArgAction::Set))]
    otlp: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    let tracing_handle = {
        #[allow(unused_mut)]
        let mut builder = webcompile_tracing::TracingBuilder::default().level(cli.log_level);
        #[cfg(feature = "otlp")]
        {
            if cli.otlp {
                builder = builder.enable_otlp("webcompile");
            }
        }
        builder.build()?
    };

    info!(
        recipe_dir=?cli.service.recipe_dir,
        toolchain_dir=?cli.service.toolchain_dir,
        scratch_dir=?cli.service.scratch_dir,
        "configured compile service"
    );

    let service = CompileService::try_from(cli.service)?;
    let state = AppState::new(Arc::new(service));

    let app = webcompile_server::gen_router(&cli.http).with_state(state);

    let listen_address = &cli.listen_args.listen_address.unwrap_or_else(|| {
        "[::]:8080"
            .parse()
            .expect("invalid fallback listen address")
    });

    let listener = tokio_listener::Listener::bind(
        listen_address,
        &Default::default(),
        &cli.listen_args.listener_options,
    )
    .await?;

    info!(listen_address=%listen_address, "starting daemon");

    tokio_listener::axum07::serve(
        listener,
        app.into_make_service_with_connect_info::<tokio_listener::SomeSocketAddrClonable>(),
    )
    .await?;

    tracing_handle.shutdown().await;

    Ok(())
}
