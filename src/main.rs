use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use switchboard::config::Flags;
use switchboard::http::{middleware_fn, request_id_middleware};
use switchboard::lifecycle::cancel_on_signal;
use switchboard::observability::{self, MetricsStats};
use switchboard::Server;

#[tokio::main]
async fn main() -> ExitCode {
    observability::logging::init();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "switchboard starting");

    let flags = Flags::parse();
    let config = match flags.load() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        grpc = %config.listen.grpc,
        http = %config.listen.http,
        internal_grpc = %config.listen.internal_grpc,
        internal_http = %config.listen.internal_http,
        "Configuration loaded"
    );

    let server = match Server::new(config) {
        Ok(server) => server,
        Err(err) => {
            tracing::error!(error = %err, "Failed to set up server");
            return ExitCode::FAILURE;
        }
    };
    server.grpc().register_stats_handler(Arc::new(MetricsStats));
    server.http().register_middleware(request_id_middleware());
    server
        .http()
        .register_middleware(middleware_fn(observability::metrics::track_requests));

    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone());

    match server.run(shutdown).await {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(error = %err, "Server failed");
            ExitCode::FAILURE
        }
    }
}
