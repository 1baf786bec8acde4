//! Process entrypoint: load settings, build services and the server,
//! serve until a termination signal, then drain with a bounded deadline.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, info_span, warn};
use tracing_subscriber::EnvFilter;

use servicekit::{Server, ServerOption, Settings};

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves on SIGINT, or SIGTERM where available.
async fn termination_signal() {
    let interrupt = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => {}
        () = terminate => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let settings = Settings::parse();

    let users = servicekit::services::users::service(&settings)
        .context("building users service")?;

    let server = Server::new(
        settings,
        [
            ServerOption::logger(info_span!("server")),
            ServerOption::service(Arc::new(users)),
        ],
    )
    .context("composing http server")?;
    let server = Arc::new(server);

    let drainer = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            termination_signal().await;
            info!("termination signal received");
            if let Err(err) = server.shutdown(SHUTDOWN_DEADLINE).await {
                warn!(error = %err, "graceful shutdown incomplete");
            }
        })
    };

    server.serve().await.context("http server failed")?;

    // serve only returns cleanly after the signal task triggered the
    // drain; let it finish logging before exiting 0.
    let _ = drainer.await;
    info!("http server stopped");
    Ok(())
}
