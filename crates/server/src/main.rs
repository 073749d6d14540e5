use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use fluxgate_provider::ProviderRegistry;
use fluxgate_server::config::ServerConfig;
use fluxgate_server::server::Server;
use fluxgate_server::{api, telemetry};

/// Fluxgate dynamic edge router.
#[derive(Parser, Debug)]
#[command(name = "fluxgate", about = "Dynamic edge router")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "fluxgate.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Probe the running instance's ping endpoint; exits 2 on failure.
    Healthcheck,
    /// Print version information.
    Version,
}

#[tokio::main]
async fn main() {
    telemetry::init();
    let cli = Cli::parse();

    let mut config = match ServerConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "fatal configuration error");
            std::process::exit(1);
        }
    };

    match cli.command {
        Some(Commands::Version) => {
            println!("fluxgate {} (codename {})", api::VERSION, api::CODENAME);
            return;
        }
        Some(Commands::Healthcheck) => {
            config.ensure_internal_entry_point();
            std::process::exit(healthcheck(&config).await);
        }
        None => {}
    }

    // Concrete providers (file watcher, KV adapters, orchestrator
    // clients) are wired here by deployments; the pipeline runs the same
    // with zero providers and serves the internal entities only.
    let registry = ProviderRegistry::new();

    let server = match Server::bind(config, registry).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "fatal startup error");
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    spawn_signal_handlers(&server, &shutdown);

    server.run(shutdown).await;
}

/// SIGINT/SIGTERM trigger the graceful shutdown; SIGUSR1 reopens the
/// access log after external rotation.
fn spawn_signal_handlers(server: &Server, shutdown: &CancellationToken) {
    let shutdown = shutdown.clone();
    let access_log = server.access_log();

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(_) => return,
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return,
        };
        let mut reopen = match signal(SignalKind::user_defined1()) {
            Ok(s) => s,
            Err(_) => return,
        };

        loop {
            tokio::select! {
                _ = interrupt.recv() => {
                    info!("received SIGINT");
                    shutdown.cancel();
                    return;
                }
                _ = terminate.recv() => {
                    info!("received SIGTERM");
                    shutdown.cancel();
                    return;
                }
                _ = reopen.recv() => {
                    info!("received SIGUSR1");
                    access_log.reopen();
                }
            }
        }
    });

    #[cfg(not(unix))]
    tokio::spawn(async move {
        let _ = &access_log;
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });
}

/// GET the ping endpoint of a (presumably) running instance.
async fn healthcheck(config: &ServerConfig) -> i32 {
    let Some(ep) = config.entry_points.get(&config.api.entry_point) else {
        error!("no ping entry point configured");
        return 2;
    };
    // A wildcard bind is probed over loopback.
    let address = ep.address.replace("0.0.0.0", "127.0.0.1");
    let url = format!("http://{address}/ping");

    match reqwest::get(&url).await {
        Ok(response) if response.status().is_success() => {
            println!("OK: {url}");
            0
        }
        Ok(response) => {
            error!(url = %url, status = %response.status(), "healthcheck failed");
            2
        }
        Err(e) => {
            error!(url = %url, error = %e, "healthcheck failed");
            2
        }
    }
}
