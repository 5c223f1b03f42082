//! sixin-server: realtime session and signaling server.
//!
//! Accepts event-socket and plain WebSocket clients, authenticates them with
//! bearer tokens, relays chat events between their connections, negotiates a
//! server-side WebRTC peer per connection, and answers STUN binding requests.

mod auth;
mod config;
mod fanout;
mod gateway;
mod peer;
mod registry;
mod server;
mod store;
mod transport;

use auth::TokenAuthenticator;
use clap::Parser;
use config::{CliOverrides, ServerConfig};
use server::SixinServer;
use std::path::PathBuf;
use tracing::{error, info};

/// sixin-server: realtime session and signaling server
#[derive(Parser, Debug)]
#[command(name = "sixin-server", version, about = "Realtime session and signaling server")]
struct Cli {
    /// WebSocket listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// STUN (UDP) listen port
    #[arg(long)]
    stun_port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.sixin/config.toml")]
    config: String,

    /// Idle timeout in seconds
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print a bearer token for USER_ID and exit
    #[arg(long, value_name = "USER_ID")]
    issue_token: Option<u64>,

    /// Pairing code pushed to every client as a `qrcode` event
    #[arg(long, value_name = "CODE")]
    pairing_code: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        port: cli.port,
        stun_port: cli.stun_port,
        idle_timeout: cli.idle_timeout,
    };
    let server_config = match ServerConfig::load(Some(&config_path), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    if let Some(user_id) = cli.issue_token {
        if user_id == 0 {
            error!("user id must be non-zero");
            std::process::exit(1);
        }
        if server_config.token_secret_ephemeral {
            error!("set auth.secret in the config file before issuing tokens");
            std::process::exit(1);
        }
        let auth = TokenAuthenticator::new(server_config.token_secret.clone(), server_config.token_ttl);
        println!("{}", auth.issue(user_id));
        return;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = server_config.port,
        stun_port = server_config.stun_port,
        "starting sixin-server"
    );

    let sixin_server = match SixinServer::new(server_config) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };
    if cli.pairing_code.is_some() {
        sixin_server.gateway().set_pairing_code(cli.pairing_code).await;
    }

    let shutdown = sixin_server.shutdown_handle();
    let mut server_task = tokio::spawn(sixin_server.run());

    let interrupted = tokio::select! {
        result = &mut server_task => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "server error");
                    std::process::exit(1);
                }
                Err(e) => {
                    error!(error = %e, "server task failed");
                    std::process::exit(1);
                }
            }
            false
        }
        _ = shutdown_signal() => true,
    };

    if interrupted {
        info!("received shutdown signal");
        let _ = shutdown.send(());
        if let Err(e) = server_task.await {
            error!(error = %e, "server task failed");
        }
    }

    info!("sixin-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
