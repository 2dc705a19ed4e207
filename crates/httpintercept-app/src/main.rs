//! HTTP Intercept - serve canned HTTP and HTTPS responses on local ports.
//!
//! Runs the intercept server until Ctrl-C or `SIGTERM`. `SIGHUP` reloads the
//! response file on every listener. `httpintercept ca create` creates the root
//! CA that generated server certificates are signed with.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use httpintercept_app::{Args, CaCommand, Command, ResponseFileScenario, ServeArgs};
use httpintercept_proxy::{
    default_data_dir, CertificateAuthority, InterceptConfig, InterceptServer,
};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    default_data_dir().map(|dir| dir.join("logs"))
}

/// Initialize console logging plus a daily rolling log file when possible.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("httpintercept={},warn", log_level)));

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("httpintercept")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::debug!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

fn certificate_authority(config: &InterceptConfig) -> anyhow::Result<CertificateAuthority> {
    let ca_dir = config
        .resolved_ca_dir()
        .context("Failed to determine CA directory; pass --ca-dir")?;
    Ok(CertificateAuthority::new(ca_dir))
}

fn run_ca_command(action: &CaCommand, config: &InterceptConfig) -> anyhow::Result<()> {
    let ca = certificate_authority(config)?;
    match action {
        CaCommand::Create { force, name } => {
            if ca.check_ca_exists() && !force {
                anyhow::bail!(
                    "A root CA already exists at {}; use --force to replace it",
                    ca.cert_path().display()
                );
            }
            let root = ca.generate_ca(name).context("Failed to create root CA")?;
            tracing::info!("Created root CA {:?}", name);
            println!("{}", root.cert_path().display());
            eprintln!("Import this certificate into every client that should trust the server.");
        }
        CaCommand::Path => {
            if !ca.check_ca_exists() {
                tracing::warn!("No root CA yet; run `httpintercept ca create`");
            }
            println!("{}", ca.cert_path().display());
        }
    }
    Ok(())
}

/// Resolves on Ctrl-C or `SIGTERM`; reloads the server on `SIGHUP`.
#[cfg(unix)]
async fn wait_for_shutdown(server: &InterceptServer) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut hangup, mut terminate) =
        match (signal(SignalKind::hangup()), signal(SignalKind::terminate())) {
            (Ok(hangup), Ok(terminate)) => (hangup, terminate),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!("Signal handlers unavailable ({}); only Ctrl-C stops the server", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = terminate.recv() => break,
            _ = hangup.recv() => {
                tracing::info!("SIGHUP received, reloading scenarios");
                server.reload_config().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_server: &InterceptServer) {
    let _ = tokio::signal::ctrl_c().await;
}

async fn serve(serve: &ServeArgs, config: InterceptConfig) -> anyhow::Result<()> {
    let mut server = InterceptServer::new(config).context("Failed to create server")?;
    if let Some(path) = &serve.responses {
        let scenario = ResponseFileScenario::open(path)?;
        server = server.with_scenario_source(Arc::new(scenario));
    }

    tracing::info!(
        "Serving HTTP on {:?} and HTTPS on {:?}",
        server.config().http_ports,
        server.config().https_ports
    );
    server
        .run(wait_for_shutdown(&server))
        .await
        .context("Intercept server failed")?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Keep the guard alive so buffered log lines are flushed on exit.
    let _log_guard = init_logging(&args);

    tracing::debug!("Args: {:?}", args);
    let config = args.serve.to_config()?;

    match &args.command {
        Some(Command::Ca { action }) => run_ca_command(action, &config),
        None => serve(&args.serve, config).await,
    }
}
