mod app;
mod bridge;
mod cli;
mod config;
mod paths;
mod provider;
mod relay;

#[cfg(feature = "tui")]
mod tui;

use anyhow::Context;
use clap::Parser;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Logs go to stderr; stdout carries the response (or the bridge protocol).
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = cli::Args::parse();

    let config_path = paths::config_path();
    let cfg = match &config_path {
        Some(path) => config::Config::load_optional(path)?,
        None => None,
    };
    tracing::debug!(?config_path, ?cfg, "resolved config");

    let settings = app::Settings::resolve(&args, cfg.as_ref(), std::env::var("OLLAMA_HOST").ok());
    tracing::debug!(?settings, "resolved settings");

    let http = reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;

    let session = app::build_session(&http, &settings)?;

    match args.cmd {
        Some(cli::Command::Bridge) => {
            bridge::cmd_bridge(session).await?;
            return Ok(ExitCode::SUCCESS);
        }
        #[cfg(feature = "tui")]
        Some(cli::Command::Tui) => {
            tui::run_tui(session).await?;
            return Ok(ExitCode::SUCCESS);
        }
        None => {}
    }

    let prompt = args.prompt.join(" ");
    if prompt.trim().is_empty() {
        anyhow::bail!("No prompt provided. Try: deepcode \"Hello\" or `deepcode bridge`");
    }

    app::cmd_once(&session, &prompt).await
}
