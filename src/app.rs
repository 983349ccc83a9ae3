use crate::relay::{
    BusyPolicy, DisplaySink, ErrorDisplay, PanelMessage, RelayOutcome, Session, SessionOptions,
};
use crate::{cli, config, provider};
use provider::Provider;
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

/// Effective settings after merging flags, environment and config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub model: String,
    pub provider: String,
    pub host: String,
    pub busy_policy: BusyPolicy,
    pub on_error: ErrorDisplay,
}

impl Settings {
    /// Flags win over `env_host` (`OLLAMA_HOST`), which wins over the config file.
    pub fn resolve(args: &cli::Args, cfg: Option<&config::Config>, env_host: Option<String>) -> Self {
        let model = args
            .model
            .clone()
            .or_else(|| cfg.and_then(|c| c.model.clone()))
            .unwrap_or_else(|| config::DEFAULT_MODEL.to_string());

        let provider = args
            .provider
            .clone()
            .or_else(|| cfg.and_then(|c| c.provider.clone()))
            .unwrap_or_else(|| "ollama".to_string());

        let host = args
            .host
            .clone()
            .or(env_host.filter(|h| !h.trim().is_empty()))
            .or_else(|| cfg.and_then(|c| c.ollama.host.clone()))
            .unwrap_or_else(|| provider::ollama::DEFAULT_HOST.to_string());

        let relay = cfg.map(|c| c.relay.clone()).unwrap_or_default();

        Self {
            model,
            provider,
            host,
            busy_policy: relay.busy_policy,
            on_error: relay.on_error,
        }
    }
}

pub fn build_provider(
    http: &reqwest::Client,
    settings: &Settings,
) -> anyhow::Result<Arc<dyn Provider + Send + Sync>> {
    match settings.provider.as_str() {
        "ollama" => Ok(Arc::new(provider::ollama::OllamaProvider::new(
            http.clone(),
            &settings.host,
        )?)),
        "stub" => Ok(Arc::new(provider::stub::StubProvider::new())),
        other => anyhow::bail!("unknown provider: {other} (expected \"ollama\" or \"stub\")"),
    }
}

pub fn build_session(http: &reqwest::Client, settings: &Settings) -> anyhow::Result<Arc<Session>> {
    let provider = build_provider(http, settings)?;
    tracing::debug!(provider = provider.name(), model = %settings.model, "session ready");
    Ok(Arc::new(Session::new(
        provider,
        SessionOptions {
            model: settings.model.clone(),
            busy_policy: settings.busy_policy,
            on_error: settings.on_error,
        },
    )))
}

/// Terminal sink: writes only what each update adds to the previous one.
///
/// An update that does not extend the shown text (an error replacing the
/// transcript) goes to `err` on a line of its own.
pub struct StreamSink<O: Write, E: Write> {
    out: O,
    err: E,
    shown: String,
}

impl<O: Write, E: Write> StreamSink<O, E> {
    pub fn new(out: O, err: E) -> Self {
        Self {
            out,
            err,
            shown: String::new(),
        }
    }
}

impl<O: Write, E: Write> DisplaySink for StreamSink<O, E> {
    fn post(&mut self, msg: PanelMessage) {
        match msg.text.strip_prefix(self.shown.as_str()) {
            Some(delta) => {
                write!(self.out, "{delta}").ok();
                self.out.flush().ok();
            }
            None => {
                if !self.shown.is_empty() {
                    writeln!(self.out).ok();
                    self.out.flush().ok();
                }
                writeln!(self.err, "{}", msg.text).ok();
            }
        }
        self.shown = msg.text;
    }
}

/// Relay one prompt to the terminal. Fails the process if the relay fails.
pub async fn cmd_once(session: &Session, prompt: &str) -> anyhow::Result<ExitCode> {
    let mut sink = StreamSink::new(std::io::stdout(), std::io::stderr());
    let outcome = session.submit(prompt, &mut sink).await?;

    match outcome {
        RelayOutcome::Completed(transcript) => {
            if !transcript.is_empty() {
                println!();
            }
            Ok(ExitCode::SUCCESS)
        }
        RelayOutcome::Failed(_) => Ok(ExitCode::FAILURE),
        RelayOutcome::Cancelled(_) => Ok(ExitCode::FAILURE),
    }
}
