use clap::{Parser, Subcommand};

/// DeepCode: stream a local model's answer to a prompt
#[derive(Debug, Parser)]
#[command(name = "deepcode")]
#[command(version)]
#[command(about = "Relay prompts to a local Ollama model and stream the reply", long_about = None)]
pub struct Args {
    /// Model name (default: config/model or "deepseek-r1")
    #[arg(short = 'm', long = "model", global = true)]
    pub model: Option<String>,

    /// Provider: "ollama" or "stub" (default: config/provider or "ollama")
    #[arg(long = "provider", global = true)]
    pub provider: Option<String>,

    /// Ollama host (default: $OLLAMA_HOST, config ollama.host, or http://127.0.0.1:11434)
    #[arg(long = "host", global = true)]
    pub host: Option<String>,

    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// Prompt text (positional) (used when no subcommand is given)
    #[arg(value_name = "PROMPT")]
    pub prompt: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve the chat panel protocol as JSON lines on stdin/stdout
    Bridge,

    /// Run an interactive terminal chat panel
    #[cfg(feature = "tui")]
    Tui,
}
