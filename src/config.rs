use crate::relay::{BusyPolicy, ErrorDisplay};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_MODEL: &str = "deepseek-r1";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Default model (optional)
    pub model: Option<String>,

    /// Provider identifier: "ollama" or "stub".
    pub provider: Option<String>,

    #[serde(default)]
    pub ollama: OllamaConfig,

    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OllamaConfig {
    /// Base URL of the Ollama server; the scheme may be omitted.
    pub host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub busy_policy: BusyPolicy,
    #[serde(default)]
    pub on_error: ErrorDisplay,
}

impl Config {
    /// Load config if the file exists, otherwise return Ok(None).
    pub fn load_optional(path: impl AsRef<Path>) -> anyhow::Result<Option<Self>> {
        let path = path.as_ref();
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::Error::new(e))
                    .with_context(|| format!("failed to read config: {}", path.display()))
            }
        };

        let s = String::from_utf8(bytes).context("config is not valid UTF-8")?;
        let cfg: Config = toml::from_str(&s)
            .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
        Ok(Some(cfg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("deepcode-{}-{name}", std::process::id()))
    }

    #[test]
    fn missing_file_is_none() {
        assert!(Config::load_optional(temp_path("absent.toml")).unwrap().is_none());
    }

    #[test]
    fn full_file() {
        let path = temp_path("full.toml");
        std::fs::write(
            &path,
            r#"
model = "llama3"
provider = "stub"

[ollama]
host = "gpu-box:11434"

[relay]
busy_policy = "supersede"
on_error = "append"
"#,
        )
        .unwrap();

        let cfg = Config::load_optional(&path).unwrap().unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(cfg.model.as_deref(), Some("llama3"));
        assert_eq!(cfg.provider.as_deref(), Some("stub"));
        assert_eq!(cfg.ollama.host.as_deref(), Some("gpu-box:11434"));
        assert_eq!(cfg.relay.busy_policy, BusyPolicy::Supersede);
        assert_eq!(cfg.relay.on_error, ErrorDisplay::Append);
    }

    #[test]
    fn sections_default() {
        let cfg: Config = toml::from_str("model = \"deepseek-r1\"").unwrap();
        assert!(cfg.ollama.host.is_none());
        assert_eq!(cfg.relay.busy_policy, BusyPolicy::Reject);
        assert_eq!(cfg.relay.on_error, ErrorDisplay::Replace);
    }

    #[test]
    fn bad_policy_is_an_error() {
        let path = temp_path("bad.toml");
        std::fs::write(&path, "[relay]\nbusy_policy = \"queue\"\n").unwrap();
        let err = Config::load_optional(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(format!("{err:#}").contains("failed to parse TOML"));
    }
}
