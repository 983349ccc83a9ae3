use std::ffi::OsString;
use std::path::PathBuf;

const CONFIG_FILE: &str = "config.toml";

/// Location of the optional `config.toml`, or `None` when no base directory is known.
///
/// Nothing is created on disk: the file is only ever read.
pub fn config_path() -> Option<PathBuf> {
    config_path_from(|key| std::env::var_os(key))
}

/// `$DEEPCODE_HOME/config`, then `$XDG_CONFIG_HOME/deepcode`, then `$HOME/.config/deepcode`.
fn config_path_from(var: impl Fn(&str) -> Option<OsString>) -> Option<PathBuf> {
    let non_empty = |key: &str| var(key).filter(|v| !v.is_empty()).map(PathBuf::from);

    let dir = if let Some(base) = non_empty("DEEPCODE_HOME") {
        base.join("config")
    } else if let Some(xdg) = non_empty("XDG_CONFIG_HOME") {
        xdg.join("deepcode")
    } else {
        non_empty("HOME")?.join(".config").join("deepcode")
    };

    Some(dir.join(CONFIG_FILE))
}
