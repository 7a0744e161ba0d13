use std::path::PathBuf;

use tracing_subscriber::{filter::LevelFilter, EnvFilter};

pub(crate) fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

/// `$XDG_CONFIG_HOME/latch`, else `$HOME/.config/latch`, else `./.latch`.
pub(crate) fn default_config_root(lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
    let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
    if let Some(xdg) = non_empty("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("latch");
    }
    if let Some(home) = non_empty("HOME") {
        return PathBuf::from(home).join(".config").join("latch");
    }
    PathBuf::from(".latch")
}
