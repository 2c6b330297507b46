use crate::app_list::DEFAULT_APP_LIST_FILE;
use crate::options::DEFAULT_SETTINGS_FILE;
use crate::runner::{DEFAULT_CANCEL_GRACE, ScriptCommand};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_SCRIPT: &str = "DEBLOAT_SCRIPT";
pub const ENV_COMMAND: &str = "DEBLOAT_COMMAND";
pub const ENV_SETTINGS: &str = "DEBLOAT_SETTINGS";
pub const ENV_APP_LIST: &str = "DEBLOAT_APPLIST";
pub const ENV_CANCEL_GRACE: &str = "DEBLOAT_CANCEL_GRACE";

/// Where state lives and what a run executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebloatConfig {
    pub script: ScriptCommand,
    pub settings_path: PathBuf,
    pub app_list_path: PathBuf,
    pub cancel_grace: Duration,
}

impl Default for DebloatConfig {
    fn default() -> Self {
        DebloatConfig {
            script: ScriptCommand::default(),
            settings_path: PathBuf::from(DEFAULT_SETTINGS_FILE),
            app_list_path: PathBuf::from(DEFAULT_APP_LIST_FILE),
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }
}

impl DebloatConfig {
    /// Defaults overridden by `DEBLOAT_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// `DEBLOAT_COMMAND` runs a program directly and wins over `DEBLOAT_SCRIPT`, which
    /// names the PowerShell script to invoke.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = DebloatConfig::default();
        let value = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(command) = value(ENV_COMMAND) {
            config.script = ScriptCommand::new(command, Vec::<String>::new());
        } else if let Some(script) = value(ENV_SCRIPT) {
            config.script = ScriptCommand::powershell(script);
        }
        if let Some(path) = value(ENV_SETTINGS) {
            config.settings_path = PathBuf::from(path);
        }
        if let Some(path) = value(ENV_APP_LIST) {
            config.app_list_path = PathBuf::from(path);
        }
        if let Some(grace) = value(ENV_CANCEL_GRACE) {
            match humantime::parse_duration(grace.trim()) {
                Ok(grace) => config.cancel_grace = grace,
                Err(err) => tracing::warn!(
                    value = %grace,
                    error = %err,
                    "ignoring invalid {ENV_CANCEL_GRACE}"
                ),
            }
        }
        config
    }
}
