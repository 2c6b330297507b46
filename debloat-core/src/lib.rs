//! Core domain layer for the Win11Debloat front-end: option state, the removable
//! app list and the lifecycle of script runs.
pub mod app_list;
pub mod config;
pub mod error;
pub mod options;
pub mod privilege;
pub mod runner;

pub use app_list::{AppEntry, AppListStore};
pub use config::DebloatConfig;
pub use error::{DebloatError, Result};
pub use options::{LoadFallback, LoadedOptions, OptionCatalog, OptionGroup, OptionSpec, OptionStore};
pub use privilege::{FixedPrivileges, PrivilegeProbe, SystemPrivileges};
pub use runner::{
    RunController, RunEvent, RunFailure, RunHandle, RunOutcome, RunReport, RunRequest, RunState,
    ScriptCommand,
};

use std::io::Write;
use std::path::Path;

/// Replace `path` with `contents` via a sibling temporary file, so readers never see a
/// half-written file.
pub(crate) fn write_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut staged = tempfile::NamedTempFile::new_in(dir)?;
    staged.write_all(contents)?;
    staged.as_file().sync_all()?;
    staged.persist(path).map_err(|err| err.error)?;
    Ok(())
}
