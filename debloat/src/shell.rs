use crate::formatting::fallback_notice;
use debloat_core::options::is_valid_option_name;
use debloat_core::{
    AppEntry, AppListStore, DebloatConfig, DebloatError, OptionCatalog, OptionSpec, OptionStore,
    PrivilegeProbe, RunController, RunEvent, RunReport, RunRequest,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};
use thiserror::Error;

const DRAIN_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("invalid option name: {0}")]
    InvalidOptionName(String),
    #[error("run worker disappeared before reporting an outcome")]
    WorkerLost,
    #[error(transparent)]
    Core(#[from] DebloatError),
}

/// Owns the front-end's view of option state, the app list and the run controller.
pub struct Shell {
    config: DebloatConfig,
    options: OptionStore,
    controller: RunController,
    notices: Vec<String>,
}

pub struct AppListView {
    pub entries: Vec<AppEntry>,
    pub notice: Option<String>,
}

impl Shell {
    pub fn open(config: DebloatConfig) -> Self {
        let loaded = OptionStore::load(OptionCatalog::default(), &config.settings_path);
        let notices = loaded
            .fallback
            .as_ref()
            .map(fallback_notice)
            .into_iter()
            .collect();
        let controller = RunController::from_config(&config);
        Shell {
            config,
            options: loaded.store,
            controller,
            notices,
        }
    }

    pub fn notices(&self) -> &[String] {
        &self.notices
    }

    pub fn options(&self) -> Vec<(OptionSpec, bool)> {
        self.options
            .catalog()
            .specs()
            .iter()
            .map(|spec| (*spec, self.options.get(spec.name)))
            .collect()
    }

    pub fn enabled_options(&self) -> Vec<String> {
        self.options.enabled_names()
    }

    pub fn set_option(&mut self, name: &str, value: bool) -> Result<(), ShellError> {
        if !is_valid_option_name(name) {
            return Err(ShellError::InvalidOptionName(name.to_string()));
        }
        if self.options.catalog().find(name).is_none() {
            tracing::warn!(option = name, "option is not part of the built-in catalog");
        }
        self.options.set(name, value);
        self.options.save(&self.config.settings_path)?;
        Ok(())
    }

    pub fn reset_options(&mut self) -> Result<(), ShellError> {
        self.options.reset_to_defaults();
        self.options.save(&self.config.settings_path)?;
        Ok(())
    }

    /// A missing app list renders as an empty list with a notice.
    pub fn apps(&self) -> Result<AppListView, ShellError> {
        match AppListStore::load(&self.config.app_list_path) {
            Ok(store) => Ok(AppListView {
                entries: store.entries().cloned().collect(),
                notice: None,
            }),
            Err(DebloatError::ResourceUnavailable { path }) => Ok(AppListView {
                entries: Vec::new(),
                notice: Some(format!("App list not found at {}.", path.display())),
            }),
            Err(err) => Err(err.into()),
        }
    }

    pub fn toggle_app(&self, name: &str) -> Result<bool, ShellError> {
        let mut store = AppListStore::load(&self.config.app_list_path)?;
        Ok(store.toggle(name)?)
    }

    /// Run the script with `only` (or the enabled options), draining output on this
    /// thread. Cancellation is requested once `cancel_after` has passed or `interrupt`
    /// is raised; output keeps flowing until the run reports its outcome.
    pub fn run(
        &self,
        only: Option<Vec<String>>,
        cancel_after: Option<Duration>,
        interrupt: &AtomicBool,
        mut on_line: impl FnMut(&str),
    ) -> Result<RunReport, ShellError> {
        let request = match only {
            Some(names) => {
                if let Some(bad) = names.iter().find(|name| !is_valid_option_name(name)) {
                    return Err(ShellError::InvalidOptionName(bad.clone()));
                }
                RunRequest::new(names)
            }
            None => RunRequest::from(&self.options),
        };
        let (handle, events) = self.controller.start_with_channel(request)?;
        let started = Instant::now();
        let mut cancel_sent = false;

        loop {
            match events.recv_timeout(DRAIN_INTERVAL) {
                Ok(RunEvent::Line(line)) => on_line(&line),
                Ok(RunEvent::Finished(report)) => {
                    handle.wait();
                    return Ok(report);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(ShellError::WorkerLost),
            }

            let expired = cancel_after.is_some_and(|limit| started.elapsed() >= limit);
            let interrupted = interrupt.load(Ordering::SeqCst);
            if (expired || interrupted) && !cancel_sent {
                cancel_sent = true;
                tracing::info!(run_id = handle.run_id(), interrupted, "cancelling run");
                match handle.cancel() {
                    Ok(()) | Err(DebloatError::NotRunning) => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
    }

    pub fn launch_configurator(&self, privileges: &dyn PrivilegeProbe) -> Result<u32, ShellError> {
        Ok(self.controller.launch_configurator(privileges)?)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use debloat_core::{RunOutcome, ScriptCommand};
    use tempfile::tempdir;

    fn shell_in(dir: &std::path::Path, script: &str) -> Shell {
        let mut config = DebloatConfig::default();
        config.settings_path = dir.join("debloat_settings.json");
        config.app_list_path = dir.join("Appslist.txt");
        config.script = ScriptCommand::new("/bin/sh", ["-c", script, "debloat"]);
        config.cancel_grace = Duration::from_millis(200);
        Shell::open(config)
    }

    #[test]
    fn first_open_reports_missing_settings() {
        let dir = tempdir().unwrap();
        let shell = shell_in(dir.path(), "true");
        assert_eq!(shell.notices().len(), 1);
        assert_eq!(shell.options().len(), 13);
    }

    #[test]
    fn option_changes_persist_across_sessions() {
        let dir = tempdir().unwrap();
        let mut shell = shell_in(dir.path(), "true");
        shell.set_option("ForceRemoveEdge", true).unwrap();
        shell.set_option("DisableTelemetry", false).unwrap();
        assert!(matches!(
            shell.set_option("-Bad", true),
            Err(ShellError::InvalidOptionName(_))
        ));

        let reopened = shell_in(dir.path(), "true");
        assert!(reopened.notices().is_empty());
        let enabled = reopened.enabled_options();
        assert!(enabled.contains(&"ForceRemoveEdge".to_string()));
        assert!(!enabled.contains(&"DisableTelemetry".to_string()));
    }

    #[test]
    fn missing_app_list_renders_empty_with_notice() {
        let dir = tempdir().unwrap();
        let shell = shell_in(dir.path(), "true");
        let view = shell.apps().unwrap();
        assert!(view.entries.is_empty());
        assert!(view.notice.is_some());
        assert!(matches!(
            shell.toggle_app("Microsoft.BingNews"),
            Err(ShellError::Core(DebloatError::ResourceUnavailable { .. }))
        ));
    }

    #[test]
    fn unreadable_app_list_is_an_error_not_a_notice() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("Appslist.txt"), b"Microsoft.BingNews\n# caf\xe9\n").unwrap();
        let shell = shell_in(dir.path(), "true");
        let err = shell.apps().err().expect("non UTF-8 app list must not load");
        assert!(matches!(err, ShellError::Core(DebloatError::ReadFailed { .. })));
    }

    #[test]
    fn run_streams_enabled_flags() {
        let dir = tempdir().unwrap();
        let shell = shell_in(dir.path(), r#"for flag in "$@"; do echo "$flag"; done"#);
        let mut lines = Vec::new();
        let report = shell
            .run(
                Some(vec!["RemoveApps".into(), "DisableRecall".into()]),
                None,
                &AtomicBool::new(false),
                |line| lines.push(line.to_string()),
            )
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Success);
        assert_eq!(lines, vec!["-RemoveApps", "-DisableRecall"]);
    }

    #[test]
    fn cancel_after_stops_a_long_run() {
        let dir = tempdir().unwrap();
        let shell = shell_in(dir.path(), "exec sleep 30");
        let report = shell
            .run(None, Some(Duration::from_millis(100)), &AtomicBool::new(false), |_| {})
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Cancelled);
    }

    #[test]
    fn interrupt_cancels_and_keeps_draining_output() {
        let dir = tempdir().unwrap();
        let shell = shell_in(
            dir.path(),
            "trap 'echo cleaning up; exit 3' TERM; echo started; while :; do sleep 0.05; done",
        );
        let interrupt = AtomicBool::new(false);
        let mut lines = Vec::new();
        let report = shell
            .run(None, None, &interrupt, |line| {
                lines.push(line.to_string());
                if line == "started" {
                    interrupt.store(true, Ordering::SeqCst);
                }
            })
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(lines, vec!["started", "cleaning up"]);
    }

    #[test]
    fn run_rejects_invalid_option_names() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("ran");
        let shell = shell_in(dir.path(), &format!("touch '{}'", marker.display()));
        for bad in ["", "File x", "-Command"] {
            let result = shell.run(
                Some(vec!["RemoveApps".into(), bad.into()]),
                None,
                &AtomicBool::new(false),
                |_| {},
            );
            assert!(matches!(result, Err(ShellError::InvalidOptionName(name)) if name == bad));
        }
        assert!(!marker.exists());
    }
}
