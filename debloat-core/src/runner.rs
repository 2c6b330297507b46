//! Lifecycle of debloat script runs.
//!
//! A [`RunController`] allows one run at a time. Each run owns a background worker
//! that spawns the script with stdout and stderr sharing one pipe, hands every output
//! line to the consumer in arrival order and reports exactly one [`RunReport`] when the
//! process is gone.
use crate::config::DebloatConfig;
use crate::error::{DebloatError, Result};
use crate::options::OptionStore;
use crate::privilege::PrivilegeProbe;
use std::ffi::OsString;
use std::fmt;
use std::io::{BufRead, BufReader, ErrorKind, PipeReader, Read};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const DEFAULT_SCRIPT_PATH: &str = r"Win11Debloat\Win11Debloat.ps1";
pub const CONFIGURATOR_FLAG: &str = "RunAppConfigurator";
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(3);

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const PUMP_JOIN_TIMEOUT: Duration = Duration::from_millis(250);

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Presence-only command line flag for an option.
pub fn option_flag(name: &str) -> String {
    format!("-{name}")
}

/// Fixed program and leading arguments every run starts with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl Default for ScriptCommand {
    fn default() -> Self {
        Self::powershell(DEFAULT_SCRIPT_PATH)
    }
}

impl ScriptCommand {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        ScriptCommand {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn powershell(script: impl Into<PathBuf>) -> Self {
        let script: PathBuf = script.into();
        Self::new(
            "powershell.exe",
            [
                OsString::from("-ExecutionPolicy"),
                OsString::from("Bypass"),
                OsString::from("-File"),
                script.into_os_string(),
            ],
        )
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Full argument vector (program excluded) for the given trailing flags.
    pub fn arguments(&self, flags: &[String]) -> Vec<OsString> {
        self.args
            .iter()
            .cloned()
            .chain(flags.iter().map(OsString::from))
            .collect()
    }

    fn command(&self, flags: &[String]) -> Command {
        let mut command = Command::new(&self.program);
        command.args(self.arguments(flags)).stdin(Stdio::null());
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            command.creation_flags(CREATE_NO_WINDOW);
        }
        command
    }
}

/// Option names enabled when a run starts, in order and without duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunRequest {
    options: Vec<String>,
}

impl RunRequest {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut options: Vec<String> = Vec::new();
        for name in names {
            let name = name.into();
            if !options.contains(&name) {
                options.push(name);
            }
        }
        RunRequest { options }
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    pub fn flags(&self) -> Vec<String> {
        self.options.iter().map(|name| option_flag(name)).collect()
    }
}

impl From<&OptionStore> for RunRequest {
    fn from(store: &OptionStore) -> Self {
        RunRequest::new(store.enabled_names())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Cancelling,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunFailure {
    /// The script exited with a non-zero code.
    Exit(i32),
    /// The script was ended by a signal and reported no exit code.
    Terminated,
    Launch(String),
    Io(String),
    Panicked,
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunFailure::Exit(code) => write!(f, "script exited with code {code}"),
            RunFailure::Terminated => write!(f, "script was terminated without an exit code"),
            RunFailure::Launch(message) => write!(f, "{message}"),
            RunFailure::Io(message) => write!(f, "failed to read script output: {message}"),
            RunFailure::Panicked => write!(f, "run worker panicked"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Cancelled,
    Failed(RunFailure),
}

impl RunOutcome {
    fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(0) => RunOutcome::Success,
            Some(code) => RunOutcome::Failed(RunFailure::Exit(code)),
            None => RunOutcome::Failed(RunFailure::Terminated),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: u64,
    pub outcome: RunOutcome,
    pub elapsed: Duration,
}

/// What the channel adaptor hands to the foreground.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    Line(String),
    Finished(RunReport),
}

#[derive(Debug)]
struct Slot {
    state: RunState,
    run_id: Option<u64>,
}

#[derive(Debug)]
struct Shared {
    slot: Mutex<Slot>,
    next_run_id: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_requested(&self) -> bool {
        self.lock().state == RunState::Cancelling
    }

    fn request_cancel(&self, run_id: Option<u64>) -> Result<()> {
        let mut slot = self.lock();
        if run_id.is_some() && slot.run_id != run_id {
            return Err(DebloatError::NotRunning);
        }
        match slot.state {
            RunState::Idle => Err(DebloatError::NotRunning),
            RunState::Running => {
                slot.state = RunState::Cancelling;
                tracing::info!(run_id = slot.run_id, "cancellation requested");
                Ok(())
            }
            RunState::Cancelling => Ok(()),
        }
    }

    /// Return to Idle; reports whether the run was being cancelled.
    fn finish(&self) -> bool {
        let mut slot = self.lock();
        let cancelled = slot.state == RunState::Cancelling;
        slot.state = RunState::Idle;
        slot.run_id = None;
        cancelled
    }
}

/// Starts, streams and cancels script runs, one at a time.
#[derive(Debug, Clone)]
pub struct RunController {
    script: ScriptCommand,
    cancel_grace: Duration,
    shared: Arc<Shared>,
}

impl Default for RunController {
    fn default() -> Self {
        Self::new(ScriptCommand::default())
    }
}

impl RunController {
    pub fn new(script: ScriptCommand) -> Self {
        RunController {
            script,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    state: RunState::Idle,
                    run_id: None,
                }),
                next_run_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn from_config(config: &DebloatConfig) -> Self {
        Self::new(config.script.clone()).with_cancel_grace(config.cancel_grace)
    }

    /// How long a cancelled script gets to exit before it is killed.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn script(&self) -> &ScriptCommand {
        &self.script
    }

    pub fn state(&self) -> RunState {
        self.shared.lock().state
    }

    /// Start a run. `on_line` receives every output line in order on the worker
    /// thread; `on_complete` is called exactly once, after the controller is Idle again.
    pub fn start<L, C>(&self, request: RunRequest, on_line: L, on_complete: C) -> Result<RunHandle>
    where
        L: FnMut(String) + Send + 'static,
        C: FnOnce(RunReport) + Send + 'static,
    {
        let run_id = {
            let mut slot = self.shared.lock();
            if slot.state != RunState::Idle {
                tracing::warn!(active_run = slot.run_id, "rejected start while a run is active");
                return Err(DebloatError::AlreadyRunning);
            }
            let run_id = self.shared.next_run_id.fetch_add(1, Ordering::Relaxed);
            slot.state = RunState::Running;
            slot.run_id = Some(run_id);
            run_id
        };

        let job = RunJob {
            run_id,
            flags: request.flags(),
            script: self.script.clone(),
            cancel_grace: self.cancel_grace,
            shared: Arc::clone(&self.shared),
        };
        tracing::info!(run_id, options = request.options().len(), "starting debloat run");

        let worker = thread::Builder::new()
            .name(format!("debloat-run-{run_id}"))
            .spawn(move || job.run(on_line, on_complete));

        match worker {
            Ok(worker) => Ok(RunHandle {
                run_id,
                shared: Arc::clone(&self.shared),
                worker: Some(worker),
            }),
            Err(err) => {
                self.shared.finish();
                tracing::error!(run_id, error = %err, "failed to spawn run worker");
                Err(DebloatError::launch(self.script.program(), err))
            }
        }
    }

    /// Like [`RunController::start`], but delivers lines and the final report through
    /// a channel the foreground drains on its own schedule.
    pub fn start_with_channel(&self, request: RunRequest) -> Result<(RunHandle, Receiver<RunEvent>)> {
        let (tx, rx) = mpsc::channel();
        let line_tx = tx.clone();
        let handle = self.start(
            request,
            move |line| {
                let _ = line_tx.send(RunEvent::Line(line));
            },
            move |report| {
                let _ = tx.send(RunEvent::Finished(report));
            },
        )?;
        Ok((handle, rx))
    }

    /// Ask the active run to stop. Repeated requests while cancelling are no-ops.
    pub fn cancel(&self) -> Result<()> {
        self.shared.request_cancel(None)
    }

    /// Launch the app configurator and return its pid. The launch is fire-and-forget:
    /// it does not touch the run state and its output is discarded.
    pub fn launch_configurator(&self, privileges: &dyn PrivilegeProbe) -> Result<u32> {
        if !privileges.is_elevated() {
            tracing::warn!("app configurator requested without administrative rights");
            return Err(DebloatError::PermissionDenied("App Configurator".to_string()));
        }

        let mut command = self.script.command(&[option_flag(CONFIGURATOR_FLAG)]);
        command.stdout(Stdio::null()).stderr(Stdio::null());
        let mut child = command.spawn().map_err(|err| {
            let err = DebloatError::launch(self.script.program(), err);
            tracing::error!(error = %err, "failed to launch app configurator");
            err
        })?;

        let pid = child.id();
        tracing::info!(pid, "app configurator launched");
        let reaper = thread::Builder::new()
            .name("debloat-configurator".to_string())
            .spawn(move || match child.wait() {
                Ok(status) => tracing::info!(pid, %status, "app configurator exited"),
                Err(err) => tracing::warn!(pid, error = %err, "failed to reap app configurator"),
            });
        if let Err(err) = reaper {
            tracing::warn!(pid, error = %err, "app configurator will not be reaped");
        }
        Ok(pid)
    }
}

/// Handle to a started run.
#[derive(Debug)]
pub struct RunHandle {
    run_id: u64,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl RunHandle {
    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    /// Cancel this run; fails with `NotRunning` once it has finished.
    pub fn cancel(&self) -> Result<()> {
        self.shared.request_cancel(Some(self.run_id))
    }

    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Block until the worker, including the completion callback, is done.
    pub fn wait(mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!(run_id = self.run_id, "run worker terminated abnormally");
            }
        }
    }
}

enum PumpEvent {
    Line(String),
    Failed(String),
}

struct RunJob {
    run_id: u64,
    flags: Vec<String>,
    script: ScriptCommand,
    cancel_grace: Duration,
    shared: Arc<Shared>,
}

impl RunJob {
    fn run<L, C>(self, mut on_line: L, on_complete: C)
    where
        L: FnMut(String),
        C: FnOnce(RunReport),
    {
        let started = Instant::now();
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.execute(&mut on_line))) {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!(run_id = self.run_id, "run worker panicked");
                RunOutcome::Failed(RunFailure::Panicked)
            }
        };

        let outcome = if self.shared.finish() {
            RunOutcome::Cancelled
        } else {
            outcome
        };
        let report = RunReport {
            run_id: self.run_id,
            outcome,
            elapsed: started.elapsed(),
        };

        match &report.outcome {
            RunOutcome::Success => tracing::info!(run_id = self.run_id, "debloat run completed"),
            RunOutcome::Cancelled => tracing::info!(run_id = self.run_id, "debloat run cancelled"),
            RunOutcome::Failed(failure) => {
                tracing::warn!(run_id = self.run_id, %failure, "debloat run failed")
            }
        }

        if panic::catch_unwind(AssertUnwindSafe(|| on_complete(report))).is_err() {
            tracing::error!(run_id = self.run_id, "completion callback panicked");
        }
    }

    fn execute(&self, on_line: &mut dyn FnMut(String)) -> RunOutcome {
        if self.shared.cancel_requested() {
            return RunOutcome::Cancelled;
        }

        let (mut child, output) = match self.spawn() {
            Ok(spawned) => spawned,
            Err(err) => {
                tracing::error!(run_id = self.run_id, error = %err, "failed to launch script");
                return RunOutcome::Failed(RunFailure::Launch(err.to_string()));
            }
        };

        let (tx, rx) = mpsc::channel();
        let pump = match thread::Builder::new()
            .name(format!("debloat-output-{}", self.run_id))
            .spawn(move || pump_lines(output, tx))
        {
            Ok(pump) => pump,
            Err(err) => return RunOutcome::Failed(RunFailure::Io(err.to_string())),
        };

        let outcome = self.supervise(&mut child, &rx, on_line);
        drop(child);
        drop(rx);
        self.release_pump(pump);
        outcome
    }

    /// Forward output and watch for exit or cancellation until the script is reaped.
    fn supervise(
        &self,
        child: &mut RunningScript,
        rx: &Receiver<PumpEvent>,
        on_line: &mut dyn FnMut(String),
    ) -> RunOutcome {
        let mut stream_open = true;
        let mut kill_deadline: Option<Instant> = None;
        let mut killed = false;

        loop {
            if stream_open {
                match rx.recv_timeout(POLL_INTERVAL) {
                    Ok(PumpEvent::Line(line)) => on_line(line),
                    Ok(PumpEvent::Failed(message)) => {
                        tracing::warn!(run_id = self.run_id, error = %message, "output stream failed");
                        child.kill();
                        let _ = child.wait();
                        return RunOutcome::Failed(RunFailure::Io(message));
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => stream_open = false,
                }
            }

            if self.shared.cancel_requested() {
                match kill_deadline {
                    None => {
                        child.terminate();
                        kill_deadline = Some(Instant::now() + self.cancel_grace);
                    }
                    Some(deadline) if !killed && Instant::now() >= deadline => {
                        tracing::warn!(run_id = self.run_id, "script ignored terminate, killing");
                        child.kill();
                        killed = true;
                    }
                    Some(_) => {}
                }
            }

            if !stream_open || kill_deadline.is_some() {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        // Output written before exit still belongs to this run.
                        let drain_until = Instant::now() + PUMP_JOIN_TIMEOUT;
                        while let Some(left) = drain_until.checked_duration_since(Instant::now()) {
                            match rx.recv_timeout(left) {
                                Ok(PumpEvent::Line(line)) => on_line(line),
                                Ok(PumpEvent::Failed(_)) | Err(_) => break,
                            }
                        }
                        tracing::debug!(run_id = self.run_id, %status, "script exited");
                        return RunOutcome::from_status(status);
                    }
                    Ok(None) if !stream_open => thread::sleep(POLL_INTERVAL),
                    Ok(None) => {}
                    Err(err) => return RunOutcome::Failed(RunFailure::Io(err.to_string())),
                }
            }
        }
    }

    /// Join the output pump once the pipe is closed. A descendant of a cancelled
    /// script can keep the write end open; the pump is then detached and exits on
    /// its own at EOF, since the receiver is already gone.
    fn release_pump(&self, pump: JoinHandle<()>) {
        let deadline = Instant::now() + PUMP_JOIN_TIMEOUT;
        while !pump.is_finished() && Instant::now() < deadline {
            thread::sleep(POLL_INTERVAL);
        }
        if pump.is_finished() {
            if pump.join().is_err() {
                tracing::warn!(run_id = self.run_id, "output pump panicked");
            }
        } else {
            tracing::debug!(run_id = self.run_id, "output pipe still held by a descendant, detaching pump");
        }
    }

    fn spawn(&self) -> Result<(RunningScript, PipeReader)> {
        let program = self.script.program();
        let (reader, writer) = std::io::pipe().map_err(|err| DebloatError::launch(program, err))?;
        let writer_for_stderr = writer
            .try_clone()
            .map_err(|err| DebloatError::launch(program, err))?;

        let mut command = self.script.command(&self.flags);
        command.stdout(writer).stderr(writer_for_stderr);
        // Terminal interrupts reach the front-end only; it cancels through the controller.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let child = command
            .spawn()
            .map_err(|err| DebloatError::launch(program, err))?;
        // The command still owns the write ends; the reader only sees EOF once they
        // are closed.
        drop(command);

        tracing::debug!(run_id = self.run_id, pid = child.id(), flags = ?self.flags, "script spawned");
        Ok((
            RunningScript {
                child,
                reaped: false,
            },
            reader,
        ))
    }
}

/// A spawned script that is killed and reaped if dropped before it exited.
struct RunningScript {
    child: Child,
    reaped: bool,
}

impl RunningScript {
    #[cfg(unix)]
    fn terminate(&mut self) {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if self.reaped {
            return;
        }
        let pid = Pid::from_raw(self.child.id() as i32);
        if let Err(err) = kill(pid, Signal::SIGTERM) {
            tracing::debug!(pid = self.child.id(), error = %err, "SIGTERM failed");
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        self.kill();
    }

    fn kill(&mut self) {
        if self.reaped {
            return;
        }
        if let Err(err) = self.child.kill() {
            tracing::debug!(pid = self.child.id(), error = %err, "kill failed");
        }
    }

    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        let status = self.child.try_wait()?;
        self.reaped = status.is_some();
        Ok(status)
    }

    fn wait(&mut self) -> std::io::Result<ExitStatus> {
        let status = self.child.wait()?;
        self.reaped = true;
        Ok(status)
    }
}

impl Drop for RunningScript {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn pump_lines(reader: impl Read, tx: Sender<PumpEvent>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => return,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(PumpEvent::Line(line)).is_err() {
                    return;
                }
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                let _ = tx.send(PumpEvent::Failed(err.to_string()));
                return;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::privilege::FixedPrivileges;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    const DEADLINE: Duration = Duration::from_secs(10);

    fn sh(script: impl AsRef<str>) -> RunController {
        RunController::new(ScriptCommand::new("/bin/sh", ["-c", script.as_ref(), "debloat"]))
            .with_cancel_grace(Duration::from_millis(200))
    }

    /// Drain the channel until the run finishes.
    fn collect(rx: &Receiver<RunEvent>) -> (Vec<String>, RunReport) {
        let mut lines = Vec::new();
        loop {
            match rx.recv_timeout(DEADLINE).expect("run did not finish in time") {
                RunEvent::Line(line) => lines.push(line),
                RunEvent::Finished(report) => return (lines, report),
            }
        }
    }

    fn wait_for_line(rx: &Receiver<RunEvent>, expected: &str) {
        match rx.recv_timeout(DEADLINE).expect("no output from script") {
            RunEvent::Line(line) => assert_eq!(line, expected),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn streams_lines_in_order_then_reports_success() {
        let controller = sh("echo A; echo B; echo C");
        let (handle, rx) = controller.start_with_channel(RunRequest::default()).unwrap();
        let (lines, report) = collect(&rx);
        handle.wait();

        assert_eq!(lines, vec!["A", "B", "C"]);
        assert_eq!(report.outcome, RunOutcome::Success);
        assert_eq!(controller.state(), RunState::Idle);
        assert!(rx.try_recv().is_err(), "exactly one completion per run");
    }

    #[test]
    fn passes_enabled_options_as_flags_in_order() {
        let controller = sh(r#"for flag in "$@"; do echo "$flag"; done"#);
        let request = RunRequest::new(["DisableTelemetry", "RemoveApps", "DisableTelemetry", "ShowKnownFileExt"]);
        let (_handle, rx) = controller.start_with_channel(request).unwrap();
        let (lines, report) = collect(&rx);

        assert_eq!(lines, vec!["-DisableTelemetry", "-RemoveApps", "-ShowKnownFileExt"]);
        assert_eq!(report.outcome, RunOutcome::Success);
    }

    #[test]
    fn merges_stderr_into_the_same_stream() {
        let controller = sh("echo out; echo err 1>&2; echo out2");
        let (_handle, rx) = controller.start_with_channel(RunRequest::default()).unwrap();
        let (lines, _) = collect(&rx);
        assert_eq!(lines, vec!["out", "err", "out2"]);
    }

    #[test]
    fn strips_terminators_and_keeps_trailing_fragment() {
        let controller = sh(r"printf 'one\r\ntwo\n\nthree'");
        let (_handle, rx) = controller.start_with_channel(RunRequest::default()).unwrap();
        let (lines, _) = collect(&rx);
        assert_eq!(lines, vec!["one", "two", "", "three"]);
    }

    #[test]
    fn nonzero_exit_reports_failure_once() {
        let completions = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        let counter = Arc::clone(&completions);
        let handle = sh("echo working; exit 1")
            .start(RunRequest::default(), |_| {}, move |report| {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.send(report).unwrap();
            })
            .unwrap();
        handle.wait();

        let report = rx.recv_timeout(DEADLINE).unwrap();
        assert_eq!(report.outcome, RunOutcome::Failed(RunFailure::Exit(1)));
        assert_eq!(completions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn second_start_is_rejected_without_spawning() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("second-run");
        let controller = sh(format!(
            r#"if [ "$1" = "-Second" ]; then touch '{}'; fi; echo ready; exec sleep 30"#,
            marker.display()
        ));

        let (handle, rx) = controller.start_with_channel(RunRequest::default()).unwrap();
        wait_for_line(&rx, "ready");
        assert_eq!(controller.state(), RunState::Running);

        let second = controller.start(
            RunRequest::new(["Second"]),
            |_| {},
            |_| panic!("rejected run must not complete"),
        );
        assert!(matches!(second, Err(DebloatError::AlreadyRunning)));

        handle.cancel().unwrap();
        let (_, report) = collect(&rx);
        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert!(!marker.exists());
    }

    #[test]
    fn cancel_completes_while_a_descendant_holds_the_pipe() {
        let controller = sh("sleep 5 & echo started; wait");
        let (handle, rx) = controller.start_with_channel(RunRequest::default()).unwrap();
        wait_for_line(&rx, "started");

        let requested = Instant::now();
        controller.cancel().unwrap();
        let (_, report) = collect(&rx);
        handle.wait();

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert!(requested.elapsed() < Duration::from_secs(3));
        assert_eq!(controller.state(), RunState::Idle);
    }

    #[test]
    fn cancel_terminates_a_script_that_never_exits() {
        let controller = sh("echo started; exec sleep 30");
        let (handle, rx) = controller.start_with_channel(RunRequest::default()).unwrap();
        wait_for_line(&rx, "started");

        let requested = Instant::now();
        controller.cancel().unwrap();
        controller.cancel().unwrap();
        let (_, report) = collect(&rx);
        handle.wait();

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert!(requested.elapsed() < Duration::from_secs(5));
        assert_eq!(controller.state(), RunState::Idle);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn cancel_kills_a_script_that_ignores_terminate() {
        let controller = sh("trap '' TERM; echo stubborn; while :; do sleep 0.05; done");
        let (handle, rx) = controller.start_with_channel(RunRequest::default()).unwrap();
        wait_for_line(&rx, "stubborn");

        let requested = Instant::now();
        handle.cancel().unwrap();
        let (_, report) = collect(&rx);

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert!(requested.elapsed() >= Duration::from_millis(200));
        assert!(requested.elapsed() < Duration::from_secs(5));
        assert_eq!(controller.state(), RunState::Idle);
    }

    #[test]
    fn cancel_without_active_run_is_rejected() {
        let controller = sh("true");
        assert!(matches!(controller.cancel(), Err(DebloatError::NotRunning)));

        let (handle, rx) = controller.start_with_channel(RunRequest::default()).unwrap();
        collect(&rx);
        assert!(matches!(handle.cancel(), Err(DebloatError::NotRunning)));
    }

    #[test]
    fn launch_failure_is_reported_through_completion() {
        let controller = RunController::new(ScriptCommand::new(
            "/nonexistent/debloat/Win11Debloat.ps1",
            Vec::<String>::new(),
        ));
        let (_handle, rx) = controller.start_with_channel(RunRequest::default()).unwrap();
        let (lines, report) = collect(&rx);

        assert!(lines.is_empty());
        assert!(matches!(report.outcome, RunOutcome::Failed(RunFailure::Launch(_))));
        assert_eq!(controller.state(), RunState::Idle);
    }

    #[test]
    fn controller_is_idle_before_completion_returns() {
        let controller = sh("echo done");
        let observer = controller.clone();
        let (tx, rx) = mpsc::channel();
        let handle = controller
            .start(RunRequest::default(), |_| {}, move |_| {
                tx.send(observer.state()).unwrap();
            })
            .unwrap();
        handle.wait();

        assert_eq!(rx.recv_timeout(DEADLINE).unwrap(), RunState::Idle);
        let (_again, rx) = controller.start_with_channel(RunRequest::default()).unwrap();
        let (lines, report) = collect(&rx);
        assert_eq!(lines, vec!["done"]);
        assert_eq!(report.outcome, RunOutcome::Success);
    }

    #[test]
    fn panicking_consumer_is_contained() {
        let controller = sh("echo boom; exec sleep 30");
        let (tx, rx) = mpsc::channel();
        let handle = controller
            .start(
                RunRequest::default(),
                |_| panic!("consumer failure"),
                move |report| tx.send(report).unwrap(),
            )
            .unwrap();
        handle.wait();

        let report = rx.recv_timeout(DEADLINE).unwrap();
        assert_eq!(report.outcome, RunOutcome::Failed(RunFailure::Panicked));
        assert_eq!(controller.state(), RunState::Idle);
    }

    #[test]
    fn configurator_requires_admin_rights() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("configurator");
        let controller = RunController::new(ScriptCommand::new(
            "/bin/sh",
            ["-c".to_string(), format!(r#"echo "$@" > '{}'"#, marker.display()), "debloat".to_string()],
        ));

        let denied = controller.launch_configurator(&FixedPrivileges(false));
        assert!(matches!(denied, Err(DebloatError::PermissionDenied(_))));
        thread::sleep(Duration::from_millis(100));
        assert!(!marker.exists());

        controller.launch_configurator(&FixedPrivileges(true)).unwrap();
        assert_eq!(controller.state(), RunState::Idle);
        let started = Instant::now();
        loop {
            if let Ok(contents) = std::fs::read_to_string(&marker) {
                if contents.ends_with('\n') {
                    assert_eq!(contents.trim(), "-RunAppConfigurator");
                    break;
                }
            }
            assert!(started.elapsed() < DEADLINE, "configurator never ran");
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn default_command_mirrors_powershell_invocation() {
        let script = ScriptCommand::default();
        assert_eq!(script.program(), Path::new("powershell.exe"));
        let args: Vec<String> = script
            .arguments(&RunRequest::new(["DisableBing"]).flags())
            .into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec!["-ExecutionPolicy", "Bypass", "-File", DEFAULT_SCRIPT_PATH, "-DisableBing"]
        );
    }

    #[test]
    fn request_from_store_uses_enabled_names() {
        let mut store = OptionStore::default();
        for spec in store.catalog().specs().to_vec() {
            store.set(spec.name, false);
        }
        store.set("RemoveGamingApps", true);
        store.set("DisableTelemetry", true);

        let request = RunRequest::from(&store);
        assert_eq!(request.options(), ["DisableTelemetry", "RemoveGamingApps"]);
    }
}
