use crate::tm::events::{EventKind, EventLog};
use crate::tm::launcher::{Launcher, Termination};
use crate::tm::program::{signal_name, AutoRestart, ProcessSpec};
use crate::tm::rpc::StatusEntry;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::fmt;
use std::time::{Duration, Instant};

/// Rest states of a process entity. Backoff is a decision taken on exit, never a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Running,
    Stopping,
    Exited,
    Fatal,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Stopped => "STOPPED",
            ProcessState::Running => "RUNNING",
            ProcessState::Stopping => "STOPPING",
            ProcessState::Exited => "EXITED",
            ProcessState::Fatal => "FATAL",
        }
    }

    /// No child is alive and nothing further happens without an operator.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ProcessState::Stopped | ProcessState::Exited | ProcessState::Fatal
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("no such program: {0}")]
    UnknownInstance(String),
    #[error("{0} is already running")]
    AlreadyRunning(String),
    #[error("{0} is not running")]
    NotRunning(String),
}

/// Why a start is happening; only backoff keeps the quick-fail counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartKind {
    Operator,
    Backoff,
    AutoRestart,
}

enum AfterExit {
    Relaunch(StartKind),
    Settle,
}

/// One supervised instance and its current (or most recent) child.
///
/// `pid` is `Some` exactly while the state is `Running` or `Stopping`.
#[derive(Debug)]
pub struct ProcessEntity {
    spec: ProcessSpec,
    state: ProcessState,
    pid: Option<Pid>,
    started_at: Option<Instant>,
    last_exit: Option<Termination>,
    retries: u32,
    description: String,
    stop_deadline: Option<Instant>,
}

impl ProcessEntity {
    pub fn new(spec: ProcessSpec) -> Self {
        Self {
            spec,
            state: ProcessState::Stopped,
            pid: None,
            started_at: None,
            last_exit: None,
            retries: 0,
            description: "not started".to_string(),
            stop_deadline: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn last_exit(&self) -> Option<Termination> {
        self.last_exit
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Pending SIGKILL time while a graceful stop is in progress.
    pub fn stop_deadline(&self) -> Option<Instant> {
        self.stop_deadline
    }

    pub fn start(
        &mut self,
        kind: StartKind,
        now: Instant,
        launcher: &mut dyn Launcher,
        log: &mut EventLog,
    ) -> Result<(), CommandError> {
        if matches!(self.state, ProcessState::Running | ProcessState::Stopping) {
            return Err(CommandError::AlreadyRunning(self.spec.name.clone()));
        }
        self.launch(kind, now, launcher, log);
        Ok(())
    }

    // Launch failures that still count as a run (exec/chdir) are fed back through the exit
    // rules as quick exits, so an unrunnable command walks the retries into FATAL instead of
    // spinning.
    fn launch(
        &mut self,
        mut kind: StartKind,
        now: Instant,
        launcher: &mut dyn Launcher,
        log: &mut EventLog,
    ) {
        loop {
            if kind != StartKind::Backoff {
                self.retries = 0;
            }
            match launcher.spawn(&self.spec) {
                Ok(spawned) => {
                    for target in &spawned.redirect_fallbacks {
                        log.record(EventKind::Eacces, &self.spec.name, target);
                    }
                    self.pid = Some(spawned.pid);
                    self.started_at = Some(now);
                    self.stop_deadline = None;
                    self.state = ProcessState::Running;
                    self.description = format!("pid {}", spawned.pid);
                    log.record(EventKind::Spawn, &self.spec.name, spawned.pid.to_string());
                    return;
                }
                Err(e) => {
                    tracing::warn!(instance = %self.spec.name, "launch failed: {e}");
                    let Some(code) = e.exit_status() else {
                        self.pid = None;
                        self.state = ProcessState::Fatal;
                        self.description = e.to_string();
                        log.record(EventKind::Fatal, &self.spec.name, e.to_string());
                        return;
                    };
                    self.pid = None;
                    self.started_at = Some(now);
                    self.state = ProcessState::Running;
                    match self.after_exit(Termination::Exited(code), true, log) {
                        AfterExit::Relaunch(next) => kind = next,
                        AfterExit::Settle => {
                            if self.state == ProcessState::Fatal {
                                self.description = e.to_string();
                            }
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Exit bookkeeping for a run that ended while `Running`. `pid` is already cleared.
    fn after_exit(&mut self, term: Termination, quick: bool, log: &mut EventLog) -> AfterExit {
        self.last_exit = Some(term);
        let name = self.spec.name.as_str();
        if quick && self.retries < self.spec.startretries {
            self.retries += 1;
            log.record(
                EventKind::Backoff,
                name,
                format!("{term} (retry {}/{})", self.retries, self.spec.startretries),
            );
            return AfterExit::Relaunch(StartKind::Backoff);
        }
        if quick {
            self.state = ProcessState::Fatal;
            self.description = format!("exited too quickly ({term})");
            log.record(EventKind::Fatal, name, term.to_string());
            return AfterExit::Settle;
        }

        self.state = ProcessState::Exited;
        self.description = format!("exited ({term})");
        log.record(EventKind::Exit, name, term.to_string());
        let restart = match self.spec.autorestart {
            AutoRestart::Always => true,
            AutoRestart::Never => false,
            AutoRestart::Unexpected => !self.spec.is_expected_exit(term.code()),
        };
        if restart {
            AfterExit::Relaunch(StartKind::AutoRestart)
        } else {
            AfterExit::Settle
        }
    }

    /// The reaper confirmed that this entity's child is gone.
    pub fn on_exit(
        &mut self,
        term: Termination,
        now: Instant,
        launcher: &mut dyn Launcher,
        log: &mut EventLog,
    ) {
        self.pid = None;
        match self.state {
            ProcessState::Stopping => {
                self.stop_deadline = None;
                self.last_exit = Some(term);
                self.state = ProcessState::Stopped;
                self.description = format!("stopped ({term})");
                log.record(EventKind::Stop, &self.spec.name, term.to_string());
            }
            ProcessState::Running => {
                let uptime = self
                    .started_at
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or(Duration::ZERO);
                let quick = uptime < self.spec.start_window();
                if let AfterExit::Relaunch(kind) = self.after_exit(term, quick, log) {
                    self.launch(kind, now, launcher, log);
                }
            }
            state => {
                tracing::debug!(instance = %self.spec.name, %state, "exit reported for settled entity");
            }
        }
    }

    /// Begin a graceful stop: send the stop signal and arm the kill deadline.
    pub fn stop(
        &mut self,
        now: Instant,
        launcher: &mut dyn Launcher,
        log: &mut EventLog,
    ) -> Result<(), CommandError> {
        let (ProcessState::Running, Some(pid)) = (self.state, self.pid) else {
            return Err(CommandError::NotRunning(self.spec.name.clone()));
        };
        let sig = self.spec.stopsignal;
        self.state = ProcessState::Stopping;
        self.stop_deadline = Some(now + self.spec.stop_grace());
        self.description = format!("pid {pid}, stopping");
        log.record(EventKind::WaitStop, &self.spec.name, signal_name(sig));
        self.send(launcher, pid, sig);
        Ok(())
    }

    /// Escalate to SIGKILL once the grace period has passed.
    pub fn on_stop_deadline(&mut self, now: Instant, launcher: &mut dyn Launcher, log: &mut EventLog) {
        let (ProcessState::Stopping, Some(pid), Some(deadline)) =
            (self.state, self.pid, self.stop_deadline)
        else {
            return;
        };
        if now < deadline {
            return;
        }
        self.stop_deadline = None;
        log.record(EventKind::Kill, &self.spec.name, format!("pid {pid}"));
        self.send(launcher, pid, Signal::SIGKILL);
    }

    fn send(&self, launcher: &mut dyn Launcher, pid: Pid, sig: Signal) {
        if let Err(e) = launcher.signal(pid, sig) {
            tracing::warn!(instance = %self.spec.name, %pid, "failed to send {}: {e}", sig.as_str());
        }
    }

    pub fn status_entry(&self, now: Instant) -> StatusEntry {
        let description = match (self.state, self.pid, self.started_at) {
            (ProcessState::Running, Some(pid), Some(t)) => {
                format!("pid {pid}, uptime {}", fmt_uptime(now.saturating_duration_since(t)))
            }
            _ => self.description.clone(),
        };
        StatusEntry {
            name: self.spec.name.clone(),
            state: self.state.to_string(),
            description,
        }
    }
}

fn fmt_uptime(d: Duration) -> String {
    let s = d.as_secs();
    format!("{}:{:02}:{:02}", s / 3600, (s / 60) % 60, s % 60)
}
