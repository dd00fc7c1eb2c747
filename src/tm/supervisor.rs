use crate::tm::config::{load_master_config, MasterConfig};
use crate::tm::events::{tm_event, EventKind, EventLog};
use crate::tm::launcher::{Launcher, Termination};
use crate::tm::process::{CommandError, ProcessEntity, ProcessState, StartKind};
use crate::tm::registry::{Registry, ReloadSummary};
use crate::tm::rpc::StatusEntry;
use nix::unistd::Pid;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// What `restart` did right away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartProgress {
    /// The instance was not running and has been started.
    Started,
    /// A graceful stop is under way; the start follows once the child is reaped.
    Stopping,
}

/// Owns every piece of supervisor state. Only the event loop touches it.
pub struct Supervisor<L: Launcher> {
    config_path: PathBuf,
    config: MasterConfig,
    registry: Registry,
    launcher: L,
    events: EventLog,
    pending_restarts: BTreeSet<String>,
    quitting: bool,
}

impl<L: Launcher> Supervisor<L> {
    pub fn new(config_path: PathBuf, config: MasterConfig, launcher: L, events: EventLog) -> Self {
        Self {
            config_path,
            config,
            registry: Registry::new(),
            launcher,
            events,
            pending_restarts: BTreeSet::new(),
            quitting: false,
        }
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    pub fn is_quitting(&self) -> bool {
        self.quitting
    }

    /// Create the initial entities and start the autostart ones.
    pub fn boot(&mut self, now: Instant, banner: &str) {
        self.events.record(
            EventKind::Daemon,
            "taskmasterd",
            format!("{} ({banner})", std::process::id()),
        );
        let specs = self.config.specs.clone();
        self.registry
            .apply_initial(specs, now, &mut self.launcher, &mut self.events);
        tm_event(
            "supervisor",
            None,
            format!("booted with {} instance(s)", self.registry.len()),
        );
    }

    fn entity_mut(&mut self, name: &str) -> Result<&mut ProcessEntity, CommandError> {
        self.registry
            .get_mut(name)
            .ok_or_else(|| CommandError::UnknownInstance(name.to_string()))
    }

    pub fn state_of(&self, name: &str) -> Option<ProcessState> {
        self.registry.get(name).map(ProcessEntity::state)
    }

    pub fn description_of(&self, name: &str) -> Option<&str> {
        self.registry.get(name).map(ProcessEntity::description)
    }

    pub fn start(&mut self, name: &str, now: Instant) -> Result<(), CommandError> {
        let entity = self
            .registry
            .get_mut(name)
            .ok_or_else(|| CommandError::UnknownInstance(name.to_string()))?;
        entity.start(StartKind::Operator, now, &mut self.launcher, &mut self.events)
    }

    pub fn stop(&mut self, name: &str, now: Instant) -> Result<(), CommandError> {
        let entity = self
            .registry
            .get_mut(name)
            .ok_or_else(|| CommandError::UnknownInstance(name.to_string()))?;
        entity.stop(now, &mut self.launcher, &mut self.events)
    }

    pub fn restart(&mut self, name: &str, now: Instant) -> Result<RestartProgress, CommandError> {
        let state = self.entity_mut(name)?.state();
        if state == ProcessState::Running {
            self.stop(name, now)?;
            self.pending_restarts.insert(name.to_string());
            return Ok(RestartProgress::Stopping);
        }
        self.start(name, now)?;
        Ok(RestartProgress::Started)
    }

    /// A restart of `name` is still waiting for its stop to complete.
    pub fn restart_pending(&self, name: &str) -> bool {
        self.pending_restarts.contains(name)
    }

    /// Re-read the configuration file and apply it. On failure nothing changes.
    pub fn reload(&mut self, now: Instant) -> anyhow::Result<ReloadSummary> {
        self.events
            .record(EventKind::Reload, "taskmasterd", self.config_path.display().to_string());
        match load_master_config(&self.config_path) {
            Ok(cfg) => Ok(self.apply_config(cfg, now)),
            Err(e) => {
                self.events
                    .record(EventKind::Config, "taskmasterd", format!("{e:#}"));
                Err(e)
            }
        }
    }

    /// Apply an already validated configuration through the reload diff.
    pub fn apply_config(&mut self, cfg: MasterConfig, now: Instant) -> ReloadSummary {
        if cfg.sock != self.config.sock {
            tracing::warn!(
                old = %self.config.sock.display(),
                new = %cfg.sock.display(),
                "unix_socket.path changes take effect on the next daemon start"
            );
        }
        self.events.retarget(cfg.event_log.as_deref());
        let summary =
            self.registry
                .reload(cfg.specs.clone(), now, &mut self.launcher, &mut self.events);
        self.pending_restarts
            .retain(|n| summary.kept.iter().any(|k| k == n));
        self.config = MasterConfig {
            sock: self.config.sock.clone(),
            ..cfg
        };
        summary
    }

    /// Stop everything; the daemon exits once `all_settled` holds.
    pub fn begin_shutdown(&mut self, now: Instant) {
        if self.quitting {
            return;
        }
        self.quitting = true;
        self.pending_restarts.clear();
        self.events.record(EventKind::Quit, "taskmasterd", "");
        self.registry
            .shutdown_all(now, &mut self.launcher, &mut self.events);
    }

    pub fn all_settled(&self) -> bool {
        self.registry.all_settled()
    }

    pub fn on_child_exit(&mut self, pid: Pid, term: Termination, now: Instant) {
        let owner = self
            .registry
            .on_child_exit(pid, term, now, &mut self.launcher, &mut self.events);
        if let Some(name) = owner {
            self.resume_restart(&name, now);
        }
    }

    fn resume_restart(&mut self, name: &str, now: Instant) {
        if !self.pending_restarts.contains(name) {
            return;
        }
        let Some(entity) = self.registry.get_mut(name) else {
            self.pending_restarts.remove(name);
            return;
        };
        if entity.state() == ProcessState::Stopping {
            return;
        }
        self.pending_restarts.remove(name);
        if let Err(e) = entity.start(StartKind::Operator, now, &mut self.launcher, &mut self.events) {
            tm_event("supervisor", Some(name), format!("restart skipped: {e}"));
        }
    }

    /// `pid` still belongs to a live or retiring entity, i.e. it has not been reaped yet.
    pub fn tracks_pid(&self, pid: Pid) -> bool {
        self.registry.owner_of(pid).is_some()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.registry.next_deadline()
    }

    pub fn fire_timers(&mut self, now: Instant) {
        self.registry
            .fire_timers(now, &mut self.launcher, &mut self.events);
    }

    pub fn status(&self, now: Instant) -> Vec<StatusEntry> {
        self.registry.status(now)
    }
}
