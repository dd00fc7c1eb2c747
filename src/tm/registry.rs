use crate::tm::events::{tm_event, EventLog};
use crate::tm::launcher::{Launcher, Termination};
use crate::tm::process::{ProcessEntity, ProcessState, StartKind};
use crate::tm::program::ProcessSpec;
use crate::tm::rpc::StatusEntry;
use nix::unistd::Pid;
use std::time::Instant;

/// What a reload did, by instance name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub kept: Vec<String>,
    pub removed: Vec<String>,
    pub added: Vec<String>,
}

impl ReloadSummary {
    pub fn describe(&self) -> String {
        format!(
            "kept={} removed={} added={}",
            self.kept.len(),
            self.removed.len(),
            self.added.len()
        )
    }
}

/// Instance name to entity, in configuration order.
///
/// Entities dropped by a reload or a shutdown move to `retiring` until their child is
/// confirmed gone, so the reaper and the kill timers still reach them.
#[derive(Debug, Default)]
pub struct Registry {
    entities: Vec<ProcessEntity>,
    retiring: Vec<ProcessEntity>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ProcessEntity> {
        self.entities.iter().find(|e| e.name() == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ProcessEntity> {
        self.entities.iter_mut().find(|e| e.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessEntity> {
        self.entities.iter()
    }

    pub fn retiring(&self) -> impl Iterator<Item = &ProcessEntity> {
        self.retiring.iter()
    }

    /// The live or retiring entity whose current child is `pid`.
    pub fn owner_of(&self, pid: Pid) -> Option<&ProcessEntity> {
        self.entities
            .iter()
            .chain(self.retiring.iter())
            .find(|e| e.pid() == Some(pid))
    }

    /// One entity per spec; start the `autostart` ones.
    pub fn apply_initial(
        &mut self,
        specs: Vec<ProcessSpec>,
        now: Instant,
        launcher: &mut dyn Launcher,
        log: &mut EventLog,
    ) {
        for spec in specs {
            let entity = admit(spec, now, launcher, log);
            self.entities.push(entity);
        }
    }

    /// Keep running entities whose spec is unchanged, retire everything else, and
    /// create (and autostart) entities for the specs left over.
    pub fn reload(
        &mut self,
        specs: Vec<ProcessSpec>,
        now: Instant,
        launcher: &mut dyn Launcher,
        log: &mut EventLog,
    ) -> ReloadSummary {
        let mut summary = ReloadSummary::default();
        let mut old = std::mem::take(&mut self.entities);
        let mut next = Vec::with_capacity(specs.len());

        for spec in specs {
            let keep = old
                .iter()
                .position(|e| e.state() == ProcessState::Running && *e.spec() == spec);
            match keep {
                Some(i) => {
                    let entity = old.remove(i);
                    summary.kept.push(entity.name().to_string());
                    next.push(entity);
                }
                None => {
                    summary.added.push(spec.name.clone());
                    next.push(admit(spec, now, launcher, log));
                }
            }
        }

        for mut entity in old {
            summary.removed.push(entity.name().to_string());
            if entity.state() == ProcessState::Running {
                let _ = entity.stop(now, launcher, log);
            }
            if !entity.state().is_settled() {
                self.retiring.push(entity);
            }
        }

        self.entities = next;
        tm_event("registry", None, format!("reload applied {}", summary.describe()));
        summary
    }

    /// Stop everything that is alive and empty the registry.
    pub fn shutdown_all(&mut self, now: Instant, launcher: &mut dyn Launcher, log: &mut EventLog) {
        for mut entity in std::mem::take(&mut self.entities) {
            if entity.state() == ProcessState::Running {
                let _ = entity.stop(now, launcher, log);
            }
            if !entity.state().is_settled() {
                self.retiring.push(entity);
            }
        }
    }

    /// Attribute a reaped child to its entity. Returns the entity name, if any owned it.
    pub fn on_child_exit(
        &mut self,
        pid: Pid,
        term: Termination,
        now: Instant,
        launcher: &mut dyn Launcher,
        log: &mut EventLog,
    ) -> Option<String> {
        let owner = self
            .entities
            .iter_mut()
            .chain(self.retiring.iter_mut())
            .find(|e| e.pid() == Some(pid));
        let name = match owner {
            Some(entity) => {
                entity.on_exit(term, now, launcher, log);
                Some(entity.name().to_string())
            }
            None => {
                tracing::debug!(%pid, "reaped child with no owning entity ({term})");
                None
            }
        };
        self.retiring.retain(|e| !e.state().is_settled());
        name
    }

    /// Earliest pending kill deadline across live and retiring entities.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entities
            .iter()
            .chain(self.retiring.iter())
            .filter_map(ProcessEntity::stop_deadline)
            .min()
    }

    pub fn fire_timers(&mut self, now: Instant, launcher: &mut dyn Launcher, log: &mut EventLog) {
        for entity in self.entities.iter_mut().chain(self.retiring.iter_mut()) {
            entity.on_stop_deadline(now, launcher, log);
        }
    }

    /// Nothing alive and nothing still stopping, anywhere.
    pub fn all_settled(&self) -> bool {
        self.retiring.is_empty() && self.entities.iter().all(|e| e.state().is_settled())
    }

    pub fn status(&self, now: Instant) -> Vec<StatusEntry> {
        self.entities.iter().map(|e| e.status_entry(now)).collect()
    }
}

fn admit(
    spec: ProcessSpec,
    now: Instant,
    launcher: &mut dyn Launcher,
    log: &mut EventLog,
) -> ProcessEntity {
    let autostart = spec.autostart;
    let mut entity = ProcessEntity::new(spec);
    if autostart {
        // A fresh entity is STOPPED, so this cannot be rejected.
        let _ = entity.start(StartKind::Operator, now, launcher, log);
    }
    entity
}
