use chrono::Local;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Diagnostic line for supervisor activity, tagged with the component and (optionally)
/// the instance it concerns.
pub fn tm_event(component: &str, instance: Option<&str>, msg: impl AsRef<str>) {
    match instance {
        Some(instance) => tracing::info!(component, instance, "{}", msg.as_ref()),
        None => tracing::info!(component, "{}", msg.as_ref()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Info => "INFO",
            EventLevel::Warn => "WARN",
            EventLevel::Error => "ERROR",
        }
    }
}

/// Kinds of lines written to the append-only event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Daemon,
    Spawn,
    Backoff,
    Exit,
    WaitStop,
    Stop,
    Kill,
    Fatal,
    Reload,
    Eacces,
    Config,
    Quit,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Daemon => "DAEMON",
            EventKind::Spawn => "SPAWN",
            EventKind::Backoff => "BACKOFF",
            EventKind::Exit => "EXIT",
            EventKind::WaitStop => "WAITSTOP",
            EventKind::Stop => "STOP",
            EventKind::Kill => "KILL",
            EventKind::Fatal => "FATAL",
            EventKind::Reload => "RELOAD",
            EventKind::Eacces => "EACCES",
            EventKind::Config => "CONFIG",
            EventKind::Quit => "QUIT",
        }
    }

    pub fn level(&self) -> EventLevel {
        match self {
            EventKind::Kill | EventKind::Reload | EventKind::Eacces => EventLevel::Warn,
            EventKind::Config => EventLevel::Error,
            _ => EventLevel::Info,
        }
    }

    /// Fixed message text; the caller's detail is appended after it.
    pub fn message(&self) -> &'static str {
        match self {
            EventKind::Daemon => "daemon started, pid",
            EventKind::Spawn => "spawned child, pid",
            EventKind::Backoff => "exited too quickly, retrying;",
            EventKind::Exit => "child exited;",
            EventKind::WaitStop => "sent stop signal, waiting;",
            EventKind::Stop => "child stopped;",
            EventKind::Kill => "still alive after stopwaitsecs, sent SIGKILL;",
            EventKind::Fatal => "too many quick exits, entered FATAL;",
            EventKind::Reload => "reload requested",
            EventKind::Eacces => "cannot open redirect target, using /dev/null:",
            EventKind::Config => "configuration rejected:",
            EventKind::Quit => "daemon shutting down",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn format_event_line(ts: &str, kind: EventKind, instance: &str, info: &str) -> String {
    let mut line = format!("{ts} {} {instance} : {}", kind.level().as_str(), kind.message());
    if !info.is_empty() {
        line.push(' ');
        line.push_str(info);
    }
    line
}

enum Sink {
    Disabled,
    File {
        path: PathBuf,
        file: Option<File>,
        failing: bool,
    },
    Memory(Vec<String>),
}

/// Append-only event log. Writes are best effort: failures are reported through
/// `tracing` once per failure streak and never reach the caller.
pub struct EventLog {
    sink: Sink,
}

impl EventLog {
    pub fn disabled() -> Self {
        Self { sink: Sink::Disabled }
    }

    pub fn to_path(path: Option<&Path>) -> Self {
        match path {
            Some(p) => Self {
                sink: Sink::File {
                    path: p.to_path_buf(),
                    file: None,
                    failing: false,
                },
            },
            None => Self::disabled(),
        }
    }

    /// Keeps formatted lines in memory instead of writing them out.
    pub fn in_memory() -> Self {
        Self {
            sink: Sink::Memory(Vec::new()),
        }
    }

    pub fn lines(&self) -> &[String] {
        match &self.sink {
            Sink::Memory(v) => v,
            _ => &[],
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.sink {
            Sink::File { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Point the log at a new destination (after a reload). A no-op if unchanged.
    pub fn retarget(&mut self, path: Option<&Path>) {
        if self.path() == path || matches!(self.sink, Sink::Memory(_)) {
            return;
        }
        *self = Self::to_path(path);
    }

    pub fn record(&mut self, kind: EventKind, instance: &str, info: impl AsRef<str>) {
        let info = info.as_ref();
        match kind.level() {
            EventLevel::Info => tracing::info!(event = kind.as_str(), instance, "{}", info),
            EventLevel::Warn => tracing::warn!(event = kind.as_str(), instance, "{}", info),
            EventLevel::Error => tracing::error!(event = kind.as_str(), instance, "{}", info),
        }

        let ts = Local::now().format("%a %b %e %H:%M:%S %Y").to_string();
        let line = format_event_line(&ts, kind, instance, info);
        match &mut self.sink {
            Sink::Disabled => {}
            Sink::Memory(v) => v.push(line),
            Sink::File {
                path,
                file,
                failing,
            } => {
                let res = append_line(path, file, &line);
                match res {
                    Ok(()) => *failing = false,
                    Err(e) => {
                        *file = None;
                        if !*failing {
                            tracing::warn!(path = %path.display(), "event log write failed: {e}");
                        }
                        *failing = true;
                    }
                }
            }
        }
    }
}

fn append_line(path: &Path, file: &mut Option<File>, line: &str) -> std::io::Result<()> {
    if file.is_none() {
        *file = Some(OpenOptions::new().create(true).append(true).open(path)?);
    }
    match file.as_mut() {
        Some(f) => writeln!(f, "{line}"),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_layout() {
        let line = format_event_line("Mon Jan  1 00:00:00 2024", EventKind::Spawn, "web:0", "4242");
        assert_eq!(
            line,
            "Mon Jan  1 00:00:00 2024 INFO web:0 : spawned child, pid 4242"
        );
    }

    #[test]
    fn kill_is_a_warning_and_config_an_error() {
        assert_eq!(EventKind::Kill.level(), EventLevel::Warn);
        assert_eq!(EventKind::Config.level(), EventLevel::Error);
        assert_eq!(EventKind::Stop.level(), EventLevel::Info);
    }

    #[test]
    fn file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let mut log = EventLog::to_path(Some(&path));
        log.record(EventKind::Daemon, "taskmasterd", "1");
        log.record(EventKind::Quit, "taskmasterd", "");
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("INFO taskmasterd : daemon started, pid 1"));
        assert!(lines[1].ends_with("INFO taskmasterd : daemon shutting down"));
    }

    #[test]
    fn unwritable_path_never_panics() {
        let mut log = EventLog::to_path(Some(Path::new("/nonexistent/dir/events.log")));
        log.record(EventKind::Exit, "p", "0");
        log.record(EventKind::Exit, "p", "0");
    }
}
