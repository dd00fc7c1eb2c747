use crate::tm::program::{ProcessSpec, Redirect};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{setsid, Pid};
use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// How a reaped child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(Signal),
}

impl Termination {
    /// Exit code, if the child exited on its own.
    pub fn code(&self) -> Option<i32> {
        match self {
            Termination::Exited(c) => Some(*c),
            Termination::Signaled(_) => None,
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Exited(c) => write!(f, "exit status {c}"),
            Termination::Signaled(s) => write!(f, "signal {}", s.as_str()),
        }
    }
}

#[derive(Debug)]
pub struct Spawned {
    pub pid: Pid,
    /// Redirect targets that could not be opened and were replaced by /dev/null.
    pub redirect_fallbacks: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("cannot change directory to {}: {source}", .dir.display())]
    Chdir { dir: PathBuf, source: io::Error },
    #[error("cannot execute {program}: {source}")]
    Exec { program: String, source: io::Error },
    #[error("cannot fork: {0}")]
    Fork(#[source] io::Error),
}

impl LaunchError {
    /// The exit status a failed attempt counts as. `None` means no child could be created at
    /// all, so the attempt cannot be retried like an ordinary exit.
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            LaunchError::Chdir { .. } => Some(126),
            LaunchError::Exec { .. } => Some(127),
            LaunchError::Fork(_) => None,
        }
    }
}

/// Creates and signals OS processes on behalf of process entities.
pub trait Launcher {
    fn spawn(&mut self, spec: &ProcessSpec) -> Result<Spawned, LaunchError>;

    /// Deliver `sig` to `pid`. A target that is already gone is not an error.
    fn signal(&mut self, pid: Pid, sig: Signal) -> io::Result<()>;
}

/// Launches children with `std::process::Command`. Child-side setup in `pre_exec`:
/// new session, umask, closing descriptors configured as `NONE`.
#[derive(Debug, Default)]
pub struct CommandLauncher;

fn redirect_stdio(r: &Redirect, fallbacks: &mut Vec<String>) -> Stdio {
    match r {
        // Closed in pre_exec; /dev/null keeps std from inheriting the daemon's descriptor.
        Redirect::Close => Stdio::null(),
        Redirect::Append(path) => match OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => Stdio::from(f),
            Err(e) => {
                fallbacks.push(format!("{}: {e}", path.display()));
                Stdio::null()
            }
        },
    }
}

pub(crate) fn build_command(spec: &ProcessSpec, fallbacks: &mut Vec<String>) -> Result<Command, LaunchError> {
    let Some((program, args)) = spec.argv.split_first() else {
        return Err(LaunchError::Exec {
            program: String::new(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "empty command"),
        });
    };
    if let Some(dir) = &spec.directory {
        if !dir.is_dir() {
            return Err(LaunchError::Chdir {
                dir: dir.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such directory"),
            });
        }
    }

    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(&spec.environment)
        .stdin(Stdio::null())
        .stdout(redirect_stdio(&spec.stdout, fallbacks))
        .stderr(redirect_stdio(&spec.stderr, fallbacks));
    if let Some(dir) = &spec.directory {
        cmd.current_dir(dir);
    }

    let mask = Mode::from_bits_truncate(spec.umask as libc::mode_t);
    let close_stdout = spec.stdout == Redirect::Close;
    let close_stderr = spec.stderr == Redirect::Close;
    // Only async-signal-safe calls between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            let _ = setsid();
            umask(mask);
            if close_stdout {
                libc::close(libc::STDOUT_FILENO);
            }
            if close_stderr {
                libc::close(libc::STDERR_FILENO);
            }
            Ok(())
        });
    }
    Ok(cmd)
}

impl Launcher for CommandLauncher {
    fn spawn(&mut self, spec: &ProcessSpec) -> Result<Spawned, LaunchError> {
        let mut fallbacks = Vec::new();
        let mut cmd = build_command(spec, &mut fallbacks)?;
        match cmd.spawn() {
            Ok(child) => Ok(Spawned {
                pid: Pid::from_raw(child.id() as i32),
                redirect_fallbacks: fallbacks,
            }),
            Err(e) if matches!(e.raw_os_error(), Some(libc::EAGAIN) | Some(libc::ENOMEM)) => {
                Err(LaunchError::Fork(e))
            }
            Err(e) => Err(LaunchError::Exec {
                program: spec.argv.first().cloned().unwrap_or_default(),
                source: e,
            }),
        }
    }

    fn signal(&mut self, pid: Pid, sig: Signal) -> io::Result<()> {
        match kill(pid, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(io::Error::from(e)),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// Hands out fake pids and records every call; failures can be queued up front.
    #[derive(Debug, Default)]
    pub(crate) struct FakeLauncher {
        next_pid: i32,
        pub(crate) spawned: Vec<(String, Pid)>,
        pub(crate) signals: Vec<(Pid, Signal)>,
        pub(crate) failures: VecDeque<LaunchError>,
    }

    impl FakeLauncher {
        pub(crate) fn new() -> Self {
            Self {
                next_pid: 1000,
                ..Default::default()
            }
        }

        pub(crate) fn last_pid(&self) -> Option<Pid> {
            self.spawned.last().map(|(_, p)| *p)
        }

        pub(crate) fn spawn_count(&self, name: &str) -> usize {
            self.spawned.iter().filter(|(n, _)| n == name).count()
        }

        pub(crate) fn signals_to(&self, pid: Pid) -> Vec<Signal> {
            self.signals
                .iter()
                .filter(|(p, _)| *p == pid)
                .map(|(_, s)| *s)
                .collect()
        }
    }

    impl Launcher for FakeLauncher {
        fn spawn(&mut self, spec: &ProcessSpec) -> Result<Spawned, LaunchError> {
            if let Some(err) = self.failures.pop_front() {
                return Err(err);
            }
            self.next_pid += 1;
            let pid = Pid::from_raw(self.next_pid);
            self.spawned.push((spec.name.clone(), pid));
            Ok(Spawned {
                pid,
                redirect_fallbacks: Vec::new(),
            })
        }

        fn signal(&mut self, pid: Pid, sig: Signal) -> io::Result<()> {
            self.signals.push((pid, sig));
            Ok(())
        }
    }

    pub(crate) fn exec_failure() -> LaunchError {
        LaunchError::Exec {
            program: "/nonexistent".to_string(),
            source: io::Error::from_raw_os_error(libc::ENOENT),
        }
    }

    pub(crate) fn fork_failure() -> LaunchError {
        LaunchError::Fork(io::Error::from_raw_os_error(libc::EAGAIN))
    }
}
