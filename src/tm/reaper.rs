use crate::tm::launcher::Termination;
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

/// Map a wait status to a termination, if it is one.
pub fn termination_of(status: WaitStatus) -> Option<(Pid, Termination)> {
    match status {
        WaitStatus::Exited(pid, code) => Some((pid, Termination::Exited(code))),
        WaitStatus::Signaled(pid, sig, _core) => Some((pid, Termination::Signaled(sig))),
        _ => None,
    }
}

/// Reap every child that has already terminated, without blocking on live ones.
/// Returns how many terminations were handed to `on_exit`.
pub fn drain<F>(mut on_exit: F) -> usize
where
    F: FnMut(Pid, Termination),
{
    let mut reaped = 0;
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                if let Some((pid, term)) = termination_of(status) {
                    on_exit(pid, term);
                    reaped += 1;
                }
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => break,
            Err(e) => {
                tracing::warn!("waitpid failed: {e}");
                break;
            }
        }
    }
    reaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    #[test]
    fn exits_and_signals_are_terminations() {
        let pid = Pid::from_raw(77);
        assert_eq!(
            termination_of(WaitStatus::Exited(pid, 3)),
            Some((pid, Termination::Exited(3)))
        );
        assert_eq!(
            termination_of(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            Some((pid, Termination::Signaled(Signal::SIGKILL)))
        );
        assert_eq!(termination_of(WaitStatus::StillAlive), None);
        assert_eq!(termination_of(WaitStatus::Continued(pid)), None);
    }
}
