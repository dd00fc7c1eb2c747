use crate::tm::launcher::Launcher;
use crate::tm::process::{CommandError, ProcessState};
use crate::tm::rpc::{reply, Request, STATUS_END};
use crate::tm::supervisor::{RestartProgress, Supervisor};
use nix::unistd::Pid;
use std::time::Instant;

/// Outcome of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// Messages to send now, in order.
    Reply(Vec<String>),
    /// The reply depends on children that have not been reaped yet.
    Await(Pending),
    /// `exit`: drop this session without replying.
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pending {
    /// Resolved once the child being stopped has been reaped, wherever its entity now lives.
    Stop { name: String, pid: Pid },
    Restart(String),
    Quit,
}

impl Pending {
    /// The reply text once the awaited condition holds.
    pub fn poll<L: Launcher>(&self, sup: &Supervisor<L>) -> Option<String> {
        match self {
            Pending::Stop { name, pid } => {
                if sup.tracks_pid(*pid) {
                    return None;
                }
                Some(reply::stopping(name))
            }
            Pending::Restart(name) => {
                if sup.restart_pending(name) {
                    return None;
                }
                Some(reply::restarting(name, &start_outcome(sup, name)))
            }
            Pending::Quit => sup.all_settled().then(reply::quitting),
        }
    }

    pub fn is_quit(&self) -> bool {
        matches!(self, Pending::Quit)
    }
}

fn start_outcome<L: Launcher>(sup: &Supervisor<L>, name: &str) -> String {
    match sup.state_of(name) {
        Some(ProcessState::Running) => reply::started(name),
        Some(_) => reply::start_failed(name, sup.description_of(name).unwrap_or("")),
        None => reply::no_such_instance(name),
    }
}

fn command_error_text(err: &CommandError) -> String {
    match err {
        CommandError::UnknownInstance(name) => reply::no_such_instance(name),
        CommandError::AlreadyRunning(name) => reply::already_running(name),
        CommandError::NotRunning(name) => reply::not_running(name),
    }
}

pub fn dispatch<L: Launcher>(sup: &mut Supervisor<L>, text: &str, now: Instant) -> Dispatched {
    let req = match Request::parse(text) {
        Ok(r) => r,
        Err(e) => return Dispatched::Reply(vec![reply::bad_request(&e)]),
    };
    tracing::debug!(request = %req, "dispatch");

    let one = |text: String| Dispatched::Reply(vec![text]);
    match req {
        Request::Status => {
            let mut msgs: Vec<String> = sup.status(now).iter().map(|e| e.render()).collect();
            msgs.push(STATUS_END.to_string());
            Dispatched::Reply(msgs)
        }
        Request::Start(name) => match sup.start(&name, now) {
            Ok(()) => one(reply::starting(&name, &start_outcome(sup, &name))),
            Err(e) => one(command_error_text(&e)),
        },
        Request::Stop(name) => {
            let pid = sup.registry().get(&name).and_then(|e| e.pid());
            match (sup.stop(&name, now), pid) {
                (Ok(()), Some(pid)) => Dispatched::Await(Pending::Stop { name, pid }),
                (Ok(()), None) => one(reply::stopping(&name)),
                (Err(e), _) => one(command_error_text(&e)),
            }
        }
        Request::Restart(name) => match sup.restart(&name, now) {
            Ok(RestartProgress::Stopping) => Dispatched::Await(Pending::Restart(name)),
            Ok(RestartProgress::Started) => {
                one(reply::restarting(&name, &start_outcome(sup, &name)))
            }
            Err(CommandError::UnknownInstance(n)) => one(reply::no_such_instance(&n)),
            Err(e) => one(reply::restarting(&name, &command_error_text(&e))),
        },
        Request::Reload => match sup.reload(now) {
            Ok(_) => one(reply::reloaded()),
            Err(e) => one(reply::reload_failed(&format!("{e:#}"))),
        },
        Request::Pid => one(std::process::id().to_string()),
        Request::Quit => {
            sup.begin_shutdown(now);
            Dispatched::Await(Pending::Quit)
        }
        Request::Exit => Dispatched::Close,
    }
}
