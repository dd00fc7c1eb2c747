use crate::tm::channel::{read_message, write_message, ChannelError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::unix::net::UnixStream;
use std::path::Path;

/// Literal message that terminates a `status` listing.
pub const STATUS_END: &str = "DAEMON COPY";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Status,
    Start(String),
    Stop(String),
    Restart(String),
    Reload,
    Pid,
    Quit,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("empty request")]
    Empty,
    #[error("unknown command {0:?} (commands: status start stop restart reload pid quit exit)")]
    UnknownCommand(String),
    #[error("{0} needs a program name")]
    MissingArgument(&'static str),
    #[error("{0} takes no argument")]
    UnexpectedArgument(&'static str),
    #[error("{0} takes a single program name")]
    TooManyArguments(&'static str),
}

impl Request {
    /// Parse `<command>[ <argument>]`.
    pub fn parse(text: &str) -> Result<Self, RequestError> {
        let mut words = text.split_whitespace();
        let Some(cmd) = words.next() else {
            return Err(RequestError::Empty);
        };
        let arg = words.next();
        let extra = words.next().is_some();

        let named = |word: &'static str, build: fn(String) -> Request| match (arg, extra) {
            (None, _) => Err(RequestError::MissingArgument(word)),
            (Some(_), true) => Err(RequestError::TooManyArguments(word)),
            (Some(a), false) => Ok(build(a.to_string())),
        };
        let bare = |word: &'static str, req: Request| match arg {
            Some(_) => Err(RequestError::UnexpectedArgument(word)),
            None => Ok(req),
        };

        match cmd {
            "status" => bare("status", Request::Status),
            "start" => named("start", Request::Start),
            "stop" => named("stop", Request::Stop),
            "restart" => named("restart", Request::Restart),
            "reload" => bare("reload", Request::Reload),
            "pid" => bare("pid", Request::Pid),
            "quit" => bare("quit", Request::Quit),
            "exit" => bare("exit", Request::Exit),
            other => Err(RequestError::UnknownCommand(other.to_string())),
        }
    }

    pub fn command(&self) -> &'static str {
        match self {
            Request::Status => "status",
            Request::Start(_) => "start",
            Request::Stop(_) => "stop",
            Request::Restart(_) => "restart",
            Request::Reload => "reload",
            Request::Pid => "pid",
            Request::Quit => "quit",
            Request::Exit => "exit",
        }
    }

    pub fn target(&self) -> Option<&str> {
        match self {
            Request::Start(n) | Request::Stop(n) | Request::Restart(n) => Some(n),
            _ => None,
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target() {
            Some(name) => write!(f, "{} {name}", self.command()),
            None => f.write_str(self.command()),
        }
    }
}

/// Reply texts. Every non-status reply is one message of one or two lines.
pub mod reply {
    pub fn no_such_instance(name: &str) -> String {
        format!("No such program: {name} (type \"status\" to list them)")
    }
    pub fn bad_request(err: &super::RequestError) -> String {
        format!("Error: {err}")
    }
    pub fn starting(name: &str, outcome: &str) -> String {
        format!("Starting {name}...\n{outcome}")
    }
    pub fn started(name: &str) -> String {
        format!("{name} started")
    }
    pub fn start_failed(name: &str, why: &str) -> String {
        format!("{name} failed to start: {why}")
    }
    pub fn already_running(name: &str) -> String {
        format!("{name} is already running")
    }
    pub fn stopping(name: &str) -> String {
        format!("Stopping {name} gracefully (SIGKILL after stopwaitsecs)...\n{name} stopped")
    }
    pub fn not_running(name: &str) -> String {
        format!("{name} is not running")
    }
    pub fn restarting(name: &str, outcome: &str) -> String {
        format!("Restarting {name}...\n{outcome}")
    }
    pub fn reloaded() -> String {
        "Reloading configuration...\nConfiguration reloaded".to_string()
    }
    pub fn reload_failed(why: &str) -> String {
        format!("Reloading configuration...\nReload failed: {why}")
    }
    pub fn quitting() -> String {
        "Stopping all processes...\nDone".to_string()
    }
}

/// One row of a `status` listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub name: String,
    pub state: String,
    pub description: String,
}

impl StatusEntry {
    pub fn render(&self) -> String {
        format!("{}  {}  {}", self.name, self.state, self.description)
    }

    /// Inverse of [`StatusEntry::render`]. Names and states never contain spaces, so only the
    /// description may hold the separator.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.splitn(3, "  ");
        let name = parts.next()?.to_string();
        let state = parts.next()?.to_string();
        let description = parts.next().unwrap_or("").to_string();
        if name.is_empty() || state.is_empty() {
            return None;
        }
        Some(Self {
            name,
            state,
            description,
        })
    }
}

/// Blocking operator-side connection.
pub struct Client {
    stream: UnixStream,
}

impl Client {
    pub fn connect(sock: &Path) -> anyhow::Result<Self> {
        let stream = UnixStream::connect(sock).map_err(|e| {
            anyhow::anyhow!(
                "daemon unavailable: failed to connect to {}: {e}",
                sock.display()
            )
        })?;
        Ok(Self { stream })
    }

    /// Send one request and collect its reply messages. `status` collects up to (not including)
    /// the end sentinel; `exit` has no reply.
    pub fn call(&mut self, req: &Request) -> Result<Vec<String>, ChannelError> {
        write_message(&mut self.stream, &req.to_string())?;
        match req {
            Request::Exit => Ok(Vec::new()),
            Request::Status => {
                let mut lines = Vec::new();
                loop {
                    match read_message(&mut self.stream)? {
                        Some(msg) if msg == STATUS_END => return Ok(lines),
                        Some(msg) => lines.push(msg),
                        None => return Err(ChannelError::ConnectionClosed),
                    }
                }
            }
            _ => match read_message(&mut self.stream)? {
                Some(msg) => Ok(vec![msg]),
                None => Err(ChannelError::ConnectionClosed),
            },
        }
    }
}

pub fn client_call(sock: &Path, req: &Request) -> anyhow::Result<Vec<String>> {
    let mut client = Client::connect(sock)?;
    client
        .call(req)
        .map_err(|e| anyhow::anyhow!("daemon unavailable: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_command() {
        assert_eq!(Request::parse("status"), Ok(Request::Status));
        assert_eq!(Request::parse("start web:0"), Ok(Request::Start("web:0".into())));
        assert_eq!(Request::parse("  stop   web "), Ok(Request::Stop("web".into())));
        assert_eq!(Request::parse("restart x"), Ok(Request::Restart("x".into())));
        assert_eq!(Request::parse("reload"), Ok(Request::Reload));
        assert_eq!(Request::parse("pid"), Ok(Request::Pid));
        assert_eq!(Request::parse("quit"), Ok(Request::Quit));
        assert_eq!(Request::parse("exit"), Ok(Request::Exit));
    }

    #[test]
    fn argument_rules() {
        assert_eq!(Request::parse("start"), Err(RequestError::MissingArgument("start")));
        assert_eq!(Request::parse("status web"), Err(RequestError::UnexpectedArgument("status")));
        assert_eq!(Request::parse("stop a b"), Err(RequestError::TooManyArguments("stop")));
        assert_eq!(Request::parse(""), Err(RequestError::Empty));
        assert_eq!(
            Request::parse("launch web"),
            Err(RequestError::UnknownCommand("launch".into()))
        );
    }

    #[test]
    fn display_matches_wire_text() {
        assert_eq!(Request::Restart("w".into()).to_string(), "restart w");
        assert_eq!(Request::Pid.to_string(), "pid");
        let req = Request::Stop("web:1".into());
        assert_eq!(Request::parse(&req.to_string()), Ok(req));
    }

    #[test]
    fn status_line_round_trips_with_spaces_in_description() {
        let e = StatusEntry {
            name: "web:0".into(),
            state: "RUNNING".into(),
            description: "pid 42, uptime 0:00:05  (since boot)".into(),
        };
        let line = e.render();
        assert_eq!(line, "web:0  RUNNING  pid 42, uptime 0:00:05  (since boot)");
        assert_eq!(StatusEntry::parse(&line), Some(e));
        assert_eq!(StatusEntry::parse("lonely"), None);
    }

    #[test]
    fn replies_are_at_most_two_lines() {
        for text in [
            reply::starting("p", &reply::started("p")),
            reply::stopping("p"),
            reply::restarting("p", &reply::started("p")),
            reply::reloaded(),
            reply::reload_failed("bad"),
            reply::quitting(),
            reply::not_running("p"),
        ] {
            assert!(text.lines().count() <= 2, "{text}");
        }
    }
}
