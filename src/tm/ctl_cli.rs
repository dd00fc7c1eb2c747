use crate::tm::rpc::{self, Request, StatusEntry};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "taskctl", version, about = "taskmaster control client")]
pub struct CtlArgs {
    /// Unix socket path of the taskmaster daemon
    #[arg(
        short = 's',
        long = "sock",
        env = "TASKMASTER_SOCK",
        default_value = "/tmp/taskmaster.sock"
    )]
    pub sock: PathBuf,

    #[command(subcommand)]
    pub cmd: Option<Cmd>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Cmd {
    /// Show every instance (default)
    Status {
        /// Output format: text (default) or json
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Start an instance
    Start { name: String },
    /// Stop an instance gracefully (SIGKILL after stopwaitsecs)
    Stop { name: String },
    /// Restart an instance
    Restart { name: String },
    /// Re-read the daemon configuration and apply the differences
    Reload,
    /// Print the daemon pid
    Pid,
    /// Stop every instance and shut the daemon down
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

impl Cmd {
    pub fn request(&self) -> Request {
        match self {
            Cmd::Status { .. } => Request::Status,
            Cmd::Start { name } => Request::Start(name.clone()),
            Cmd::Stop { name } => Request::Stop(name.clone()),
            Cmd::Restart { name } => Request::Restart(name.clone()),
            Cmd::Reload => Request::Reload,
            Cmd::Pid => Request::Pid,
            Cmd::Quit => Request::Quit,
        }
    }
}

fn pad(s: &str, width: usize) -> String {
    format!("{s:<width$}")
}

pub fn render_status_table(entries: &[StatusEntry]) -> String {
    if entries.is_empty() {
        return "(no programs)".to_string();
    }
    let headers = ["name", "state", "description"];
    let name_w = entries
        .iter()
        .map(|e| e.name.chars().count())
        .chain([headers[0].len()])
        .max()
        .unwrap_or(0);
    let state_w = entries
        .iter()
        .map(|e| e.state.len())
        .chain([headers[1].len()])
        .max()
        .unwrap_or(0);

    let mut out = String::new();
    out.push_str(&format!(
        "{}  {}  {}\n",
        pad(headers[0], name_w),
        pad(headers[1], state_w),
        headers[2]
    ));
    for e in entries {
        out.push_str(&format!(
            "{}  {}  {}\n",
            pad(&e.name, name_w),
            pad(&e.state, state_w),
            e.description
        ));
    }
    out
}

pub fn run() -> anyhow::Result<()> {
    let args = CtlArgs::parse();
    let cmd = args.cmd.unwrap_or(Cmd::Status {
        format: OutputFormat::Text,
    });
    let msgs = rpc::client_call(&args.sock, &cmd.request())?;

    match cmd {
        Cmd::Status { format } => {
            let entries: Vec<StatusEntry> = msgs
                .iter()
                .filter_map(|line| StatusEntry::parse(line))
                .collect();
            match format {
                OutputFormat::Text => print!("{}", render_status_table(&entries)),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
            }
        }
        _ => {
            for msg in msgs {
                if !msg.trim().is_empty() {
                    println!("{}", msg.trim_end());
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        CtlArgs::command().debug_assert();
    }

    #[test]
    fn subcommands_map_to_requests() {
        let a = CtlArgs::try_parse_from(["taskctl", "-s", "/run/tm.sock", "restart", "web:1"]).unwrap();
        assert_eq!(a.sock, PathBuf::from("/run/tm.sock"));
        assert_eq!(a.cmd.unwrap().request(), Request::Restart("web:1".into()));

        let b = CtlArgs::try_parse_from(["taskctl", "status", "--format", "json"]).unwrap();
        match b.cmd {
            Some(Cmd::Status { format }) => assert_eq!(format, OutputFormat::Json),
            other => panic!("{other:?}"),
        }
        assert!(CtlArgs::try_parse_from(["taskctl", "start"]).is_err());
    }

    #[test]
    fn table_aligns_columns() {
        let entries = vec![
            StatusEntry {
                name: "web:10".into(),
                state: "RUNNING".into(),
                description: "pid 7, uptime 0:00:01".into(),
            },
            StatusEntry {
                name: "db".into(),
                state: "FATAL".into(),
                description: "exited too quickly (exit status 1)".into(),
            },
        ];
        let table = render_status_table(&entries);
        let lines: Vec<_> = table.lines().collect();
        assert_eq!(lines[0], "name    state    description");
        assert_eq!(lines[1], "web:10  RUNNING  pid 7, uptime 0:00:01");
        assert_eq!(lines[2], "db      FATAL    exited too quickly (exit status 1)");
        assert_eq!(render_status_table(&[]), "(no programs)");
    }
}
