use crate::tm::program::{ProcessSpec, ProgramSection};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Validated daemon configuration: where to listen, where to append events, what to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterConfig {
    pub sock: PathBuf,
    /// `None` disables the event log.
    pub event_log: Option<PathBuf>,
    /// One entry per instance, numprocs already expanded, ordered by program name then index.
    pub specs: Vec<ProcessSpec>,
}

impl MasterConfig {
    pub fn spec(&self, name: &str) -> Option<&ProcessSpec> {
        self.specs.iter().find(|s| s.name == name)
    }
}

// -------- YAML file schema (grouped; strict) --------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct MasterConfigFile {
    #[serde(default)]
    unix_socket: Option<UnixSocketConfigFile>,
    #[serde(default)]
    event_log: Option<EventLogConfigFile>,
    #[serde(default)]
    programs: BTreeMap<String, ProgramSection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct UnixSocketConfigFile {
    #[serde(default = "default_sock")]
    path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct EventLogConfigFile {
    /// Missing: default path. Explicit `null`: logging disabled.
    #[serde(default = "default_event_log")]
    path: Option<PathBuf>,
}

pub fn default_sock() -> PathBuf {
    "/tmp/taskmaster.sock".into()
}

fn default_event_log() -> Option<PathBuf> {
    Some("/tmp/taskmaster.log".into())
}

/// Parse and validate configuration text. Relative paths resolve against `base`.
pub fn parse_master_config(raw: &str, base: &Path) -> anyhow::Result<MasterConfig> {
    let file_cfg: MasterConfigFile = serde_yaml::from_str(raw)?;

    let mut sock = file_cfg
        .unix_socket
        .map(|us| us.path)
        .unwrap_or_else(default_sock);
    anyhow::ensure!(
        !sock.as_os_str().is_empty(),
        "unix_socket.path must not be empty"
    );
    if sock.is_relative() {
        sock = base.join(sock);
    }

    let mut event_log = match file_cfg.event_log {
        Some(el) => el.path,
        None => default_event_log(),
    };
    if let Some(p) = event_log.take() {
        event_log = Some(if p.is_relative() { base.join(p) } else { p });
    }

    let mut specs = Vec::new();
    for (program, section) in file_cfg.programs {
        let expanded = section
            .into_specs(&program, base)
            .map_err(|e| anyhow::anyhow!("programs.{program}: {e}"))?;
        specs.extend(expanded);
    }

    Ok(MasterConfig {
        sock,
        event_log,
        specs,
    })
}

pub fn load_master_config(config_path: &Path) -> anyhow::Result<MasterConfig> {
    let raw = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", config_path.display()))?;
    let base = config_path.parent().unwrap_or_else(|| Path::new("."));
    parse_master_config(&raw, base)
        .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", config_path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tm::program::AutoRestart;
    use std::io::Write;

    const SAMPLE: &str = r#"
unix_socket:
  path: run/tm.sock
event_log:
  path: /var/log/tm.log
programs:
  web:
    command: /usr/bin/python3 -m http.server
    numprocs: 2
    autorestart: always
  worker:
    command: ["/bin/sh", "-c", "sleep 5"]
    autostart: false
    exitcodes: [0, 3]
"#;

    #[test]
    fn sample_config_expands_and_resolves() {
        let cfg = parse_master_config(SAMPLE, Path::new("/etc/tm")).unwrap();
        assert_eq!(cfg.sock, PathBuf::from("/etc/tm/run/tm.sock"));
        assert_eq!(cfg.event_log, Some(PathBuf::from("/var/log/tm.log")));
        let names: Vec<_> = cfg.specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["web:0", "web:1", "worker"]);
        assert_eq!(cfg.spec("web:1").unwrap().autorestart, AutoRestart::Always);
        assert!(!cfg.spec("worker").unwrap().autostart);
    }

    #[test]
    fn empty_document_uses_defaults() {
        let cfg = parse_master_config("{}", Path::new("/")).unwrap();
        assert_eq!(cfg.sock, default_sock());
        assert_eq!(cfg.event_log, default_event_log());
        assert!(cfg.specs.is_empty());
    }

    #[test]
    fn null_event_log_disables_it() {
        let cfg = parse_master_config("event_log:\n  path: null\n", Path::new("/")).unwrap();
        assert_eq!(cfg.event_log, None);
    }

    #[test]
    fn unknown_top_level_section_is_rejected() {
        let err = parse_master_config("http_console:\n  enabled: true\n", Path::new("/")).unwrap_err();
        assert!(err.to_string().contains("http_console"), "{err}");
    }

    #[test]
    fn program_errors_name_the_program() {
        let err = parse_master_config(
            "programs:\n  bad:\n    command: x\n    numprocs: 0\n",
            Path::new("/"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("programs.bad"), "{err}");
    }

    #[test]
    fn load_reads_relative_to_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taskmaster.yml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "unix_socket:\n  path: tm.sock\nprograms:\n  p:\n    command: /bin/true").unwrap();
        let cfg = load_master_config(&path).unwrap();
        assert_eq!(cfg.sock, dir.path().join("tm.sock"));
        assert_eq!(cfg.specs.len(), 1);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = load_master_config(Path::new("/nonexistent/taskmaster.yml")).unwrap_err();
        assert!(err.to_string().contains("failed to read config"), "{err}");
    }
}
