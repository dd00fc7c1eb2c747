use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Restart policy applied after a process exits on its own past `startsecs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoRestart {
    Always,
    Never,
    #[default]
    Unexpected,
}

impl AutoRestart {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoRestart::Always => "always",
            AutoRestart::Never => "never",
            AutoRestart::Unexpected => "unexpected",
        }
    }

    fn parse(s: &str) -> Result<Self, String> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" | "true" => Ok(AutoRestart::Always),
            "never" | "false" => Ok(AutoRestart::Never),
            "unexpected" => Ok(AutoRestart::Unexpected),
            other => Err(format!(
                "unknown autorestart policy {other:?} (supported: always | never | unexpected)"
            )),
        }
    }
}

impl fmt::Display for AutoRestart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination of a child's stdout or stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    /// `NONE` in the config: the descriptor is closed before exec.
    Close,
    /// Opened in append mode (created if missing).
    Append(PathBuf),
}

impl Redirect {
    pub fn dev_null() -> Self {
        Redirect::Append(PathBuf::from("/dev/null"))
    }

    fn from_config(raw: Option<String>, base: &Path) -> Self {
        match raw {
            None => Redirect::dev_null(),
            Some(s) if s.trim() == "NONE" => Redirect::Close,
            Some(s) => Redirect::Append(resolve_path(base, Path::new(s.trim()))),
        }
    }
}

impl fmt::Display for Redirect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Redirect::Close => f.write_str("NONE"),
            Redirect::Append(p) => write!(f, "{}", p.display()),
        }
    }
}

/// One supervised instance, fully resolved from its program section.
///
/// Equality is structural over every configurable field; the reload diff keeps a running
/// instance only when its old and new specs compare equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Instance name (`program` or `program:<index>`).
    pub name: String,
    /// Program section this instance was expanded from.
    pub program: String,
    pub index: Option<u32>,
    pub numprocs: u32,
    pub argv: Vec<String>,
    pub directory: Option<PathBuf>,
    pub umask: u32,
    pub environment: BTreeMap<String, String>,
    pub stdout: Redirect,
    pub stderr: Redirect,
    pub autostart: bool,
    pub autorestart: AutoRestart,
    pub exitcodes: BTreeSet<i32>,
    pub startsecs: u64,
    pub startretries: u32,
    pub stopsignal: Signal,
    pub stopwaitsecs: u64,
}

impl ProcessSpec {
    /// A single-instance spec with default policy values.
    pub fn new(name: impl Into<String>, argv: Vec<String>) -> Self {
        let name = name.into();
        Self {
            program: name.clone(),
            name,
            index: None,
            numprocs: 1,
            argv,
            directory: None,
            umask: default_umask(),
            environment: BTreeMap::new(),
            stdout: Redirect::dev_null(),
            stderr: Redirect::dev_null(),
            autostart: default_autostart(),
            autorestart: AutoRestart::default(),
            exitcodes: default_exitcodes(),
            startsecs: default_startsecs(),
            startretries: default_startretries(),
            stopsignal: default_stopsignal(),
            stopwaitsecs: default_stopwaitsecs(),
        }
    }

    /// Minimum uptime for a run to count as a successful start.
    pub fn start_window(&self) -> Duration {
        Duration::from_secs(self.startsecs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stopwaitsecs)
    }

    /// Whether an exit code belongs to the accepted set. Deaths by signal carry no code and
    /// are never expected.
    pub fn is_expected_exit(&self, code: Option<i32>) -> bool {
        code.is_some_and(|c| self.exitcodes.contains(&c))
    }

    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }
}

pub fn signal_name(sig: Signal) -> &'static str {
    sig.as_str()
}

/// Parse a stop signal name. The `SIG` prefix is optional and case is ignored.
pub fn parse_signal(s: &str) -> anyhow::Result<Signal> {
    let raw = s.trim().to_ascii_uppercase();
    let name = raw.strip_prefix("SIG").unwrap_or(&raw);
    let sig = match name {
        "TERM" => Signal::SIGTERM,
        "HUP" => Signal::SIGHUP,
        "INT" => Signal::SIGINT,
        "QUIT" => Signal::SIGQUIT,
        "KILL" => Signal::SIGKILL,
        "USR1" => Signal::SIGUSR1,
        "USR2" => Signal::SIGUSR2,
        _ => anyhow::bail!("unsupported stopsignal: {s:?} (supported: TERM HUP INT QUIT KILL USR1 USR2)"),
    };
    Ok(sig)
}

/// Program names become instance names and request arguments, so they must stay free of
/// whitespace and of `:` (reserved for the numprocs index suffix).
pub fn validate_program_name(name: &str) -> anyhow::Result<()> {
    anyhow::ensure!(!name.is_empty(), "program name must not be empty");
    anyhow::ensure!(
        name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')),
        "program name {name:?} may only contain ASCII letters, digits, '-', '_' and '.'"
    );
    Ok(())
}

fn resolve_path(base: &Path, p: &Path) -> PathBuf {
    if p.is_relative() {
        base.join(p)
    } else {
        p.to_path_buf()
    }
}

fn default_numprocs() -> u32 {
    1
}
fn default_autostart() -> bool {
    true
}
fn default_exitcodes() -> BTreeSet<i32> {
    BTreeSet::from([0])
}
fn default_startsecs() -> u64 {
    1
}
fn default_startretries() -> u32 {
    3
}
fn default_stopsignal() -> Signal {
    Signal::SIGTERM
}
fn default_stopwaitsecs() -> u64 {
    10
}
fn default_umask() -> u32 {
    0o022
}

// ---------------- program section (YAML; strict) ----------------

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum CommandLine {
    Line(String),
    Argv(Vec<String>),
}

impl CommandLine {
    fn into_argv(self) -> Vec<String> {
        match self {
            CommandLine::Line(s) => s.split_whitespace().map(str::to_string).collect(),
            CommandLine::Argv(v) => v,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ProgramSection {
    command: CommandLine,
    #[serde(default = "default_numprocs")]
    numprocs: u32,
    #[serde(default = "default_autostart")]
    autostart: bool,
    #[serde(default, deserialize_with = "deserialize_autorestart")]
    autorestart: AutoRestart,
    #[serde(default = "default_exitcodes", deserialize_with = "deserialize_exitcodes")]
    exitcodes: BTreeSet<i32>,
    #[serde(default = "default_startsecs")]
    startsecs: u64,
    #[serde(default = "default_startretries")]
    startretries: u32,
    #[serde(default = "default_stopsignal", deserialize_with = "deserialize_signal")]
    stopsignal: Signal,
    #[serde(default = "default_stopwaitsecs")]
    stopwaitsecs: u64,
    #[serde(default)]
    environment: BTreeMap<String, serde_yaml::Value>,
    #[serde(default = "default_umask", deserialize_with = "deserialize_umask")]
    umask: u32,
    #[serde(default)]
    directory: Option<PathBuf>,
    #[serde(default)]
    stdout: Option<String>,
    #[serde(default)]
    stderr: Option<String>,
}

impl ProgramSection {
    /// Validate the section and expand it into `numprocs` instance specs.
    ///
    /// Relative paths resolve against `base` (the config file's directory).
    pub(crate) fn into_specs(self, program: &str, base: &Path) -> anyhow::Result<Vec<ProcessSpec>> {
        validate_program_name(program)?;
        anyhow::ensure!(self.numprocs >= 1, "program {program}: numprocs must be >= 1");

        let argv = self.command.into_argv();
        anyhow::ensure!(
            argv.first().is_some_and(|a| !a.trim().is_empty()),
            "program {program}: command must not be empty"
        );

        let mut environment = BTreeMap::new();
        for (key, value) in self.environment {
            anyhow::ensure!(
                !key.is_empty() && !key.contains('=') && !key.contains('\0'),
                "program {program}: invalid environment variable name {key:?}"
            );
            let value = match value {
                serde_yaml::Value::String(s) => s,
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                other => anyhow::bail!(
                    "program {program}: environment.{key} must be a scalar, got {other:?}"
                ),
            };
            environment.insert(key, value);
        }

        let directory = self.directory.map(|d| resolve_path(base, &d));
        let stdout = Redirect::from_config(self.stdout, base);
        let stderr = Redirect::from_config(self.stderr, base);

        let specs = (0..self.numprocs)
            .map(|i| {
                let (name, index) = if self.numprocs > 1 {
                    (format!("{program}:{i}"), Some(i))
                } else {
                    (program.to_string(), None)
                };
                ProcessSpec {
                    name,
                    program: program.to_string(),
                    index,
                    numprocs: self.numprocs,
                    argv: argv.clone(),
                    directory: directory.clone(),
                    umask: self.umask,
                    environment: environment.clone(),
                    stdout: stdout.clone(),
                    stderr: stderr.clone(),
                    autostart: self.autostart,
                    autorestart: self.autorestart,
                    exitcodes: self.exitcodes.clone(),
                    startsecs: self.startsecs,
                    startretries: self.startretries,
                    stopsignal: self.stopsignal,
                    stopwaitsecs: self.stopwaitsecs,
                }
            })
            .collect();
        Ok(specs)
    }
}

fn deserialize_autorestart<'de, D>(deserializer: D) -> Result<AutoRestart, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    match serde_yaml::Value::deserialize(deserializer)? {
        serde_yaml::Value::Bool(true) => Ok(AutoRestart::Always),
        serde_yaml::Value::Bool(false) => Ok(AutoRestart::Never),
        serde_yaml::Value::String(s) => AutoRestart::parse(&s).map_err(D::Error::custom),
        _ => Err(D::Error::custom(
            "autorestart must be one of: always | never | unexpected",
        )),
    }
}

fn deserialize_exitcodes<'de, D>(deserializer: D) -> Result<BTreeSet<i32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    fn code_from(v: &serde_yaml::Value) -> Result<i32, String> {
        match v {
            serde_yaml::Value::Number(n) => n
                .as_i64()
                .and_then(|c| i32::try_from(c).ok())
                .filter(|c| (0..=255).contains(c))
                .ok_or_else(|| format!("exit code {n} out of range 0..=255")),
            serde_yaml::Value::String(s) => s
                .trim()
                .parse::<i32>()
                .ok()
                .filter(|c| (0..=255).contains(c))
                .ok_or_else(|| format!("invalid exit code {s:?}")),
            other => Err(format!("invalid exit code {other:?}")),
        }
    }

    let codes: Vec<i32> = match serde_yaml::Value::deserialize(deserializer)? {
        serde_yaml::Value::Sequence(items) => items
            .iter()
            .map(code_from)
            .collect::<Result<_, _>>()
            .map_err(D::Error::custom)?,
        serde_yaml::Value::String(s) => s
            .split(',')
            .filter(|t| !t.trim().is_empty())
            .map(|t| code_from(&serde_yaml::Value::String(t.to_string())))
            .collect::<Result<_, _>>()
            .map_err(D::Error::custom)?,
        v @ serde_yaml::Value::Number(_) => vec![code_from(&v).map_err(D::Error::custom)?],
        _ => {
            return Err(D::Error::custom(
                "exitcodes must be an integer, a list of integers or a comma-separated string",
            ))
        }
    };
    if codes.is_empty() {
        return Err(D::Error::custom("exitcodes must not be empty"));
    }
    Ok(codes.into_iter().collect())
}

fn deserialize_signal<'de, D>(deserializer: D) -> Result<Signal, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let s = String::deserialize(deserializer)?;
    parse_signal(&s).map_err(D::Error::custom)
}

fn deserialize_umask<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    // YAML 1.2 keeps `022` a string, so digit strings are read as octal. A number is
    // already a value (`0o022` arrives as 18) and is taken as the mask itself.
    match serde_yaml::Value::deserialize(deserializer)? {
        serde_yaml::Value::Number(n) => {
            let mask = n
                .as_u64()
                .ok_or_else(|| D::Error::custom(format!("invalid umask {n}")))?;
            check_umask(mask, &n.to_string()).map_err(D::Error::custom)
        }
        serde_yaml::Value::String(s) => parse_umask_str(&s).map_err(D::Error::custom),
        _ => Err(D::Error::custom("umask must be an octal string like 022 or an integer like 0o022")),
    }
}

fn check_umask(mask: u64, shown: &str) -> Result<u32, String> {
    if mask > 0o777 {
        return Err(format!("umask {shown:?} is out of range (max 0o777)"));
    }
    Ok(mask as u32)
}

fn parse_umask_str(s: &str) -> Result<u32, String> {
    let t = s.trim();
    let t = t.strip_prefix("0o").or_else(|| t.strip_prefix("0O")).unwrap_or(t);
    let mask = u64::from_str_radix(t, 8).map_err(|e| format!("invalid umask {s:?}: {e}"))?;
    check_umask(mask, s)
}
