use crate::tm::{build_info, config, daemon};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "taskmasterd", version, about = "taskmaster process supervisor daemon")]
pub struct Args {
    /// Path to the taskmaster config YAML
    #[arg(short = 'c', long = "config", default_value = "taskmaster.yml")]
    pub config: PathBuf,

    /// Fork into the background (the parent prints the daemon pid and exits)
    #[arg(short = 'd', long = "daemonize")]
    pub daemonize: bool,
}

/// Diagnostics go to stderr; `TASKMASTER_LOG` takes an `EnvFilter` directive (default `info`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env("TASKMASTER_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

// Reload re-reads the file later, possibly after the working directory stopped mattering.
fn absolute(path: &Path) -> anyhow::Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}

pub fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let config_path = absolute(&args.config)?;
    // Validate before detaching so a bad config still fails loudly with a non-zero status.
    let cfg = config::load_master_config(&config_path)?;

    if args.daemonize {
        daemon::daemonize()?;
    }
    init_tracing();
    tracing::info!("{}", build_info::banner());
    tracing::info!(config = %config_path.display(), instances = cfg.specs.len(), "configuration loaded");
    daemon::run_daemon(&config_path, cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn flags_parse() {
        let a = Args::try_parse_from(["taskmasterd", "-c", "/etc/tm.yml", "--daemonize"]).unwrap();
        assert_eq!(a.config, PathBuf::from("/etc/tm.yml"));
        assert!(a.daemonize);
        let b = Args::try_parse_from(["taskmasterd"]).unwrap();
        assert_eq!(b.config, PathBuf::from("taskmaster.yml"));
        assert!(!b.daemonize);
    }

    #[test]
    fn relative_config_becomes_absolute() {
        let p = absolute(Path::new("tm.yml")).unwrap();
        assert!(p.is_absolute());
        assert!(p.ends_with("tm.yml"));
    }
}
