use nix::sys::signal::Signal;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use std::fs;
use std::path::Path;
use taskmaster::tm::launcher::{CommandLauncher, LaunchError, Launcher, Termination};
use taskmaster::tm::program::{ProcessSpec, Redirect};
use taskmaster::tm::reaper::termination_of;

fn sh(name: &str, script: &str) -> ProcessSpec {
    ProcessSpec::new(
        name,
        vec!["/bin/sh".into(), "-c".into(), script.into()],
    )
}

fn wait_for(pid: Pid) -> Termination {
    let status = waitpid(pid, None).unwrap();
    termination_of(status).unwrap().1
}

fn run_to_file(mut spec: ProcessSpec, out: &Path) -> String {
    spec.stdout = Redirect::Append(out.to_path_buf());
    let spawned = CommandLauncher.spawn(&spec).unwrap();
    assert!(spawned.redirect_fallbacks.is_empty());
    assert_eq!(wait_for(spawned.pid), Termination::Exited(0));
    fs::read_to_string(out).unwrap()
}

#[test]
fn exit_code_is_reported() {
    let spawned = CommandLauncher.spawn(&sh("seven", "exit 7")).unwrap();
    assert_eq!(wait_for(spawned.pid), Termination::Exited(7));
}

#[test]
fn stdout_appends_to_the_target() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.log");
    fs::write(&out, "before\n").unwrap();
    let text = run_to_file(sh("echo", "echo hello"), &out);
    assert_eq!(text, "before\nhello\n");
}

#[test]
fn stderr_has_its_own_target() {
    let dir = tempfile::tempdir().unwrap();
    let err = dir.path().join("err.log");
    let mut spec = sh("oops", "echo oops >&2");
    spec.stderr = Redirect::Append(err.clone());
    let spawned = CommandLauncher.spawn(&spec).unwrap();
    assert_eq!(wait_for(spawned.pid), Termination::Exited(0));
    assert_eq!(fs::read_to_string(&err).unwrap(), "oops\n");
}

#[test]
fn umask_environment_and_directory_apply() {
    let dir = tempfile::tempdir().unwrap();
    let work = dir.path().join("work");
    fs::create_dir(&work).unwrap();

    let mut spec = sh("probe", "umask; echo \"$GREETING\"; pwd");
    spec.umask = 0o077;
    spec.environment.insert("GREETING".into(), "hi there".into());
    spec.directory = Some(work.clone());

    let text = run_to_file(spec, &dir.path().join("probe.log"));
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "0077");
    assert_eq!(lines[1], "hi there");
    assert_eq!(
        fs::canonicalize(lines[2]).unwrap(),
        fs::canonicalize(&work).unwrap()
    );
}

#[test]
fn child_leads_its_own_session() {
    let dir = tempfile::tempdir().unwrap();
    let spec = sh("sid", "cut -d' ' -f6 /proc/$$/stat");
    let text = run_to_file(spec, &dir.path().join("sid.log"));
    let sid: i32 = text.trim().parse().unwrap();
    assert_ne!(sid, nix::unistd::getsid(None).unwrap().as_raw());
}

#[test]
fn missing_program_is_an_exec_failure() {
    let spec = ProcessSpec::new("ghost", vec!["/nonexistent/bin/ghost".into()]);
    let err = CommandLauncher.spawn(&spec).unwrap_err();
    assert!(matches!(err, LaunchError::Exec { .. }), "{err:?}");
    assert_eq!(err.exit_status(), Some(127));
}

#[test]
fn missing_directory_is_a_chdir_failure() {
    let mut spec = sh("lost", "true");
    spec.directory = Some("/nonexistent/work/dir".into());
    let err = CommandLauncher.spawn(&spec).unwrap_err();
    assert!(matches!(err, LaunchError::Chdir { .. }), "{err:?}");
    assert_eq!(err.exit_status(), Some(126));
}

#[test]
fn unopenable_redirect_falls_back_to_dev_null() {
    let mut spec = sh("quiet", "echo lost");
    spec.stdout = Redirect::Append("/nonexistent/dir/out.log".into());
    let spawned = CommandLauncher.spawn(&spec).unwrap();
    assert_eq!(spawned.redirect_fallbacks.len(), 1);
    assert!(spawned.redirect_fallbacks[0].starts_with("/nonexistent/dir/out.log"));
    assert_eq!(wait_for(spawned.pid), Termination::Exited(0));
}

#[test]
fn closed_stdout_still_runs() {
    let mut spec = sh("closed", "echo nowhere; exit 3");
    spec.stdout = Redirect::Close;
    let spawned = CommandLauncher.spawn(&spec).unwrap();
    // echo fails on the closed descriptor; the script still reaches its exit.
    assert_eq!(wait_for(spawned.pid), Termination::Exited(3));
}

#[test]
fn signal_terminates_and_gone_targets_are_ignored() {
    let mut launcher = CommandLauncher;
    let spec = ProcessSpec::new("sleeper", vec!["/bin/sleep".into(), "100".into()]);
    let spawned = launcher.spawn(&spec).unwrap();
    launcher.signal(spawned.pid, Signal::SIGTERM).unwrap();
    assert_eq!(
        wait_for(spawned.pid),
        Termination::Signaled(Signal::SIGTERM)
    );
    // Reaped already: delivering again is not an error.
    launcher.signal(spawned.pid, Signal::SIGTERM).unwrap();
}
