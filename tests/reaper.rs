// Kept alone in its own test binary: drain() reaps any child of the process.
use nix::sys::signal::Signal;
use std::time::{Duration, Instant};
use taskmaster::tm::launcher::{CommandLauncher, Launcher, Termination};
use taskmaster::tm::program::ProcessSpec;
use taskmaster::tm::reaper::drain;

#[test]
fn drain_collects_every_finished_child() {
    let mut launcher = CommandLauncher;
    let quick = launcher
        .spawn(&ProcessSpec::new(
            "quick",
            vec!["/bin/sh".into(), "-c".into(), "exit 4".into()],
        ))
        .unwrap()
        .pid;
    let sleeper = launcher
        .spawn(&ProcessSpec::new(
            "sleeper",
            vec!["/bin/sleep".into(), "100".into()],
        ))
        .unwrap()
        .pid;
    launcher.signal(sleeper, Signal::SIGKILL).unwrap();

    let mut seen = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while seen.len() < 2 && Instant::now() < deadline {
        drain(|pid, term| seen.push((pid, term)));
        std::thread::sleep(Duration::from_millis(20));
    }
    seen.sort_by_key(|(pid, _)| pid.as_raw());

    let mut expected = vec![
        (quick, Termination::Exited(4)),
        (sleeper, Termination::Signaled(Signal::SIGKILL)),
    ];
    expected.sort_by_key(|(pid, _)| pid.as_raw());
    assert_eq!(seen, expected);

    // Nothing left: a further drain reports zero without blocking.
    assert_eq!(drain(|_, _| panic!("no children remain")), 0);
}
