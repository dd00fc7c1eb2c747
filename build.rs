use std::env;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

fn probe(program: &str, args: &[&str]) -> Option<String> {
    let out = Command::new(program).args(args).output().ok()?;
    if !out.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&out.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");

    // SOURCE_DATE_EPOCH wins so packaged builds stay reproducible.
    let stamp = match env::var("SOURCE_DATE_EPOCH") {
        Ok(epoch) => format!("epoch:{}", epoch.trim()),
        Err(_) => probe("date", &["-u", "+%Y-%m-%dT%H:%M:%SZ"]).unwrap_or_else(|| {
            let secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            format!("epoch:{secs}")
        }),
    };

    let host = env::var("HOSTNAME")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .or_else(|| probe("hostname", &[]))
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=TASKMASTER_BUILD_TIME={stamp}");
    println!("cargo:rustc-env=TASKMASTER_BUILD_HOST={host}");
}
