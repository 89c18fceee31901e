//! Build script for meshnote
//!
//! Embeds the git revision, build time, target and compiler version so
//! `meshnote version` can report exactly which build is talking on the mesh.

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let git_hash = command_output("git", &["rev-parse", "--short=8", "HEAD"]);
    let git_dirty = match Command::new("git").args(["status", "--porcelain"]).output() {
        Ok(out) if out.status.success() => (!out.stdout.is_empty()).to_string(),
        _ => "unknown".to_string(),
    };
    let rustc_version = command_output("rustc", &["--version"]);

    let vars = [
        ("MESHNOTE_GIT_HASH", git_hash),
        ("MESHNOTE_GIT_DIRTY", git_dirty),
        (
            "MESHNOTE_BUILD_TIMESTAMP",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        ),
        ("MESHNOTE_TARGET", env_or_unknown("TARGET")),
        ("MESHNOTE_PROFILE", env_or_unknown("PROFILE")),
        ("MESHNOTE_RUSTC_VERSION", rustc_version),
    ];

    for (key, value) in vars {
        println!("cargo:rustc-env={}={}", key, value);
    }
}

/// Run a command and return its trimmed stdout, or "unknown"
fn command_output(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn env_or_unknown(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| "unknown".to_string())
}
