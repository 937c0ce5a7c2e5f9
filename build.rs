//! Stamps version and git SHA into the binary's startup banner.
//!
//! - WIIM_VERSION: overrides CARGO_PKG_VERSION
//! - WIIM_GIT_SHA: overrides `git rev-parse --short HEAD`

use std::process::Command;

fn main() {
    let version = std::env::var("WIIM_VERSION")
        .or_else(|_| std::env::var("CARGO_PKG_VERSION"))
        .unwrap_or_else(|_| "unknown".into());
    println!("cargo:rustc-env=WIIM_VERSION={}", version);

    let git_sha = std::env::var("WIIM_GIT_SHA").unwrap_or_else(|_| short_head());
    println!("cargo:rustc-env=WIIM_GIT_SHA={}", git_sha);

    println!("cargo:rerun-if-env-changed=WIIM_VERSION");
    println!("cargo:rerun-if-env-changed=WIIM_GIT_SHA");
}

fn short_head() -> String {
    Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".into())
}
