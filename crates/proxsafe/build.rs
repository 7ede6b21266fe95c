//! Embeds the build identity reported by `proxsafe version` and stamped
//! into refreshed manifests.

use std::process::Command;

fn git_short_sha() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short=8", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!sha.is_empty()).then_some(sha)
}

fn main() {
    // PROXSAFE_GIT_SHA overrides git for builds outside a checkout
    let sha = std::env::var("PROXSAFE_GIT_SHA").ok().or_else(git_short_sha);
    if let Some(sha) = sha {
        println!("cargo:rustc-env=PROXSAFE_GIT_SHA={}", sha);
    }

    println!(
        "cargo:rustc-env=PROXSAFE_BUILD_DATE={}",
        chrono::Utc::now().format("%Y-%m-%d")
    );
    if let Ok(target) = std::env::var("TARGET") {
        println!("cargo:rustc-env=PROXSAFE_TARGET={}", target);
    }

    println!("cargo:rerun-if-env-changed=PROXSAFE_GIT_SHA");
    println!("cargo:rerun-if-changed=../../.git/HEAD");
}
