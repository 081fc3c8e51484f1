//! Embeds build metadata for the ldmd startup banner.

use std::process::Command;

fn stamp(command: &str, args: &[&str]) -> String {
    Command::new(command)
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn main() {
    println!("cargo:rustc-env=BUILD_DATE={}", stamp("date", &["+%Y-%m-%d"]));
    println!("cargo:rustc-env=BUILD_TIME={}", stamp("date", &["+%H:%M:%S"]));
    println!(
        "cargo:rustc-env=GIT_HASH={}",
        stamp("git", &["rev-parse", "--short", "HEAD"])
    );
    println!("cargo:rerun-if-changed=.git/HEAD");
}
