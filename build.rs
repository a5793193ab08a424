use std::env;
use std::process::Command;

fn main() {
    // Capture the compiler version for the `runtime_version` upload label.
    let rustc = env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());

    let version = Command::new(rustc)
        .arg("--version")
        .output()
        .ok()
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=CONPROF_RUSTC_VERSION={version}");
    println!("cargo:rerun-if-changed=build.rs");
}
