use std::env;
use std::process::Command;

/// Record the compiler version so events can report the runtime they were built with.
fn main() {
    println!("cargo:rerun-if-env-changed=RUSTC");

    let rustc = env::var("RUSTC").unwrap_or_else(|_| "rustc".to_owned());
    let version = Command::new(rustc)
        .arg("--version")
        .output()
        .ok()
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .and_then(|stdout| stdout.split_whitespace().nth(1).map(str::to_owned));

    if let Some(version) = version {
        println!("cargo:rustc-env=BOOBOO_RUSTC_VERSION={}", version);
    }
}
