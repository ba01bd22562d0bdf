use std::process::Command;

// Startup banner metadata; main.rs falls back to "unknown" when unset
fn main() {
    let describe = Command::new("git")
        .args(["describe", "--always", "--dirty"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok());
    if let Some(hash) = describe.as_deref().map(str::trim).filter(|h| !h.is_empty()) {
        println!("cargo:rustc-env=GIT_HASH={}", hash);
    }

    println!(
        "cargo:rustc-env=BUILD_DATE={}",
        chrono::Utc::now().format("%Y-%m-%d")
    );
    println!("cargo:rerun-if-changed=.git/HEAD");
}
