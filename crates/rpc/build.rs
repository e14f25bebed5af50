use std::process::Command;

fn main() {
    println!("cargo:rerun-if-env-changed=GIT_COMMIT_HASH");
    println!("cargo:rerun-if-changed=../../.git/HEAD");

    if let Ok(sha) = std::env::var("GIT_COMMIT_HASH") {
        if !sha.trim().is_empty() {
            println!("cargo:rustc-env=GIT_COMMIT_HASH={}", sha.trim());
            return;
        }
    }

    // Fall back to the local checkout; builds outside git report "unknown".
    let Ok(output) = Command::new("git").args(["rev-parse", "--short", "HEAD"]).output() else {
        return;
    };
    if output.status.success() {
        let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !sha.is_empty() {
            println!("cargo:rustc-env=GIT_COMMIT_HASH={sha}");
        }
    }
}
