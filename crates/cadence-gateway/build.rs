use std::process::Command;

/// Commit reported by `/health` as `CADENCE_GIT_SHA`.
///
/// Release builds from a source tarball have no `.git`; they pass the commit
/// in `CADENCE_BUILD_COMMIT` instead.
fn commit() -> String {
    if let Ok(pinned) = std::env::var("CADENCE_BUILD_COMMIT") {
        let pinned = pinned.trim();
        if !pinned.is_empty() {
            return pinned.to_string();
        }
    }

    let Ok(out) = Command::new("git").args(["describe", "--always", "--dirty"]).output() else {
        return "unknown".into();
    };
    if !out.status.success() {
        return "unknown".into();
    }
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

fn main() {
    println!("cargo:rustc-env=CADENCE_GIT_SHA={}", commit());
    println!("cargo:rerun-if-env-changed=CADENCE_BUILD_COMMIT");
    for watched in ["../../.git/HEAD", "../../.git/index"] {
        println!("cargo:rerun-if-changed={watched}");
    }
}
