use std::process::Command;

fn main() {
    // Set build date
    let now = chrono::Utc::now()
        .format("%Y-%m-%d %H:%M:%S UTC")
        .to_string();
    println!("cargo:rustc-env=BUILD_DATE={}", now);

    // Set git commit hash if available
    if let Ok(output) = Command::new("git").args(["rev-parse", "--short", "HEAD"]).output() {
        if output.status.success() {
            let commit = String::from_utf8_lossy(&output.stdout).trim().to_string();
            println!("cargo:rustc-env=GIT_COMMIT={}", commit);
        }
    }

    // The protocol bindings are generated from these files at compile time
    println!("cargo:rerun-if-changed=protocols/wayland-drm.xml");
    println!("cargo:rerun-if-changed=protocols/ivi-application.xml");
    println!("cargo:rerun-if-changed=.git/HEAD");
}
