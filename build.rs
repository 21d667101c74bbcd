// Version string for --version, with the git hash when one is available.
fn main() {
    let version = std::env::var("CARGO_PKG_VERSION").unwrap_or_default();
    let hash = std::process::Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|hash| hash.trim().to_owned())
        .filter(|hash| !hash.is_empty());
    match hash {
        Some(hash) => println!("cargo:rustc-env=SCREENTAPE_VERSION={version} ({hash})"),
        None => println!("cargo:rustc-env=SCREENTAPE_VERSION={version}"),
    }
}
