use std::env;

use anyhow::Context as _;
use anyhow::Result;

use grev::git_revision_auto;


/// Assemble the version string reported by `dwflcli --version`.
fn version(dir: &str) -> Result<String> {
    let version = env!("CARGO_PKG_VERSION");
    let version = match git_revision_auto(dir)? {
        Some(git_rev) => format!("{version} ({git_rev})"),
        None => version.to_string(),
    };
    Ok(version)
}

fn main() -> Result<()> {
    let dir = env::var("CARGO_MANIFEST_DIR").context("CARGO_MANIFEST_DIR is not set")?;
    println!("cargo:rustc-env=VERSION={}", version(&dir)?);
    Ok(())
}
