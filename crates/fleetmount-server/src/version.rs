//! Build metadata stamped in by `build.rs`.

use serde::Serialize;
use std::fmt;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Short commit SHA.
pub const GIT_SHA: &str = env!("VERGEN_GIT_SHA");

/// Snapshot of the build, served by `/version` and printed by `version`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_sha: &'static str,
    pub git_branch: &'static str,
    pub git_commit_timestamp: &'static str,
    pub dirty: bool,
    pub build_timestamp: &'static str,
    pub rustc: &'static str,
    pub target: &'static str,
}

impl BuildInfo {
    pub const fn current() -> Self {
        Self {
            version: VERSION,
            git_sha: GIT_SHA,
            git_branch: env!("VERGEN_GIT_BRANCH"),
            git_commit_timestamp: env!("VERGEN_GIT_COMMIT_TIMESTAMP"),
            dirty: matches!(env!("VERGEN_GIT_DIRTY").as_bytes(), b"true"),
            build_timestamp: env!("VERGEN_BUILD_TIMESTAMP"),
            rustc: env!("VERGEN_RUSTC_SEMVER"),
            target: env!("VERGEN_CARGO_TARGET_TRIPLE"),
        }
    }

    /// `<version> (<sha>[ dirty])`
    pub fn short(&self) -> String {
        let dirty = if self.dirty { " dirty" } else { "" };
        format!("{} ({}{dirty})", self.version, self.git_sha)
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "fleetmount-server {}", self.short())?;
        writeln!(f, "branch: {} ({})", self.git_branch, self.git_commit_timestamp)?;
        writeln!(f, "built:  {} for {}", self.build_timestamp, self.target)?;
        write!(f, "rustc:  {}", self.rustc)
    }
}
