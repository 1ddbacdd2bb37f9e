//! The two ways of creating a detached worker. Everything downstream
//! (liveness, stop, prune) sees only the returned pid.

use std::path::{Path, PathBuf};

use bg_instance::{InstanceId, LaunchMode};

mod headless;
mod windowed;

pub use headless::{HeadlessLauncher, SUPERVISE_COMMAND};
pub use windowed::WindowedLauncher;

/// Inputs shared by both strategies. The instance directory already exists.
#[derive(Debug, Clone)]
pub struct LaunchSpec<'a> {
    pub instance_id: &'a InstanceId,
    pub command: &'a str,
    pub cwd: &'a Path,
    pub env: &'a [(String, String)],
    pub instance_dir: &'a Path,
    pub log_file: &'a Path,
}

#[derive(Debug, Clone)]
pub struct Launched {
    pub mode: LaunchMode,
    pub pid: Option<u32>,
    pub log_file: PathBuf,
    /// Soft problem worth surfacing even though the launch went through.
    pub warning: Option<String>,
}

pub trait LaunchStrategy {
    fn mode(&self) -> LaunchMode;

    fn launch(&self, spec: &LaunchSpec<'_>) -> anyhow::Result<Launched>;
}

/// `KEY=VALUE` pairs; entries without `=` or with an empty key are dropped.
pub fn parse_env_pairs<S: AsRef<str>>(raw: &[S]) -> Vec<(String, String)> {
    raw.iter()
        .filter_map(|s| {
            let s = s.as_ref();
            let idx = s.find('=')?;
            if idx == 0 {
                return None;
            }
            Some((s[..idx].to_string(), s[idx + 1..].to_string()))
        })
        .collect()
}
