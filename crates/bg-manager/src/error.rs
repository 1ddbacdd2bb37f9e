use std::path::PathBuf;

use bg_instance::{IdError, InstanceId};

/// Failures a lifecycle operation reports to its caller.
///
/// Stale state (metadata present, process gone) is deliberately absent: it is
/// a normal terminal state, not an error.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("instance \"{name}\" is already running (PID: {pid})")]
    AlreadyRunning { name: String, pid: u32 },

    #[error("no active instance found for \"{0}\"")]
    NoActiveInstance(String),

    #[error("instance metadata not found for \"{0}\"")]
    MetaMissing(InstanceId),

    #[error("log file not found: {}", .0.display())]
    LogMissing(PathBuf),

    #[error("instance id {0} already exists (two starts within the same second)")]
    IdCollision(InstanceId),

    #[error("working directory does not exist: {}", .0.display())]
    MissingCwd(PathBuf),

    #[error("failed to terminate process tree rooted at PID {pid}")]
    TerminateFailed {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    InvalidName(#[from] IdError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LifecycleError {
    /// Conflicts and lookups that came up empty are reported as warnings
    /// rather than failures.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            LifecycleError::AlreadyRunning { .. }
                | LifecycleError::NoActiveInstance(_)
                | LifecycleError::MetaMissing(_)
                | LifecycleError::LogMissing(_)
        )
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

pub fn format_error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = Vec::<String>::new();
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        let s = e.to_string();
        if !s.is_empty() && parts.last() != Some(&s) {
            parts.push(s);
        }
        cur = e.source();
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}
