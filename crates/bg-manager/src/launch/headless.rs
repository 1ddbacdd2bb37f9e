use std::{
    path::PathBuf,
    process::{Command, Stdio},
};

use anyhow::Context;
use bg_instance::LaunchMode;

use super::{LaunchSpec, LaunchStrategy, Launched};

/// Hidden subcommand the supervisor runs under.
pub const SUPERVISE_COMMAND: &str = "__supervise";

/// Re-executes this binary as a detached supervisor that owns the user's
/// command and writes its output to the log file.
#[derive(Debug, Clone)]
pub struct HeadlessLauncher {
    exe: PathBuf,
}

impl HeadlessLauncher {
    pub fn new(exe: impl Into<PathBuf>) -> Self {
        Self { exe: exe.into() }
    }

    pub fn current_exe() -> anyhow::Result<Self> {
        let exe = std::env::current_exe().context("locate bg executable")?;
        Ok(Self::new(exe))
    }
}

#[cfg(unix)]
fn detach(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;

    // New session: no controlling terminal, and the supervisor leads its own
    // process group so the whole tree can be signalled at once.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(windows)]
fn detach(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;

    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
}

impl LaunchStrategy for HeadlessLauncher {
    fn mode(&self) -> LaunchMode {
        LaunchMode::Headless
    }

    fn launch(&self, spec: &LaunchSpec<'_>) -> anyhow::Result<Launched> {
        // The supervisor opens the log asynchronously; create it up front so
        // `logs` works straight after `start`.
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(spec.log_file)
            .with_context(|| format!("create log file {}", spec.log_file.display()))?;

        let mut cmd = Command::new(&self.exe);
        cmd.arg(SUPERVISE_COMMAND)
            .arg("--log-file")
            .arg(spec.log_file)
            .arg("--cwd")
            .arg(spec.cwd)
            .arg("--")
            .arg(spec.command)
            .current_dir(spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        detach(&mut cmd);

        tracing::debug!(
            exe = %self.exe.display(),
            instance_id = %spec.instance_id,
            cwd = %spec.cwd.display(),
            "spawning supervisor"
        );

        let child = cmd
            .spawn()
            .with_context(|| format!("spawn supervisor for {}", spec.instance_id))?;
        let pid = child.id();

        // Dropping a std Child neither waits on nor kills it; the supervisor
        // is re-parented once this invocation exits.
        drop(child);

        Ok(Launched {
            mode: LaunchMode::Headless,
            pid: Some(pid),
            log_file: spec.log_file.to_path_buf(),
            warning: None,
        })
    }
}
