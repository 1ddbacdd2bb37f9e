use std::{
    path::Path,
    process::{Command, Stdio},
};

use anyhow::Context;
use bg_instance::LaunchMode;

use super::{LaunchSpec, LaunchStrategy, Launched};
use crate::config::HandshakeConfig;

const PID_FILE: &str = "pid.txt";

#[cfg(not(windows))]
const RUN_SCRIPT: &str = "_run.sh";
#[cfg(windows)]
const RUN_SCRIPT: &str = "_run.ps1";

#[cfg(all(unix, not(target_os = "macos")))]
const TERMINAL_CANDIDATES: &[&str] = &[
    "x-terminal-emulator",
    "gnome-terminal",
    "konsole",
    "xfce4-terminal",
    "xterm",
];

/// Runs the command in a fresh interactive terminal window and learns the
/// window's pid from a file the run script writes on its first line.
#[derive(Debug, Clone)]
pub struct WindowedLauncher {
    handshake: HandshakeConfig,
    terminal: Option<String>,
}

impl WindowedLauncher {
    pub fn new(handshake: HandshakeConfig, terminal: Option<String>) -> Self {
        Self {
            handshake,
            terminal,
        }
    }
}

impl LaunchStrategy for WindowedLauncher {
    fn mode(&self) -> LaunchMode {
        LaunchMode::Window
    }

    fn launch(&self, spec: &LaunchSpec<'_>) -> anyhow::Result<Launched> {
        let pid_file = spec.instance_dir.join(PID_FILE);
        let script_path = spec.instance_dir.join(RUN_SCRIPT);

        let script = render_run_script(&pid_file, spec.cwd, spec.command, spec.log_file);
        write_script(&script_path, &script)?;

        let mut launcher = self.launcher_command(&script_path)?;
        launcher
            .current_dir(spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // The launcher only asks for a window and exits; its exit says
        // nothing about the window itself.
        let status = launcher
            .status()
            .with_context(|| format!("run terminal launcher for {}", spec.instance_id))?;
        if !status.success() {
            anyhow::bail!("terminal launcher exited with {status}");
        }

        let pid = wait_for_pid_file(&pid_file, self.handshake);
        let warning = pid.is_none().then(|| {
            format!(
                "could not capture window PID within {}ms; the window may still be running",
                self.handshake.budget().as_millis()
            )
        });

        Ok(Launched {
            mode: LaunchMode::Window,
            pid,
            log_file: spec.log_file.to_path_buf(),
            warning,
        })
    }
}

/// Polls for the side-channel pid file at a fixed interval, up to the
/// configured number of attempts.
pub fn wait_for_pid_file(path: &Path, cfg: HandshakeConfig) -> Option<u32> {
    for attempt in 1..=cfg.attempts {
        std::thread::sleep(cfg.interval);
        if let Ok(raw) = std::fs::read_to_string(path)
            && let Ok(pid) = raw.trim().trim_start_matches('\u{feff}').parse::<u32>()
        {
            tracing::debug!(attempt, pid, "window pid captured");
            return Some(pid);
        }
    }
    tracing::warn!(path = %path.display(), attempts = cfg.attempts, "window pid handshake timed out");
    None
}

fn write_script(path: &Path, script: &str) -> anyhow::Result<()> {
    std::fs::write(path, script).with_context(|| format!("write {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .with_context(|| format!("chmod {}", path.display()))?;
    }
    Ok(())
}

#[cfg(not(windows))]
fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(not(windows))]
fn path_quote(p: &Path) -> String {
    sh_quote(&p.to_string_lossy())
}

/// POSIX sh run script. The pid written first is the script's own; the
/// trailing `exec` keeps the same pid alive as an interactive shell so the
/// window stays open after the command ends.
#[cfg(not(windows))]
pub(crate) fn render_run_script(pid_file: &Path, cwd: &Path, command: &str, log_file: &Path) -> String {
    let log = path_quote(log_file);
    [
        "#!/bin/sh".to_string(),
        format!("echo $$ > {}", path_quote(pid_file)),
        "# bg auto-generated run script".to_string(),
        format!("cd {} || exit 1", path_quote(cwd)),
        "{".to_string(),
        command.to_string(),
        "} 2>&1 | while IFS= read -r line || [ -n \"$line\" ]; do".to_string(),
        format!(
            "  printf '%s\\t%s\\n' \"$(date '+%Y-%m-%d %H:%M:%S')\" \"$line\" >> {log}"
        ),
        "  printf '%s\\n' \"$line\"".to_string(),
        "done".to_string(),
        "exec \"${SHELL:-/bin/sh}\"".to_string(),
        String::new(),
    ]
    .join("\n")
}

#[cfg(windows)]
fn ps_quote(p: &Path) -> String {
    format!("'{}'", p.to_string_lossy().replace('\'', "''"))
}

#[cfg(windows)]
pub(crate) fn render_run_script(pid_file: &Path, cwd: &Path, command: &str, log_file: &Path) -> String {
    let body = [
        format!("$PID | Set-Content -Path {} -Encoding UTF8", ps_quote(pid_file)),
        "# bg auto-generated run script".to_string(),
        "[Console]::OutputEncoding = [System.Text.Encoding]::UTF8".to_string(),
        "$OutputEncoding = [System.Text.Encoding]::UTF8".to_string(),
        "$ErrorActionPreference = 'Continue'".to_string(),
        format!("Set-Location {}", ps_quote(cwd)),
        format!("& {{ {command} }} 2>&1 | ForEach-Object {{"),
        "  $ts = Get-Date -Format 'yyyy-MM-dd HH:mm:ss'".to_string(),
        format!(
            "  \"$ts\" + [char]9 + $_ | Add-Content -Path {} -Encoding UTF8",
            ps_quote(log_file)
        ),
        "  $_".to_string(),
        "}".to_string(),
    ]
    .join("\r\n");
    // BOM so Windows PowerShell reads the script as UTF-8.
    format!("\u{feff}{body}")
}

impl WindowedLauncher {
    #[cfg(target_os = "macos")]
    fn launcher_command(&self, script: &Path) -> anyhow::Result<Command> {
        let app = self.terminal.as_deref().unwrap_or("Terminal");
        let mut cmd = Command::new("open");
        cmd.arg("-a").arg(app).arg(script);
        Ok(cmd)
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    fn launcher_command(&self, script: &Path) -> anyhow::Result<Command> {
        let terminal = match &self.terminal {
            Some(t) => t.clone(),
            None => TERMINAL_CANDIDATES
                .iter()
                .find(|c| command_exists(c))
                .map(|c| c.to_string())
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "no terminal emulator found (tried {}); set BG_TERMINAL or use --daemon",
                        TERMINAL_CANDIDATES.join(", ")
                    )
                })?,
        };

        let flag = exec_flag(&terminal);

        // `sh -c '... &'` returns as soon as the terminal is forked off.
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("\"$@\" >/dev/null 2>&1 &")
            .arg("bg-launch")
            .arg(terminal)
            .arg(flag)
            .arg("sh")
            .arg(script);
        Ok(cmd)
    }

    #[cfg(windows)]
    fn launcher_command(&self, script: &Path) -> anyhow::Result<Command> {
        let shell = self.terminal.as_deref().unwrap_or("powershell");
        let start = format!(
            "Start-Process {shell} -ArgumentList '-NoExit','-NoProfile','-ExecutionPolicy','Bypass','-File',{}",
            ps_quote(script)
        );
        let mut cmd = Command::new("powershell.exe");
        cmd.args(["-NoProfile", "-ExecutionPolicy", "Bypass", "-Command", start.as_str()]);
        Ok(cmd)
    }
}

/// Flag after which the terminal takes a program and its arguments as
/// separate words. `xfce4-terminal -e` wants one command string instead.
#[cfg(all(unix, not(target_os = "macos")))]
fn exec_flag(terminal: &str) -> &'static str {
    let bin = Path::new(terminal)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(terminal);
    match bin {
        "gnome-terminal" => "--",
        "xfce4-terminal" => "-x",
        _ => "-e",
    }
}

#[cfg(all(unix, not(target_os = "macos")))]
fn command_exists(bin: &str) -> bool {
    let path = Path::new(bin);
    if path.components().count() > 1 {
        return is_executable_file(path);
    }

    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| is_executable_file(&dir.join(bin))))
        .unwrap_or(false)
}

#[cfg(all(unix, not(target_os = "macos")))]
fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    meta.is_file() && meta.permissions().mode() & 0o111 != 0
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn fast() -> HandshakeConfig {
        HandshakeConfig {
            interval: Duration::from_millis(10),
            attempts: 5,
        }
    }

    #[test]
    fn script_writes_pid_first_and_logs_with_timestamps() {
        let script = render_run_script(
            Path::new("/tmp/inst/pid.txt"),
            Path::new("/work/it's here"),
            "npm run dev",
            Path::new("/tmp/inst/log.txt"),
        );
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[0], "#!/bin/sh");
        assert_eq!(lines[1], "echo $$ > '/tmp/inst/pid.txt'");
        assert!(script.contains(r"cd '/work/it'\''s here' || exit 1"));
        assert!(script.contains("npm run dev"));
        assert!(script.contains(">> '/tmp/inst/log.txt'"));
    }

    #[test]
    fn script_runs_and_produces_log_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let pid_file = tmp.path().join(PID_FILE);
        let log = tmp.path().join("log.txt");
        let script = render_run_script(&pid_file, tmp.path(), "echo one; echo two >&2", &log)
            .replace("exec \"${SHELL:-/bin/sh}\"", "");
        let script_path = tmp.path().join(RUN_SCRIPT);
        write_script(&script_path, &script).unwrap();

        let out = Command::new("sh").arg(&script_path).output().unwrap();
        assert!(out.status.success());
        assert_eq!(String::from_utf8_lossy(&out.stdout), "one\ntwo\n");

        let logged = std::fs::read_to_string(&log).unwrap();
        let lines: Vec<&str> = logged.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("\tone"));
        assert!(lines[1].ends_with("\ttwo"));
        assert_eq!(lines[0].split('\t').next().unwrap().len(), 19);

        let pid: u32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        assert!(pid > 0);
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn each_terminal_gets_its_exec_flag() {
        assert_eq!(exec_flag("gnome-terminal"), "--");
        assert_eq!(exec_flag("xfce4-terminal"), "-x");
        assert_eq!(exec_flag("/usr/bin/xfce4-terminal"), "-x");
        assert_eq!(exec_flag("xterm"), "-e");
        assert_eq!(exec_flag("konsole"), "-e");
        assert_eq!(exec_flag("x-terminal-emulator"), "-e");
    }

    #[test]
    fn handshake_reads_pid_written_late() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(PID_FILE);
        let writer = {
            let path = path.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(25));
                std::fs::write(path, "4321\n").unwrap();
            })
        };
        let cfg = HandshakeConfig {
            interval: Duration::from_millis(10),
            attempts: 50,
        };
        assert_eq!(wait_for_pid_file(&path, cfg), Some(4321));
        writer.join().unwrap();
    }

    #[test]
    fn handshake_gives_up_after_bounded_attempts() {
        let tmp = tempfile::tempdir().unwrap();
        let started = Instant::now();
        assert_eq!(wait_for_pid_file(&tmp.path().join(PID_FILE), fast()), None);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn handshake_ignores_garbage_until_exhausted() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(PID_FILE);
        std::fs::write(&path, "not a pid").unwrap();
        assert_eq!(wait_for_pid_file(&path, fast()), None);
    }
}
