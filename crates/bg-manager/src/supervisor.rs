//! The detached process behind a headless instance: runs the user's command
//! through the shell, timestamps every output line into the log file, and
//! records how the command ended.

use std::{path::Path, process::ExitStatus};

use anyhow::Context;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::Command,
    sync::mpsc,
};

use crate::logs::log_timestamp;

#[derive(Clone)]
struct LogSink {
    tx: mpsc::UnboundedSender<String>,
}

impl LogSink {
    fn emit(&self, line: &str) {
        let _ = self.tx.send(format!("{}\t{}\n", log_timestamp(), line));
    }

    fn emit_bg(&self, msg: impl AsRef<str>) {
        self.emit(&format!("[bg] {}", msg.as_ref()));
    }
}

struct FileLogWriter {
    file: tokio::fs::File,
}

impl FileLogWriter {
    async fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self { file })
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.file.write_all(line.as_bytes()).await?;
        // Followers poll the file size, so don't sit on buffered output.
        self.file.flush().await
    }
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

/// Splits on `\n`, strips a trailing `\r`, drops empty lines. Bytes that
/// aren't UTF-8 are replaced rather than ending the stream.
async fn pump<R: AsyncRead + Unpin>(reader: R, sink: LogSink) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches('\n').trim_end_matches('\r');
                if !line.is_empty() {
                    sink.emit(line);
                }
            }
            Err(_) => break,
        }
    }
}

fn describe_exit(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("Process exited with code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return format!("Process exited with signal {sig}");
        }
    }
    format!("Process exited ({status})")
}

/// Runs `command` in `cwd` until it exits. The returned status is `None`
/// when the command could not be started at all.
pub async fn run(log_file: &Path, cwd: &Path, command: &str) -> anyhow::Result<Option<ExitStatus>> {
    let mut writer = FileLogWriter::open(log_file)
        .await
        .with_context(|| format!("open log file {}", log_file.display()))?;

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let sink = LogSink { tx };
    let writer_task = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if writer.write_line(&line).await.is_err() {
                break;
            }
        }
    });

    let mut cmd = shell_command(command);
    cmd.current_dir(cwd)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    let status = match cmd.spawn() {
        Ok(mut child) => {
            let mut pumps = Vec::new();
            if let Some(out) = child.stdout.take() {
                pumps.push(tokio::spawn(pump(out, sink.clone())));
            }
            if let Some(err) = child.stderr.take() {
                pumps.push(tokio::spawn(pump(err, sink.clone())));
            }

            let waited = child.wait().await;
            // Drain remaining output so the exit line is the last one.
            for p in pumps {
                let _ = p.await;
            }

            match waited {
                Ok(status) => {
                    sink.emit_bg(describe_exit(status));
                    Some(status)
                }
                Err(e) => {
                    sink.emit_bg(format!("Process error: {e}"));
                    None
                }
            }
        }
        Err(e) => {
            sink.emit_bg(format!("Process error: {e}"));
            None
        }
    };

    drop(sink);
    let _ = writer_task.await;
    Ok(status)
}
