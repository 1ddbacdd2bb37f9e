//! Log file format and read-side helpers: tail the last lines, then follow
//! appended output by polling the file size.

use std::{
    fs,
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;

const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Local time, second resolution: the prefix before the tab on every line.
pub fn log_timestamp() -> String {
    chrono::Local::now().format(LOG_TIMESTAMP_FORMAT).to_string()
}

fn split_lines(text: &str) -> impl Iterator<Item = &str> {
    text.split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .filter(|l| !l.is_empty())
}

/// Last `n` complete, non-empty lines of the file, plus the offset just past
/// the last newline. A trailing line still being written is left for the
/// follower, which resumes from that offset.
pub fn tail_lines(path: &Path, n: usize) -> anyhow::Result<(Vec<String>, u64)> {
    let raw = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let complete = raw.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    let text = String::from_utf8_lossy(&raw[..complete]);
    let all: Vec<&str> = split_lines(&text).collect();
    let start = all.len().saturating_sub(n);
    let out = all[start..].iter().map(|l| l.to_string()).collect();
    Ok((out, complete as u64))
}

/// Reads only what was appended since the previous poll.
///
/// A trailing line without its newline is held back until the newline
/// arrives, so each line is reported exactly once and never split. If the
/// file shrinks (truncated or replaced) reading restarts from the top.
#[derive(Debug)]
pub struct LogFollower {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
}

impl LogFollower {
    pub fn new(path: impl Into<PathBuf>, offset: u64) -> Self {
        Self {
            path: path.into(),
            offset,
            partial: Vec::new(),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn poll(&mut self) -> std::io::Result<Vec<String>> {
        let size = fs::metadata(&self.path)?.len();
        if size < self.offset {
            tracing::debug!(path = %self.path.display(), size, offset = self.offset, "log shrank; rereading");
            self.offset = 0;
            self.partial.clear();
        }
        if size == self.offset {
            return Ok(Vec::new());
        }

        let mut f = fs::File::open(&self.path)?;
        f.seek(SeekFrom::Start(self.offset))?;
        let mut chunk = Vec::with_capacity((size - self.offset) as usize);
        f.take(size - self.offset).read_to_end(&mut chunk)?;
        self.offset += chunk.len() as u64;

        self.partial.extend_from_slice(&chunk);
        let Some(last_nl) = self.partial.iter().rposition(|b| *b == b'\n') else {
            return Ok(Vec::new());
        };
        let complete: Vec<u8> = self.partial.drain(..=last_nl).collect();
        let text = String::from_utf8_lossy(&complete);
        Ok(split_lines(&text).map(str::to_string).collect())
    }
}

/// Polls `follower` every `interval`, handing new lines to `emit`, until
/// Ctrl-C. The ticker is dropped before returning.
pub async fn follow_until_interrupt(
    mut follower: LogFollower,
    interval: Duration,
    mut emit: impl FnMut(&str),
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                res.context("listen for Ctrl-C")?;
                break;
            }
            _ = ticker.tick() => {
                match follower.poll() {
                    Ok(lines) => lines.iter().for_each(|l| emit(l.as_str())),
                    // The file may be briefly missing while pruned or rotated.
                    Err(e) => tracing::debug!(error = %e, "log poll failed"),
                }
            }
        }
    }
    drop(ticker);
    Ok(())
}
