//! Best-effort process probing and whole-tree termination.
//!
//! A recycled pid that now belongs to an unrelated process reads as alive;
//! that false positive is accepted.

use std::{collections::HashMap, io};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

impl Signal {
    #[cfg(unix)]
    fn raw(self) -> libc::c_int {
        match self {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

#[cfg(unix)]
fn to_raw_pid(pid: u32) -> Option<libc::pid_t> {
    libc::pid_t::try_from(pid).ok().filter(|p| *p > 0)
}

/// Zero-signal probe: "found" and "permission denied" both mean alive.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    let Some(raw) = to_raw_pid(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs the permission and existence checks only.
    let rc = unsafe { libc::kill(raw, 0) };
    if rc == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(windows)]
pub fn is_alive(pid: u32) -> bool {
    let out = std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH", "/FO", "CSV"])
        .output();
    match out {
        Ok(out) => String::from_utf8_lossy(&out.stdout).contains(&format!("\"{pid}\"")),
        Err(_) => false,
    }
}

/// `pid -> parent pid` for every visible process.
#[cfg(target_os = "linux")]
fn parent_table() -> HashMap<u32, u32> {
    let mut out = HashMap::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return out;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|s| s.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some(ppid) = parse_stat_ppid(&stat) {
            out.insert(pid, ppid);
        }
    }
    out
}

/// The command name in `/proc/<pid>/stat` may contain spaces and parens, so
/// fields are located from the last `)`.
#[cfg(target_os = "linux")]
fn parse_stat_ppid(stat: &str) -> Option<u32> {
    let end = stat.rfind(')')?;
    let rest = stat.get((end + 2)..)?;
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}

#[cfg(all(unix, not(target_os = "linux")))]
fn parent_table() -> HashMap<u32, u32> {
    let mut out = HashMap::new();
    let Ok(output) = std::process::Command::new("ps")
        .args(["-A", "-o", "pid=", "-o", "ppid="])
        .output()
    else {
        return out;
    };
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let mut it = line.split_whitespace();
        if let (Some(pid), Some(ppid)) = (it.next(), it.next())
            && let (Ok(pid), Ok(ppid)) = (pid.parse::<u32>(), ppid.parse::<u32>())
        {
            out.insert(pid, ppid);
        }
    }
    out
}

/// All descendants of `root`, parents before children. `root` is excluded.
#[cfg(unix)]
fn descendants(root: u32, parents: &HashMap<u32, u32>) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (&pid, &ppid) in parents {
        if pid != ppid {
            children.entry(ppid).or_default().push(pid);
        }
    }

    let mut out = Vec::new();
    let mut queue = std::collections::VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if kid != root && !out.contains(&kid) {
                    out.push(kid);
                    queue.push_back(kid);
                }
            }
        }
    }
    out
}

/// Signals `root` and everything below it.
///
/// Descendants are signalled leaves-first and their errors ignored; only a
/// failure to signal `root` itself is returned. A root that vanished in the
/// meantime counts as success. If `root` leads its own process group the
/// group is signalled too, which catches re-parented grandchildren.
#[cfg(unix)]
pub fn kill_tree(root: u32, signal: Signal) -> io::Result<()> {
    let raw_root = to_raw_pid(root)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid pid {root}")))?;
    let sig = signal.raw();

    let tree = descendants(root, &parent_table());
    tracing::debug!(pid = root, ?signal, descendants = ?tree, "signalling process tree");

    for &pid in tree.iter().rev() {
        if let Some(raw) = to_raw_pid(pid) {
            // SAFETY: plain kill(2); errors are ignored for descendants.
            unsafe {
                libc::kill(raw, sig);
            }
        }
    }

    // SAFETY: getpgid/kill take no pointers.
    let leads_group = unsafe { libc::getpgid(raw_root) } == raw_root;
    if leads_group {
        unsafe {
            libc::kill(-raw_root, sig);
        }
    }

    let rc = unsafe { libc::kill(raw_root, sig) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

#[cfg(windows)]
pub fn kill_tree(root: u32, signal: Signal) -> io::Result<()> {
    let mut cmd = std::process::Command::new("taskkill");
    cmd.args(["/PID", &root.to_string(), "/T"]);
    if signal == Signal::Kill {
        cmd.arg("/F");
    }
    let status = cmd.status()?;
    if status.success() || !is_alive(root) {
        Ok(())
    } else {
        Err(io::Error::other(format!("taskkill exited with {status}")))
    }
}
