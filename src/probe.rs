//! Process probe — stateless reads of one process's attributes
//!
//! Every call goes to the process filesystem or the kernel; nothing is
//! cached per PID. The probe also carries the mutation primitives (signal
//! delivery, scheduling changes) so everything that touches a live process
//! goes through one seam.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors a probe call can surface. Callers branch on the first two;
/// anything else is skipped and logged by the sampling layer.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no such process")]
    NotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("malformed process record: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProbeError {
    fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => ProbeError::NotFound,
            io::ErrorKind::PermissionDenied => ProbeError::PermissionDenied,
            _ => ProbeError::Io(err),
        }
    }

    fn from_errno(errno: nix::errno::Errno) -> Self {
        match errno {
            nix::errno::Errno::ESRCH => ProbeError::NotFound,
            nix::errno::Errno::EPERM => ProbeError::PermissionDenied,
            e => ProbeError::Io(io::Error::from_raw_os_error(e as i32)),
        }
    }
}

/// One process's attributes at a single instant.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessSnapshot {
    pub pid: i32,
    pub parent_pid: i32,
    /// Executable name with arguments stripped; empty for kernel threads
    /// whose command line is unreadable.
    pub name: String,
    /// Resident set size in bytes.
    pub memory_bytes: u64,
    pub thread_count: u32,
    pub priority: i32,
    pub policy: i32,
    /// OS-defined state code, passed through opaquely.
    pub state_code: i32,
    /// Lifetime CPU time across all CPUs, in nanoseconds.
    pub cumulative_cpu_ns: u64,
    /// Wall-clock start time in epoch milliseconds, 0 if unknown.
    pub start_time_ms: i64,
}

/// Read and mutation primitives over live processes.
///
/// The registry, group index, and server take this as a trait object so
/// tests can drive them with a scripted implementation.
pub trait ProcessProbe: Send + Sync {
    /// Every PID that currently has a process filesystem entry.
    fn list_pids(&self) -> Result<Vec<i32>, ProbeError>;

    /// Fresh attribute read for one PID.
    fn read_snapshot(&self, pid: i32) -> Result<ProcessSnapshot, ProbeError>;

    /// Deliver a signal; `None` probes for existence only.
    fn send_signal(&self, pid: i32, signal: Option<Signal>) -> Result<(), ProbeError>;

    /// Change scheduling parameters. Policy 0 adjusts the nice value;
    /// any other policy goes through the scheduler.
    fn adjust_priority(&self, pid: i32, priority: i32, policy: i32) -> Result<(), ProbeError>;

    fn suspend(&self, pid: i32) -> Result<(), ProbeError> {
        self.send_signal(pid, Some(Signal::SIGSTOP))
    }

    fn resume(&self, pid: i32) -> Result<(), ProbeError> {
        self.send_signal(pid, Some(Signal::SIGCONT))
    }

    fn terminate(&self, pid: i32) -> Result<(), ProbeError> {
        self.send_signal(pid, Some(Signal::SIGTERM))
    }

    fn exists(&self, pid: i32) -> bool {
        self.send_signal(pid, None).is_ok()
    }
}

/// Fields parsed out of a `stat` record.
struct StatFields {
    pid: i32,
    comm: String,
    state: i32,
    ppid: i32,
    utime_ticks: u64,
    stime_ticks: u64,
    priority: i32,
    thread_count: u32,
    start_ticks: u64,
    rss_pages: u64,
    policy: i32,
}

/// Parse one `/proc/<pid>/stat` line.
///
/// The command name sits in parentheses and may itself contain spaces or
/// parentheses, so the split anchors on the last `)`. Optional fields that
/// fail to parse default to zero; a missing pid or CPU time is malformed.
fn parse_stat(contents: &str) -> Result<StatFields, ProbeError> {
    let open = contents
        .find('(')
        .ok_or(ProbeError::Malformed("stat: missing '('"))?;
    let close = contents
        .rfind(')')
        .ok_or(ProbeError::Malformed("stat: missing ')'"))?;
    if close < open {
        return Err(ProbeError::Malformed("stat: unbalanced command name"));
    }

    let pid: i32 = contents[..open]
        .trim()
        .parse()
        .map_err(|_| ProbeError::Malformed("stat: bad pid"))?;
    let comm = contents[open + 1..close].to_string();

    // Fields after the command name, starting at the state character
    // (overall field 3 of the record).
    let rest: Vec<&str> = contents[close + 1..].split_whitespace().collect();

    let field_u64 = |idx: usize| rest.get(idx).and_then(|f| f.parse::<u64>().ok());
    let field_i32 = |idx: usize| {
        rest.get(idx)
            .and_then(|f| f.parse::<i32>().ok())
            .unwrap_or(0)
    };

    let utime_ticks = field_u64(11).ok_or(ProbeError::Malformed("stat: bad utime"))?;
    let stime_ticks = field_u64(12).ok_or(ProbeError::Malformed("stat: bad stime"))?;

    Ok(StatFields {
        pid,
        comm,
        state: rest
            .first()
            .and_then(|s| s.bytes().next())
            .map(i32::from)
            .unwrap_or(0),
        ppid: field_i32(1),
        utime_ticks,
        stime_ticks,
        priority: field_i32(15),
        thread_count: field_u64(17).unwrap_or(0) as u32,
        start_ticks: field_u64(19).unwrap_or(0),
        rss_pages: field_u64(21).unwrap_or(0),
        policy: field_i32(38),
    })
}

/// Probe backed by the kernel's process filesystem.
pub struct ProcProbe {
    root: PathBuf,
    ticks_per_sec: u64,
    page_size: u64,
    /// Boot time in epoch milliseconds, 0 if the kernel did not report it.
    boot_time_ms: i64,
}

impl ProcProbe {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Probe rooted at an arbitrary directory laid out like `/proc`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let ticks_per_sec = match unsafe { libc::sysconf(libc::_SC_CLK_TCK) } {
            n if n > 0 => n as u64,
            _ => 100,
        };
        let page_size = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            n if n > 0 => n as u64,
            _ => 4096,
        };
        let boot_time_ms = read_boot_time_ms(&root).unwrap_or(0);
        Self {
            root,
            ticks_per_sec,
            page_size,
            boot_time_ms,
        }
    }

    fn pid_dir(&self, pid: i32) -> PathBuf {
        self.root.join(pid.to_string())
    }

    fn ticks_to_ns(&self, ticks: u64) -> u64 {
        // 1e9 / ticks_per_sec is exact for the usual 100 Hz and 1000 Hz.
        ticks.saturating_mul(1_000_000_000 / self.ticks_per_sec)
    }

    /// First command-line argument with its path prefix stripped.
    fn read_name(&self, pid: i32) -> Option<String> {
        let raw = fs::read(self.pid_dir(pid).join("cmdline")).ok()?;
        let first = raw.split(|b| *b == 0).next()?;
        if first.is_empty() {
            return None;
        }
        let arg0 = String::from_utf8_lossy(first);
        let base = arg0.rsplit('/').next().unwrap_or(arg0.as_ref());
        Some(base.to_string())
    }
}

impl Default for ProcProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the `btime` line (boot time, epoch seconds) out of `<root>/stat`.
fn read_boot_time_ms(root: &Path) -> Option<i64> {
    let contents = fs::read_to_string(root.join("stat")).ok()?;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("btime ") {
            return rest.trim().parse::<i64>().ok().map(|s| s * 1000);
        }
    }
    None
}

impl ProcessProbe for ProcProbe {
    fn list_pids(&self) -> Result<Vec<i32>, ProbeError> {
        let entries = fs::read_dir(&self.root).map_err(ProbeError::from_io)?;
        let mut pids = Vec::new();
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(pid) = name.parse::<i32>() {
                    pids.push(pid);
                }
            }
        }
        Ok(pids)
    }

    fn read_snapshot(&self, pid: i32) -> Result<ProcessSnapshot, ProbeError> {
        let stat_path = self.pid_dir(pid).join("stat");
        let contents = fs::read_to_string(&stat_path).map_err(ProbeError::from_io)?;
        if contents.is_empty() {
            // The process vanished between open and read.
            return Err(ProbeError::NotFound);
        }
        let stat = parse_stat(&contents)?;

        let name = self.read_name(pid).unwrap_or(stat.comm);

        let start_time_ms = if self.boot_time_ms > 0 && stat.start_ticks > 0 {
            self.boot_time_ms + (stat.start_ticks * 1000 / self.ticks_per_sec) as i64
        } else {
            0
        };

        Ok(ProcessSnapshot {
            pid: stat.pid,
            parent_pid: stat.ppid.max(0),
            name,
            memory_bytes: stat.rss_pages.saturating_mul(self.page_size),
            thread_count: stat.thread_count,
            priority: stat.priority,
            policy: stat.policy,
            state_code: stat.state,
            cumulative_cpu_ns: self.ticks_to_ns(stat.utime_ticks + stat.stime_ticks),
            start_time_ms,
        })
    }

    fn send_signal(&self, pid: i32, signal: Option<Signal>) -> Result<(), ProbeError> {
        kill(Pid::from_raw(pid), signal).map_err(ProbeError::from_errno)
    }

    fn adjust_priority(&self, pid: i32, priority: i32, policy: i32) -> Result<(), ProbeError> {
        let ret = if policy == 0 {
            unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, priority) }
        } else {
            let param = libc::sched_param {
                sched_priority: priority,
            };
            unsafe { libc::sched_setscheduler(pid, policy, &param) }
        };
        if ret == -1 {
            return Err(ProbeError::from_io(io::Error::last_os_error()));
        }
        Ok(())
    }
}
