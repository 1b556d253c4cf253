//! Process group handle: kill-on-drop and RSS sampling for a whole process tree

use std::fs;
use std::sync::OnceLock;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::{sysconf, Pid, SysconfVar};
use tracing::debug;

static PAGE_SIZE_KB: OnceLock<u64> = OnceLock::new();

fn page_size_kb() -> u64 {
    *PAGE_SIZE_KB.get_or_init(|| {
        sysconf(SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .and_then(|bytes| u64::try_from(bytes).ok())
            .map(|bytes| bytes / 1024)
            .unwrap_or(4)
    })
}

/// Group led by a sandboxed child (the child calls `setsid` before exec).
/// Dropping the handle SIGKILLs every process still in the group.
#[derive(Debug)]
pub struct ProcessGroup {
    pgid: Pid,
}

impl ProcessGroup {
    pub fn new(leader_pid: u32) -> Self {
        Self {
            pgid: Pid::from_raw(leader_pid as i32),
        }
    }

    pub fn id(&self) -> i32 {
        self.pgid.as_raw()
    }

    /// SIGKILL the whole group. A group that is already gone is not an error.
    pub fn kill(&self) {
        if let Err(errno) = killpg(self.pgid, Signal::SIGKILL) {
            if errno != nix::errno::Errno::ESRCH {
                debug!("killpg({}) failed: {}", self.pgid, errno);
            }
        }
    }

    /// Sum of resident memory of every live process in the group, in KB
    pub fn resident_kb(&self) -> Option<u64> {
        let entries = fs::read_dir("/proc").ok()?;
        let mut total_pages = 0u64;
        let mut found = false;

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            let Ok(stat) = fs::read_to_string(entry.path().join("stat")) else {
                continue;
            };
            if let Some((pgrp, rss_pages)) = parse_stat(&stat) {
                if pgrp == self.pgid.as_raw() {
                    total_pages += rss_pages;
                    found = true;
                }
            }
        }

        found.then(|| total_pages * page_size_kb())
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Extract (pgrp, rss pages) from /proc/<pid>/stat. The command name is
/// parenthesised and may contain spaces, so fields are counted after the last ')'.
fn parse_stat(stat: &str) -> Option<(i32, u64)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is field 3 (state); pgrp is field 5, rss is field 24
    let pgrp = fields.get(2)?.parse().ok()?;
    let rss = fields.get(21)?.parse().ok()?;
    Some((pgrp, rss))
}
