use std::fs;
use std::os::unix::io::RawFd;
use std::thread::sleep;
use std::time::Duration;

use libc::pid_t;

use config::AgentConfig;
use error::{Error, Result};
use group::CounterGroup;
use interrupt;
use procs;
use socket::SocketFabric;
use unwinder::UnwindContext;
use wire::Payload;

/// Everything the agent holds for one live thread: one armed counter group
/// per CPU and the remote-unwind context. Acquisition opens it all; dropping
/// the watch releases it all.
pub struct ThreadWatch {
    pub tid: pid_t,
    pub groups: Vec<CounterGroup>,
    pub unwind: UnwindContext,
}

/// The registry of watched threads. The overflow path only reads it, and the
/// overflow signal is consumed synchronously between reconciler cycles, so
/// these lookups can never observe a half-applied mutation.
pub struct ThreadTable {
    watches: Vec<ThreadWatch>,
}

impl ThreadTable {
    fn new() -> Self {
        ThreadTable {
            watches: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.watches.len()
    }

    /// Resolve a triggering fd to (watch index, cpu index).
    pub fn fd_to_group(&self, fd: RawFd) -> Option<(usize, usize)> {
        for (wi, watch) in self.watches.iter().enumerate() {
            for (ci, group) in watch.groups.iter().enumerate() {
                if group.owns_fd(fd) {
                    return Some((wi, ci));
                }
            }
        }
        None
    }

    pub fn group_mut(&mut self, at: (usize, usize)) -> &mut CounterGroup {
        &mut self.watches[at.0].groups[at.1]
    }

    pub fn by_tid_mut(&mut self, tid: pid_t) -> Option<&mut ThreadWatch> {
        self.watches.iter_mut().find(|w| w.tid == tid)
    }
}

/// Periodic diff of the target's live thread set against what we watch,
/// driving counter-group and unwind-context lifecycles.
pub struct Reconciler {
    threshold: u64,
    command: String,
    cores: usize,
    interval: Duration,
    retries: u32,
    previous: Vec<pid_t>,
    table: ThreadTable,
}

impl Reconciler {
    pub fn new(config: &AgentConfig) -> Self {
        Reconciler {
            threshold: config.threshold,
            command: config.command.clone(),
            cores: config.cores,
            interval: config.interval(),
            retries: config.retries,
            previous: Vec::new(),
            table: ThreadTable::new(),
        }
    }

    pub fn table_mut(&mut self) -> &mut ThreadTable {
        &mut self.table
    }

    /// One reconciliation cycle. Returns `false` once two consecutive cycles
    /// observed no live threads, which is the agent's termination signal.
    pub fn cycle(&mut self, fabric: &mut SocketFabric) -> Result<bool> {
        let pids = self.wait_for_pids();

        let mut now: Vec<pid_t> = Vec::new();
        for &pid in &pids {
            now.extend(tasks_of(pid)?);
        }
        now.sort();

        let was_empty = self.previous.is_empty();
        let diff = diff_sorted(&self.previous, &now);

        for &tid in &diff.entered {
            self.watch(tid)?;
        }
        for &tid in &diff.exited {
            self.unwatch(tid, fabric);
        }

        self.previous = now;
        Ok(!(self.previous.is_empty() && was_empty))
    }

    /// Candidate PIDs for the target, retrying while the process table has
    /// none (the target may still be starting up).
    fn wait_for_pids(&self) -> Vec<pid_t> {
        let mut retry = 0;
        loop {
            let pids = procs::pids_for_command(&self.command);
            if !pids.is_empty() || retry + 1 >= self.retries {
                return pids;
            }
            retry += 1;
            debug!(
                "no pids match {:?} yet, retry {}/{}",
                self.command, retry, self.retries
            );
            sleep(self.interval);
        }
    }

    fn watch(&mut self, tid: pid_t) -> Result<()> {
        info!("watching new thread {}", tid);

        let mut groups = Vec::with_capacity(self.cores);
        for cpu in 0..self.cores {
            let group = CounterGroup::open(tid, cpu as u32, self.threshold)?;
            group.arm(interrupt::OVERFLOW_SIGNAL)?;
            groups.push(group);
        }

        let unwind = UnwindContext::new(tid)?;

        self.table.watches.push(ThreadWatch { tid, groups, unwind });
        Ok(())
    }

    /// Announce the exit on the CPU-0 stream, then release the thread's
    /// counters and unwind context before the cycle returns.
    fn unwatch(&mut self, tid: pid_t, fabric: &mut SocketFabric) {
        info!("thread {} exited", tid);
        fabric.send_exit(&Payload::exit(tid as u32).frame());

        if let Some(at) = self.table.watches.iter().position(|w| w.tid == tid) {
            self.table.watches.remove(at);
        }
    }
}

/// The live thread ids under `/proc/<pid>/task`. Non-numeric entries are
/// skipped; an unreadable directory for a pid we were just told is live is
/// fatal.
pub fn tasks_of(pid: pid_t) -> Result<Vec<pid_t>> {
    let dir = format!("/proc/{}/task", pid);
    let entries = fs::read_dir(&dir).map_err(|inner| Error::TaskDir { pid, inner })?;

    let mut tids = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|inner| Error::TaskDir { pid, inner })?;
        if let Some(tid) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
            tids.push(tid);
        }
    }

    Ok(tids)
}

pub struct Diff {
    pub entered: Vec<pid_t>,
    pub exited: Vec<pid_t>,
}

/// Single merge pass over two sorted id sequences; both result sets are owned
/// and outlive the cycle that computed them.
pub fn diff_sorted(previous: &[pid_t], now: &[pid_t]) -> Diff {
    let mut entered = Vec::new();
    let mut exited = Vec::new();
    let (mut i, mut j) = (0, 0);

    while i < previous.len() && j < now.len() {
        if previous[i] == now[j] {
            i += 1;
            j += 1;
        } else if previous[i] < now[j] {
            exited.push(previous[i]);
            i += 1;
        } else {
            entered.push(now[j]);
            j += 1;
        }
    }

    exited.extend_from_slice(&previous[i..]);
    entered.extend_from_slice(&now[j..]);

    Diff { entered, exited }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_of_disjoint_sets() {
        let d = diff_sorted(&[1, 2, 3], &[4, 5]);
        assert_eq!(d.exited, vec![1, 2, 3]);
        assert_eq!(d.entered, vec![4, 5]);
    }

    #[test]
    fn diff_of_overlapping_sets() {
        let d = diff_sorted(&[10, 20, 30, 40], &[20, 25, 40, 50]);
        assert_eq!(d.exited, vec![10, 30]);
        assert_eq!(d.entered, vec![25, 50]);
    }

    #[test]
    fn diff_of_identical_sets_is_empty() {
        let d = diff_sorted(&[7, 8], &[7, 8]);
        assert!(d.entered.is_empty());
        assert!(d.exited.is_empty());
    }

    #[test]
    fn diff_from_nothing() {
        let d = diff_sorted(&[], &[1]);
        assert_eq!(d.entered, vec![1]);
        assert!(d.exited.is_empty());
    }

    #[test]
    fn own_process_has_tasks() {
        let pid = ::std::process::id() as pid_t;
        let tids = tasks_of(pid).unwrap();
        assert!(tids.contains(&pid));
    }

    #[test]
    fn dead_pid_is_fatal() {
        // pid 0 has no /proc entry from our point of view
        assert!(tasks_of(0).is_err());
    }
}
