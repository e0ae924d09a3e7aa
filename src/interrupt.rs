use std::io;
use std::mem;
use std::mem::size_of;
use std::os::unix::io::RawFd;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use libc::{self, c_int, pid_t};
use nix;
use nix::sys::ptrace;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

use error::{Error, Result};
use group::{self, CounterGroup};
use raw::{perf_event_header, PERF_RECORD_SAMPLE};
use socket::SocketFabric;
use threads::ThreadTable;
use wire::Payload;

/// The signal counter overflows are routed to via F_SETSIG.
pub const OVERFLOW_SIGNAL: c_int = libc::SIGIO;

/// si_code for "the polled source hung up", which is what a one-shot refresh
/// turns every counter overflow into.
// #define POLL_HUP 6 (asm-generic/siginfo.h)
const POLL_HUP: c_int = 6;

/// The blocked overflow-signal set, as handed to sigtimedwait.
pub struct OverflowSet(libc::sigset_t);

/// Block the overflow signal process-wide, before the first counter is
/// armed. From here on it is only ever consumed synchronously by [`wait`] on
/// the main loop, so the thread table can never be observed mid-mutation.
/// If we inherited the signal unblocked, this is what fixes it.
pub fn install() -> Result<OverflowSet> {
    // NOTE(unsafe) plain signal-mask plumbing on our own process
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, OVERFLOW_SIGNAL);

        if libc::sigprocmask(libc::SIG_BLOCK, &set, ::std::ptr::null_mut()) == -1 {
            return Err(Error::SignalMask {
                inner: io::Error::last_os_error(),
            });
        }

        Ok(OverflowSet(set))
    }
}

/// One pending overflow: the descriptor that crossed its period and the
/// kernel's si_code for the delivery.
#[derive(Clone, Copy, Debug)]
pub struct Overflow {
    pub fd: RawFd,
    pub code: c_int,
}

/// Wait up to `timeout` for a pending overflow signal. `None` means the
/// timeout lapsed (or we were interrupted) and it's the reconciler's turn.
pub fn wait(set: &OverflowSet, timeout: Duration) -> Option<Overflow> {
    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };

    // NOTE(unsafe) sigtimedwait only writes the siginfo out-param
    let mut info: libc::siginfo_t = unsafe { mem::zeroed() };
    let signo = unsafe { libc::sigtimedwait(&set.0, &mut info, &ts) };

    if signo == -1 {
        return None;
    }

    Some(Overflow {
        fd: si_fd(&info),
        code: info.si_code,
    })
}

// glibc lays the poll-source members out right after the three standard
// ints; the libc crate does not expose them, same as F_SETSIG over in `fd`.
#[repr(C)]
struct PollSigInfo {
    si_signo: c_int,
    si_errno: c_int,
    si_code: c_int,
    si_band: libc::c_long,
    si_fd: c_int,
}

fn si_fd(info: &libc::siginfo_t) -> RawFd {
    // NOTE(unsafe) reading the poll arm of the siginfo union through a
    // repr(C) view with matching layout
    unsafe { (*(info as *const libc::siginfo_t as *const PollSigInfo)).si_fd }
}

/// Wall-clock nanoseconds, taken before anything else so the record carries
/// the moment of the overflow as closely as possible.
pub fn now_ns() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() * 1_000_000_000 + d.subsec_nanos() as u64,
        Err(_) => 0,
    }
}

/// Failures that cost us one sample. The group is re-armed and the agent
/// moves on; only a failed re-arm is fatal, because it silences the group
/// for good.
#[derive(Debug, Fail)]
pub enum SampleError {
    #[fail(display = "signal was not raised by the kernel (si_code {})", code)]
    NotKernel { code: c_int },
    #[fail(display = "signal was not a counter-overflow hangup (si_code {})", code)]
    NotOverflow { code: c_int },
    #[fail(display = "no counter group owns fd {}", fd)]
    UnknownFd { fd: RawFd },
    #[fail(display = "the ring buffer held a partial record")]
    Truncated,
    #[fail(display = "unexpected record type {} in the ring buffer", type_)]
    NotASample { type_: u32 },
    #[fail(display = "could not attach to thread {}: {}", tid, inner)]
    Attach { tid: pid_t, inner: nix::Error },
    #[fail(display = "no unwind context registered for thread {}", tid)]
    NoContext { tid: pid_t },
    #[fail(display = "remote unwind of thread {} failed: {}", tid, inner)]
    Unwind { tid: pid_t, inner: ::unwind::Error },
    #[fail(display = "no frames could be collected")]
    EmptyStack,
}

/// Process one overflow end to end: disable the source, read the sample,
/// unwind the sampled thread, ship the record, re-arm the source.
pub fn handle(overflow: Overflow, table: &mut ThreadTable, fabric: &mut SocketFabric) -> Result<()> {
    let timestamp = now_ns();

    if let Err(e) = group::disable_by_fd(overflow.fd) {
        // the owning thread was reaped after the signal queued and the fd is
        // gone; there is nothing to read and nothing to re-arm
        debug!("dropping overflow for stale fd {}: {}", overflow.fd, e);
        return Ok(());
    }

    match collect(&overflow, timestamp, table) {
        Ok(payload) => {
            let cpu = payload.core as usize;
            fabric.send(cpu, &payload.frame());
        }
        Err(SampleError::UnknownFd { fd }) => {
            // quieted a group we no longer track; don't re-arm what's gone
            debug!("dropping sample: no counter group owns fd {}", fd);
            return Ok(());
        }
        Err(e) => debug!("dropping sample: {}", e),
    }

    // re-enabling happens inside and happens last, so an overflow re-raised
    // mid-reset still finds the group consistent
    group::reset_by_fd(overflow.fd).map_err(|inner| Error::GroupReset { inner })
}

fn collect(
    overflow: &Overflow,
    timestamp: u64,
    table: &mut ThreadTable,
) -> ::std::result::Result<Payload, SampleError> {
    if overflow.code < 0 {
        return Err(SampleError::NotKernel { code: overflow.code });
    }
    if overflow.code != POLL_HUP {
        return Err(SampleError::NotOverflow { code: overflow.code });
    }

    let at = table
        .fd_to_group(overflow.fd)
        .ok_or(SampleError::UnknownFd { fd: overflow.fd })?;

    let (pid, tid, cpu, counters) = read_sample(table.group_mut(at))?;
    let target = Pid::from_raw(tid as pid_t);

    // stop the thread while we walk its stack; if it died since the sample
    // was written, losing this one sample is fine
    ptrace::attach(target).map_err(|inner| SampleError::Attach {
        tid: tid as pid_t,
        inner,
    })?;
    if let Err(inner) = waitpid(target, None) {
        let _ = ptrace::detach(target);
        return Err(SampleError::Attach {
            tid: tid as pid_t,
            inner,
        });
    }

    let walked = match table.by_tid_mut(tid as pid_t) {
        Some(watch) => watch.unwind.backtrace(),
        None => {
            let _ = ptrace::detach(target);
            return Err(SampleError::NoContext { tid: tid as pid_t });
        }
    };

    let _ = ptrace::detach(target);

    let traces = walked.map_err(|inner| SampleError::Unwind {
        tid: tid as pid_t,
        inner,
    })?;
    if traces.is_empty() {
        return Err(SampleError::EmptyStack);
    }

    Ok(Payload {
        core: cpu,
        pid,
        tid,
        timestamp,
        counters,
        traces,
    })
}

/// Consume one record from the group's ring buffer. The field order is fixed
/// by the sample mask the leader was opened with: ip, pid/tid, cpu plus a
/// reserved word, period, then the read-group.
fn read_sample(
    group: &mut CounterGroup,
) -> ::std::result::Result<(u32, u32, u32, Vec<(String, u64)>), SampleError> {
    let header = group
        .buffer_mut()
        .read_header()
        .ok_or(SampleError::Truncated)?;

    if header.type_ != PERF_RECORD_SAMPLE {
        let body = (header.size as usize).saturating_sub(size_of::<perf_event_header>());
        group.buffer_mut().skip(body);
        return Err(SampleError::NotASample { type_: header.type_ });
    }

    let _ip = group.buffer_mut().read_u64().ok_or(SampleError::Truncated)?;
    let pid = group.buffer_mut().read_u32().ok_or(SampleError::Truncated)?;
    let tid = group.buffer_mut().read_u32().ok_or(SampleError::Truncated)?;
    let cpu = group.buffer_mut().read_u32().ok_or(SampleError::Truncated)?;
    let _reserved = group.buffer_mut().read_u32().ok_or(SampleError::Truncated)?;
    let _period = group.buffer_mut().read_u64().ok_or(SampleError::Truncated)?;

    let nr = group.buffer_mut().read_u64().ok_or(SampleError::Truncated)?;
    let mut entries = Vec::new();
    for _ in 0..nr {
        let value = group.buffer_mut().read_u64().ok_or(SampleError::Truncated)?;
        let id = group.buffer_mut().read_u64().ok_or(SampleError::Truncated)?;
        entries.push((value, id));
    }

    let counters = entries
        .into_iter()
        .map(|(value, id)| {
            let name = match group.event_for_id(id) {
                Some(event) => event.name(),
                None => "unknown",
            };
            (name.to_string(), value)
        })
        .collect();

    Ok((pid, tid, cpu, counters))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_look_like_the_present() {
        // seconds-since-epoch expressed in nanoseconds, not zero and not tiny
        assert!(now_ns() > 1_000_000_000 * 1_000_000_000);
    }

    #[test]
    fn poll_siginfo_overlay_field_offsets() {
        // the union arm starts after the three header ints, padded to the
        // natural alignment of si_band
        let band = offset_of_band();
        assert_eq!(band % mem::align_of::<libc::c_long>(), 0);
        assert!(band >= 3 * size_of::<c_int>());
        assert!(size_of::<PollSigInfo>() <= size_of::<libc::siginfo_t>());
    }

    fn offset_of_band() -> usize {
        let probe: PollSigInfo = unsafe { mem::zeroed() };
        &probe.si_band as *const _ as usize - &probe as *const _ as usize
    }
}
