use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use libc::{c_int, pid_t};

use buffer::{RingBuffer, BUFFER_PAGES};
use error::{Error, Result};
use events::Event;
use fd::PerfFile;
use raw;

/// Every counter opened for one (thread, CPU) pair: the leader first, the
/// other events attached to it, the leader's ring buffer, and the kernel ids
/// that let the overflow path map read-group entries back to event names.
///
/// Descriptors are never reused across threads; dropping the group unmaps the
/// buffer exactly once and then closes every descriptor.
pub struct CounterGroup {
    tid: pid_t,
    cpu: u32,
    ids: Vec<(Event, u64)>,
    // SAFETY: the buffer must be declared before the files so the mapping is
    // released before its fd closes, now that rust specifies drop order
    buffer: RingBuffer,
    files: Vec<PerfFile>,
}

impl CounterGroup {
    /// Open one counter per configured event (leader first, created disabled;
    /// members created enabled on the leader), read the kernel ids back, and
    /// map the ring buffer. The group stays quiet until [`arm`] refreshes it.
    pub fn open(tid: pid_t, cpu: u32, threshold: u64) -> Result<Self> {
        let events = Event::all();
        let mut files: Vec<PerfFile> = Vec::with_capacity(events.len());

        for &event in &events {
            let leader_fd = files.first().map(|f| f.as_raw_fd());
            let file = PerfFile::open(event, tid, cpu as c_int, leader_fd, threshold)?;
            files.push(file);
        }

        let ids = files[0]
            .read_ids(events.len())
            .map_err(|inner| Error::Identify { inner })?;

        let buffer = RingBuffer::map(&files[0], BUFFER_PAGES)?;

        Ok(CounterGroup {
            tid,
            cpu,
            ids: events.into_iter().zip(ids).collect(),
            buffer,
            files,
        })
    }

    /// Wire overflow delivery to `signal` and let the group run: refresh buys
    /// the first overflow, reset clears whatever accumulated while opening.
    pub fn arm(&self, signal: c_int) -> Result<()> {
        self.leader().arm(signal)?;
        self.leader()
            .refresh_group()
            .map_err(|inner| Error::Ioctl { op: "refresh", inner })?;
        self.leader()
            .reset_group()
            .map_err(|inner| Error::Ioctl { op: "reset", inner })?;
        Ok(())
    }

    /// Revoke async delivery and stop the whole group.
    pub fn disarm(&self) -> Result<()> {
        self.leader().disarm()?;
        self.leader()
            .disable_group()
            .map_err(|inner| Error::Ioctl { op: "disable", inner })?;
        Ok(())
    }

    fn leader(&self) -> &PerfFile {
        &self.files[0]
    }

    pub fn leader_fd(&self) -> RawFd {
        self.leader().as_raw_fd()
    }

    /// True if `fd` belongs to any member of this group.
    pub fn owns_fd(&self, fd: RawFd) -> bool {
        self.files.iter().any(|f| f.as_raw_fd() == fd)
    }

    pub fn tid(&self) -> pid_t {
        self.tid
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    pub fn buffer_mut(&mut self) -> &mut RingBuffer {
        &mut self.buffer
    }

    /// Map a kernel id from a read-group entry back to its event.
    pub fn event_for_id(&self, id: u64) -> Option<Event> {
        lookup_event(&self.ids, id)
    }
}

pub(crate) fn lookup_event(ids: &[(Event, u64)], id: u64) -> Option<Event> {
    ids.iter()
        .find(|&&(_, known)| known == id)
        .map(|&(event, _)| event)
}

/// ioctl-disable whatever group `fd` leads, without resolving it first; the
/// overflow path quiets the source before it trusts anything else about it.
pub fn disable_by_fd(fd: RawFd) -> io::Result<()> {
    // NOTE(unsafe) a group ioctl on the fd the signal handed us
    if unsafe { raw::ioctls::DISABLE(fd, raw::PERF_IOC_FLAG_GROUP) } == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Re-arm a group by its leader fd after a sample: refresh, reset, and only
/// then re-enable, so a re-raised overflow can't interleave with the reset.
pub fn reset_by_fd(fd: RawFd) -> io::Result<()> {
    // NOTE(unsafe) group ioctls on a leader fd looked up from the signal
    unsafe {
        if raw::ioctls::REFRESH(fd, raw::PERF_IOC_FLAG_GROUP as c_int) == -1 {
            return Err(io::Error::last_os_error());
        }
        if raw::ioctls::RESET(fd, raw::PERF_IOC_FLAG_GROUP) == -1 {
            return Err(io::Error::last_os_error());
        }
        if raw::ioctls::ENABLE(fd, raw::PERF_IOC_FLAG_GROUP) == -1 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_lookup_hits_and_misses() {
        let ids = vec![
            (Event::UnhaltedCycles, 41),
            (Event::UnhaltedReferenceCycles, 42),
        ];
        assert_eq!(lookup_event(&ids, 41), Some(Event::UnhaltedCycles));
        assert_eq!(lookup_event(&ids, 42), Some(Event::UnhaltedReferenceCycles));
        assert_eq!(lookup_event(&ids, 7), None);
    }
}
