use std::fs::File;
use std::io;
use std::io::Read;
use std::mem::size_of;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::slice;

use libc::{self, c_int, pid_t};
use nix::errno::Errno;

use error::{Error, Result};
use events::{Event, GroupRole};
use raw;

/// One open counter file descriptor, bound to a single (thread, CPU) pair.
/// The first descriptor opened for a pair is the group leader; the others are
/// attached to it and live or die with it.
#[derive(Debug)]
pub struct PerfFile(pub(crate) File);

impl PerfFile {
    /// `perf_event_open` for `event` on `(tid, cpu)`. `group` is the leader's
    /// descriptor for member events, `None` for the leader itself.
    pub fn open(
        event: Event,
        tid: pid_t,
        cpu: c_int,
        group: Option<RawFd>,
        threshold: u64,
    ) -> Result<Self> {
        let role = match group {
            None => GroupRole::Leader,
            Some(_) => GroupRole::Member,
        };
        let mut attr = event.as_raw(role, threshold);

        // NOTE(unsafe) the attr is fully initialized; the kernel validates it
        // and writes back the size it expected on mismatch
        let fd = unsafe { raw::perf_event_open(&mut attr, tid, cpu, group.unwrap_or(-1), 0) };

        if fd == -1 {
            let e = OpenError::from(Errno::last());
            debug!("unable to open {} for tid {} on cpu {}: {}", event, tid, cpu, e);
            Err(Error::from(e))
        } else {
            // NOTE(unsafe) if the kernel doesn't give -1, guarantees the fd is valid
            Ok(PerfFile(unsafe { File::from_raw_fd(fd) }))
        }
    }

    pub fn disable_group(&self) -> io::Result<()> {
        // NOTE(unsafe) these ioctls are safe on a perf_event_open fd
        self.checked(unsafe { raw::ioctls::DISABLE(self.as_raw_fd(), raw::PERF_IOC_FLAG_GROUP) })
    }

    /// REFRESH's argument is an overflow count, not a flag word; the group
    /// flag constant happens to equal 1, so each refresh buys exactly one
    /// overflow before the kernel disables the group and raises POLL_HUP.
    pub fn refresh_group(&self) -> io::Result<()> {
        self.checked(unsafe {
            raw::ioctls::REFRESH(self.as_raw_fd(), raw::PERF_IOC_FLAG_GROUP as c_int)
        })
    }

    pub fn reset_group(&self) -> io::Result<()> {
        self.checked(unsafe { raw::ioctls::RESET(self.as_raw_fd(), raw::PERF_IOC_FLAG_GROUP) })
    }

    fn checked(&self, ret: c_int) -> io::Result<()> {
        if ret == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// One read of a group leader opened with read format GROUP|ID recovers
    /// the kernel-assigned id of every member: `{nr, {value, id} * nr}`.
    pub fn read_ids(&mut self, members: usize) -> io::Result<Vec<u64>> {
        let mut values = vec![0u64; 1 + 2 * members];

        {
            // NOTE(unsafe): we're just viewing the stack buffer as bytes for
            // the read, nothing outlives this block
            let as_bytes = unsafe {
                slice::from_raw_parts_mut(
                    values.as_mut_ptr() as *mut u8,
                    values.len() * size_of::<u64>(),
                )
            };
            self.0.read_exact(as_bytes)?;
        }

        if values[0] != members as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("leader reported {} members, expected {}", values[0], members),
            ));
        }

        Ok((0..members).map(|j| values[2 * j + 2]).collect())
    }

    /// Route overflow notifications for this descriptor to `signal`,
    /// delivered to the agent's main thread.
    pub fn arm(&self, signal: c_int) -> Result<()> {
        let fd = self.as_raw_fd();

        // The F_SETOWN_EX option to fcntl(2) is needed to properly route
        // overflow signals once more than one thread exists in the receiver.
        #[repr(C)]
        struct FOwnerEx(c_int, pid_t);

        let owner = FOwnerEx(F_OWNER_TID, unsafe { libc::syscall(libc::SYS_gettid) as pid_t });

        // NOTE(unsafe) plain fcntls on a descriptor we own
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL, 0);
            if flags == -1 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_ASYNC) == -1 {
                return Err(self.arm_error());
            }
            if libc::fcntl(fd, F_SETSIG, signal) == -1 {
                return Err(self.arm_error());
            }
            if libc::fcntl(fd, F_SETOWN_EX, &owner) == -1 {
                return Err(self.arm_error());
            }
        }

        Ok(())
    }

    /// Revoke async delivery; the descriptor keeps counting until disabled.
    pub fn disarm(&self) -> Result<()> {
        let fd = self.as_raw_fd();

        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL, 0);
            if flags == -1 || libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_ASYNC) == -1 {
                return Err(self.arm_error());
            }
        }

        Ok(())
    }

    fn arm_error(&self) -> Error {
        Error::Arm {
            inner: io::Error::last_os_error(),
        }
    }
}

impl AsRawFd for PerfFile {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl Read for PerfFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

/// Why `perf_event_open(2)` refused us, keyed on errno. The long tail of
/// kernel-side reasons collapses into these; the display strings carry the
/// condensed man-page meaning so fatal logs are self-explanatory.
#[derive(Debug, Fail)]
pub enum OpenError {
    #[fail(display = "the perf_event_attr size was not one the kernel accepts (E2BIG)")]
    AttrWrongSize,
    #[fail(display = "the event needs CAP_SYS_ADMIN or a friendlier perf_event_paranoid (EACCES)")]
    CapSysAdminRequired,
    #[fail(display = "the group leader descriptor is not valid (EBADF)")]
    InvalidFdOrPid,
    #[fail(display = "another event holds exclusive access to the PMU (EBUSY)")]
    PmuBusy,
    #[fail(display = "the attr pointer points at invalid memory (EFAULT)")]
    AttrInvalidPointer,
    #[fail(display = "the kernel rejected the event configuration (EINVAL)")]
    InvalidEvent,
    #[fail(display = "the per-process file descriptor limit is exhausted (EMFILE)")]
    TooManyOpenFiles,
    #[fail(display = "the requested event needs a CPU feature this machine lacks (ENODEV)")]
    CpuFeatureUnsupported,
    #[fail(display = "the event type is not supported (ENOENT)")]
    InvalidEventType,
    #[fail(display = "no room left for the event (ENOSPC)")]
    NoRoomForEvent,
    #[fail(display = "hardware support for the request is missing (EOPNOTSUPP)")]
    HardwareFeatureUnsupported,
    #[fail(display = "the exclude settings or required privileges were refused (EPERM)")]
    ExcludeOrPrivilegeRefused,
    #[fail(display = "the target thread does not exist (ESRCH)")]
    ProcessDoesNotExist,
    #[fail(display = "the kernel returned an unexpected error code: {}", errno)]
    Unknown { errno: Errno },
}

impl From<Errno> for OpenError {
    fn from(errno: Errno) -> OpenError {
        match errno {
            Errno::E2BIG => OpenError::AttrWrongSize,
            Errno::EACCES => OpenError::CapSysAdminRequired,
            Errno::EBADF => OpenError::InvalidFdOrPid,
            Errno::EBUSY => OpenError::PmuBusy,
            Errno::EFAULT => OpenError::AttrInvalidPointer,
            Errno::EINVAL => OpenError::InvalidEvent,
            Errno::EMFILE => OpenError::TooManyOpenFiles,
            Errno::ENODEV => OpenError::CpuFeatureUnsupported,
            Errno::ENOENT => OpenError::InvalidEventType,
            Errno::ENOSPC => OpenError::NoRoomForEvent,
            Errno::EOPNOTSUPP => OpenError::HardwareFeatureUnsupported,
            Errno::EPERM => OpenError::ExcludeOrPrivilegeRefused,
            Errno::ESRCH => OpenError::ProcessDoesNotExist,
            _ => OpenError::Unknown { errno },
        }
    }
}

// https://github.com/torvalds/linux/blob/master/include/uapi/asm-generic/fcntl.h
// #define F_SETSIG 10
pub(crate) const F_SETSIG: c_int = 10;
// #define F_OWNER_TID 0
const F_OWNER_TID: c_int = 0;
// #define F_SETOWN_EX 15
const F_SETOWN_EX: c_int = 15;
