use std::io;

use libc::pid_t;

use buffer::BufferError;
use fd::OpenError;

pub type Result<T> = ::std::result::Result<T, Error>;

/// Fatal errors. Anything the agent can survive is handled closer to where it
/// happens (a dropped sample, a degraded socket); one of these reaching the
/// main loop means the agent logs it and exits non-zero.
#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "failed to open a counter file descriptor: {}", inner)]
    FdOpen { inner: OpenError },
    #[fail(display = "failed to read kernel ids back from a group leader: {}", inner)]
    Identify { inner: io::Error },
    #[fail(display = "failed to map a counter ring buffer: {}", inner)]
    Mmap { inner: BufferError },
    #[fail(display = "failed to wire overflow delivery on a group leader: {}", inner)]
    Arm { inner: io::Error },
    #[fail(display = "group {} ioctl failed: {}", op, inner)]
    Ioctl { op: &'static str, inner: io::Error },
    #[fail(display = "failed to re-arm a group after a sample, its overflows are lost: {}", inner)]
    GroupReset { inner: io::Error },
    #[fail(display = "socket {} could not be set up: {}", path, inner)]
    Socket { path: String, inner: io::Error },
    #[fail(display = "handshake with the collector failed: {}", inner)]
    Handshake { inner: io::Error },
    #[fail(display = "cannot enumerate tasks of live pid {}: {}", pid, inner)]
    TaskDir { pid: pid_t, inner: io::Error },
    #[fail(display = "failed to block the overflow signal: {}", inner)]
    SignalMask { inner: io::Error },
    #[fail(display = "cannot create an unwind context for thread {}: {}", tid, inner)]
    UnwindInit { tid: pid_t, inner: ::unwind::Error },
    #[fail(display = "usage: agent <threshold> <label> <command> ({})", reason)]
    Usage { reason: String },
}

impl From<OpenError> for Error {
    fn from(inner: OpenError) -> Self {
        Error::FdOpen { inner }
    }
}

impl From<BufferError> for Error {
    fn from(inner: BufferError) -> Self {
        Error::Mmap { inner }
    }
}
