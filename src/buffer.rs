use std::mem::{size_of, zeroed};
use std::os::unix::io::AsRawFd;
use std::slice;
use std::sync::atomic::{fence, Ordering};

use enum_primitive::FromPrimitive;
use libc;
use nix::errno::errno;
use page_size::get as page_size;

use error::{Error, Result};
use fd::PerfFile;
use raw::{perf_event_header, perf_event_mmap_page};

/// Data pages mapped behind each group leader. Must be a power of two; one
/// header page is mapped in front of them.
pub const BUFFER_PAGES: usize = 8;

/// The kernel-filled sample buffer mapped over a group leader. The kernel is
/// the only producer and the overflow path the only consumer, so the head and
/// tail need fences but no locking.
pub struct RingBuffer {
    base: *mut libc::c_void,
    len: usize,
    mask: u64,
    tail: u64,
    metadata: *mut perf_event_mmap_page,
}

impl RingBuffer {
    /// Map `pages` data pages plus the header page over `leader`.
    pub fn map(leader: &PerfFile, pages: usize) -> Result<Self> {
        assert!(pages != 0 && (pages & (pages - 1)) == 0);

        let len = (pages + 1) * page_size();

        // NOTE(unsafe) mapping a perf fd hands us kernel-managed memory; all
        // accesses below go through the metadata page's protocol
        let base = unsafe {
            libc::mmap(
                ::std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                leader.as_raw_fd(),
                0,
            )
        };

        if base == libc::MAP_FAILED {
            return Err(Error::from(BufferError::from_i32(errno()).unwrap_or(
                BufferError::InvalidArgs,
            )));
        }

        Ok(RingBuffer {
            base,
            len,
            mask: (pages * page_size()) as u64 - 1,
            tail: 0,
            metadata: base as *mut perf_event_mmap_page,
        })
    }

    /// This points to the head of the data section. The value continuously
    /// increases and must be wrapped with the page mask before use. After
    /// reading it, user space should issue an rmb().
    fn head(&self) -> u64 {
        let head = unsafe { (*self.metadata).data_head };
        fence(Ordering::Acquire);
        head
    }

    /// Publish our consumption offset so the kernel won't overwrite unread
    /// records.
    fn commit(&mut self) {
        fence(Ordering::Release);
        unsafe {
            (*self.metadata).data_tail = self.tail;
        }
    }

    fn available(&self) -> u64 {
        self.head().wrapping_sub(self.tail)
    }

    fn data(&self) -> &[u8] {
        // NOTE(unsafe) the data region starts one page past the mapping base
        // and is exactly mask + 1 bytes long
        unsafe {
            slice::from_raw_parts(
                (self.base as *const u8).offset(page_size() as isize),
                (self.mask + 1) as usize,
            )
        }
    }

    fn read_bytes(&mut self, dst: &mut [u8]) -> bool {
        if self.available() < dst.len() as u64 {
            return false;
        }

        copy_wrapped(self.data(), self.mask, self.tail, dst);
        self.tail += dst.len() as u64;
        self.commit();

        true
    }

    pub fn read_header(&mut self) -> Option<perf_event_header> {
        // NOTE(unsafe) the header is plain old data; we view it as bytes to
        // copy it out and never keep the byte view
        let mut header: perf_event_header = unsafe { zeroed() };
        let done = {
            let view = unsafe {
                slice::from_raw_parts_mut(
                    &mut header as *mut perf_event_header as *mut u8,
                    size_of::<perf_event_header>(),
                )
            };
            self.read_bytes(view)
        };

        if done {
            Some(header)
        } else {
            None
        }
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        let mut value: u64 = 0;
        let done = {
            let view = unsafe {
                slice::from_raw_parts_mut(&mut value as *mut u64 as *mut u8, size_of::<u64>())
            };
            self.read_bytes(view)
        };

        if done {
            Some(value)
        } else {
            None
        }
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        let mut value: u32 = 0;
        let done = {
            let view = unsafe {
                slice::from_raw_parts_mut(&mut value as *mut u32 as *mut u8, size_of::<u32>())
            };
            self.read_bytes(view)
        };

        if done {
            Some(value)
        } else {
            None
        }
    }

    /// Discard `n` bytes, e.g. the body of a record type we don't consume.
    pub fn skip(&mut self, n: usize) {
        let n = (n as u64).min(self.available());
        self.tail += n;
        self.commit();
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        // the single munmap for this mapping; the leader fd closes after us
        unsafe {
            libc::munmap(self.base, self.len);
        }
    }
}

/// Copy `dst.len()` bytes starting at logical offset `tail` out of a
/// power-of-two ring, splitting the copy when it crosses the end.
pub(crate) fn copy_wrapped(data: &[u8], mask: u64, tail: u64, dst: &mut [u8]) {
    let start = (tail & mask) as usize;
    let first = dst.len().min(data.len() - start);

    dst[..first].copy_from_slice(&data[start..start + first]);

    if first < dst.len() {
        let rest = dst.len() - first;
        dst[first..].copy_from_slice(&data[..rest]);
    }
}

enum_from_primitive! {
#[repr(i32)]
#[derive(Debug, Fail)]
pub enum BufferError {
    #[fail(display = "the descriptor cannot be mapped with these protections (EACCES)")]
    Access = libc::EACCES,
    #[fail(display = "the leader fd is not valid (EBADF)")]
    FdBad = libc::EBADF,
    #[fail(display = "the kernel disliked the length or offset of the mapping (EINVAL)")]
    InvalidArgs = libc::EINVAL,
    #[fail(display = "the descriptor does not support memory mapping (ENODEV)")]
    NoMapSupport = libc::ENODEV,
    #[fail(display = "no memory, or the mapping limit was exceeded (ENOMEM)")]
    NoMemory = libc::ENOMEM,
    #[fail(display = "too much memory is locked, see perf_event_mlock_kb (EAGAIN)")]
    TooMuchLocking = libc::EAGAIN,
    #[fail(display = "the system-wide open file limit has been reached (ENFILE)")]
    TooManyOpenFiles = libc::ENFILE,
    #[fail(display = "the mapping was refused by a file seal or permissions (EPERM)")]
    MapRefused = libc::EPERM,
}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_without_wrap() {
        let data: Vec<u8> = (0..16).collect();
        let mut dst = [0u8; 4];
        copy_wrapped(&data, 15, 3, &mut dst);
        assert_eq!(dst, [3, 4, 5, 6]);
    }

    #[test]
    fn copy_across_the_end() {
        let data: Vec<u8> = (0..16).collect();
        let mut dst = [0u8; 6];
        copy_wrapped(&data, 15, 13, &mut dst);
        assert_eq!(dst, [13, 14, 15, 0, 1, 2]);
    }

    #[test]
    fn copy_with_unwrapped_tail() {
        // tails keep growing past the ring size; only the masked offset counts
        let data: Vec<u8> = (0..16).collect();
        let mut dst = [0u8; 2];
        copy_wrapped(&data, 15, 16 * 3 + 9, &mut dst);
        assert_eq!(dst, [9, 10]);
    }

    #[test]
    fn buffer_errors_map_from_errno() {
        match BufferError::from_i32(libc::ENOMEM) {
            Some(BufferError::NoMemory) => (),
            other => panic!("unexpected mapping: {:?}", other),
        }
    }
}
