use libc::pid_t;
use unwind::{Accessors, AddressSpace, Byteorder, Cursor, PTraceState, PTraceStateRef, RegNum};

use error::{Error, Result};

/// Cap on frames collected from one sample. A corrupt or hand-rolled stack
/// can make the remote walk spin; past this depth the trace is cut off.
pub const MAX_FRAMES: usize = 256;

/// Per-thread remote-unwind state: the ptrace accessor state and the address
/// space it reads through. Created when the reconciler first sees a thread,
/// dropped when the thread is no longer observed.
pub struct UnwindContext {
    tid: pid_t,
    space: AddressSpace<PTraceStateRef>,
    state: PTraceState,
}

impl UnwindContext {
    pub fn new(tid: pid_t) -> Result<Self> {
        let state = PTraceState::new(tid as u32).map_err(|inner| Error::UnwindInit { tid, inner })?;
        let space = AddressSpace::new(Accessors::ptrace(), Byteorder::DEFAULT)
            .map_err(|inner| Error::UnwindInit { tid, inner })?;

        Ok(UnwindContext { tid, space, state })
    }

    pub fn tid(&self) -> pid_t {
        self.tid
    }

    /// Walk the stopped thread's stack, innermost frame first. The walk ends
    /// at `main`, at a frame with no resolvable name, at a null instruction
    /// pointer, or at [`MAX_FRAMES`]. The caller must have the thread
    /// ptrace-stopped for the duration.
    pub fn backtrace(&mut self) -> ::std::result::Result<Vec<String>, ::unwind::Error> {
        let mut cursor = Cursor::remote(&self.space, &self.state)?;
        let mut frames = Vec::new();

        while cursor.step()? {
            let ip = match cursor.register(RegNum::IP) {
                Ok(ip) => ip,
                Err(_) => break,
            };
            if ip == 0 {
                break;
            }

            // an unreadable address sometimes resolves to an empty name
            // rather than an error; both end the walk
            let name = match cursor.procedure_name() {
                Ok(name) => name.name().to_string(),
                Err(_) => break,
            };
            if name.is_empty() {
                break;
            }

            let done = name == "main";
            frames.push(name);

            if done || frames.len() == MAX_FRAMES {
                break;
            }
        }

        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_for_our_own_thread() {
        // _UPT-style state creation doesn't attach; it's safe on ourselves
        let tid = unsafe { ::libc::syscall(::libc::SYS_gettid) as pid_t };
        let ctx = UnwindContext::new(tid).unwrap();
        assert_eq!(ctx.tid(), tid);
    }
}
