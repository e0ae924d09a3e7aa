//! A per-process performance-sampling agent.
//!
//! The agent attaches hardware counter groups to every thread of a target
//! process on every CPU. Each counter overflow is delivered as a signal,
//! consumed synchronously on the main loop: the handler reads the sample
//! from the group's ring buffer, ptrace-stops the sampled thread, walks its
//! user-space stack remotely, and streams the encoded record to a co-located
//! collector over one unix socket per CPU.
//!
//! A periodic reconciler keeps the watched thread set in step with the
//! kernel's view of the target, opening and releasing counter groups and
//! unwind contexts as threads come and go.
#[macro_use]
extern crate bitflags;
extern crate bytes;
#[macro_use]
extern crate enum_primitive;
extern crate failure;
#[macro_use]
extern crate failure_derive;
extern crate libc;
#[macro_use]
extern crate log;
extern crate nix;
extern crate num;
extern crate page_size;
extern crate perf_event_open_sys;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate strum;
#[macro_use]
extern crate strum_macros;
extern crate unwind;

#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;

pub mod agent;
pub mod buffer;
pub mod config;
pub mod error;
pub mod events;
pub mod fd;
pub mod group;
pub mod interrupt;
pub mod procs;
pub mod raw;
pub mod socket;
pub mod threads;
pub mod unwinder;
pub mod wire;

pub use agent::run;
pub use config::AgentConfig;
pub use error::{Error, Result};
