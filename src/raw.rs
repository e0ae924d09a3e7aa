//! Raw kernel ABI for the performance-monitoring interface.
//!
//! The bindings are the pregenerated ones from `perf-event-open-sys`, which
//! keep the bindgen shape (`__bindgen_anon_1.sample_period`, bitfield setter
//! methods, constified enums) that the rest of this crate relies on.
#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(unused)]

pub use perf_event_open_sys::bindings::*;
pub use perf_event_open_sys::{ioctls, perf_event_open};
