use std::mem::{size_of, zeroed};

use strum::IntoEnumIterator;

use raw::{
    perf_event_attr, perf_event_attr__bindgen_ty_1, perf_event_attr__bindgen_ty_2,
    PERF_COUNT_HW_CPU_CYCLES, PERF_COUNT_HW_REF_CPU_CYCLES, PERF_FORMAT_GROUP, PERF_FORMAT_ID,
    PERF_SAMPLE_CPU, PERF_SAMPLE_IP, PERF_SAMPLE_PERIOD, PERF_SAMPLE_READ, PERF_SAMPLE_TID,
    PERF_TYPE_HARDWARE,
};

/// The events opened in every counter group, in group order. The first entry
/// is the group leader and carries the sampling configuration; the rest are
/// attached to it and scheduled with it.
///
/// Selection is compile-time: the agent always ships this exact pair.
#[repr(u64)]
#[derive(Clone, Copy, Debug, Display, EnumIter, Eq, PartialEq, PartialOrd, Ord, Serialize)]
pub enum Event {
    /// Core clock cycles whenever the core is not halted.
    #[serde(rename = "unhalted_cycles")]
    #[strum(to_string = "unhalted_cycles")]
    UnhaltedCycles = PERF_COUNT_HW_CPU_CYCLES as u64,

    /// Reference clock cycles while not halted; not affected by frequency
    /// scaling. (since Linux 3.3)
    #[serde(rename = "unhalted_reference_cycles")]
    #[strum(to_string = "unhalted_reference_cycles")]
    UnhaltedReferenceCycles = PERF_COUNT_HW_REF_CPU_CYCLES as u64,
}

/// Whether an attr is built for the distinguished first member of a group.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GroupRole {
    Leader,
    Member,
}

bitflags! {
    /// What the kernel writes into the ring buffer for each overflow, which
    /// also fixes the order the handler must consume the fields in.
    pub struct SampleFormat: u64 {
        const IP = PERF_SAMPLE_IP as u64;
        const TID = PERF_SAMPLE_TID as u64;
        const CPU = PERF_SAMPLE_CPU as u64;
        const PERIOD = PERF_SAMPLE_PERIOD as u64;
        const READ = PERF_SAMPLE_READ as u64;
    }
}

impl Event {
    /// The configured event sequence, leader first.
    pub fn all() -> Vec<Event> {
        Event::iter().collect()
    }

    /// The name this event is keyed by on the wire.
    pub fn name(&self) -> &'static str {
        match *self {
            Event::UnhaltedCycles => "unhalted_cycles",
            Event::UnhaltedReferenceCycles => "unhalted_reference_cycles",
        }
    }

    fn apply(&self, attr: &mut perf_event_attr) {
        attr.type_ = PERF_TYPE_HARDWARE;
        attr.config = *self as u64;
    }

    pub(crate) fn as_raw(&self, role: GroupRole, threshold: u64) -> perf_event_attr {
        // NOTE(unsafe) a zeroed struct is what the example c code uses,
        // zero fields are interpreted as "off" aside from the required ones
        let mut attr: perf_event_attr = unsafe { zeroed() };

        attr.size = size_of::<perf_event_attr>() as u32;
        self.apply(&mut attr);

        // user-space samples only
        attr.set_exclude_kernel(1);
        attr.set_exclude_hv(1);

        if let GroupRole::Leader = role {
            // created disabled; arming refreshes the group into life
            attr.set_disabled(1);
            attr.sample_type = SampleFormat::all().bits();
            attr.read_format = (PERF_FORMAT_GROUP | PERF_FORMAT_ID) as u64;
            attr.__bindgen_anon_1 = perf_event_attr__bindgen_ty_1 {
                sample_period: threshold,
            };
            attr.__bindgen_anon_2 = perf_event_attr__bindgen_ty_2 { wakeup_events: 1 };
        }

        attr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leader_comes_first() {
        assert_eq!(
            Event::all(),
            vec![Event::UnhaltedCycles, Event::UnhaltedReferenceCycles]
        );
    }

    #[test]
    fn leader_attr_samples() {
        let attr = Event::UnhaltedCycles.as_raw(GroupRole::Leader, 1_000_000);
        assert_eq!(attr.type_, PERF_TYPE_HARDWARE);
        assert_eq!(attr.config, PERF_COUNT_HW_CPU_CYCLES as u64);
        assert_eq!(attr.sample_type, SampleFormat::all().bits());
        assert_eq!(attr.read_format, (PERF_FORMAT_GROUP | PERF_FORMAT_ID) as u64);
        assert_eq!(unsafe { attr.__bindgen_anon_1.sample_period }, 1_000_000);
        assert_eq!(unsafe { attr.__bindgen_anon_2.wakeup_events }, 1);
        assert_eq!(attr.disabled(), 1);
        assert_eq!(attr.exclude_kernel(), 1);
    }

    #[test]
    fn member_attr_counts_quietly() {
        let attr = Event::UnhaltedReferenceCycles.as_raw(GroupRole::Member, 1_000_000);
        assert_eq!(attr.config, PERF_COUNT_HW_REF_CPU_CYCLES as u64);
        assert_eq!(attr.disabled(), 0);
        assert_eq!(attr.sample_type, 0);
        assert_eq!(unsafe { attr.__bindgen_anon_1.sample_period }, 0);
    }

    #[test]
    fn wire_names() {
        assert_eq!(Event::UnhaltedCycles.name(), "unhalted_cycles");
        assert_eq!(
            Event::UnhaltedReferenceCycles.name(),
            "unhalted_reference_cycles"
        );
    }
}
