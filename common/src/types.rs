//! Map key definitions shared with the BPF program
//!
//! The discriminants are the array indices used by the kernel side and
//! must not be reordered.

/// Slots of the `config` array map
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigKey {
    /// Program only emits events once this holds [`crate::READY_VALUE`]
    Ready = 0,
}

/// Slots of the `config_ratecurve` array map
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateCurveKey {
    Curve0Age = 0,
    Curve0Interval = 1,
    Curve1Age = 2,
    Curve1Interval = 3,
    Curve2Age = 4,
    Curve2Interval = 5,
}

impl RateCurveKey {
    /// Age and interval slots for the curve point at `index`
    pub const fn point(index: usize) -> Option<(RateCurveKey, RateCurveKey)> {
        match index {
            0 => Some((RateCurveKey::Curve0Age, RateCurveKey::Curve0Interval)),
            1 => Some((RateCurveKey::Curve1Age, RateCurveKey::Curve1Interval)),
            2 => Some((RateCurveKey::Curve2Age, RateCurveKey::Curve2Interval)),
            _ => None,
        }
    }
}

// Compile-time layout checks
const _: () = {
    assert!(crate::constants::OFFSET_PROTO < crate::constants::ACCT_EVENT_LEN);
    assert!(crate::constants::OFFSET_DST_ADDR + crate::constants::ADDR_SLOT_LEN == crate::constants::OFFSET_PACKETS_ORIG);
    assert!(crate::constants::ACCT_EVENT_LEN % 8 == 0);
};
