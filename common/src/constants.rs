//! Shared constants for the conntrack accounting probe
//!
//! These constants mirror the definitions compiled into the BPF program
//! and must change in lockstep with it.

// ============================================================================
// Event Record Layout
// ============================================================================

/// Length of one accounting record as written by the BPF program
pub const ACCT_EVENT_LEN: usize = 104;

/// Flow start, epoch nanoseconds (u64, host order)
pub const OFFSET_START: usize = 0;

/// Event timestamp, nanoseconds since boot (u64, host order)
pub const OFFSET_TIMESTAMP: usize = 8;

/// Connection identifier (u32, host order)
pub const OFFSET_CONNECTION_ID: usize = 16;

/// Connection mark (u32, host order)
pub const OFFSET_CONNMARK: usize = 20;

/// Source address, `union nf_inet_addr` (16 bytes)
pub const OFFSET_SRC_ADDR: usize = 24;

/// Destination address, `union nf_inet_addr` (16 bytes)
pub const OFFSET_DST_ADDR: usize = 40;

/// Original direction packet counter (u64, host order)
pub const OFFSET_PACKETS_ORIG: usize = 56;

/// Original direction byte counter (u64, host order)
pub const OFFSET_BYTES_ORIG: usize = 64;

/// Reply direction packet counter (u64, host order)
pub const OFFSET_PACKETS_RET: usize = 72;

/// Reply direction byte counter (u64, host order)
pub const OFFSET_BYTES_RET: usize = 80;

/// Source port (u16, network order)
pub const OFFSET_SRC_PORT: usize = 88;

/// Destination port (u16, network order)
pub const OFFSET_DST_PORT: usize = 90;

/// Network namespace inode (u32, host order)
pub const OFFSET_NETNS: usize = 92;

/// Transport protocol number (u8)
pub const OFFSET_PROTO: usize = 96;

/// Size of the `union nf_inet_addr` slot
pub const ADDR_SLOT_LEN: usize = 16;

// ============================================================================
// BPF Map Names
// ============================================================================

/// Perf event array carrying update events
pub const PERF_UPDATE_MAP: &str = "perf_acct_update";

/// Perf event array carrying destroy events
pub const PERF_DESTROY_MAP: &str = "perf_acct_end";

/// Array map holding probe configuration, indexed by [`crate::ConfigKey`]
pub const CONFIG_MAP: &str = "config";

/// Array map holding rate curve (age, interval) pairs, indexed by [`crate::RateCurveKey`]
pub const CONFIG_RATECURVE_MAP: &str = "config_ratecurve";

/// Value written to the Ready slot of the config map to enable the program
pub const READY_VALUE: u64 = 0x90;

/// Number of (age, interval) points in the rate curve
pub const RATE_CURVE_POINTS: usize = 3;

// ============================================================================
// Protocol Numbers (from linux/in.h)
// ============================================================================

/// TCP protocol number
pub const IPPROTO_TCP: u8 = 6;

/// UDP protocol number
pub const IPPROTO_UDP: u8 = 17;

/// ICMP protocol number
pub const IPPROTO_ICMP: u8 = 1;
