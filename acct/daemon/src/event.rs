//! Accounting event decoding
//!
//! Turns the fixed-length records written by the BPF program into [`Event`]s.
//! Counters and identifiers are written in host byte order; the ports are
//! copied straight from the conntrack tuple and therefore arrive in network
//! byte order.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use acct_common::{ACCT_EVENT_LEN, ADDR_SLOT_LEN, IPPROTO_TCP, IPPROTO_UDP};
use bytes::Buf;
use serde::Serialize;

use crate::error::{Error, Result};

/// The perf stream an event was delivered on
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Periodic snapshot of a live connection
    Update,
    /// Final snapshot of a connection being torn down
    Destroy,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Update => "update",
            EventKind::Destroy => "destroy",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accounting event delivered to userspace by the probe
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Epoch timestamp of flow start (nanoseconds)
    pub start: u64,
    /// Time of the event, relative to machine boot (nanoseconds)
    pub timestamp: u64,
    pub connection_id: u32,
    pub connmark: u32,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub packets_orig: u64,
    pub bytes_orig: u64,
    pub packets_ret: u64,
    pub bytes_ret: u64,
    /// Zero unless `proto` is TCP or UDP
    pub src_port: u16,
    /// Zero unless `proto` is TCP or UDP
    pub dst_port: u16,
    pub netns: u32,
    pub proto: u8,
}

impl Event {
    /// Decode a binary record produced by the BPF program.
    ///
    /// Fails with [`Error::MalformedInput`] unless `b` is exactly
    /// [`ACCT_EVENT_LEN`] bytes long.
    pub fn decode(b: &[u8]) -> Result<Self> {
        if b.len() != ACCT_EVENT_LEN {
            return Err(Error::MalformedInput {
                len: b.len(),
                expected: ACCT_EVENT_LEN,
            });
        }

        // Every read below is in bounds after the length check.
        let mut buf = b;

        let start = buf.get_u64_ne();
        let timestamp = buf.get_u64_ne();
        let connection_id = buf.get_u32_ne();
        let connmark = buf.get_u32_ne();

        let src_addr = read_addr(&mut buf);
        let dst_addr = read_addr(&mut buf);

        let packets_orig = buf.get_u64_ne();
        let bytes_orig = buf.get_u64_ne();
        let packets_ret = buf.get_u64_ne();
        let bytes_ret = buf.get_u64_ne();

        let src_port = buf.get_u16();
        let dst_port = buf.get_u16();
        let netns = buf.get_u32_ne();
        let proto = buf.get_u8();

        // Other protocols leave the port union filled with unrelated data.
        let (src_port, dst_port) = if has_ports(proto) {
            (src_port, dst_port)
        } else {
            (0, 0)
        };

        Ok(Event {
            start,
            timestamp,
            connection_id,
            connmark,
            src_addr,
            dst_addr,
            packets_orig,
            bytes_orig,
            packets_ret,
            bytes_ret,
            src_port,
            dst_port,
            netns,
            proto,
        })
    }
}

impl TryFrom<&[u8]> for Event {
    type Error = Error;

    fn try_from(b: &[u8]) -> Result<Self> {
        Event::decode(b)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "proto {} {} -> {} cid {:#x} mark {} netns {} orig {}p/{}b ret {}p/{}b",
            self.proto,
            endpoint(self.src_addr, self.src_port),
            endpoint(self.dst_addr, self.dst_port),
            self.connection_id,
            self.connmark,
            self.netns,
            self.packets_orig,
            self.bytes_orig,
            self.packets_ret,
            self.bytes_ret,
        )
    }
}

/// Whether the conntrack tuple of `proto` carries port numbers
pub fn has_ports(proto: u8) -> bool {
    proto == IPPROTO_TCP || proto == IPPROTO_UDP
}

/// Interpret a `union nf_inet_addr` slot.
///
/// The kernel stores an IPv4 address in the first four bytes and zeroes the
/// rest, so only those four bytes may be used to build the address.
pub fn addr_from_slot(slot: [u8; ADDR_SLOT_LEN]) -> IpAddr {
    if slot[4..].iter().all(|&b| b == 0) {
        IpAddr::V4(Ipv4Addr::new(slot[0], slot[1], slot[2], slot[3]))
    } else {
        IpAddr::V6(Ipv6Addr::from(slot))
    }
}

fn read_addr(buf: &mut &[u8]) -> IpAddr {
    let mut slot = [0u8; ADDR_SLOT_LEN];
    buf.copy_to_slice(&mut slot);
    addr_from_slot(slot)
}

fn endpoint(addr: IpAddr, port: u16) -> String {
    match addr {
        IpAddr::V4(a) => format!("{}:{}", a, port),
        IpAddr::V6(a) => format!("[{}]:{}", a, port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{encode, sample_event};
    use acct_common::*;

    fn put_ne_u64(b: &mut [u8], off: usize, v: u64) {
        b[off..off + 8].copy_from_slice(&v.to_ne_bytes());
    }

    #[test]
    fn test_decode_roundtrip() {
        let v4_only = Event {
            src_addr: "192.168.10.20".parse().unwrap(),
            dst_addr: "172.16.0.1".parse().unwrap(),
            ..sample_event()
        };
        let v6_only = Event {
            src_addr: "fe80::1".parse().unwrap(),
            dst_addr: "::1".parse().unwrap(),
            ..sample_event()
        };
        let udp = Event {
            proto: IPPROTO_UDP,
            src_port: 5353,
            dst_port: 53,
            ..sample_event()
        };
        let icmp = Event {
            proto: IPPROTO_ICMP,
            src_port: 0,
            dst_port: 0,
            ..sample_event()
        };
        let max = Event {
            start: u64::MAX,
            timestamp: u64::MAX,
            connection_id: u32::MAX,
            connmark: u32::MAX,
            src_addr: "255.255.255.255".parse().unwrap(),
            dst_addr: "ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff".parse().unwrap(),
            packets_orig: u64::MAX,
            bytes_orig: u64::MAX,
            packets_ret: u64::MAX,
            bytes_ret: u64::MAX,
            src_port: u16::MAX,
            dst_port: u16::MAX,
            netns: u32::MAX,
            proto: IPPROTO_TCP,
        };

        for event in [sample_event(), v4_only, v6_only, udp, icmp, max] {
            let decoded = Event::decode(&encode(&event)).unwrap();
            assert_eq!(decoded, event);
        }
    }

    #[test]
    fn test_decode_field_offsets() {
        let mut b = [0u8; ACCT_EVENT_LEN];
        put_ne_u64(&mut b, OFFSET_START, 1_600_000_000_000_000_000);
        put_ne_u64(&mut b, OFFSET_TIMESTAMP, 42);
        b[OFFSET_CONNECTION_ID..OFFSET_CONNECTION_ID + 4].copy_from_slice(&0xdead_beefu32.to_ne_bytes());
        b[OFFSET_CONNMARK..OFFSET_CONNMARK + 4].copy_from_slice(&7u32.to_ne_bytes());
        b[OFFSET_SRC_ADDR..OFFSET_SRC_ADDR + 4].copy_from_slice(&[10, 0, 0, 1]);
        b[OFFSET_DST_ADDR..OFFSET_DST_ADDR + 4].copy_from_slice(&[192, 168, 1, 2]);
        put_ne_u64(&mut b, OFFSET_PACKETS_ORIG, 3);
        put_ne_u64(&mut b, OFFSET_BYTES_ORIG, 300);
        put_ne_u64(&mut b, OFFSET_PACKETS_RET, 4);
        put_ne_u64(&mut b, OFFSET_BYTES_RET, 400);
        b[OFFSET_SRC_PORT..OFFSET_SRC_PORT + 2].copy_from_slice(&[0x1f, 0x90]);
        b[OFFSET_DST_PORT..OFFSET_DST_PORT + 2].copy_from_slice(&[0x01, 0xbb]);
        b[OFFSET_NETNS..OFFSET_NETNS + 4].copy_from_slice(&4_026_531_992u32.to_ne_bytes());
        b[OFFSET_PROTO] = IPPROTO_TCP;

        let e = Event::decode(&b).unwrap();
        assert_eq!(e.start, 1_600_000_000_000_000_000);
        assert_eq!(e.timestamp, 42);
        assert_eq!(e.connection_id, 0xdead_beef);
        assert_eq!(e.connmark, 7);
        assert_eq!(e.src_addr, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(e.dst_addr, "192.168.1.2".parse::<IpAddr>().unwrap());
        assert_eq!((e.packets_orig, e.bytes_orig), (3, 300));
        assert_eq!((e.packets_ret, e.bytes_ret), (4, 400));
        assert_eq!(e.src_port, 8080);
        assert_eq!(e.dst_port, 443);
        assert_eq!(e.netns, 4_026_531_992);
        assert_eq!(e.proto, IPPROTO_TCP);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        for len in [0usize, 1, 103, 105, 200] {
            let b = vec![0u8; len];
            match Event::decode(&b) {
                Err(Error::MalformedInput { len: got, expected }) => {
                    assert_eq!(got, len);
                    assert_eq!(expected, ACCT_EVENT_LEN);
                }
                other => panic!("length {} decoded to {:?}", len, other),
            }
        }
    }

    #[test]
    fn test_addr_disambiguation() {
        let mut slot = [0u8; ADDR_SLOT_LEN];
        slot[..4].copy_from_slice(&[172, 16, 0, 9]);
        assert_eq!(addr_from_slot(slot), IpAddr::V4(Ipv4Addr::new(172, 16, 0, 9)));

        // A single non-zero byte past the IPv4 prefix makes it IPv6.
        slot[15] = 1;
        let mut expected = [0u8; 16];
        expected[..4].copy_from_slice(&[172, 16, 0, 9]);
        expected[15] = 1;
        assert_eq!(addr_from_slot(slot), IpAddr::V6(Ipv6Addr::from(expected)));

        let v6: Ipv6Addr = "2001:db8::1".parse().unwrap();
        assert_eq!(addr_from_slot(v6.octets()), IpAddr::V6(v6));
    }

    #[test]
    fn test_zero_slot_is_ipv4() {
        assert_eq!(
            addr_from_slot([0u8; ADDR_SLOT_LEN]),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        );
    }

    #[test]
    fn test_port_gating() {
        let mut b = encode(&sample_event());
        b[OFFSET_SRC_PORT..OFFSET_SRC_PORT + 2].copy_from_slice(&[0x00, 0x35]);
        b[OFFSET_DST_PORT..OFFSET_DST_PORT + 2].copy_from_slice(&[0xc3, 0x50]);

        b[OFFSET_PROTO] = IPPROTO_UDP;
        let e = Event::decode(&b).unwrap();
        assert_eq!((e.src_port, e.dst_port), (53, 50000));

        for proto in [0u8, IPPROTO_ICMP, 47, 58, 132, 255] {
            b[OFFSET_PROTO] = proto;
            let e = Event::decode(&b).unwrap();
            assert_eq!((e.src_port, e.dst_port), (0, 0), "proto {}", proto);
        }
    }

    #[test]
    fn test_display() {
        let e = sample_event();
        let s = e.to_string();
        assert!(s.contains("10.1.2.3:51000"));
        assert!(s.contains("-> [2001:db8::80]:443"));
        assert_eq!(EventKind::Destroy.to_string(), "destroy");
    }
}
