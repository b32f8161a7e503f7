//! Test fixtures: a wire encoder and an in-memory kernel program

use std::{
    net::IpAddr,
    sync::{Arc, Mutex},
};

use acct_common::{ACCT_EVENT_LEN, IPPROTO_TCP};
use bytes::{BufMut, Bytes};
use tokio::task::JoinHandle;

use crate::{
    error::Result,
    event::{Event, EventKind},
    kernel::{self, KernelProbe},
    probe::{PerfNotice, PerfStreams, Probe, Program},
};

/// Encode `event` the way the BPF program lays it out.
pub(crate) fn encode(event: &Event) -> Vec<u8> {
    let mut b = Vec::with_capacity(ACCT_EVENT_LEN);
    b.put_u64_ne(event.start);
    b.put_u64_ne(event.timestamp);
    b.put_u32_ne(event.connection_id);
    b.put_u32_ne(event.connmark);
    put_addr(&mut b, event.src_addr);
    put_addr(&mut b, event.dst_addr);
    b.put_u64_ne(event.packets_orig);
    b.put_u64_ne(event.bytes_orig);
    b.put_u64_ne(event.packets_ret);
    b.put_u64_ne(event.bytes_ret);
    b.put_u16(event.src_port);
    b.put_u16(event.dst_port);
    b.put_u32_ne(event.netns);
    b.put_u8(event.proto);
    b.resize(ACCT_EVENT_LEN, 0);
    b
}

fn put_addr(b: &mut Vec<u8>, addr: IpAddr) {
    match addr {
        IpAddr::V4(a) => {
            b.put_slice(&a.octets());
            b.put_bytes(0, 12);
        }
        IpAddr::V6(a) => b.put_slice(&a.octets()),
    }
}

pub(crate) fn sample_event() -> Event {
    Event {
        start: 1_700_000_000_000_000_000,
        timestamp: 98_765_432_100,
        connection_id: 0x8c1f_2a40,
        connmark: 3,
        src_addr: "10.1.2.3".parse().unwrap(),
        dst_addr: "2001:db8::80".parse().unwrap(),
        packets_orig: 12,
        bytes_orig: 3_400,
        packets_ret: 10,
        bytes_ret: 98_000,
        src_port: 51000,
        dst_port: 443,
        netns: 4_026_531_993,
        proto: IPPROTO_TCP,
    }
}

/// What a [`MockProgram`] has been asked to do
#[derive(Debug, Clone, Default)]
pub(crate) struct MockSnapshot {
    pub attached: Vec<String>,
    pub poll_calls: usize,
    pub closed: bool,
    pub streams_open: bool,
}

#[derive(Default)]
struct MockInner {
    attached: Vec<String>,
    poll_calls: usize,
    closed: bool,
    streams: Option<PerfStreams>,
}

/// A [`Program`] whose perf streams are fed by the test
#[derive(Clone, Default)]
pub(crate) struct MockProgram {
    inner: Arc<Mutex<MockInner>>,
}

impl MockProgram {
    pub(crate) fn state(&self) -> MockSnapshot {
        let inner = self.inner.lock().unwrap();
        MockSnapshot {
            attached: inner.attached.clone(),
            poll_calls: inner.poll_calls,
            closed: inner.closed,
            streams_open: inner.streams.is_some(),
        }
    }

    /// Push a raw record onto one of the perf streams.
    pub(crate) async fn send(&self, kind: EventKind, record: Vec<u8>) {
        let tx = {
            let inner = self.inner.lock().unwrap();
            let streams = inner.streams.as_ref().expect("program is not polling");
            match kind {
                EventKind::Update => streams.update.clone(),
                EventKind::Destroy => streams.destroy.clone(),
            }
        };
        tx.send(Bytes::from(record)).await.unwrap();
    }

    /// Report `n` records dropped by the kernel.
    pub(crate) async fn send_lost(&self, n: u64) {
        self.send_notice(PerfNotice::Lost(n)).await;
    }

    pub(crate) async fn send_notice(&self, notice: PerfNotice) {
        let tx = {
            let inner = self.inner.lock().unwrap();
            inner
                .streams
                .as_ref()
                .expect("program is not polling")
                .notices
                .clone()
        };
        tx.send(notice).await.unwrap();
    }
}

impl Program for MockProgram {
    fn attach(&mut self, probes: &[KernelProbe]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .attached
            .extend(probes.iter().map(|p| p.program_name()));
        Ok(())
    }

    fn poll(&mut self, streams: PerfStreams) -> Result<Vec<JoinHandle<()>>> {
        let mut inner = self.inner.lock().unwrap();
        inner.poll_calls += 1;
        inner.streams = Some(streams);
        Ok(Vec::new())
    }

    fn close(&mut self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.streams = None;
        Ok(())
    }
}

/// A probe in the `Loaded` state backed by a [`MockProgram`]
pub(crate) fn mock_probe() -> (Probe, MockProgram) {
    let mock = MockProgram::default();
    let kernel = kernel::select("5.4").unwrap();
    let probe = Probe::from_program(kernel, Box::new(mock.clone()));
    (probe, mock)
}
