//! Accounting probe lifecycle and event fanout
//!
//! A [`Probe`] owns a loaded kernel program and moves through
//! `Loaded -> Started -> Stopped`. While started, perf readers push raw
//! records into two bounded queues; a single decode task turns them into
//! [`Event`]s and fans each one out to the registered [`Consumer`]s without
//! ever waiting on them. A second task tallies records the kernel dropped.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    config::Config,
    consumer::Consumer,
    error::{Error, Result},
    event::{Event, EventKind},
    kallsyms::Kallsyms,
    kernel::{self, Kernel, KernelProbe},
    loader::ProbeLoader,
    stats::{ConsumerStats, ProbeCounters, ProbeStats},
};

/// Capacity of each raw event queue between perf readers and the decoder
pub const PERF_QUEUE_CAPACITY: usize = 1024;

const NOTICE_QUEUE_CAPACITY: usize = 64;

/// Queues a program's perf readers deliver into
#[derive(Debug)]
pub struct PerfStreams {
    /// Raw records from the update perf map
    pub update: mpsc::Sender<Bytes>,
    /// Raw records from the destroy perf map
    pub destroy: mpsc::Sender<Bytes>,
    /// Record losses and reader failures
    pub notices: mpsc::Sender<PerfNotice>,
}

/// Out-of-band report from a perf reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PerfNotice {
    /// The kernel dropped this many records before they were read
    Lost(u64),
    /// Reading a CPU's buffer failed and its reader exited
    ReadError {
        map: &'static str,
        cpu: u32,
        error: String,
    },
}

/// A kernel program a [`Probe`] drives.
///
/// [`ProbeLoader`] is the eBPF implementation.
pub trait Program: Send {
    /// Attach `probes` in order.
    fn attach(&mut self, probes: &[KernelProbe]) -> Result<()>;

    /// Start reading both perf maps into `streams`, returning the reader tasks.
    fn poll(&mut self, streams: PerfStreams) -> Result<Vec<JoinHandle<()>>>;

    /// Detach all probes and release the program.
    fn close(&mut self) -> Result<()>;
}

/// Lifecycle state of a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    /// Program is in the kernel, nothing attached yet
    Loaded,
    /// Probes attached and perf buffers being read
    Started,
    /// Resources released; terminal
    Stopped,
}

type ConsumerSet = Arc<RwLock<Vec<Arc<Consumer>>>>;

struct Lifecycle {
    state: ProbeState,
    program: Box<dyn Program>,
    pollers: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

/// An instance of the accounting program running in the kernel
pub struct Probe {
    kernel: Kernel,
    lifecycle: Mutex<Lifecycle>,
    consumers: ConsumerSet,
    errors: Mutex<Option<mpsc::Receiver<Error>>>,
    stats: Arc<ProbeCounters>,
}

impl Probe {
    /// Load the program build matching the running kernel.
    ///
    /// Does not attach any probes yet; see [`Probe::start`].
    ///
    /// # Arguments
    ///
    /// * `config` - Object directory, perf buffer size and rate curve
    /// * `kallsyms` - Kernel symbols, checked against the build's kprobes
    ///
    /// # Returns
    ///
    /// A probe in the [`ProbeState::Loaded`] state
    pub fn new(config: &Config, kallsyms: &Kallsyms) -> Result<Self> {
        let release = kernel::running_release()?;
        Self::for_release(&release, config, kallsyms)
    }

    /// Load the program build matching a normalized kernel `release`.
    ///
    /// # Arguments
    ///
    /// * `release` - Kernel release such as `5.10` or `4.19.2`
    /// * `config` - Object directory, perf buffer size and rate curve
    /// * `kallsyms` - Kernel symbols, checked against the build's kprobes
    ///
    /// # Returns
    ///
    /// A loaded probe, or `KernelUnsupported` when no build fits `release`
    pub fn for_release(release: &str, config: &Config, kallsyms: &Kallsyms) -> Result<Self> {
        config.validate()?;

        let kernel = kernel::select(release)?;
        info!(
            "selected BPF program build {} for kernel {}",
            kernel.version, release
        );

        // Catch missing symbols here rather than as an attach failure.
        kallsyms.check_probes(kernel.probes)?;

        let program = ProbeLoader::load(&kernel, config)?;

        Ok(Self::from_program(kernel, Box::new(program)))
    }

    /// Wrap an already loaded program.
    pub fn from_program(kernel: Kernel, program: Box<dyn Program>) -> Self {
        Self {
            kernel,
            lifecycle: Mutex::new(Lifecycle {
                state: ProbeState::Loaded,
                program,
                pollers: Vec::new(),
                workers: Vec::new(),
            }),
            consumers: Arc::new(RwLock::new(Vec::new())),
            errors: Mutex::new(None),
            stats: Arc::new(ProbeCounters::default()),
        }
    }

    /// Attach the program's probes and start reading events.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut lc = lock(&self.lifecycle);

        match lc.state {
            ProbeState::Started => return Err(Error::AlreadyStarted),
            ProbeState::Stopped => return Err(Error::Stopped),
            ProbeState::Loaded => {}
        }

        lc.program.attach(self.kernel.probes)?;

        let (update_tx, update_rx) = mpsc::channel(PERF_QUEUE_CAPACITY);
        let (destroy_tx, destroy_rx) = mpsc::channel(PERF_QUEUE_CAPACITY);
        let (notice_tx, notice_rx) = mpsc::channel(NOTICE_QUEUE_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(1);

        let pollers = lc.program.poll(PerfStreams {
            update: update_tx,
            destroy: destroy_tx,
            notices: notice_tx,
        })?;

        lc.workers.push(tokio::spawn(perf_worker(
            update_rx,
            destroy_rx,
            Arc::clone(&self.consumers),
            Arc::clone(&self.stats),
            err_tx.clone(),
        )));
        lc.workers.push(tokio::spawn(notice_worker(
            notice_rx,
            Arc::clone(&self.stats),
            err_tx,
        )));

        lc.pollers = pollers;
        *lock(&self.errors) = Some(err_rx);
        lc.state = ProbeState::Started;

        info!(
            "probe started: {} probes attached, {} perf readers",
            self.kernel.probes.len(),
            lc.pollers.len()
        );

        Ok(())
    }

    /// Release the program and close the probe's queues.
    ///
    /// Only valid once, after [`Probe::start`].
    pub fn stop(&self) -> Result<()> {
        let mut lc = lock(&self.lifecycle);

        if lc.state != ProbeState::Started {
            return Err(Error::NotStarted);
        }
        lc.state = ProbeState::Stopped;

        let closed = lc.program.close();

        // Readers own the queue senders; once they are gone the decode and
        // notice loops drain what is left and exit.
        for poller in lc.pollers.drain(..) {
            poller.abort();
        }

        info!("probe stopped");
        closed
    }

    /// Wait for the decode and notice loops to finish after [`Probe::stop`].
    pub async fn join(&self) {
        let workers = std::mem::take(&mut lock(&self.lifecycle).workers);
        for worker in workers {
            let _ = worker.await;
        }
    }

    pub fn state(&self) -> ProbeState {
        lock(&self.lifecycle).state
    }

    /// Target kernel of the loaded program build
    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Snapshot copy of the probe's statistics
    pub fn stats(&self) -> ProbeStats {
        self.stats.get()
    }

    /// Take the receiver of decode and perf read errors.
    ///
    /// Returns `None` before [`Probe::start`] or once taken. The queue holds
    /// a single error: while one is pending, later errors are dropped, so a
    /// receiver that falls behind sees the oldest unread error first. The
    /// counters in [`Probe::stats`] are exact regardless.
    pub fn take_errors(&self) -> Option<mpsc::Receiver<Error>> {
        lock(&self.errors).take()
    }

    /// Add a consumer to the fanout set.
    pub fn register_consumer(&self, consumer: Arc<Consumer>) -> Result<()> {
        let mut consumers = write(&self.consumers);

        if consumers.iter().any(|c| c.name() == consumer.name()) {
            return Err(Error::ConsumerExists(consumer.name().to_string()));
        }

        debug!(
            "registered consumer {} ({:?}, capacity {})",
            consumer.name(),
            consumer.mode(),
            consumer.capacity()
        );
        consumers.push(consumer);

        Ok(())
    }

    /// Remove a consumer from the fanout set.
    ///
    /// Its inbox closes once the returned handle is dropped.
    pub fn unregister_consumer(&self, name: &str) -> Result<Arc<Consumer>> {
        let mut consumers = write(&self.consumers);

        let pos = consumers
            .iter()
            .position(|c| c.name() == name)
            .ok_or_else(|| Error::ConsumerNotFound(name.to_string()))?;

        debug!("unregistered consumer {}", name);
        Ok(consumers.remove(pos))
    }

    pub fn consumer_names(&self) -> Vec<String> {
        read(&self.consumers)
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Statistics of every registered consumer
    pub fn consumer_stats(&self) -> Vec<(String, ConsumerStats)> {
        read(&self.consumers)
            .iter()
            .map(|c| (c.name().to_string(), c.stats()))
            .collect()
    }
}

impl Drop for Probe {
    fn drop(&mut self) {
        let lc = self
            .lifecycle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for poller in lc.pollers.drain(..) {
            poller.abort();
        }
    }
}

/// Decode raw records from both perf queues and fan them out.
///
/// Exits once both queues are closed.
async fn perf_worker(
    mut update: mpsc::Receiver<Bytes>,
    mut destroy: mpsc::Receiver<Bytes>,
    consumers: ConsumerSet,
    stats: Arc<ProbeCounters>,
    errors: mpsc::Sender<Error>,
) {
    loop {
        let (record, kind) = tokio::select! {
            Some(record) = update.recv() => {
                stats.incr_update();
                (record, EventKind::Update)
            }
            Some(record) = destroy.recv() => {
                stats.incr_destroy();
                (record, EventKind::Destroy)
            }
            else => break,
        };

        match Event::decode(&record) {
            Ok(event) => {
                fanout(&consumers, &event, kind);
            }
            Err(e) => {
                stats.incr_decode_errors();
                debug!("dropping {} record: {}", kind, e);
                send_error(&errors, e);
            }
        }
    }

    debug!("perf worker exiting");
}

/// Count kernel-side perf buffer losses and failed readers.
///
/// Exits once the queue is closed.
async fn notice_worker(
    mut notices: mpsc::Receiver<PerfNotice>,
    stats: Arc<ProbeCounters>,
    errors: mpsc::Sender<Error>,
) {
    while let Some(notice) = notices.recv().await {
        match notice {
            PerfNotice::Lost(n) => stats.add_lost(n),
            PerfNotice::ReadError { map, cpu, error } => {
                stats.incr_read_errors();
                warn!("perf reader for {} on CPU {} stopped: {}", map, cpu, error);
                send_error(&errors, Error::map(map, format!("reading CPU {}: {}", cpu, error)));
            }
        }
    }

    debug!("notice worker exiting");
}

/// Deliver `event` to every consumer interested in `kind`.
///
/// Holds the read lock for one pass. Returns the number of consumers that
/// accepted the event.
pub(crate) fn fanout(
    consumers: &RwLock<Vec<Arc<Consumer>>>,
    event: &Event,
    kind: EventKind,
) -> usize {
    let consumers = read(consumers);

    let mut delivered = 0;
    for consumer in consumers.iter() {
        if consumer.mode().wants(kind) && consumer.deliver(kind, event.clone()) {
            delivered += 1;
        }
    }
    delivered
}

/// Non-blocking send on the error queue. Returns whether it was delivered.
fn send_error(errors: &mpsc::Sender<Error>, err: Error) -> bool {
    errors.try_send(err).is_ok()
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}
