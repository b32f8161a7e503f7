//! Accounting pipeline
//!
//! Owns a [`Probe`] and the sinks fed from it. Every sink gets a consumer on
//! the probe and a task draining that consumer's inbox into the sink.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

use crate::{
    config::Config,
    consumer::{Consumer, ConsumerMode, Inbox},
    error::{Error, Result},
    kallsyms::Kallsyms,
    probe::Probe,
    sink::Sink,
    stats::{ConsumerStats, PipelineCounters, PipelineStats, ProbeStats},
    sysctl,
};

/// Conntrack accounting data ingest pipeline
pub struct Pipeline {
    probe: Probe,
    sinks: RwLock<Vec<Arc<dyn Sink>>>,
    drains: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<PipelineCounters>,
    /// Consumer statistics taken once the probe's loops have finished
    final_consumers: Mutex<Option<Vec<(String, ConsumerStats)>>>,
}

impl Pipeline {
    pub fn new(probe: Probe) -> Self {
        Self {
            probe,
            sinks: RwLock::new(Vec::new()),
            drains: Mutex::new(Vec::new()),
            stats: Arc::new(PipelineCounters::default()),
            final_consumers: Mutex::new(None),
        }
    }

    /// Load the probe for the running kernel and wrap it in a pipeline.
    pub fn init(config: &Config, kallsyms: &Kallsyms) -> Result<Self> {
        Ok(Self::new(Probe::new(config, kallsyms)?))
    }

    pub fn start(&self) -> Result<()> {
        self.probe.start()
    }

    /// Register a sink and start feeding it events.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Arguments
    ///
    /// * `sink` - Initialized sink; its name becomes the consumer name
    ///
    /// # Returns
    ///
    /// `SinkNotInitialized` if the sink is not ready, or `ConsumerExists`
    /// if its name is taken
    pub fn register_sink(&self, sink: Arc<dyn Sink>) -> Result<()> {
        if !sink.is_init() {
            return Err(Error::SinkNotInitialized(sink.name().to_string()));
        }

        if sink.want_destroy() {
            sysctl::warn_destroy_timeouts();
        }

        let inbox = match ConsumerMode::from_flags(sink.want_update(), sink.want_destroy()) {
            Some(mode) => {
                let (consumer, inbox) =
                    Consumer::new(sink.name(), sink.queue_capacity(), mode);
                self.probe.register_consumer(consumer)?;
                Some(inbox)
            }
            None => {
                warn!("Sink {} wants neither update nor destroy events", sink.name());
                None
            }
        };

        self.sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&sink));
        self.stats.incr_sinks();

        info!("Registered sink {}", sink.name());

        if let Some(inbox) = inbox {
            let handle = tokio::spawn(drain_sink(sink, inbox, Arc::clone(&self.stats)));
            lock(&self.drains).push(handle);
        }

        Ok(())
    }

    /// Snapshot of the registered sinks
    pub fn sinks(&self) -> Vec<Arc<dyn Sink>> {
        self.sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop the probe. Sinks keep draining until [`Pipeline::drain`].
    pub fn stop(&self) -> Result<()> {
        self.probe.stop()
    }

    /// Wait for in-flight events to reach the sinks after [`Pipeline::stop`].
    ///
    /// Once the probe's loops have exited, the sinks' consumers are
    /// unregistered so every drain task empties its inbox and finishes.
    ///
    /// # Returns
    ///
    /// Final statistics of every sink consumer, taken after the last event
    /// was fanned out. Later calls to [`Pipeline::consumer_stats`] return the
    /// same snapshot.
    pub async fn drain(&self) -> Vec<(String, ConsumerStats)> {
        self.probe.join().await;

        let consumers = self.probe.consumer_stats();
        *lock(&self.final_consumers) = Some(consumers.clone());

        for sink in self.sinks() {
            match self.probe.unregister_consumer(sink.name()) {
                Ok(_) | Err(Error::ConsumerNotFound(_)) => {}
                Err(e) => warn!("Failed to unregister sink {}: {}", sink.name(), e),
            }
        }

        let drains = std::mem::take(&mut *lock(&self.drains));
        for drain in drains {
            let _ = drain.await;
        }

        info!("All sinks drained");

        consumers
    }

    pub fn probe(&self) -> &Probe {
        &self.probe
    }

    /// Snapshot copy of the probe's statistics
    pub fn probe_stats(&self) -> ProbeStats {
        self.probe.stats()
    }

    /// Snapshot copy of the pipeline's statistics
    pub fn stats(&self) -> PipelineStats {
        self.stats.get()
    }

    /// Snapshot copies of every sink consumer's statistics
    ///
    /// After [`Pipeline::drain`] this is the final snapshot taken there.
    pub fn consumer_stats(&self) -> Vec<(String, ConsumerStats)> {
        if let Some(last) = lock(&self.final_consumers).as_ref() {
            return last.clone();
        }
        self.probe.consumer_stats()
    }
}

/// Hand every event in `inbox` to `sink` until the inbox closes.
async fn drain_sink(sink: Arc<dyn Sink>, mut inbox: Inbox, stats: Arc<PipelineCounters>) {
    while let Some((kind, event)) = inbox.recv().await {
        match sink.push(&event, kind) {
            Ok(()) => stats.incr_pushed(),
            Err(e) => {
                stats.incr_push_errors();
                warn!("Sink {} failed to write {} event: {:#}", sink.name(), kind, e);
            }
        }
    }

    if let Err(e) = sink.flush() {
        error!("{:#}", e);
    }

    debug!("sink {} drained", sink.name());
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::{Event, EventKind},
        testing::{encode, mock_probe, sample_event},
    };
    use std::sync::atomic::{AtomicBool, Ordering};

    struct TestSink {
        name: String,
        init: bool,
        update: bool,
        destroy: bool,
        fail: bool,
        events: Mutex<Vec<(EventKind, Event)>>,
        flushed: AtomicBool,
    }

    impl TestSink {
        fn new(name: &str, update: bool, destroy: bool) -> Self {
            Self {
                name: name.to_string(),
                init: true,
                update,
                destroy,
                fail: false,
                events: Mutex::new(Vec::new()),
                flushed: AtomicBool::new(false),
            }
        }

        fn kinds(&self) -> Vec<EventKind> {
            self.events.lock().unwrap().iter().map(|(k, _)| *k).collect()
        }
    }

    impl Sink for TestSink {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_init(&self) -> bool {
            self.init
        }

        fn want_update(&self) -> bool {
            self.update
        }

        fn want_destroy(&self) -> bool {
            self.destroy
        }

        fn push(&self, event: &Event, kind: EventKind) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("backend unavailable");
            }
            self.events.lock().unwrap().push((kind, event.clone()));
            Ok(())
        }

        fn flush(&self) -> anyhow::Result<()> {
            self.flushed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_uninitialized_sink_rejected() {
        let (probe, _mock) = mock_probe();
        let pipeline = Pipeline::new(probe);

        let sink = TestSink {
            init: false,
            ..TestSink::new("cold", true, true)
        };
        assert!(matches!(
            pipeline.register_sink(Arc::new(sink)),
            Err(Error::SinkNotInitialized(name)) if name == "cold"
        ));
        assert!(pipeline.sinks().is_empty());
        assert!(pipeline.probe().consumer_names().is_empty());
        assert_eq!(pipeline.stats().sinks, 0);
    }

    #[tokio::test]
    async fn test_duplicate_sink_name_rejected() {
        let (probe, _mock) = mock_probe();
        let pipeline = Pipeline::new(probe);

        pipeline
            .register_sink(Arc::new(TestSink::new("out", true, false)))
            .unwrap();
        assert!(matches!(
            pipeline.register_sink(Arc::new(TestSink::new("out", false, true))),
            Err(Error::ConsumerExists(_))
        ));
        assert_eq!(pipeline.sinks().len(), 1);
    }

    #[tokio::test]
    async fn test_sinks_receive_filtered_events() {
        let (probe, mock) = mock_probe();
        let pipeline = Pipeline::new(probe);

        let updates = Arc::new(TestSink::new("updates", true, false));
        let destroys = Arc::new(TestSink::new("destroys", false, true));
        let all = Arc::new(TestSink::new("all", true, true));
        pipeline.register_sink(updates.clone()).unwrap();
        pipeline.register_sink(destroys.clone()).unwrap();
        pipeline.register_sink(all.clone()).unwrap();
        assert_eq!(pipeline.sinks().len(), 3);

        pipeline.start().unwrap();
        mock.send(EventKind::Update, encode(&sample_event())).await;
        mock.send(EventKind::Destroy, encode(&sample_event())).await;
        mock.send(EventKind::Update, encode(&sample_event())).await;
        pipeline.stop().unwrap();
        pipeline.drain().await;

        assert_eq!(updates.kinds(), vec![EventKind::Update, EventKind::Update]);
        assert_eq!(destroys.kinds(), vec![EventKind::Destroy]);
        assert_eq!(all.kinds().len(), 3);
        assert!(updates.flushed.load(Ordering::SeqCst));
        assert!(all.flushed.load(Ordering::SeqCst));

        let stats = pipeline.stats();
        assert_eq!(stats.sinks, 3);
        assert_eq!(stats.events_pushed, 6);
        assert_eq!(stats.push_errors, 0);
        assert_eq!(pipeline.probe_stats().events_total, 3);
    }

    #[tokio::test]
    async fn test_push_errors_counted() {
        let (probe, mock) = mock_probe();
        let pipeline = Pipeline::new(probe);

        let broken = TestSink {
            fail: true,
            ..TestSink::new("broken", true, true)
        };
        pipeline.register_sink(Arc::new(broken)).unwrap();

        pipeline.start().unwrap();
        mock.send(EventKind::Update, encode(&sample_event())).await;
        mock.send(EventKind::Destroy, encode(&sample_event())).await;
        pipeline.stop().unwrap();
        pipeline.drain().await;

        let stats = pipeline.stats();
        assert_eq!(stats.events_pushed, 0);
        assert_eq!(stats.push_errors, 2);
    }

    #[tokio::test]
    async fn test_sink_without_interest_has_no_consumer() {
        let (probe, _mock) = mock_probe();
        let pipeline = Pipeline::new(probe);

        pipeline
            .register_sink(Arc::new(TestSink::new("idle", false, false)))
            .unwrap();
        assert_eq!(pipeline.sinks().len(), 1);
        assert!(pipeline.probe().consumer_names().is_empty());
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let (probe, _mock) = mock_probe();
        let pipeline = Pipeline::new(probe);
        assert!(matches!(pipeline.stop(), Err(Error::NotStarted)));
    }

    #[tokio::test]
    async fn test_stats_are_snapshots() {
        let (probe, mock) = mock_probe();
        let pipeline = Pipeline::new(probe);
        pipeline
            .register_sink(Arc::new(TestSink::new("s", true, true)))
            .unwrap();

        let before = pipeline.stats();
        let sinks = pipeline.sinks();

        pipeline.start().unwrap();
        mock.send(EventKind::Update, encode(&sample_event())).await;
        pipeline.stop().unwrap();
        pipeline.drain().await;

        assert_eq!(before.events_pushed, 0);
        assert_eq!(pipeline.stats().events_pushed, 1);
        assert_eq!(sinks.len(), 1);

        assert_eq!(pipeline.consumer_stats().len(), 1);
    }

    #[tokio::test]
    async fn test_consumer_stats_survive_drain() {
        let (probe, mock) = mock_probe();
        let pipeline = Pipeline::new(probe);
        pipeline
            .register_sink(Arc::new(TestSink::new("all", true, true)))
            .unwrap();

        pipeline.start().unwrap();
        for _ in 0..3 {
            mock.send(EventKind::Update, encode(&sample_event())).await;
        }
        pipeline.stop().unwrap();
        let consumers = pipeline.drain().await;

        assert_eq!(consumers.len(), 1);
        let (name, stats) = &consumers[0];
        assert_eq!(name, "all");
        assert_eq!(stats.events_received, 3);
        assert_eq!(stats.events_lost, 0);

        assert_eq!(pipeline.consumer_stats(), consumers);
        assert!(pipeline.probe().consumer_names().is_empty());
        assert_eq!(pipeline.stats().events_pushed, 3);
    }
}
