//! Perf buffer readers
//!
//! One task per online CPU reads raw samples from a perf event array and
//! forwards them, unparsed, to the probe's decode queue.

use acct_common::ACCT_EVENT_LEN;
use aya::{
    maps::{perf::AsyncPerfEventArray, MapData},
    util::online_cpus,
};
use bytes::{Bytes, BytesMut};
use log::{debug, error, info};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    error::{Error, Result},
    probe::PerfNotice,
};

/// Samples read per wakeup
const READ_BATCH: usize = 10;

/// Spawn a reader task for every online CPU.
///
/// A reader exits when either queue is closed, or after reporting a failed
/// read as [`PerfNotice::ReadError`].
///
/// # Arguments
///
/// * `map` - Name of the perf map, used in logs and notices
/// * `perf_array` - Perf event array taken from the loaded program
/// * `pages` - Pages per CPU buffer, `None` for the aya default
/// * `queue` - Receives raw samples
/// * `notices` - Receives kernel loss counts and read failures
///
/// # Returns
///
/// Handles of the spawned reader tasks, one per online CPU
pub fn spawn_cpu_readers(
    map: &'static str,
    mut perf_array: AsyncPerfEventArray<MapData>,
    pages: Option<usize>,
    queue: mpsc::Sender<Bytes>,
    notices: mpsc::Sender<PerfNotice>,
) -> Result<Vec<JoinHandle<()>>> {
    let cpus = online_cpus()?;
    info!("Spawning {} readers for {} CPUs", map, cpus.len());

    let mut readers = Vec::with_capacity(cpus.len());
    for cpu_id in cpus {
        let mut buf = perf_array
            .open(cpu_id, pages)
            .map_err(|e| Error::map(map, e))?;
        let queue = queue.clone();
        let notices = notices.clone();

        readers.push(tokio::spawn(async move {
            let mut buffers = (0..READ_BATCH)
                .map(|_| BytesMut::with_capacity(ACCT_EVENT_LEN + 8))
                .collect::<Vec<_>>();

            loop {
                let events = match buf.read_events(&mut buffers).await {
                    Ok(events) => events,
                    Err(e) => {
                        error!("Error reading {} on CPU {}: {}", map, cpu_id, e);
                        let _ = notices
                            .send(PerfNotice::ReadError {
                                map,
                                cpu: cpu_id,
                                error: e.to_string(),
                            })
                            .await;
                        return;
                    }
                };

                if events.lost > 0
                    && notices
                        .send(PerfNotice::Lost(events.lost as u64))
                        .await
                        .is_err()
                {
                    break;
                }

                for sample in buffers.iter_mut().take(events.read) {
                    let record = trim_sample(sample.split().freeze());
                    if queue.send(record).await.is_err() {
                        debug!("{} reader on CPU {} exiting", map, cpu_id);
                        return;
                    }
                }
            }
        }));
    }

    Ok(readers)
}

/// Strip perf alignment padding from a raw sample.
///
/// The kernel pads each raw sample so that it and its u32 size header end
/// on an 8-byte boundary, so a record can arrive with up to 7 trailing
/// bytes. Anything longer is left for the decoder to reject.
pub(crate) fn trim_sample(mut sample: Bytes) -> Bytes {
    if sample.len() > ACCT_EVENT_LEN && sample.len() - ACCT_EVENT_LEN < 8 {
        sample.truncate(ACCT_EVENT_LEN);
    }
    sample
}
