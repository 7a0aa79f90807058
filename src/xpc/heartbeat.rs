use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Instant,
};

use tokio::{
    select,
    sync::{watch, Notify},
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use super::{
    endpoint::Shared,
    error::{Error, Result},
    partition::ActState,
    reserved::ReservedPage,
    PartId,
};

/// What a remote looked like at the last check.
#[derive(Clone, Copy, Debug, Default)]
struct Sample {
    stamp: Option<i64>,
    heartbeat: Option<u64>,
    /// Consecutive checks without a change.
    misses: u32,
}

pub(crate) struct HeartbeatMonitor {
    counter: AtomicU64,
    last_check: Mutex<Option<Instant>>,
    check: Notify,
    samples: Mutex<Vec<Sample>>,
}

impl HeartbeatMonitor {
    pub(crate) fn new(partitions: PartId) -> Self {
        Self {
            counter: AtomicU64::new(0),
            last_check: Mutex::new(None),
            check: Notify::new(),
            samples: Mutex::new(vec![Sample::default(); partitions as usize]),
        }
    }

    fn samples(&self) -> MutexGuard<'_, Vec<Sample>> {
        self.samples.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn last_check(&self) -> MutexGuard<'_, Option<Instant>> {
        self.last_check.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Advances the local heartbeat. Wakes the checker once a check is due.
    pub(crate) fn tick(&self, shared: &Shared) {
        let beat = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        shared.fabric.set_heartbeat(beat);
        let due = self
            .last_check()
            .map_or(true, |at| at.elapsed() >= shared.config.heartbeat_check_interval);
        if due {
            self.check.notify_one();
        }
    }

    /// Compares every remote heartbeat with its previous sample. Inactive
    /// partitions that show signs of life get activated, active ones that
    /// went quiet for too long get deactivated.
    pub(crate) fn check_remote_heartbeats(&self, shared: &Arc<Shared>) {
        *self.last_check() = Some(Instant::now());
        let threshold = shared.config.missed_heartbeats;

        for part in &shared.partitions {
            if part.id == shared.fabric.local() {
                continue;
            }
            let observed = observe(shared, part.id);
            let previous = self.samples()[part.id as usize];
            let mut sample = previous;

            match part.state() {
                ActState::Inactive | ActState::Deactivating => match observed {
                    Ok((stamp, beat)) => {
                        let alive = previous.stamp == Some(stamp)
                            && previous.heartbeat.map_or(false, |b| b != beat);
                        sample = Sample {
                            stamp: Some(stamp),
                            heartbeat: Some(beat),
                            misses: 0,
                        };
                        if alive {
                            shared.request_activation(part);
                        }
                    }
                    Err(Error::ProtocolVersionMismatch) => {
                        if previous.misses == 0 {
                            debug!(
                                partid = part.id,
                                "ignoring partition with foreign protocol version"
                            );
                        }
                        sample = Sample {
                            misses: previous.misses.saturating_add(1),
                            ..Sample::default()
                        };
                    }
                    Err(_) => sample = Sample::default(),
                },
                ActState::ActivationRequested | ActState::Activating | ActState::Active => {
                    match observed {
                        Ok((stamp, _)) if previous.stamp.map_or(false, |s| s != stamp) => {
                            info!(partid = part.id, "partition rebooted");
                            part.deactivate(Error::PartitionDown);
                            shared.request_activation(part);
                            sample = Sample {
                                stamp: Some(stamp),
                                heartbeat: None,
                                misses: 0,
                            };
                        }
                        Ok((stamp, beat)) => {
                            sample.stamp = Some(stamp);
                            if previous.heartbeat == Some(beat) {
                                sample.misses += 1;
                            } else {
                                sample.misses = 0;
                            }
                            sample.heartbeat = Some(beat);
                        }
                        Err(_) => sample.misses += 1,
                    }
                    if sample.misses >= threshold {
                        warn!(
                            partid = part.id,
                            "no heartbeat for {:?}, deactivating",
                            shared.config.heartbeat_timeout()
                        );
                        part.deactivate(Error::PartitionDown);
                        sample.misses = 0;
                    }
                }
            }
            self.samples()[part.id as usize] = sample;
        }
    }
}

/// Reads the boot stamp and heartbeat of `partid`. Any failure counts as no
/// heartbeat.
fn observe(shared: &Shared, partid: PartId) -> Result<(i64, u64)> {
    let page = ReservedPage::decode(&shared.fabric.reserved_page(partid)?)?;
    if page.partid != partid {
        return Err(Error::CorruptDescriptor);
    }
    let beat = shared.fabric.heartbeat(partid, page.vars_location)?;
    Ok((page.stamp, beat))
}

/// The heartbeat task.
pub(crate) async fn run(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut beat = interval(shared.config.heartbeat_interval);
    beat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let monitor = &shared.heartbeat;
    loop {
        select! {
            _ = beat.tick() => monitor.tick(&shared),
            _ = monitor.check.notified() => monitor.check_remote_heartbeats(&shared),
            _ = shutdown.changed() => break,
        }
    }
    debug!("heartbeat task stopped");
}
