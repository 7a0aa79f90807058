use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tokio::{
    select,
    sync::{mpsc, watch},
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, trace};

use super::{endpoint::Shared, error::Result, fabric::Fabric, PartId};

/// Counters of the notification layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NotifyStats {
    /// Interrupts received.
    pub interrupts: u64,
    /// Periodic rechecks run.
    pub rechecks: u64,
    /// Doorbells found set by either kind of scan.
    pub signals: u64,
    /// Doorbells only the periodic recheck found.
    pub recovered: u64,
}

#[derive(Default)]
pub(crate) struct NotifyCounters {
    interrupts: AtomicU64,
    rechecks: AtomicU64,
    signals: AtomicU64,
    recovered: AtomicU64,
}

impl NotifyCounters {
    pub(crate) fn snapshot(&self) -> NotifyStats {
        NotifyStats {
            interrupts: self.interrupts.load(Ordering::Relaxed),
            rechecks: self.rechecks.load(Ordering::Relaxed),
            signals: self.signals.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
        }
    }
}

/// Signals `partid`: sets `bits` in the doorbell it keeps for us, then
/// interrupts it unless those bits were already pending there.
pub(crate) fn signal(fabric: &dyn Fabric, partid: PartId, bits: u64) -> Result<()> {
    let before = fabric.ring(partid, bits)?;
    if before & bits != bits {
        fabric.interrupt(partid);
    } else {
        trace!("doorbell {bits:#x} already pending at {partid}");
    }
    Ok(())
}

/// Reads and clears every doorbell, handing the bits to the partitions that
/// rang them. Returns how many partitions had rung.
fn scan(shared: &Shared) -> u64 {
    let mut found = 0;
    for part in &shared.partitions {
        if part.id == shared.fabric.local() {
            continue;
        }
        let bits = shared.fabric.take_doorbell(part.id);
        if bits != 0 {
            trace!(partid = part.id, "doorbell {bits:#x}");
            part.add_pending(bits);
            part.wake();
            found += 1;
        }
    }
    found
}

async fn next_interrupt(irq: &mut Option<mpsc::UnboundedReceiver<PartId>>) -> Option<PartId> {
    match irq {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// The notification task. Interrupts only say that somebody rang; the
/// doorbells say who. The recheck timer rescans even when no interrupt came.
pub(crate) async fn run(
    shared: Arc<Shared>,
    mut irq: Option<mpsc::UnboundedReceiver<PartId>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut recheck = interval(shared.config.notify_recheck_interval);
    recheck.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let counters = &shared.notify;
    loop {
        select! {
            source = next_interrupt(&mut irq) => match source {
                Some(source) => {
                    trace!("interrupt from {source}");
                    counters.interrupts.fetch_add(1, Ordering::Relaxed);
                    let found = scan(&shared);
                    counters.signals.fetch_add(found, Ordering::Relaxed);
                }
                None => {
                    debug!("interrupt line closed, relying on rechecks");
                    irq = None;
                }
            },
            _ = recheck.tick() => {
                counters.rechecks.fetch_add(1, Ordering::Relaxed);
                let found = scan(&shared);
                if found > 0 {
                    trace!("recheck found {found} doorbells");
                    counters.signals.fetch_add(found, Ordering::Relaxed);
                    counters.recovered.fetch_add(found, Ordering::Relaxed);
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("notification task stopped");
}
