use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::{debug, trace, warn, Instrument};

use super::{
    channel::Channel,
    endpoint::Shared,
    error::Error,
    partition::Partition,
    registry::EventKind,
};

#[derive(Default)]
struct Counts {
    assigned: usize,
    /// Idle workers nobody claimed yet.
    idle: usize,
    /// Claims handed to idle workers that haven't picked them up.
    wakeups: usize,
    assigned_limit: usize,
    idle_limit: usize,
    closing: bool,
}

/// Delivery workers of one channel.
#[derive(Default)]
pub(crate) struct WorkerPool {
    counts: Mutex<Counts>,
    wake: Notify,
}

impl WorkerPool {
    fn counts(&self) -> MutexGuard<'_, Counts> {
        self.counts.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn assigned(&self) -> usize {
        self.counts().assigned
    }

    pub(crate) fn idle(&self) -> usize {
        let counts = self.counts();
        counts.idle + counts.wakeups
    }

    /// Reopens the pool for a new connection.
    pub(crate) fn reset(&self, assigned_limit: usize, idle_limit: usize) {
        let mut counts = self.counts();
        counts.assigned_limit = assigned_limit;
        counts.idle_limit = idle_limit;
        counts.closing = false;
    }

    /// Tells every worker to leave as soon as it notices.
    pub(crate) fn close(&self) {
        let mut counts = self.counts();
        counts.closing = true;
        counts.idle += std::mem::take(&mut counts.wakeups);
        drop(counts);
        self.wake.notify_waiters();
    }

    /// Wakes up to `needed` idle workers and reserves room for the rest,
    /// capped by the assigned limit. Returns how many workers the caller must
    /// start, or `None` once the pool is closing.
    fn claim(&self, needed: usize) -> Option<usize> {
        let (woken, spawn) = {
            let mut counts = self.counts();
            if counts.closing {
                return None;
            }
            let woken = needed.min(counts.idle);
            counts.idle -= woken;
            counts.wakeups += woken;
            let room = counts.assigned_limit.saturating_sub(counts.assigned);
            let spawn = (needed - woken).min(room);
            counts.assigned += spawn;
            (woken, spawn)
        };
        for _ in 0..woken {
            self.wake.notify_one();
        }
        Some(spawn)
    }

    /// Makes sure `needed` workers are on the channel: idle workers are woken
    /// first, then new ones are started up to the channel's limit.
    pub(crate) fn request(
        &self,
        shared: &Arc<Shared>,
        part: &Arc<Partition>,
        ch: &Arc<Channel>,
        needed: u64,
    ) {
        let needed = usize::try_from(needed).unwrap_or(usize::MAX);
        let Some(spawn) = self.claim(needed) else {
            return;
        };

        for started in 0..spawn {
            if !shared.acquire_worker() {
                let starved = {
                    let mut counts = self.counts();
                    counts.assigned -= spawn - started;
                    counts.assigned < counts.idle_limit.max(1)
                };
                if starved {
                    warn!(
                        partid = ch.partid,
                        channel = ch.number,
                        "no worker available for channel"
                    );
                    ch.begin_disconnect(Error::ResourceExhausted);
                } else {
                    debug!(partid = ch.partid, channel = ch.number, "worker budget exhausted");
                }
                return;
            }
            let span = tracing::debug_span!("worker", partid = ch.partid, channel = ch.number);
            tokio::spawn(
                deliver(shared.clone(), part.clone(), ch.clone()).instrument(span),
            );
        }
    }
}

/// Keeps a worker's place in its pool and the global budget until the task
/// ends, however it ends.
struct Assignment {
    shared: Arc<Shared>,
    part: Arc<Partition>,
    ch: Arc<Channel>,
}

impl Drop for Assignment {
    fn drop(&mut self) {
        let last = {
            let mut counts = self.ch.pool.counts();
            counts.assigned -= 1;
            counts.closing && counts.assigned == 0
        };
        self.shared.release_worker();
        if last {
            self.part.wake();
        }
    }
}

enum Next {
    Deliver,
    Leave,
}

/// Drains the channel, then waits for more or for the channel to close.
async fn deliver(shared: Arc<Shared>, part: Arc<Partition>, ch: Arc<Channel>) {
    let _assignment = Assignment {
        shared,
        part,
        ch: ch.clone(),
    };
    trace!("worker started");
    loop {
        loop {
            if ch.pool.counts().closing {
                return;
            }
            match ch.next_message() {
                Ok(Some(delivery)) => delivery.registration.notify(
                    ch.partid,
                    ch.number,
                    EventKind::Message {
                        id: delivery.id,
                        payload: delivery.payload,
                    },
                ),
                Ok(None) => break,
                Err(e) => {
                    debug!("delivery stopped: {e}");
                    return;
                }
            }
        }
        if let Next::Leave = idle(&ch).await {
            trace!("worker retiring");
            return;
        }
    }
}

async fn idle(ch: &Channel) -> Next {
    let pool = &ch.pool;
    let wake = pool.wake.notified();
    tokio::pin!(wake);
    wake.as_mut().enable();
    {
        let mut counts = pool.counts();
        // woken workers that haven't picked up their claim still count
        if counts.closing || counts.idle + counts.wakeups >= counts.idle_limit {
            return Next::Leave;
        }
        counts.idle += 1;
    }
    loop {
        // messages may have shown up while nobody was idle to take them
        if ch.undelivered() > 0 && unidle(pool) {
            return Next::Deliver;
        }
        wake.as_mut().await;
        {
            let mut counts = pool.counts();
            if counts.closing {
                counts.idle -= 1;
                return Next::Leave;
            }
            if counts.wakeups > 0 {
                counts.wakeups -= 1;
                return Next::Deliver;
            }
        }
        wake.set(pool.wake.notified());
        wake.as_mut().enable();
    }
}

/// Leaves the idle set on the worker's own initiative. Consumes a pending
/// claim if a requester got there first.
fn unidle(pool: &WorkerPool) -> bool {
    let mut counts = pool.counts();
    if counts.closing {
        return false;
    }
    if counts.wakeups > 0 {
        counts.wakeups -= 1;
    } else {
        counts.idle -= 1;
    }
    true
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::xpc::{fabric::Fabric, machine::Machine};

    fn channel(assigned_limit: usize, idle_limit: usize) -> Arc<Channel> {
        let machine = Machine::new(2);
        let fabric: Arc<dyn Fabric> = machine.port(0);
        let ch = Arc::new(Channel::new(1, 0, fabric));
        ch.pool.reset(assigned_limit, idle_limit);
        ch
    }

    async fn until_idle(ch: &Channel, idle: usize) {
        timeout(Duration::from_secs(1), async {
            while ch.pool.idle() != idle {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn new_workers_are_capped_by_the_assigned_limit() {
        let ch = channel(3, 1);
        assert_eq!(ch.pool.claim(5), Some(3));
        assert_eq!(ch.pool.assigned(), 3);
        assert_eq!(ch.pool.claim(2), Some(0));
        assert_eq!(ch.pool.assigned(), 3);

        ch.pool.close();
        assert_eq!(ch.pool.claim(1), None);
    }

    #[tokio::test]
    async fn idle_workers_are_woken_before_new_ones_start() {
        let ch = channel(4, 1);
        ch.pool.claim(1);
        let worker = {
            let ch = ch.clone();
            tokio::spawn(async move { matches!(idle(&ch).await, Next::Deliver) })
        };
        until_idle(&ch, 1).await;

        assert_eq!(ch.pool.claim(3), Some(2));
        assert!(timeout(Duration::from_secs(1), worker).await.unwrap().unwrap());
        assert_eq!(ch.pool.idle(), 0);
        assert_eq!(ch.pool.assigned(), 3);
    }

    #[tokio::test]
    async fn unclaimed_wakeups_count_as_idle() {
        let ch = channel(4, 1);
        let woken = {
            let ch = ch.clone();
            tokio::spawn(async move { idle(&ch).await })
        };
        until_idle(&ch, 1).await;
        {
            let mut counts = ch.pool.counts();
            counts.idle -= 1;
            counts.wakeups += 1;
        }
        assert!(matches!(idle(&ch).await, Next::Leave));
        assert_eq!(ch.pool.idle(), 1);
        ch.pool.wake.notify_one();
        assert!(matches!(
            timeout(Duration::from_secs(1), woken).await.unwrap().unwrap(),
            Next::Deliver
        ));
    }

    #[tokio::test]
    async fn workers_beyond_the_idle_limit_retire() {
        let ch = channel(4, 1);
        let first = {
            let ch = ch.clone();
            tokio::spawn(async move { matches!(idle(&ch).await, Next::Leave) })
        };
        until_idle(&ch, 1).await;
        assert!(matches!(idle(&ch).await, Next::Leave));
        assert_eq!(ch.pool.idle(), 1);

        let none = channel(4, 0);
        assert!(matches!(idle(&none).await, Next::Leave));
        assert_eq!(none.pool.idle(), 0);

        ch.pool.close();
        assert!(timeout(Duration::from_secs(1), first).await.unwrap().unwrap());
        assert_eq!(ch.pool.idle(), 0);
    }
}
