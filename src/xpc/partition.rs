use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc, Mutex, MutexGuard,
};

use tokio::sync::{watch, Notify};
use tracing::debug;

use super::{
    channel::Channel,
    error::{Error, Result},
    fabric::Fabric,
    ChannelId, PartId, MAX_CHANNELS,
};

/// Activation state of one remote partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActState {
    Inactive,
    ActivationRequested,
    Activating,
    Active,
    Deactivating,
}

#[derive(Default)]
struct Activation {
    /// Why the current activation is ending. The first reason wins.
    reason: Option<Error>,
    /// Why the previous activation ended.
    last_reason: Option<Error>,
    /// Set when activation was requested again while still deactivating.
    reactivate: bool,
    affinity: Option<usize>,
    /// Boot stamp of the remote, fixed for one activation.
    remote_stamp: Option<i64>,
    activations: u64,
    /// The endpoint is going away; no activation is ever started again.
    unloading: bool,
}

/// Everything we know about one remote partition. Records are created once
/// per possible ID and live as long as the endpoint.
pub(crate) struct Partition {
    pub(crate) id: PartId,
    state: watch::Sender<ActState>,
    // transitions of `state` happen with this held
    activation: Mutex<Activation>,
    refs: AtomicUsize,
    refs_idle: Notify,
    wake_requests: AtomicU64,
    wake: Notify,
    /// Doorbell bits seen by the notification layer, not yet handled.
    pending: AtomicU64,
    pub(crate) channels: Vec<Arc<Channel>>,
}

impl Partition {
    pub(crate) fn new(id: PartId, fabric: &Arc<dyn Fabric>) -> Self {
        Self {
            id,
            state: watch::channel(ActState::Inactive).0,
            activation: Mutex::new(Activation::default()),
            refs: AtomicUsize::new(0),
            refs_idle: Notify::new(),
            wake_requests: AtomicU64::new(0),
            wake: Notify::new(),
            pending: AtomicU64::new(0),
            channels: (0..MAX_CHANNELS)
                .map(|ch| Arc::new(Channel::new(id, ch as ChannelId, fabric.clone())))
                .collect(),
        }
    }

    fn activation(&self) -> MutexGuard<'_, Activation> {
        self.activation.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn state(&self) -> ActState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ActState> {
        self.state.subscribe()
    }

    pub(crate) fn reason(&self) -> Option<Error> {
        self.activation().reason
    }

    /// The current deactivation reason, or else the one that ended the
    /// previous activation.
    pub(crate) fn last_reason(&self) -> Option<Error> {
        let act = self.activation();
        act.reason.or(act.last_reason)
    }

    pub(crate) fn affinity(&self) -> Option<usize> {
        self.activation().affinity
    }

    pub(crate) fn activations(&self) -> u64 {
        self.activation().activations
    }

    pub(crate) fn remote_stamp(&self) -> Option<i64> {
        self.activation().remote_stamp
    }

    pub(crate) fn channel(&self, channel: ChannelId) -> Result<&Arc<Channel>> {
        self.channels
            .get(channel as usize)
            .ok_or(Error::InvalidChannel)
    }

    /// Moves an inactive partition to `ActivationRequested`. Returns true
    /// when the caller must spawn the activation task. A partition that is
    /// still deactivating remembers the request instead.
    pub(crate) fn request_activation(&self) -> bool {
        let mut act = self.activation();
        if act.unloading {
            return false;
        }
        match self.state() {
            ActState::Inactive => {
                act.reason = None;
                act.reactivate = false;
                self.state.send_replace(ActState::ActivationRequested);
                true
            }
            ActState::Deactivating => {
                if !act.reactivate {
                    debug!(partid = self.id, "reactivation requested while deactivating");
                }
                act.reactivate = true;
                false
            }
            _ => false,
        }
    }

    /// The activation task claims the request.
    pub(crate) fn claim_activation(&self, affinity: usize) -> bool {
        let mut act = self.activation();
        if self.state() != ActState::ActivationRequested {
            return false;
        }
        act.affinity = Some(affinity);
        act.remote_stamp = None;
        self.state.send_replace(ActState::Activating);
        true
    }

    /// Completes the handshake. Fails when a deactivation got in first.
    pub(crate) fn mark_active(&self, remote_stamp: i64) -> bool {
        let mut act = self.activation();
        if self.state() != ActState::Activating {
            return false;
        }
        act.remote_stamp = Some(remote_stamp);
        act.activations += 1;
        self.state.send_replace(ActState::Active);
        true
    }

    /// Starts tearing the partition down. Only the first reason of a cycle is
    /// kept. Returns false when there was nothing to deactivate.
    pub(crate) fn deactivate(&self, reason: Error) -> bool {
        let started = self.deactivate_locked(&mut self.activation(), reason);
        if started {
            debug!(partid = self.id, %reason, "deactivating");
            self.wake();
        }
        started
    }

    /// Deactivates with `Unloading` and refuses every later activation
    /// request, in one step so a request racing the unload can't slip in.
    pub(crate) fn unload(&self) -> bool {
        let started = {
            let mut act = self.activation();
            act.unloading = true;
            act.reactivate = false;
            self.deactivate_locked(&mut act, Error::Unloading)
        };
        if started {
            debug!(partid = self.id, "unloading");
            self.wake();
        }
        started
    }

    fn deactivate_locked(&self, act: &mut Activation, reason: Error) -> bool {
        match self.state() {
            ActState::ActivationRequested | ActState::Activating | ActState::Active => {
                act.reason.get_or_insert(reason);
                self.state.send_replace(ActState::Deactivating);
                true
            }
            ActState::Deactivating => {
                act.reason.get_or_insert(reason);
                false
            }
            ActState::Inactive => false,
        }
    }

    /// Back to `Inactive`. Returns whether activation was requested while
    /// the partition was going down.
    pub(crate) fn finish_deactivation(&self) -> bool {
        let mut act = self.activation();
        act.affinity = None;
        act.remote_stamp = None;
        if let Some(reason) = act.reason.take() {
            act.last_reason = Some(reason);
        }
        self.state.send_replace(ActState::Inactive);
        std::mem::take(&mut act.reactivate)
    }

    /// Takes a reference that keeps the partition from finishing its
    /// teardown. Only active partitions hand out references.
    pub(crate) fn pin(self: &Arc<Self>) -> Result<PartitionRef> {
        self.refs.fetch_add(1, Ordering::SeqCst);
        let guard = PartitionRef { part: self.clone() };
        if self.state() != ActState::Active {
            return Err(Error::PartitionDown);
        }
        Ok(guard)
    }

    pub(crate) fn refs(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    /// Waits until every reference is dropped.
    pub(crate) async fn unpinned(&self) {
        loop {
            let idle = self.refs_idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.refs() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Asks the partition's task for another pass.
    pub(crate) fn wake(&self) {
        self.wake_requests.fetch_add(1, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub(crate) fn take_wake_requests(&self) -> u64 {
        self.wake_requests.swap(0, Ordering::SeqCst)
    }

    pub(crate) async fn woken(&self) {
        self.wake.notified().await
    }

    pub(crate) fn add_pending(&self, bits: u64) {
        self.pending.fetch_or(bits, Ordering::SeqCst);
    }

    pub(crate) fn take_pending(&self) -> u64 {
        self.pending.swap(0, Ordering::SeqCst)
    }
}

/// A counted reference to an active partition, released on drop.
pub(crate) struct PartitionRef {
    part: Arc<Partition>,
}

impl Drop for PartitionRef {
    fn drop(&mut self) {
        if self.part.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.part.refs_idle.notify_waiters();
        }
    }
}

/// Deterministic round robin over the processing units that aren't
/// disabled.
#[derive(Default)]
pub(crate) struct AffinityCursor {
    next: usize,
}

impl AffinityCursor {
    pub(crate) fn pick(&mut self, units: usize, disabled: &[usize]) -> Option<usize> {
        for _ in 0..units {
            let unit = self.next % units;
            self.next = (unit + 1) % units;
            if !disabled.contains(&unit) {
                return Some(unit);
            }
        }
        None
    }
}
