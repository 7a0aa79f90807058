//! One channel towards one remote partition.
//!
//! Both sides publish a `ChannelCtl` and read the other's. A side that wants
//! the channel open picks a fresh generation, resets its index pair,
//! allocates its slot ring and publishes `open`. Each side acknowledges the
//! generation it last saw from the peer; the channel is connected once both
//! acknowledge each other's current generation, and falls apart as soon as
//! that stops being true.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{futures::Notified, watch, Notify};
use tracing::{debug, info, trace, warn};

use super::{
    activation::check_remote,
    channel_bit,
    endpoint::Shared,
    error::{Error, Result},
    fabric::{Fabric, Region},
    notify::signal,
    partition::{ActState, Partition},
    queue::{Inbound, Outbound},
    registry::{EventKind, MsgId, Registration},
    wire::{
        decode_frame, encode_frame, ChannelCtl, GetPut, SlotHeader, FRAME_LEN, GP_LEN,
        SLOT_HEADER_LEN, SLOT_NOOP, SLOT_READY,
    },
    workers::WorkerPool,
    ChannelId, PartId,
};

/// Runs once when the peer consumed a sent message, or with the disconnect
/// reason if the channel went away first.
pub(crate) type Callout = Box<dyn FnOnce(Result<()>) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Disconnected,
    /// Our side is open, waiting for the peer.
    Connecting,
    Connected,
    /// Waiting for workers to leave before the final callouts.
    Disconnecting,
}

#[derive(Default)]
struct ChannelState {
    /// The registration this connection was opened for.
    registration: Option<Arc<Registration>>,
    /// What we publish.
    ctl: ChannelCtl,
    /// `Connected` was delivered for the current connection.
    connected: bool,
    reason: Option<Error>,
    outbound: Option<Outbound<Callout>>,
    inbound: Option<Inbound>,
}

/// A message a worker is about to deliver.
pub(crate) struct Delivery {
    pub(crate) id: MsgId,
    pub(crate) payload: Vec<u8>,
    pub(crate) registration: Arc<Registration>,
}

/// A point-in-time view of a channel, for introspection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelStats {
    pub phase: Phase,
    pub assigned_workers: usize,
    pub idle_workers: usize,
    /// Our produced, published index.
    pub put: u64,
    /// How far the peer consumed our queue.
    pub acked: u64,
    /// How far we consumed the peer's queue.
    pub get: u64,
    pub remote_put: u64,
}

pub(crate) struct Channel {
    pub(crate) partid: PartId,
    pub(crate) number: ChannelId,
    fabric: Arc<dyn Fabric>,
    state: Mutex<ChannelState>,
    phase: watch::Sender<Phase>,
    /// Woken whenever slots may have been freed.
    space: Notify,
    pub(crate) pool: WorkerPool,
}

impl Channel {
    pub(crate) fn new(partid: PartId, number: ChannelId, fabric: Arc<dyn Fabric>) -> Self {
        Self {
            partid,
            number,
            fabric,
            state: Mutex::new(ChannelState::default()),
            phase: watch::channel(Phase::Disconnected).0,
            space: Notify::new(),
            pool: WorkerPool::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub(crate) fn bit(&self) -> u64 {
        channel_bit(self.number)
    }

    fn local(&self, region: fn(PartId, ChannelId) -> Region) -> Region {
        region(self.partid, self.number)
    }

    fn remote(&self, region: fn(PartId, ChannelId) -> Region) -> Region {
        region(self.fabric.local(), self.number)
    }

    fn publish_ctl(&self, ctl: &ChannelCtl) -> Result<()> {
        self.fabric
            .write(self.local(ctl_region), 0, &encode_frame(ctl)?)
    }

    fn remote_ctl(&self) -> Result<ChannelCtl> {
        let Some(bytes) = self
            .fabric
            .pull(self.partid, self.remote(ctl_region), 0, FRAME_LEN)?
        else {
            return Ok(ChannelCtl::default());
        };
        Ok(decode_frame(&bytes).unwrap_or_else(|e| {
            debug!(partid = self.partid, channel = self.number, "unreadable channel state: {e}");
            ChannelCtl::default()
        }))
    }

    fn remote_gp(&self) -> Result<GetPut> {
        match self
            .fabric
            .pull(self.partid, self.remote(gp_region), 0, GP_LEN)?
        {
            Some(bytes) => GetPut::decode(&bytes),
            None => Ok(GetPut::default()),
        }
    }

    fn write_gp(&self, state: &ChannelState) -> Result<()> {
        let gp = GetPut {
            get: state.inbound.as_ref().map_or(0, |i| i.get()),
            put: state.outbound.as_ref().map_or(0, |o| o.put()),
        };
        self.fabric.write(self.local(gp_region), 0, &gp.encode())
    }

    fn ring(&self) -> Result<()> {
        signal(&*self.fabric, self.partid, self.bit())
    }

    /// One channel manager step. Errors mean the remote partition can't be
    /// reached.
    pub(crate) fn process(
        self: &Arc<Self>,
        shared: &Arc<Shared>,
        part: &Arc<Partition>,
    ) -> Result<()> {
        let closing = match part.state() {
            ActState::Active => None,
            _ => Some(part.reason().unwrap_or(Error::PartitionDown)),
        };
        match self.phase() {
            Phase::Disconnected => {
                if closing.is_none() {
                    self.open(shared)?;
                }
            }
            Phase::Connecting | Phase::Connected => {
                if let Some(reason) = closing {
                    self.begin_disconnect(reason);
                } else if !self.registered(shared) {
                    self.begin_disconnect(Error::Unregistering);
                } else {
                    self.exchange(shared, part)?;
                }
            }
            Phase::Disconnecting => {}
        }
        if self.phase() == Phase::Disconnecting {
            self.finish_disconnect(part);
        }
        Ok(())
    }

    fn registered(&self, shared: &Shared) -> bool {
        let current = shared.registry.get(self.number);
        match (&self.state().registration, current) {
            (Some(ours), Some(current)) => Arc::ptr_eq(ours, &current),
            _ => false,
        }
    }

    fn open(&self, shared: &Shared) -> Result<()> {
        // connect and disconnect hold this while they change the registry
        let Some(_guard) = shared.registry.try_lock(self.number) else {
            return Ok(());
        };
        let Some(registration) = shared.registry.get(self.number) else {
            return Ok(());
        };
        let remote = self.remote_ctl()?;
        if remote.open && remote.payload_size as usize != registration.payload_size {
            trace!(
                partid = self.partid,
                channel = self.number,
                "peer is open with {} byte payloads, not opening",
                remote.payload_size
            );
            return Ok(());
        }

        let mut state = self.state();
        let mut generation = rand::random::<u32>();
        while generation == 0 || generation == state.ctl.generation {
            generation = rand::random();
        }
        let outbound = Outbound::new(registration.queue_depth, registration.payload_size);
        let ctl = ChannelCtl {
            open: true,
            generation,
            ack: 0,
            payload_size: registration.payload_size as u32,
            depth: registration.queue_depth,
        };
        let allocated = self
            .fabric
            .alloc(self.local(slots_region), outbound.region_len())
            .and_then(|_| self.fabric.alloc(self.local(gp_region), GP_LEN))
            .and_then(|_| self.publish_ctl(&ctl));
        if let Err(e) = allocated {
            warn!(
                partid = self.partid,
                channel = self.number,
                "can't set up channel queues: {e}"
            );
            self.fabric.free(self.local(slots_region));
            self.fabric.free(self.local(gp_region));
            return Ok(());
        }

        self.pool
            .reset(registration.assigned_limit, registration.idle_limit);
        *state = ChannelState {
            registration: Some(registration),
            ctl,
            connected: false,
            reason: None,
            outbound: Some(outbound),
            inbound: None,
        };
        self.phase.send_replace(Phase::Connecting);
        drop(state);

        debug!(
            partid = self.partid,
            channel = self.number,
            "opening generation {generation:08x}"
        );
        self.ring()
    }

    /// Compares our control block with the peer's and moves the connection
    /// along.
    fn exchange(self: &Arc<Self>, shared: &Arc<Shared>, part: &Arc<Partition>) -> Result<()> {
        let remote = self.remote_ctl()?;
        let mut state = self.state();
        let Some(registration) = state.registration.clone() else {
            return Ok(());
        };

        match self.phase() {
            Phase::Connecting => {
                if !remote.open {
                    return Ok(());
                }
                if remote.payload_size != state.ctl.payload_size {
                    drop(state);
                    warn!(
                        partid = self.partid,
                        channel = self.number,
                        "peer uses {} byte payloads, we use {}",
                        remote.payload_size,
                        registration.payload_size
                    );
                    self.begin_disconnect(Error::PayloadSizeMismatch);
                    return Ok(());
                }
                let acked = state.ctl.ack != remote.generation;
                if acked {
                    state.ctl.ack = remote.generation;
                    self.publish_ctl(&state.ctl)?;
                }
                if remote.ack != state.ctl.generation || remote.depth == 0 {
                    drop(state);
                    return if acked { self.ring() } else { Ok(()) };
                }
                state.inbound = Some(Inbound::new(remote.depth, registration.payload_size));
                state.connected = true;
                self.phase.send_replace(Phase::Connected);
                drop(state);
                if acked {
                    self.ring()?;
                }
                info!(partid = self.partid, channel = self.number, "channel connected");
                registration.notify(self.partid, self.number, EventKind::Connected);
            }
            Phase::Connected => {
                let stale = !remote.open
                    || remote.generation != state.ctl.ack
                    || remote.ack != state.ctl.generation;
                drop(state);
                if stale {
                    // a peer partition going away takes precedence
                    check_remote(shared, part)?;
                    self.begin_disconnect(Error::NotConnected);
                    return Ok(());
                }
            }
            _ => return Ok(()),
        }
        self.refresh(shared, part)
    }

    /// Pulls the peer's indices: acknowledges what it consumed and asks for
    /// workers for what it produced.
    fn refresh(self: &Arc<Self>, shared: &Arc<Shared>, part: &Arc<Partition>) -> Result<()> {
        let gp = self.remote_gp()?;
        let (callouts, waiting) = {
            let mut state = self.state();
            if self.phase() != Phase::Connected {
                return Ok(());
            }
            let callouts = self.apply_get(&mut state, gp.get);
            let waiting = match state.inbound.as_mut() {
                Some(inbound) => {
                    inbound.update_put(gp.put);
                    inbound.undelivered()
                }
                None => 0,
            };
            (callouts, waiting)
        };
        for callout in callouts {
            callout(Ok(()));
        }
        if waiting > 0 {
            trace!(partid = self.partid, channel = self.number, "{waiting} messages waiting");
            self.pool.request(shared, part, self, waiting);
        }
        Ok(())
    }

    fn apply_get(&self, state: &mut ChannelState, get: u64) -> Vec<Callout> {
        let Some(outbound) = state.outbound.as_mut() else {
            return Vec::new();
        };
        let before = outbound.acked();
        let callouts = outbound.acknowledge(get);
        if outbound.acked() != before {
            self.space.notify_waiters();
        }
        callouts
    }

    /// Picks up the peer's consumption progress outside of the manager's
    /// passes, for allocators waiting on a full queue.
    pub(crate) fn pull_acks(&self) -> Result<()> {
        let gp = self.remote_gp()?;
        let callouts = {
            let mut state = self.state();
            if self.phase() != Phase::Connected {
                return Err(Error::NotConnected);
            }
            self.apply_get(&mut state, gp.get)
        };
        for callout in callouts {
            callout(Ok(()));
        }
        Ok(())
    }

    pub(crate) fn begin_disconnect(&self, reason: Error) {
        let ctl = {
            let mut state = self.state();
            if !matches!(self.phase(), Phase::Connecting | Phase::Connected) {
                return;
            }
            state.reason.get_or_insert(reason);
            state.ctl.open = false;
            self.phase.send_replace(Phase::Disconnecting);
            state.ctl
        };
        debug!(partid = self.partid, channel = self.number, %reason, "channel disconnecting");
        self.pool.close();
        self.space.notify_waiters();
        if self.publish_ctl(&ctl).is_ok() {
            let _ = self.ring();
        }
    }

    /// Completes a disconnect once no worker is left: settles every pending
    /// callout, tells the user and frees the queues.
    fn finish_disconnect(&self, part: &Partition) {
        if self.pool.assigned() > 0 {
            return;
        }
        let (callouts, reason, registration) = {
            let mut state = self.state();
            if self.phase() != Phase::Disconnecting {
                return;
            }
            let reason = state.reason.take().unwrap_or(Error::NotConnected);
            let callouts = state
                .outbound
                .take()
                .map(|mut o| o.take_callouts())
                .unwrap_or_default();
            state.inbound = None;
            let connected = std::mem::take(&mut state.connected);
            let registration = state.registration.take().filter(|_| connected);
            (callouts, reason, registration)
        };
        self.fabric.free(self.local(slots_region));
        self.fabric.free(self.local(gp_region));

        for callout in callouts {
            callout(Err(reason));
        }
        if let Some(registration) = registration {
            registration.notify(self.partid, self.number, EventKind::Disconnected(reason));
        }
        info!(partid = self.partid, channel = self.number, %reason, "channel disconnected");
        self.phase.send_replace(Phase::Disconnected);
        part.wake();
    }

    /// Forgets everything published for this channel, at partition teardown.
    pub(crate) fn release(&self) {
        self.fabric.free(self.local(ctl_region));
        self.fabric.free(self.local(slots_region));
        self.fabric.free(self.local(gp_region));
        self.state().ctl = ChannelCtl::default();
    }

    /// Waits for the channel to settle in `Disconnected`.
    pub(crate) async fn disconnected(&self) -> Result<()> {
        let mut phase = self.phase.subscribe();
        phase
            .wait_for(|p| *p == Phase::Disconnected)
            .await?;
        Ok(())
    }

    /// Claims a slot of our outbound queue. Returns the connection
    /// generation, the slot's sequence number and the payload size.
    pub(crate) fn reserve(&self) -> Result<(u32, u64, usize)> {
        let mut state = self.state();
        if self.phase() != Phase::Connected {
            return Err(Error::NotConnected);
        }
        let generation = state.ctl.generation;
        let outbound = state.outbound.as_mut().ok_or(Error::NotConnected)?;
        let seq = outbound.reserve()?;
        Ok((generation, seq, outbound.payload_size()))
    }

    pub(crate) fn space(&self) -> Notified<'_> {
        self.space.notified()
    }

    /// Writes a reserved slot and publishes it once every earlier slot is
    /// published too. `payload` is empty for abandoned reservations.
    pub(crate) fn publish(
        &self,
        generation: u32,
        seq: u64,
        payload: &[u8],
        flags: u8,
        callout: Option<Callout>,
    ) -> Result<()> {
        let mut state = self.state();
        if self.phase() != Phase::Connected || state.ctl.generation != generation {
            return Err(Error::NotConnected);
        }
        let outbound = state.outbound.as_mut().ok_or(Error::NotConnected)?;
        if flags == SLOT_READY && payload.len() != outbound.payload_size() {
            return Err(Error::InvalidArgument);
        }
        let mut slot = vec![0u8; SLOT_HEADER_LEN + payload.len()];
        SlotHeader { seq, flags }.write(&mut slot);
        slot[SLOT_HEADER_LEN..].copy_from_slice(payload);
        self.fabric
            .write(self.local(slots_region), outbound.offset(seq), &slot)?;

        let moved = outbound.mark_ready(seq, callout).is_some();
        if moved {
            self.write_gp(&state)?;
        }
        drop(state);
        if moved {
            self.ring()?;
        }
        Ok(())
    }

    /// Hands the next inbound message to a worker. Abandoned slots are
    /// acknowledged on the spot.
    pub(crate) fn next_message(&self) -> Result<Option<Delivery>> {
        loop {
            let (seq, offset, len, generation, registration) = {
                let mut state = self.state();
                if self.phase() != Phase::Connected {
                    return Ok(None);
                }
                let generation = state.ctl.generation;
                let Some(registration) = state.registration.clone() else {
                    return Ok(None);
                };
                let Some(inbound) = state.inbound.as_mut() else {
                    return Ok(None);
                };
                let Some(seq) = inbound.take_next() else {
                    return Ok(None);
                };
                (seq, inbound.offset(seq), inbound.entry_size(), generation, registration)
            };

            let bytes = match self
                .fabric
                .pull(self.partid, self.remote(slots_region), offset, len)
            {
                Ok(Some(bytes)) => bytes,
                Ok(None) => return Err(self.untake(generation, seq, Error::NotConnected)),
                Err(e) => return Err(self.untake(generation, seq, e)),
            };
            let header = SlotHeader::read(&bytes)?;
            if header.seq != seq {
                return Err(self.untake(generation, seq, Error::NotConnected));
            }
            if header.flags & SLOT_NOOP != 0 {
                trace!(
                    partid = self.partid,
                    channel = self.number,
                    "skipping abandoned slot {seq}"
                );
                self.acknowledge(generation, seq)?;
                continue;
            }
            if header.flags & SLOT_READY == 0 {
                return Err(self.untake(generation, seq, Error::CorruptDescriptor));
            }
            return Ok(Some(Delivery {
                id: MsgId {
                    partid: self.partid,
                    channel: self.number,
                    generation,
                    seq,
                },
                payload: bytes[SLOT_HEADER_LEN..].to_vec(),
                registration,
            }));
        }
    }

    fn untake(&self, generation: u32, seq: u64, e: Error) -> Error {
        let mut state = self.state();
        if state.ctl.generation == generation {
            if let Some(inbound) = state.inbound.as_mut() {
                inbound.untake(seq);
            }
        }
        e
    }

    /// Acknowledges a consumed message and publishes the new get index.
    /// Acknowledging twice is a no-op.
    pub(crate) fn acknowledge(&self, generation: u32, seq: u64) -> Result<()> {
        let mut state = self.state();
        if self.phase() != Phase::Connected || state.ctl.generation != generation {
            return Err(Error::NotConnected);
        }
        if state
            .inbound
            .as_mut()
            .and_then(|i| i.acknowledge(seq))
            .is_none()
        {
            return Ok(());
        }
        self.write_gp(&state)?;
        drop(state);
        self.ring()
    }

    pub(crate) fn undelivered(&self) -> u64 {
        self.state()
            .inbound
            .as_ref()
            .map_or(0, |i| i.undelivered())
    }

    pub(crate) fn stats(&self) -> ChannelStats {
        let state = self.state();
        ChannelStats {
            phase: self.phase(),
            assigned_workers: self.pool.assigned(),
            idle_workers: self.pool.idle(),
            put: state.outbound.as_ref().map_or(0, |o| o.put()),
            acked: state.outbound.as_ref().map_or(0, |o| o.acked()),
            get: state.inbound.as_ref().map_or(0, |i| i.get()),
            remote_put: state.inbound.as_ref().map_or(0, |i| i.remote_put()),
        }
    }
}

fn ctl_region(peer: PartId, channel: ChannelId) -> Region {
    Region::ChannelCtl { peer, channel }
}

fn gp_region(peer: PartId, channel: ChannelId) -> Region {
    Region::Gp { peer, channel }
}

fn slots_region(peer: PartId, channel: ChannelId) -> Region {
    Region::Slots { peer, channel }
}
