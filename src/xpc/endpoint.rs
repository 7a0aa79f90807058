use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use futures::future::join_all;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{timeout, Instant},
};
use tracing::{debug, info};

pub use super::{
    channel::{ChannelStats, Phase},
    notify::NotifyStats,
};
use super::{
    activation,
    channel::{Callout, Channel},
    config::Config,
    error::{Error, Result},
    fabric::Fabric,
    heartbeat::{self, HeartbeatMonitor},
    notify::{self, NotifyCounters},
    partition::{ActState, AffinityCursor, Partition},
    registry::{MsgId, Registration, Registry},
    reserved::ReservedPage,
    wire::{SLOT_NOOP, SLOT_READY},
    ChannelId, PartId, MAX_CHANNELS,
};

/// State shared by every task of one endpoint.
pub(crate) struct Shared {
    pub(crate) fabric: Arc<dyn Fabric>,
    pub(crate) config: Config,
    pub(crate) registry: Registry,
    pub(crate) partitions: Vec<Arc<Partition>>,
    /// Our boot stamp.
    pub(crate) stamp: i64,
    pub(crate) heartbeat: HeartbeatMonitor,
    pub(crate) notify: NotifyCounters,
    affinity: Mutex<AffinityCursor>,
    workers: AtomicUsize,
    unloading: AtomicBool,
}

impl Shared {
    /// Looks up a remote partition. The local ID is not a valid target.
    pub(crate) fn partition(&self, partid: PartId) -> Result<&Arc<Partition>> {
        if partid == self.fabric.local() {
            return Err(Error::InvalidPartition);
        }
        self.partitions
            .get(partid as usize)
            .ok_or(Error::InvalidPartition)
    }

    fn unloading(&self) -> bool {
        self.unloading.load(Ordering::SeqCst)
    }

    /// Spawns the partition's task if it was inactive.
    pub(crate) fn request_activation(self: &Arc<Self>, part: &Arc<Partition>) {
        if self.unloading() {
            return;
        }
        if part.request_activation() {
            debug!(partid = part.id, "activation requested");
            tokio::spawn(activation::run(self.clone(), part.clone()));
        }
    }

    pub(crate) fn pick_affinity(&self) -> Option<usize> {
        self.affinity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pick(self.config.processing_units, &self.config.disabled_units)
    }

    /// Takes a worker out of the endpoint-wide budget.
    pub(crate) fn acquire_worker(&self) -> bool {
        self.workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.config.max_workers).then_some(n + 1)
            })
            .is_ok()
    }

    pub(crate) fn release_worker(&self) {
        self.workers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Microseconds since the Unix epoch, strictly increasing within the process
/// so endpoints started back to back never share a stamp.
fn boot_stamp() -> i64 {
    static LAST: AtomicI64 = AtomicI64::new(0);
    let now = chrono::Utc::now().timestamp_micros();
    let prev = LAST
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
        .unwrap_or(now);
    now.max(prev + 1)
}

/// How `allocate` behaves on a full queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AllocFlags {
    /// Wait a bounded time for a slot.
    #[default]
    Wait,
    /// Fail with `Retry` right away.
    NoWait,
}

/// A reserved outbound slot. The payload is written in place and then
/// handed to `send`. Dropping an unsent handle gives the slot up.
pub struct MsgHandle {
    channel: Arc<Channel>,
    generation: u32,
    seq: u64,
    payload: Vec<u8>,
    sent: bool,
}

impl MsgHandle {
    pub fn partid(&self) -> PartId {
        self.channel.partid
    }

    pub fn channel(&self) -> ChannelId {
        self.channel.number
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The slot's payload, always exactly the channel's payload size.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }
}

impl fmt::Debug for MsgHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgHandle")
            .field("partid", &self.channel.partid)
            .field("channel", &self.channel.number)
            .field("seq", &self.seq)
            .finish()
    }
}

impl Drop for MsgHandle {
    fn drop(&mut self) {
        if !self.sent {
            let _ = self
                .channel
                .publish(self.generation, self.seq, &[], SLOT_NOOP, None);
        }
    }
}

/// Where a partition lives, from its reserved page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Location {
    pub partid: PartId,
    /// The opaque location descriptor the partition advertises.
    pub location: u64,
    /// Boot stamp of the partition, µs since the Unix epoch.
    pub stamp: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartitionInfo {
    pub state: ActState,
    /// Why the partition last went down, if it did.
    pub reason: Option<Error>,
    pub affinity: Option<usize>,
    /// Completed handshakes so far.
    pub activations: u64,
}

/// The messaging core of one partition.
pub struct Endpoint {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Endpoint {
    /// Publishes our reserved page and starts the heartbeat and notification
    /// tasks. Remote partitions are activated as their heartbeats show up.
    pub async fn start(fabric: Arc<dyn Fabric>, config: Config) -> Result<Self> {
        let config = config.bounded();
        let local = fabric.local();
        let stamp = boot_stamp();
        let page = ReservedPage::new(
            local,
            stamp,
            fabric.vars_location(),
            config.location,
            MAX_CHANNELS as u16,
        );
        fabric.publish_reserved_page(&page.encode())?;
        fabric.set_heartbeat(0);

        let partitions = (0..fabric.partitions())
            .map(|id| Arc::new(Partition::new(id, &fabric)))
            .collect();
        let irq = fabric.take_interrupts();
        let shared = Arc::new(Shared {
            heartbeat: HeartbeatMonitor::new(fabric.partitions()),
            fabric,
            config,
            registry: Registry::new(MAX_CHANNELS),
            partitions,
            stamp,
            notify: NotifyCounters::default(),
            affinity: Mutex::new(AffinityCursor::default()),
            workers: AtomicUsize::new(0),
            unloading: AtomicBool::new(false),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(heartbeat::run(shared.clone(), shutdown_rx.clone())),
            tokio::spawn(notify::run(shared.clone(), irq, shutdown_rx)),
        ];
        info!(partid = local, "endpoint started");
        Ok(Self {
            shared,
            shutdown,
            tasks,
        })
    }

    pub fn local(&self) -> PartId {
        self.shared.fabric.local()
    }

    /// Registers interest in `channel` with every partition, present and
    /// future. Connections come up in the background and are announced
    /// through the callback.
    pub async fn connect(&self, channel: ChannelId, registration: Registration) -> Result<()> {
        if self.shared.unloading() {
            return Err(Error::Unloading);
        }
        registration.validate()?;
        {
            let _guard = self.shared.registry.lock(channel).await?;
            self.shared.registry.insert(channel, registration)?;
        }
        debug!(channel, "registered");
        self.wake_active();
        Ok(())
    }

    /// Withdraws the registration of `channel` and waits until every
    /// connection on it is closed, its workers are gone and the last
    /// callouts have returned.
    pub async fn disconnect(&self, channel: ChannelId) -> Result<()> {
        let _guard = self.shared.registry.lock(channel).await?;
        if self.shared.registry.remove(channel).is_none() {
            return Ok(());
        }
        debug!(channel, "unregistering");
        self.wake_active();
        let waits = self
            .shared
            .partitions
            .iter()
            .filter(|part| part.id != self.local())
            .map(|part| part.channels[channel as usize].disconnected());
        join_all(waits)
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;
        debug!(channel, "unregistered");
        Ok(())
    }

    fn wake_active(&self) {
        for part in &self.shared.partitions {
            if part.state() == ActState::Active {
                part.wake();
            }
        }
    }

    /// Reserves a slot on the queue towards `partid`.
    pub async fn allocate(
        &self,
        partid: PartId,
        channel: ChannelId,
        flags: AllocFlags,
    ) -> Result<MsgHandle> {
        if self.shared.unloading() {
            return Err(Error::Unloading);
        }
        let part = self.shared.partition(partid)?;
        let ch = part.channel(channel)?.clone();
        let _pinned = part.pin()?;

        let attempts = match flags {
            AllocFlags::Wait => self.shared.config.allocate_attempts,
            AllocFlags::NoWait => 1,
        };
        let reserve = || {
            ch.reserve().map(|(generation, seq, payload_size)| MsgHandle {
                channel: ch.clone(),
                generation,
                seq,
                payload: vec![0; payload_size],
                sent: false,
            })
        };
        for _ in 0..attempts {
            match reserve() {
                Err(Error::QueueFull) => {}
                result => return result,
            }
            let space = ch.space();
            tokio::pin!(space);
            space.as_mut().enable();
            // the peer may have consumed without telling us yet
            ch.pull_acks()?;
            match reserve() {
                Err(Error::QueueFull) => {}
                result => return result,
            }
            if flags == AllocFlags::NoWait {
                break;
            }
            let _ = timeout(self.shared.config.allocate_backoff, space).await;
        }
        Err(Error::Retry)
    }

    /// Publishes a filled slot.
    pub fn send(&self, partid: PartId, channel: ChannelId, handle: MsgHandle) -> Result<()> {
        self.send_inner(partid, channel, handle, None)
    }

    /// Like `send`; `notify` runs once the peer consumed the message, or with
    /// the disconnect reason if the channel went away first. It is not run
    /// when `send` itself fails.
    pub fn send_with_notify(
        &self,
        partid: PartId,
        channel: ChannelId,
        handle: MsgHandle,
        notify: impl FnOnce(Result<()>) + Send + 'static,
    ) -> Result<()> {
        self.send_inner(partid, channel, handle, Some(Box::new(notify)))
    }

    fn send_inner(
        &self,
        partid: PartId,
        channel: ChannelId,
        mut handle: MsgHandle,
        callout: Option<Callout>,
    ) -> Result<()> {
        if handle.partid() != partid || handle.channel() != channel {
            return Err(Error::InvalidArgument);
        }
        let part = self.shared.partition(partid)?;
        let _pinned = part.pin()?;
        handle.sent = true;
        handle.channel.publish(
            handle.generation,
            handle.seq,
            &handle.payload,
            SLOT_READY,
            callout,
        )
    }

    /// Acknowledges a delivered message so its slot can be reused.
    /// Acknowledging the same message twice is a no-op.
    pub fn received(&self, partid: PartId, channel: ChannelId, id: MsgId) -> Result<()> {
        if id.partid != partid || id.channel != channel {
            return Err(Error::InvalidArgument);
        }
        let part = self.shared.partition(partid)?;
        let ch = part.channel(channel)?;
        let _pinned = part.pin()?;
        ch.acknowledge(id.generation, id.seq)
    }

    /// Reads where `partid` lives from its reserved page.
    pub fn partition_to_location(&self, partid: PartId) -> Result<Location> {
        let page = self
            .shared
            .fabric
            .reserved_page(partid)
            .and_then(|bytes| ReservedPage::decode(&bytes))
            .map_err(|_| Error::InvalidPartition)?;
        if page.partid != partid {
            return Err(Error::InvalidPartition);
        }
        Ok(Location {
            partid,
            location: page.location,
            stamp: page.stamp,
        })
    }

    pub fn partition_state(&self, partid: PartId) -> Result<ActState> {
        Ok(self.shared.partition(partid)?.state())
    }

    pub fn partition_info(&self, partid: PartId) -> Result<PartitionInfo> {
        let part = self.shared.partition(partid)?;
        Ok(PartitionInfo {
            state: part.state(),
            reason: part.last_reason(),
            affinity: part.affinity(),
            activations: part.activations(),
        })
    }

    /// Waits until `partid` reaches `state`.
    pub async fn wait_for_state(&self, partid: PartId, state: ActState) -> Result<()> {
        let mut rx = self.shared.partition(partid)?.subscribe();
        rx.wait_for(|s| *s == state).await?;
        Ok(())
    }

    pub fn channel_stats(&self, partid: PartId, channel: ChannelId) -> Result<ChannelStats> {
        Ok(self.shared.partition(partid)?.channel(channel)?.stats())
    }

    pub fn notify_stats(&self) -> NotifyStats {
        self.shared.notify.snapshot()
    }

    /// Deactivates every partition with `Unloading`, waits until all of them
    /// are inactive and withdraws the reserved page.
    pub async fn shutdown(mut self) {
        let started = Instant::now();
        self.shared.unloading.store(true, Ordering::SeqCst);
        for part in &self.shared.partitions {
            part.unload();
        }
        let waits = self
            .shared
            .partitions
            .iter()
            .map(|part| {
                let mut rx = part.subscribe();
                async move {
                    let _ = rx.wait_for(|s| *s == ActState::Inactive).await;
                }
            });
        join_all(waits).await;

        self.shared.fabric.retract_reserved_page();
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!(
            partid = self.local(),
            "endpoint shut down in {:?}",
            started.elapsed()
        );
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if self.shared.unloading.swap(true, Ordering::SeqCst) {
            let _ = self.shutdown.send(true);
            return;
        }
        for part in &self.shared.partitions {
            part.unload();
        }
        self.shared.fabric.retract_reserved_page();
        let _ = self.shutdown.send(true);
    }
}
