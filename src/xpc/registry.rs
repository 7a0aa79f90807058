use std::{
    fmt,
    sync::{Arc, RwLock},
};

use tokio::sync::{Mutex, MutexGuard};
use typed_builder::TypedBuilder;

use super::{
    error::{Error, Result},
    wire::SLOT_HEADER_LEN,
    ChannelId, PartId,
};

/// Largest slot ring a channel may publish.
pub const MAX_QUEUE_BYTES: usize = 1 << 30;

pub type Callback = Arc<dyn Fn(Event) + Send + Sync>;

/// Identifies one delivered message for `Endpoint::received`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MsgId {
    pub partid: PartId,
    pub channel: ChannelId,
    pub(crate) generation: u32,
    pub(crate) seq: u64,
}

impl MsgId {
    /// Position of the message in its channel's put order.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

#[derive(Debug)]
pub enum EventKind {
    /// Both sides registered the channel and the queues are usable.
    Connected,
    /// A message arrived. It must be acknowledged with `received`.
    Message { id: MsgId, payload: Vec<u8> },
    /// The connection is gone. Delivered once for every connection that
    /// reached `Connected`.
    Disconnected(Error),
}

/// A callout to a channel user.
#[derive(Debug)]
pub struct Event {
    pub partid: PartId,
    pub channel: ChannelId,
    /// The opaque key given at registration.
    pub key: u64,
    pub kind: EventKind,
}

/// A channel user's declaration of interest in a channel number, valid
/// against every partition.
#[derive(TypedBuilder, Clone)]
pub struct Registration {
    #[builder(setter(
        transform = |f: impl Fn(Event) + Send + Sync + 'static| Arc::new(f) as Callback
    ))]
    pub callback: Callback,
    #[builder(default)]
    pub key: u64,
    /// Size of every message payload on this channel.
    pub payload_size: usize,
    /// Slots in our outbound queue.
    #[builder(default = 16)]
    pub queue_depth: u32,
    /// Delivery workers allowed per partition.
    #[builder(default = 4)]
    pub assigned_limit: usize,
    /// Idle workers kept around per partition.
    #[builder(default = 1)]
    pub idle_limit: usize,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("key", &self.key)
            .field("payload_size", &self.payload_size)
            .field("queue_depth", &self.queue_depth)
            .field("assigned_limit", &self.assigned_limit)
            .field("idle_limit", &self.idle_limit)
            .finish()
    }
}

impl Registration {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.payload_size == 0
            || self.payload_size > u32::MAX as usize
            || self.queue_depth == 0
            || self.assigned_limit == 0
            || self.idle_limit > self.assigned_limit
        {
            return Err(Error::InvalidArgument);
        }
        let ring = self
            .payload_size
            .checked_add(SLOT_HEADER_LEN)
            .and_then(|entry| entry.checked_mul(self.queue_depth as usize));
        match ring {
            Some(len) if len <= MAX_QUEUE_BYTES => Ok(()),
            _ => Err(Error::InvalidArgument),
        }
    }

    pub(crate) fn notify(&self, partid: PartId, channel: ChannelId, kind: EventKind) {
        (self.callback)(Event {
            partid,
            channel,
            key: self.key,
            kind,
        })
    }
}

struct Slot {
    /// Serializes connect and disconnect of this channel number.
    lock: Mutex<()>,
    entry: RwLock<Option<Arc<Registration>>>,
}

/// Channel number to registration table.
pub struct Registry {
    slots: Vec<Slot>,
}

impl Registry {
    pub fn new(channels: usize) -> Self {
        Self {
            slots: (0..channels)
                .map(|_| Slot {
                    lock: Mutex::new(()),
                    entry: RwLock::new(None),
                })
                .collect(),
        }
    }

    fn slot(&self, channel: ChannelId) -> Result<&Slot> {
        self.slots
            .get(channel as usize)
            .ok_or(Error::InvalidChannel)
    }

    /// Takes the channel's exclusive registration lock.
    pub async fn lock(&self, channel: ChannelId) -> Result<MutexGuard<'_, ()>> {
        Ok(self.slot(channel)?.lock.lock().await)
    }

    /// Like `lock`, but gives up instead of waiting.
    pub fn try_lock(&self, channel: ChannelId) -> Option<MutexGuard<'_, ()>> {
        self.slot(channel).ok()?.lock.try_lock().ok()
    }

    pub fn get(&self, channel: ChannelId) -> Option<Arc<Registration>> {
        let slot = self.slot(channel).ok()?;
        let entry = slot.entry.read().unwrap_or_else(|e| e.into_inner());
        entry.clone()
    }

    /// Installs a registration. Existing state is left untouched when the
    /// channel is taken.
    pub fn insert(&self, channel: ChannelId, registration: Registration) -> Result<()> {
        let slot = self.slot(channel)?;
        let mut entry = slot.entry.write().unwrap_or_else(|e| e.into_inner());
        if entry.is_some() {
            return Err(Error::AlreadyRegistered);
        }
        *entry = Some(Arc::new(registration));
        Ok(())
    }

    pub fn remove(&self, channel: ChannelId) -> Option<Arc<Registration>> {
        let slot = self.slot(channel).ok()?;
        let mut entry = slot.entry.write().unwrap_or_else(|e| e.into_inner());
        entry.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(key: u64) -> Registration {
        Registration::builder()
            .callback(|_| {})
            .key(key)
            .payload_size(32)
            .build()
    }

    #[test]
    fn second_insert_keeps_the_first() {
        let registry = Registry::new(4);
        registry.insert(1, registration(10)).unwrap();
        assert_eq!(
            registry.insert(1, registration(20)),
            Err(Error::AlreadyRegistered)
        );
        assert_eq!(registry.get(1).unwrap().key, 10);
        assert_eq!(registry.remove(1).unwrap().key, 10);
        assert!(registry.get(1).is_none());
    }

    #[test]
    fn out_of_range_channels_are_invalid() {
        let registry = Registry::new(2);
        assert_eq!(
            registry.insert(2, registration(0)),
            Err(Error::InvalidChannel)
        );
        assert!(registry.get(7).is_none());
        assert!(registry.try_lock(7).is_none());
    }

    #[tokio::test]
    async fn try_lock_fails_while_held() {
        let registry = Registry::new(2);
        let guard = registry.lock(1).await.unwrap();
        assert!(registry.try_lock(1).is_none());
        assert!(registry.try_lock(0).is_some());
        drop(guard);
        assert!(registry.try_lock(1).is_some());
    }

    #[test]
    fn limits_are_validated() {
        let mut reg = registration(0);
        assert!(reg.validate().is_ok());
        reg.idle_limit = reg.assigned_limit + 1;
        assert_eq!(reg.validate(), Err(Error::InvalidArgument));
        let mut reg = registration(0);
        reg.queue_depth = 0;
        assert_eq!(reg.validate(), Err(Error::InvalidArgument));
    }

    #[test]
    fn oversized_queues_are_rejected() {
        let mut reg = registration(0);
        reg.payload_size = u32::MAX as usize;
        reg.queue_depth = u32::MAX;
        assert_eq!(reg.validate(), Err(Error::InvalidArgument));

        reg.payload_size = MAX_QUEUE_BYTES / 2 - SLOT_HEADER_LEN;
        reg.queue_depth = 2;
        assert!(reg.validate().is_ok());
        reg.payload_size += 1;
        assert_eq!(reg.validate(), Err(Error::InvalidArgument));
    }
}
