//! An in-process fabric: every partition is a node of one `Machine`, and
//! "remote memory" is simply another node's region table. Used to run
//! several partitions inside one process for tests and demos.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use hashbrown::HashMap;
use tokio::sync::mpsc;
use tracing::trace;

use super::{
    error::{Error, Result},
    fabric::{Fabric, Region},
    PartId,
};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct Memory {
    regions: HashMap<Region, Vec<u8>>,
    used: usize,
}

impl Memory {
    fn resize(&mut self, region: Region, len: usize, budget: usize) -> Result<&mut Vec<u8>> {
        let current = self.regions.get(&region).map_or(0, |r| r.len());
        if len > current && self.used + (len - current) > budget {
            return Err(Error::ResourceExhausted);
        }
        self.used = self.used + len - current;
        let buf = self.regions.entry(region).or_default();
        buf.resize(len, 0);
        Ok(buf)
    }

    fn remove(&mut self, region: Region) {
        if let Some(buf) = self.regions.remove(&region) {
            self.used -= buf.len();
        }
    }
}

struct Node {
    online: AtomicBool,
    boot: AtomicU64,
    heartbeat: AtomicU64,
    reserved: RwLock<Option<Vec<u8>>>,
    memory: RwLock<Memory>,
    doorbells: Vec<AtomicU64>,
    irq_tx: Mutex<Option<mpsc::UnboundedSender<PartId>>>,
    irq_rx: Mutex<Option<mpsc::UnboundedReceiver<PartId>>>,
    drop_interrupts: AtomicBool,
    stalled: AtomicBool,
}

impl Node {
    fn new(partitions: PartId) -> Self {
        Self {
            online: AtomicBool::new(false),
            boot: AtomicU64::new(0),
            heartbeat: AtomicU64::new(0),
            reserved: RwLock::new(None),
            memory: RwLock::new(Memory::default()),
            doorbells: (0..partitions).map(|_| AtomicU64::new(0)).collect(),
            irq_tx: Mutex::new(None),
            irq_rx: Mutex::new(None),
            drop_interrupts: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
        }
    }
}

/// A set of partitions sharing one address space.
pub struct Machine {
    nodes: Vec<Node>,
    budget: usize,
    boots: AtomicU64,
}

impl Machine {
    pub fn new(partitions: PartId) -> Arc<Self> {
        Self::with_budget(partitions, usize::MAX)
    }

    /// Like `new`, but every node can hold at most `budget` bytes of
    /// published regions.
    pub fn with_budget(partitions: PartId, budget: usize) -> Arc<Self> {
        Arc::new(Self {
            nodes: (0..partitions).map(|_| Node::new(partitions)).collect(),
            budget,
            boots: AtomicU64::new(0),
        })
    }

    /// Boots `partid` and returns its fabric handle. Booting again wipes
    /// the node's memory and invalidates its previous heartbeat location, as
    /// a reboot would. Ports of earlier boots behave as if powered off.
    ///
    /// # Panics
    ///
    /// Panics if `partid` is not a partition of this machine.
    pub fn port(self: &Arc<Self>, partid: PartId) -> Arc<Port> {
        let node = &self.nodes[partid as usize];
        let boot = self.boots.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        *write(&node.memory) = Memory::default();
        *write(&node.reserved) = None;
        for doorbell in &node.doorbells {
            doorbell.store(0, Ordering::SeqCst);
        }
        node.heartbeat.store(0, Ordering::SeqCst);
        node.boot.store(boot, Ordering::SeqCst);
        node.stalled.store(false, Ordering::SeqCst);
        *lock(&node.irq_tx) = Some(tx);
        *lock(&node.irq_rx) = Some(rx);
        node.online.store(true, Ordering::SeqCst);
        Arc::new(Port {
            machine: self.clone(),
            partid,
            boot,
        })
    }

    /// Cuts `partid` off the machine. Nothing can be read from it and it
    /// can't reach anyone else until it is booted again. Unknown IDs are
    /// ignored, as by the other knobs.
    pub fn power_off(&self, partid: PartId) {
        if let Ok(node) = self.node(partid) {
            node.online.store(false, Ordering::SeqCst);
        }
    }

    /// Reconnects a powered off node with its memory intact.
    pub fn power_on(&self, partid: PartId) {
        if let Ok(node) = self.node(partid) {
            node.online.store(true, Ordering::SeqCst);
        }
    }

    /// Freezes the heartbeat word of `partid` while everything else keeps
    /// working, like a node whose scheduler hung.
    pub fn stall_heartbeat(&self, partid: PartId, stall: bool) {
        if let Ok(node) = self.node(partid) {
            node.stalled.store(stall, Ordering::SeqCst);
        }
    }

    /// Makes every interrupt sent to `partid` vanish silently.
    pub fn drop_interrupts(&self, partid: PartId, drop: bool) {
        if let Ok(node) = self.node(partid) {
            node.drop_interrupts.store(drop, Ordering::SeqCst);
        }
    }

    fn node(&self, partid: PartId) -> Result<&Node> {
        self.nodes
            .get(partid as usize)
            .ok_or(Error::InvalidPartition)
    }

    fn reachable(&self, partid: PartId) -> Result<&Node> {
        let node = self.node(partid)?;
        if node.online.load(Ordering::SeqCst) {
            Ok(node)
        } else {
            Err(Error::PartitionDown)
        }
    }
}

/// One partition's view of a `Machine`, valid for one boot of its node.
pub struct Port {
    machine: Arc<Machine>,
    partid: PartId,
    boot: u64,
}

impl Port {
    /// Our node, unless it was rebooted under us.
    fn me(&self) -> Result<&Node> {
        let node = self.machine.node(self.partid)?;
        if node.boot.load(Ordering::SeqCst) != self.boot {
            return Err(Error::PartitionDown);
        }
        Ok(node)
    }

    /// Resolves a remote node, failing when either end is powered off.
    fn remote(&self, partid: PartId) -> Result<&Node> {
        if !self.me()?.online.load(Ordering::SeqCst) {
            return Err(Error::PartitionDown);
        }
        self.machine.reachable(partid)
    }
}

impl Fabric for Port {
    fn local(&self) -> PartId {
        self.partid
    }

    fn partitions(&self) -> PartId {
        self.machine.nodes.len() as PartId
    }

    fn publish_reserved_page(&self, page: &[u8]) -> Result<()> {
        *write(&self.me()?.reserved) = Some(page.to_vec());
        Ok(())
    }

    fn retract_reserved_page(&self) {
        if let Ok(node) = self.me() {
            *write(&node.reserved) = None;
        }
    }

    fn reserved_page(&self, partid: PartId) -> Result<Vec<u8>> {
        let node = self.remote(partid)?;
        let page = read(&node.reserved).clone();
        page.ok_or(Error::PartitionDown)
    }

    fn vars_location(&self) -> u64 {
        self.boot
    }

    fn set_heartbeat(&self, value: u64) {
        let Ok(node) = self.me() else {
            return;
        };
        if !node.stalled.load(Ordering::SeqCst) {
            node.heartbeat.store(value, Ordering::SeqCst);
        }
    }

    fn heartbeat(&self, partid: PartId, location: u64) -> Result<u64> {
        let node = self.remote(partid)?;
        if node.boot.load(Ordering::SeqCst) != location {
            return Err(Error::PartitionDown);
        }
        Ok(node.heartbeat.load(Ordering::SeqCst))
    }

    fn alloc(&self, region: Region, len: usize) -> Result<()> {
        let mut memory = write(&self.me()?.memory);
        memory.remove(region);
        memory.resize(region, len, self.machine.budget)?;
        Ok(())
    }

    fn write(&self, region: Region, offset: usize, bytes: &[u8]) -> Result<()> {
        let mut memory = write(&self.me()?.memory);
        let len = memory.regions.get(&region).map_or(0, |r| r.len());
        let buf = memory.resize(region, len.max(offset + bytes.len()), self.machine.budget)?;
        buf[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn free(&self, region: Region) {
        if let Ok(node) = self.me() {
            write(&node.memory).remove(region);
        }
    }

    fn pull(
        &self,
        partid: PartId,
        region: Region,
        offset: usize,
        len: usize,
    ) -> Result<Option<Vec<u8>>> {
        let node = if partid == self.partid {
            self.me()?
        } else {
            self.remote(partid)?
        };
        let memory = read(&node.memory);
        Ok(memory
            .regions
            .get(&region)
            .and_then(|buf| buf.get(offset..offset + len))
            .map(|bytes| bytes.to_vec()))
    }

    fn ring(&self, partid: PartId, bits: u64) -> Result<u64> {
        let node = self.remote(partid)?;
        Ok(node.doorbells[self.partid as usize].fetch_or(bits, Ordering::SeqCst))
    }

    fn take_doorbell(&self, source: PartId) -> u64 {
        self.me()
            .ok()
            .and_then(|node| node.doorbells.get(source as usize))
            .map_or(0, |d| d.swap(0, Ordering::SeqCst))
    }

    fn interrupt(&self, partid: PartId) {
        let Ok(node) = self.remote(partid) else {
            return;
        };
        if node.drop_interrupts.load(Ordering::SeqCst) {
            trace!("interrupt {} -> {} dropped", self.partid, partid);
            return;
        }
        if let Some(tx) = lock(&node.irq_tx).as_ref() {
            let _ = tx.send(self.partid);
        }
    }

    fn take_interrupts(&self) -> Option<mpsc::UnboundedReceiver<PartId>> {
        lock(&self.me().ok()?.irq_rx).take()
    }
}
