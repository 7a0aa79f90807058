//! The per-partition task: first-contact handshake, then the channel manager
//! for as long as the partition stays active, then teardown.

use std::sync::Arc;

use tokio::{select, time::sleep};
use tracing::{debug, debug_span, info, trace, warn, Instrument};

use super::{
    channel::Phase,
    endpoint::Shared,
    error::{Error, Result},
    fabric::Region,
    notify::signal,
    partition::{ActState, Partition},
    reserved::{ReservedPage, VERSION_MAJOR, VERSION_MINOR},
    wire::{decode_frame, encode_frame, PartDescriptor, Stage, FRAME_LEN},
    DESCRIPTOR_BIT,
};

pub(crate) async fn run(shared: Arc<Shared>, part: Arc<Partition>) {
    let span = debug_span!("partition", partid = part.id);
    async move {
        let Some(affinity) = shared.pick_affinity() else {
            warn!("no processing unit left for the partition");
            part.deactivate(Error::ResourceExhausted);
            teardown(&shared, &part, false).await;
            return;
        };
        if !part.claim_activation(affinity) {
            debug!("activation request withdrawn");
            teardown(&shared, &part, false).await;
            return;
        }
        debug!("activating on unit {affinity}");

        match handshake(&shared, &part).await {
            Ok(remote) => {
                if part.mark_active(remote.stamp) {
                    match publish_descriptor(&shared, &part, remote.stamp, Stage::Active) {
                        Ok(()) => info!("partition active"),
                        Err(e) => {
                            part.deactivate(e);
                        }
                    }
                }
                manage_channels(&shared, &part).await;
            }
            Err(e) => {
                debug!("handshake failed: {e}");
                part.deactivate(e);
            }
        }
        teardown(&shared, &part, true).await;
    }
    .instrument(span)
    .await
}

fn descriptor_region(part: &Partition) -> Region {
    Region::Descriptor { peer: part.id }
}

fn publish_descriptor(
    shared: &Shared,
    part: &Partition,
    peer_stamp: i64,
    stage: Stage,
) -> Result<()> {
    let descriptor = PartDescriptor {
        version: (VERSION_MAJOR as u16) << 8 | VERSION_MINOR as u16,
        partid: shared.fabric.local(),
        peer: part.id,
        stamp: shared.stamp,
        peer_stamp,
        stage,
    };
    shared
        .fabric
        .write(descriptor_region(part), 0, &encode_frame(&descriptor)?)?;
    signal(&*shared.fabric, part.id, DESCRIPTOR_BIT)
}

fn remote_descriptor(shared: &Shared, part: &Partition) -> Result<Option<PartDescriptor>> {
    let region = Region::Descriptor {
        peer: shared.fabric.local(),
    };
    let Some(bytes) = shared.fabric.pull(part.id, region, 0, FRAME_LEN)? else {
        return Ok(None);
    };
    match decode_frame::<PartDescriptor>(&bytes) {
        Ok(descriptor) => Ok(Some(descriptor)),
        Err(e) => {
            trace!("unreadable descriptor: {e}");
            Ok(None)
        }
    }
}

/// Exchanges descriptors with the remote until both sides name each other
/// with the right boot stamps. Returns the remote's reserved page.
async fn handshake(shared: &Shared, part: &Partition) -> Result<ReservedPage> {
    let page = ReservedPage::decode(&shared.fabric.reserved_page(part.id)?)?;
    shared
        .fabric
        .alloc(descriptor_region(part), FRAME_LEN)?;
    publish_descriptor(shared, part, page.stamp, Stage::Setup)?;

    for attempt in 0..shared.config.handshake_attempts {
        if part.state() != ActState::Activating {
            return Err(part.reason().unwrap_or(Error::PartitionDown));
        }
        if let Some(remote) = remote_descriptor(shared, part)? {
            if (remote.version >> 8) as u8 != VERSION_MAJOR {
                return Err(Error::ProtocolVersionMismatch);
            }
            if remote.stamp == page.stamp && remote.peer == shared.fabric.local() {
                if remote.stage == Stage::Teardown {
                    return Err(Error::PartitionDown);
                }
                if remote.peer_stamp == shared.stamp {
                    debug!("handshake done after {} attempts", attempt + 1);
                    return Ok(page);
                }
            }
        }
        select! {
            _ = sleep(shared.config.handshake_backoff) => {}
            _ = part.woken() => {}
        }
    }
    Err(Error::PartitionDown)
}

/// Makes sure the remote still runs the incarnation we shook hands with.
pub(crate) fn check_remote(shared: &Shared, part: &Partition) -> Result<()> {
    let Some(remote) = remote_descriptor(shared, part)? else {
        return Err(Error::PartitionDown);
    };
    let expected = part.remote_stamp();
    if remote.stage == Stage::Teardown
        || remote.peer_stamp != shared.stamp
        || Some(remote.stamp) != expected
    {
        return Err(Error::PartitionDown);
    }
    Ok(())
}

/// The channel manager. Passes run on wake requests and periodically; the
/// loop ends once the partition is going down and every channel is closed.
async fn manage_channels(shared: &Arc<Shared>, part: &Arc<Partition>) {
    let mut withdrawn = false;
    loop {
        if part.take_wake_requests() == 0 {
            select! {
                _ = part.woken() => {}
                _ = sleep(shared.config.manager_timeout) => {}
            }
            part.take_wake_requests();
        }

        if part.state() == ActState::Active {
            if let Err(e) = check_remote(shared, part) {
                part.deactivate(e);
            }
        }
        // the peer must learn the partition is going before it sees any
        // channel close
        if !withdrawn && part.state() == ActState::Deactivating {
            let stamp = part.remote_stamp().unwrap_or_default();
            let _ = publish_descriptor(shared, part, stamp, Stage::Teardown);
            withdrawn = true;
        }
        let pending = part.take_pending();
        if pending != 0 {
            trace!("doorbell bits {pending:#x}");
        }
        for ch in &part.channels {
            if let Err(e) = ch.process(shared, part) {
                debug!(channel = ch.number, "remote unreachable: {e}");
                part.deactivate(Error::PartitionDown);
            }
        }

        if part.state() == ActState::Deactivating
            && part
                .channels
                .iter()
                .all(|ch| ch.phase() == Phase::Disconnected && ch.pool.assigned() == 0)
        {
            break;
        }
    }
    debug!("channel manager done");
}

/// Withdraws everything published for the partition and returns it to
/// `Inactive`, reactivating right away if that was asked for meanwhile.
async fn teardown(shared: &Arc<Shared>, part: &Arc<Partition>, published: bool) {
    if published {
        let _ = publish_descriptor(
            shared,
            part,
            part.remote_stamp().unwrap_or_default(),
            Stage::Teardown,
        );
    }
    part.unpinned().await;
    shared.fabric.free(descriptor_region(part));
    for ch in &part.channels {
        ch.release();
    }
    let reason = part.reason();
    let reactivate = part.finish_deactivation();
    match reason {
        Some(reason) => info!(%reason, "partition inactive"),
        None => info!("partition inactive"),
    }
    if reactivate {
        shared.request_activation(part);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::{interval, timeout};

    use super::*;
    use crate::xpc::{config::Config, endpoint::Endpoint, fabric::Fabric, machine::Machine};

    fn config() -> Config {
        Config::builder()
            .heartbeat_interval(Duration::from_millis(10))
            .heartbeat_check_interval(Duration::from_millis(20))
            .handshake_backoff(Duration::from_millis(5))
            .build()
    }

    #[tokio::test]
    async fn foreign_descriptor_version_fails_the_handshake() {
        let machine = Machine::new(2);
        let a = Endpoint::start(machine.port(0), config()).await.unwrap();

        // a hand-driven partition 1 with a current reserved page but a
        // descriptor from a newer protocol
        let remote = machine.port(1);
        let page = ReservedPage::new(1, 77, remote.vars_location(), 0, 8);
        remote.publish_reserved_page(&page.encode()).unwrap();
        let descriptor = PartDescriptor {
            version: ((VERSION_MAJOR as u16) + 1) << 8,
            partid: 1,
            peer: 0,
            stamp: 77,
            peer_stamp: 0,
            stage: Stage::Setup,
        };
        remote
            .write(
                Region::Descriptor { peer: 0 },
                0,
                &encode_frame(&descriptor).unwrap(),
            )
            .unwrap();
        let beating = tokio::spawn(async move {
            let mut tick = interval(Duration::from_millis(5));
            for beat in 1.. {
                tick.tick().await;
                remote.set_heartbeat(beat);
            }
        });

        timeout(Duration::from_secs(10), async {
            while a.partition_info(1).unwrap().reason != Some(Error::ProtocolVersionMismatch) {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let info = a.partition_info(1).unwrap();
        assert_eq!(info.activations, 0);
        assert_ne!(info.state, ActState::Active);
        beating.abort();
    }
}
