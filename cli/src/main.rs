use std::time::Duration;

use ganglion::{
    ActState, AllocFlags, Config, Endpoint, Event, EventKind, Machine, Registration,
};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver},
    time::timeout,
};
use tracing::{info, warn};

type BoxError = Box<dyn std::error::Error>;

const CHANNEL: u8 = 2;
const MESSAGES: u64 = 8;

fn config() -> Config {
    Config::builder()
        .heartbeat_interval(Duration::from_millis(50))
        .heartbeat_check_interval(Duration::from_millis(100))
        .notify_recheck_interval(Duration::from_millis(100))
        .manager_timeout(Duration::from_millis(200))
        .build()
}

fn registration(key: u64) -> (Registration, UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let registration = Registration::builder()
        .callback(move |event| {
            let _ = tx.send(event);
        })
        .key(key)
        .payload_size(8)
        .build();
    (registration, rx)
}

async fn until_connected(events: &mut UnboundedReceiver<Event>) -> Result<(), BoxError> {
    loop {
        let event = timeout(Duration::from_secs(10), events.recv())
            .await?
            .ok_or("callback dropped")?;
        if let EventKind::Connected = event.kind {
            info!(partid = event.partid, key = event.key, "channel up");
            return Ok(());
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt::init();
    run().await
}

/// Two partitions on one loopback machine: exchange a few messages, then
/// pull the plug on the receiver.
async fn run() -> Result<(), BoxError> {
    let machine = Machine::new(2);
    let a = Endpoint::start(machine.port(0), config()).await?;
    let b = Endpoint::start(machine.port(1), config()).await?;

    let (reg_b, mut inbox) = registration(0xb);
    let (reg_a, mut outbox) = registration(0xa);
    b.connect(CHANNEL, reg_b).await?;
    a.connect(CHANNEL, reg_a).await?;

    until_connected(&mut outbox).await?;
    until_connected(&mut inbox).await?;
    info!("partition 1 is at {:?}", a.partition_to_location(1)?);

    let (acked, mut acks) = mpsc::unbounded_channel();
    for n in 0..MESSAGES {
        let mut handle = a.allocate(1, CHANNEL, AllocFlags::Wait).await?;
        handle.payload_mut().copy_from_slice(&n.to_le_bytes());
        let acked = acked.clone();
        a.send_with_notify(1, CHANNEL, handle, move |outcome| {
            let _ = acked.send((n, outcome));
        })?;
    }

    let mut received = 0;
    while received < MESSAGES {
        let Some(event) = inbox.recv().await else {
            break;
        };
        match event.kind {
            EventKind::Message { id, payload } => {
                let mut n = [0u8; 8];
                n.copy_from_slice(&payload);
                info!(seq = id.seq(), "partition 1 got {}", u64::from_le_bytes(n));
                b.received(0, CHANNEL, id)?;
                received += 1;
            }
            kind => info!("receiver saw {kind:?}"),
        }
    }
    for _ in 0..MESSAGES {
        if let Some((n, outcome)) = acks.recv().await {
            info!("message {n} settled: {outcome:?}");
        }
    }
    info!("{:?}", a.channel_stats(1, CHANNEL)?);

    warn!("powering partition 1 off");
    machine.power_off(1);
    timeout(Duration::from_secs(10), a.wait_for_state(1, ActState::Inactive)).await??;
    while let Ok(event) = outbox.try_recv() {
        info!(partid = event.partid, "sender saw {:?}", event.kind);
    }
    info!("partition 1 torn down: {:?}", a.partition_info(1)?);
    info!("{:?}", a.notify_stats());

    a.shutdown().await;
    drop(b);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::run;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn demo_runs_to_completion() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        run().await.unwrap();
    }
}
