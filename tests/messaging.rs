use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use ganglion::{
    ActState, AllocFlags, Config, Endpoint, Error, Event, EventKind, Machine, MsgId, Phase,
    Registration,
};
use tokio::{
    sync::mpsc,
    time::{sleep, timeout},
};

const WAIT: Duration = Duration::from_secs(10);

fn config() -> Config {
    Config::builder()
        .heartbeat_interval(Duration::from_millis(10))
        .heartbeat_check_interval(Duration::from_millis(20))
        .missed_heartbeats(3)
        .notify_recheck_interval(Duration::from_millis(20))
        .manager_timeout(Duration::from_millis(50))
        .handshake_backoff(Duration::from_millis(5))
        .allocate_backoff(Duration::from_millis(5))
        .allocate_attempts(1000)
        .location(0xA0)
        .build()
}

async fn pair_on(machine: &Arc<Machine>) -> (Endpoint, Endpoint) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let a = Endpoint::start(machine.port(0), config()).await.unwrap();
    let b = Endpoint::start(machine.port(1), config()).await.unwrap();
    timeout(WAIT, a.wait_for_state(1, ActState::Active))
        .await
        .expect("partition 1 never came up")
        .unwrap();
    timeout(WAIT, b.wait_for_state(0, ActState::Active))
        .await
        .expect("partition 0 never came up")
        .unwrap();
    (a, b)
}

async fn pair() -> (Arc<Machine>, Endpoint, Endpoint) {
    let machine = Machine::new(2);
    let (a, b) = pair_on(&machine).await;
    (machine, a, b)
}

fn recorder(
    payload_size: usize,
    queue_depth: u32,
    assigned_limit: usize,
) -> (Registration, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let registration = Registration::builder()
        .callback(move |event| {
            let _ = tx.send(event);
        })
        .key(7)
        .payload_size(payload_size)
        .queue_depth(queue_depth)
        .assigned_limit(assigned_limit)
        .idle_limit(1)
        .build();
    (registration, rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(WAIT, rx.recv())
        .await
        .expect("no event")
        .expect("callback dropped")
}

async fn connected(rx: &mut mpsc::UnboundedReceiver<Event>) {
    let event = next_event(rx).await;
    assert!(
        matches!(event.kind, EventKind::Connected),
        "expected Connected, got {event:?}"
    );
    assert_eq!(event.key, 7);
}

async fn message(rx: &mut mpsc::UnboundedReceiver<Event>) -> (MsgId, Vec<u8>) {
    match next_event(rx).await.kind {
        EventKind::Message { id, payload } => (id, payload),
        other => panic!("expected a message, got {other:?}"),
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !check() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held")
}

async fn send_u64(
    ep: &Endpoint,
    partid: u16,
    channel: u8,
    value: u64,
    flags: AllocFlags,
) -> ganglion::Result<()> {
    let mut handle = ep.allocate(partid, channel, flags).await?;
    handle.payload_mut().copy_from_slice(&value.to_le_bytes());
    ep.send(partid, channel, handle)
}

fn as_u64(payload: Vec<u8>) -> u64 {
    u64::from_le_bytes(payload.try_into().expect("payload size"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn messages_arrive_in_put_order() {
    let (_machine, a, b) = pair().await;
    let a = Arc::new(a);
    let (reg_a, mut rx_a) = recorder(8, 4, 1);
    let (reg_b, mut rx_b) = recorder(8, 4, 1);
    a.connect(0, reg_a).await.unwrap();
    b.connect(0, reg_b).await.unwrap();
    connected(&mut rx_a).await;
    connected(&mut rx_b).await;

    let sender = {
        let a = a.clone();
        tokio::spawn(async move {
            for i in 0..64 {
                send_u64(&a, 1, 0, i, AllocFlags::Wait).await.unwrap();
            }
        })
    };
    for i in 0..64 {
        let (id, payload) = message(&mut rx_b).await;
        assert_eq!(id.partid, 0);
        assert_eq!(as_u64(payload), i);
        assert_eq!(id.seq(), i);
        b.received(0, 0, id).unwrap();
    }
    sender.await.unwrap();

    let stats = b.channel_stats(0, 0).unwrap();
    assert_eq!(stats.get, 64);
    assert!(stats.assigned_workers <= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_counts_stay_within_limits_under_bursts() {
    let (_machine, a, b) = pair().await;
    let a = Arc::new(a);
    let b = Arc::new(b);
    let (reg_a, mut rx_a) = recorder(8, 16, 4);
    let (reg_b, mut rx_b) = recorder(8, 16, 4);
    a.connect(3, reg_a).await.unwrap();
    b.connect(3, reg_b).await.unwrap();
    connected(&mut rx_a).await;
    connected(&mut rx_b).await;

    let done = Arc::new(AtomicBool::new(false));
    let sampler = {
        let (b, done) = (b.clone(), done.clone());
        tokio::spawn(async move {
            let (mut assigned, mut idle) = (0, 0);
            while !done.load(Ordering::SeqCst) {
                let stats = b.channel_stats(0, 3).unwrap();
                assigned = stats.assigned_workers.max(assigned);
                idle = stats.idle_workers.max(idle);
                tokio::task::yield_now().await;
            }
            (assigned, idle)
        })
    };
    let sender = {
        let a = a.clone();
        tokio::spawn(async move {
            for burst in 0..30u64 {
                for i in 0..16 {
                    send_u64(&a, 1, 3, burst * 16 + i, AllocFlags::Wait)
                        .await
                        .unwrap();
                }
                sleep(Duration::from_millis(2)).await;
            }
        })
    };
    let mut seen = Vec::new();
    for _ in 0..480 {
        let (id, payload) = message(&mut rx_b).await;
        seen.push(as_u64(payload));
        b.received(0, 3, id).unwrap();
    }
    sender.await.unwrap();
    done.store(true, Ordering::SeqCst);

    let (assigned, idle) = sampler.await.unwrap();
    assert!(assigned <= 4, "{assigned} workers assigned");
    assert!(idle <= 2, "{idle} workers idle");
    seen.sort_unstable();
    assert_eq!(seen, (0..480).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_queue_reports_retry_until_acknowledged() {
    let (_machine, a, b) = pair().await;
    let (reg_a, mut rx_a) = recorder(8, 4, 4);
    let (reg_b, mut rx_b) = recorder(8, 4, 4);
    a.connect(2, reg_a).await.unwrap();
    b.connect(2, reg_b).await.unwrap();
    connected(&mut rx_a).await;
    connected(&mut rx_b).await;

    for i in 0..4 {
        send_u64(&a, 1, 2, i, AllocFlags::NoWait).await.unwrap();
    }
    assert_eq!(
        a.allocate(1, 2, AllocFlags::NoWait).await.unwrap_err(),
        Error::Retry
    );

    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(message(&mut rx_b).await.0);
    }
    ids.sort_by_key(|id| id.seq());
    assert_eq!(
        a.allocate(1, 2, AllocFlags::NoWait).await.unwrap_err(),
        Error::Retry
    );

    b.received(0, 2, ids[0]).unwrap();
    let handle = a.allocate(1, 2, AllocFlags::NoWait).await.unwrap();
    assert_eq!(handle.seq(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_acknowledgment_is_a_no_op() {
    let (_machine, a, b) = pair().await;
    let (reg_a, mut rx_a) = recorder(8, 8, 2);
    let (reg_b, mut rx_b) = recorder(8, 8, 2);
    a.connect(1, reg_a).await.unwrap();
    b.connect(1, reg_b).await.unwrap();
    connected(&mut rx_a).await;
    connected(&mut rx_b).await;

    send_u64(&a, 1, 1, 42, AllocFlags::Wait).await.unwrap();
    let (id, payload) = message(&mut rx_b).await;
    assert_eq!(as_u64(payload), 42);
    b.received(0, 1, id).unwrap();
    b.received(0, 1, id).unwrap();

    let stats = b.channel_stats(0, 1).unwrap();
    assert_eq!(stats.get, 1);
    assert!(stats.get <= stats.remote_put);
    assert_eq!(b.received(0, 2, id), Err(Error::InvalidArgument));
}

#[tokio::test]
async fn concurrent_connects_admit_one() {
    let (_machine, a, _b) = pair().await;
    let (first, _rx1) = recorder(8, 4, 1);
    let (second, _rx2) = recorder(8, 4, 1);
    let (r1, r2) = tokio::join!(a.connect(3, first), a.connect(3, second));
    let mut results = [r1, r2];
    results.sort_by_key(|r| r.is_err());
    assert_eq!(results, [Ok(()), Err(Error::AlreadyRegistered)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disconnect_waits_for_workers_and_callouts() {
    let (_machine, a, b) = pair().await;
    let (reg_a, mut rx_a) = recorder(8, 16, 4);
    a.connect(4, reg_a).await.unwrap();

    let delivered = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx_b) = mpsc::unbounded_channel();
    let reg_b = {
        let delivered = delivered.clone();
        Registration::builder()
            .callback(move |event: Event| {
                if let EventKind::Message { .. } = event.kind {
                    std::thread::sleep(Duration::from_millis(5));
                    delivered.fetch_add(1, Ordering::SeqCst);
                }
                let _ = tx.send(event);
            })
            .key(7)
            .payload_size(8)
            .queue_depth(16)
            .assigned_limit(2)
            .build()
    };
    b.connect(4, reg_b).await.unwrap();
    connected(&mut rx_a).await;
    connected(&mut rx_b).await;

    for i in 0..12 {
        send_u64(&a, 1, 4, i, AllocFlags::Wait).await.unwrap();
    }
    eventually(|| delivered.load(Ordering::SeqCst) > 0).await;

    timeout(WAIT, b.disconnect(4)).await.unwrap().unwrap();
    let stats = b.channel_stats(0, 4).unwrap();
    assert_eq!(stats.phase, Phase::Disconnected);
    assert_eq!(stats.assigned_workers, 0);

    let settled = delivered.load(Ordering::SeqCst);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(delivered.load(Ordering::SeqCst), settled);

    let mut last = None;
    while let Ok(event) = rx_b.try_recv() {
        last = Some(event.kind);
    }
    assert!(matches!(last, Some(EventKind::Disconnected(Error::Unregistering))));

    loop {
        match next_event(&mut rx_a).await.kind {
            EventKind::Disconnected(reason) => {
                assert_eq!(reason, Error::NotConnected);
                break;
            }
            EventKind::Connected => panic!("reconnected without a peer"),
            EventKind::Message { .. } => {}
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn acknowledgment_callouts_run_once() {
    let (_machine, a, b) = pair().await;
    let (reg_a, mut rx_a) = recorder(8, 4, 1);
    let (reg_b, mut rx_b) = recorder(8, 4, 1);
    a.connect(5, reg_a).await.unwrap();
    b.connect(5, reg_b).await.unwrap();
    connected(&mut rx_a).await;
    connected(&mut rx_b).await;

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    for i in 0..2u64 {
        let mut handle = a.allocate(1, 5, AllocFlags::Wait).await.unwrap();
        handle.payload_mut().copy_from_slice(&i.to_le_bytes());
        let outcomes = outcomes.clone();
        a.send_with_notify(1, 5, handle, move |result| {
            outcomes.lock().unwrap().push((i, result));
        })
        .unwrap();
    }

    let (first, _) = message(&mut rx_b).await;
    b.received(0, 5, first).unwrap();
    eventually(|| outcomes.lock().unwrap().len() == 1).await;
    assert_eq!(outcomes.lock().unwrap()[0], (0, Ok(())));

    // the second message is never acknowledged
    let _ = message(&mut rx_b).await;
    timeout(WAIT, b.disconnect(5)).await.unwrap().unwrap();
    eventually(|| outcomes.lock().unwrap().len() == 2).await;
    assert_eq!(outcomes.lock().unwrap()[1], (1, Err(Error::NotConnected)));

    sleep(Duration::from_millis(100)).await;
    assert_eq!(outcomes.lock().unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abandoned_reservations_do_not_stall_the_queue() {
    let (_machine, a, b) = pair().await;
    let (reg_a, mut rx_a) = recorder(8, 4, 1);
    let (reg_b, mut rx_b) = recorder(8, 4, 1);
    a.connect(6, reg_a).await.unwrap();
    b.connect(6, reg_b).await.unwrap();
    connected(&mut rx_a).await;
    connected(&mut rx_b).await;

    let abandoned = a.allocate(1, 6, AllocFlags::Wait).await.unwrap();
    send_u64(&a, 1, 6, 9, AllocFlags::Wait).await.unwrap();
    drop(abandoned);

    let (id, payload) = message(&mut rx_b).await;
    assert_eq!(as_u64(payload), 9);
    assert_eq!(id.seq(), 1);
    b.received(0, 6, id).unwrap();
    eventually(|| a.channel_stats(1, 6).unwrap().acked == 2).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mismatched_payload_sizes_never_connect() {
    let (_machine, a, b) = pair().await;
    let (reg_a, mut rx_a) = recorder(8, 4, 1);
    let (reg_b, mut rx_b) = recorder(16, 4, 1);
    a.connect(7, reg_a).await.unwrap();
    b.connect(7, reg_b).await.unwrap();

    sleep(Duration::from_millis(300)).await;
    assert!(rx_a.try_recv().is_err());
    assert!(rx_b.try_recv().is_err());
    assert_ne!(a.channel_stats(1, 7).unwrap().phase, Phase::Connected);
    assert_eq!(
        a.allocate(1, 7, AllocFlags::NoWait).await.unwrap_err(),
        Error::NotConnected
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lost_heartbeat_disconnects_once() {
    let (machine, a, b) = pair().await;
    let (reg_a, mut rx_a) = recorder(8, 4, 1);
    let (reg_b, mut rx_b) = recorder(8, 4, 1);
    a.connect(0, reg_a).await.unwrap();
    b.connect(0, reg_b).await.unwrap();
    connected(&mut rx_a).await;
    connected(&mut rx_b).await;

    machine.stall_heartbeat(1, true);
    let event = next_event(&mut rx_a).await;
    assert!(
        matches!(event.kind, EventKind::Disconnected(Error::PartitionDown)),
        "{event:?}"
    );
    timeout(WAIT, a.wait_for_state(1, ActState::Inactive))
        .await
        .unwrap()
        .unwrap();

    let info = a.partition_info(1).unwrap();
    assert_eq!(info.reason, Some(Error::PartitionDown));
    assert_eq!(info.affinity, None);
    assert_eq!(
        a.allocate(1, 0, AllocFlags::NoWait).await.unwrap_err(),
        Error::PartitionDown
    );

    sleep(Duration::from_millis(300)).await;
    assert!(rx_a.try_recv().is_err());
    assert_eq!(a.partition_state(1).unwrap(), ActState::Inactive);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delivery_survives_dropped_interrupts() {
    let machine = Machine::new(2);
    machine.drop_interrupts(0, true);
    machine.drop_interrupts(1, true);
    let (a, b) = pair_on(&machine).await;
    let (reg_a, mut rx_a) = recorder(8, 4, 1);
    let (reg_b, mut rx_b) = recorder(8, 4, 1);
    a.connect(0, reg_a).await.unwrap();
    b.connect(0, reg_b).await.unwrap();
    connected(&mut rx_a).await;
    connected(&mut rx_b).await;

    for i in 0..8 {
        send_u64(&a, 1, 0, i, AllocFlags::Wait).await.unwrap();
        let (id, payload) = message(&mut rx_b).await;
        assert_eq!(as_u64(payload), i);
        b.received(0, 0, id).unwrap();
    }

    let stats = b.notify_stats();
    assert_eq!(stats.interrupts, 0);
    assert!(stats.recovered > 0);
    assert!(stats.rechecks > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_reports_unloading_and_peer_sees_partition_down() {
    let (_machine, a, b) = pair().await;
    let (reg_a, mut rx_a) = recorder(8, 4, 1);
    let (reg_b, mut rx_b) = recorder(8, 4, 1);
    a.connect(0, reg_a).await.unwrap();
    b.connect(0, reg_b).await.unwrap();
    connected(&mut rx_a).await;
    connected(&mut rx_b).await;

    let location = b.partition_to_location(0).unwrap();
    assert_eq!(location.partid, 0);
    assert_eq!(location.location, 0xA0);

    timeout(WAIT, a.shutdown()).await.unwrap();
    let event = next_event(&mut rx_a).await;
    assert!(matches!(event.kind, EventKind::Disconnected(Error::Unloading)));
    let event = next_event(&mut rx_b).await;
    assert!(matches!(event.kind, EventKind::Disconnected(Error::PartitionDown)));

    timeout(WAIT, b.wait_for_state(0, ActState::Inactive))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(b.partition_to_location(0), Err(Error::InvalidPartition));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restarted_partition_is_activated_again() {
    let (machine, a, b) = pair().await;
    let first = a.partition_to_location(1).unwrap().stamp;
    timeout(WAIT, b.shutdown()).await.unwrap();
    timeout(WAIT, a.wait_for_state(1, ActState::Inactive))
        .await
        .unwrap()
        .unwrap();

    let b = Endpoint::start(machine.port(1), config()).await.unwrap();
    timeout(WAIT, a.wait_for_state(1, ActState::Active))
        .await
        .unwrap()
        .unwrap();
    assert!(a.partition_to_location(1).unwrap().stamp > first);
    assert_eq!(a.partition_info(1).unwrap().activations, 2);
    timeout(WAIT, b.wait_for_state(0, ActState::Active))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reboot_while_active_is_detected_and_reconnects() {
    let (machine, a, b) = pair().await;
    let (reg_a, mut rx_a) = recorder(8, 4, 1);
    let (reg_b, mut rx_b) = recorder(8, 4, 1);
    a.connect(0, reg_a).await.unwrap();
    b.connect(0, reg_b).await.unwrap();
    connected(&mut rx_a).await;
    connected(&mut rx_b).await;
    let first = a.partition_to_location(1).unwrap().stamp;

    // the old incarnation is cut off the moment the node boots again
    let b = {
        let _old = b;
        Endpoint::start(machine.port(1), config()).await.unwrap()
    };
    let (reg_b, mut rx_b) = recorder(8, 4, 1);
    b.connect(0, reg_b).await.unwrap();

    let event = next_event(&mut rx_a).await;
    assert!(
        matches!(event.kind, EventKind::Disconnected(Error::PartitionDown)),
        "{event:?}"
    );
    connected(&mut rx_a).await;
    connected(&mut rx_b).await;
    let info = a.partition_info(1).unwrap();
    assert_eq!(info.state, ActState::Active);
    assert_eq!(info.activations, 2);
    assert!(a.partition_to_location(1).unwrap().stamp > first);

    send_u64(&a, 1, 0, 5, AllocFlags::Wait).await.unwrap();
    let (id, payload) = message(&mut rx_b).await;
    assert_eq!(as_u64(payload), 5);
    assert_eq!(id.seq(), 0);
    b.received(0, 0, id).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_completes_while_partitions_come_up() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    for round in 0..20u64 {
        let machine = Machine::new(3);
        let a = Endpoint::start(machine.port(0), config()).await.unwrap();
        let _b = Endpoint::start(machine.port(1), config()).await.unwrap();
        let _c = Endpoint::start(machine.port(2), config()).await.unwrap();
        sleep(Duration::from_millis(round * 3)).await;
        timeout(WAIT, a.shutdown())
            .await
            .unwrap_or_else(|_| panic!("shutdown hung in round {round}"));
    }
}

#[tokio::test]
async fn setup_failure_leaves_partition_inactive_with_reason() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let machine = Machine::with_budget(2, 64);
    let a = Endpoint::start(machine.port(0), config()).await.unwrap();
    let _b = Endpoint::start(machine.port(1), config()).await.unwrap();

    eventually(|| a.partition_info(1).unwrap().reason == Some(Error::ResourceExhausted)).await;
    assert_ne!(a.partition_state(1).unwrap(), ActState::Active);
}

#[tokio::test]
async fn invalid_targets_are_rejected() {
    let (_machine, a, _b) = pair().await;
    assert_eq!(a.partition_state(0), Err(Error::InvalidPartition));
    assert_eq!(a.partition_state(9), Err(Error::InvalidPartition));
    assert_eq!(a.channel_stats(1, 200).unwrap_err(), Error::InvalidChannel);
    assert_eq!(
        a.allocate(1, 0, AllocFlags::NoWait).await.unwrap_err(),
        Error::NotConnected
    );
    let (bad, _rx) = recorder(0, 4, 1);
    assert_eq!(a.connect(0, bad).await, Err(Error::InvalidArgument));
    assert_eq!(a.disconnect(0).await, Ok(()));
}
