use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socktrace::analyze::{Analyzer, AnalyzerFactory, ExtensionConfig};
use socktrace::config::AnalyzerConfig;
use socktrace::listener::{ControlSignal, Listener, SocketSources};
use socktrace::queue::route::partition_index;
use socktrace::queue::{EventQueue, PartitionConsumer, StartState};
use socktrace::tracer::channel::ChannelLoader;
use socktrace::tracer::event::{
    Direction, Protocol, SocketCloseEvent, SocketDataUploadEvent, SocketDetailEvent, SocketEvent,
};
use socktrace::tracer::parse::{
    decode_data_event, decode_detail_event, encode_data_event, encode_detail_event,
};
use socktrace::tracer::EventSource;
use tokio_util::sync::CancellationToken;

fn data_event(conid: u64, data_id: u64) -> SocketDataUploadEvent {
    SocketDataUploadEvent {
        protocol: Protocol::Http1,
        have_reduce_after_chunk: false,
        direction: Direction::Egress,
        finished: true,
        sequence: 0,
        timestamp_ns: 1_000 + data_id,
        conid,
        random_id: 77,
        data_id,
        total_size: 5,
        buffer: b"hello".to_vec(),
    }
}

fn detail_event(conid: u64, data_id: u64) -> SocketDetailEvent {
    SocketDetailEvent {
        conid,
        random_id: 77,
        data_id,
        start_time_ns: 1,
        end_time_ns: 2,
        rtt_us: 100,
        l4_package_count: 1,
        l3_package_count: 1,
        l2_package_count: 1,
        protocol: Protocol::Http1,
        ssl: false,
    }
}

fn data_id(event: &SocketEvent) -> u64 {
    match event {
        SocketEvent::Data(data) => data.data_id,
        SocketEvent::Detail(detail) => detail.data_id,
    }
}

/// Consumed events, shared by every partition's recorder.
type Log = Arc<parking_lot::Mutex<Vec<(usize, String, u64)>>>;

struct Recorder {
    partition: usize,
    log: Log,
}

impl PartitionConsumer for Recorder {
    fn start(&self, _cancel: CancellationToken) {}

    fn consume(&self, event: SocketEvent) {
        self.log
            .lock()
            .push((self.partition, event.connection_id(), data_id(&event)));
    }
}

fn recording_queue(partitions: usize, capacity: usize) -> (EventQueue<Recorder>, Log) {
    let log: Log = Arc::default();
    let queue = EventQueue::new(partitions, capacity, |partition| Recorder {
        partition,
        log: Arc::clone(&log),
    })
    .expect("queue");
    (queue, log)
}

async fn wait_for_len(log: &Log, n: usize) {
    for _ in 0..500 {
        if log.lock().len() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Every connection stays in one partition and its events keep push order.
fn assert_per_connection_order(log: &[(usize, String, u64)]) {
    let mut by_connection: HashMap<&str, Vec<(usize, u64)>> = HashMap::new();
    for (partition, connection, id) in log {
        by_connection
            .entry(connection.as_str())
            .or_default()
            .push((*partition, *id));
    }

    for (connection, seen) in by_connection {
        let partition = seen[0].0;
        assert!(
            seen.iter().all(|(p, _)| *p == partition),
            "connection {connection} spread across partitions"
        );
        let ids: Vec<u64> = seen.iter().map(|(_, id)| *id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted, "connection {connection} reordered");
    }
}

#[tokio::test]
async fn pushed_events_keep_per_connection_order() {
    let (queue, log) = recording_queue(4, 8);
    let cancel = CancellationToken::new();
    queue
        .start(&cancel, &ChannelLoader::new(1))
        .expect("start");

    for id in 0..10u64 {
        for conid in 0..10u64 {
            let event = SocketEvent::Data(data_event(conid, id));
            let key = event.connection_id();
            queue.push(&key, event).await;
        }
    }

    wait_for_len(&log, 100).await;
    let log = log.lock().clone();
    assert_eq!(log.len(), 100);
    assert_per_connection_order(&log);

    for (partition, connection, _) in &log {
        assert_eq!(*partition, queue.partition_for(connection));
    }

    cancel.cancel();
    queue.wait_for_shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_keep_per_connection_order() {
    let (queue, log) = recording_queue(4, 8);
    let queue = Arc::new(queue);
    let cancel = CancellationToken::new();
    queue
        .start(&cancel, &ChannelLoader::new(1))
        .expect("start");

    let mut producers = Vec::new();
    for conid in 0..10u64 {
        let queue = Arc::clone(&queue);
        producers.push(tokio::spawn(async move {
            for id in 0..10u64 {
                let event = SocketEvent::Data(data_event(conid, id));
                let key = event.connection_id();
                queue.push(&key, event).await;
                tokio::task::yield_now().await;
            }
        }));
    }
    for producer in producers {
        producer.await.expect("producer");
    }

    wait_for_len(&log, 100).await;
    // Give a duplicate the chance to show up.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let log = log.lock().clone();
    assert_eq!(log.len(), 100);
    assert_per_connection_order(&log);

    let mut per_connection: HashMap<&str, Vec<u64>> = HashMap::new();
    for (_, connection, id) in &log {
        per_connection.entry(connection.as_str()).or_default().push(*id);
    }
    assert_eq!(per_connection.len(), 10);
    for ids in per_connection.values() {
        assert_eq!(*ids, (0..10).collect::<Vec<u64>>());
    }

    cancel.cancel();
    queue.wait_for_shutdown().await;
}

#[tokio::test]
async fn loader_records_flow_through_to_consumers() {
    let (queue, log) = recording_queue(4, 8);
    let loader = ChannelLoader::new(16);
    let sources = SocketSources::default();

    queue.register_receiver(
        sources.data.clone(),
        4096,
        decode_data_event,
        Arc::new(SocketEvent::connection_id),
    );
    queue.register_receiver(
        sources.detail.clone(),
        4096,
        decode_detail_event,
        Arc::new(SocketEvent::connection_id),
    );

    let data_tx = loader.sender(&sources.data);
    let detail_tx = loader.sender(&sources.detail);

    let cancel = CancellationToken::new();
    queue.start(&cancel, &loader).expect("start");
    assert_eq!(loader.readers_started(), 2);

    for id in 0..5u64 {
        for conid in 0..10u64 {
            data_tx
                .send(encode_data_event(&data_event(conid, id)))
                .await
                .expect("send data");
        }
    }
    for conid in 0..10u64 {
        detail_tx
            .send(encode_detail_event(&detail_event(conid, 100)))
            .await
            .expect("send detail");
    }

    wait_for_len(&log, 60).await;
    let log = log.lock().clone();
    assert_eq!(log.len(), 60);
    assert_per_connection_order(
        &log.iter()
            .filter(|(_, _, id)| *id < 100)
            .cloned()
            .collect::<Vec<_>>(),
    );

    // Details share the partition of their connection's data.
    for (partition, connection, _) in &log {
        assert_eq!(*partition, queue.partition_for(connection));
    }

    let snapshot = loader.stats().snapshot();
    assert_eq!(snapshot.decode_errors, 0);
    let received: u64 = snapshot.received.iter().map(|(_, n)| n).sum();
    assert_eq!(received, 60);

    cancel.cancel();
    queue.wait_for_shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_start_reads_each_source_once() {
    let (queue, _log) = recording_queue(2, 8);
    let queue = Arc::new(queue);
    let loader = Arc::new(ChannelLoader::new(4));
    let sources = SocketSources::default();

    queue.register_receiver(
        sources.data,
        4096,
        decode_data_event,
        Arc::new(SocketEvent::connection_id),
    );
    queue.register_receiver(
        sources.detail,
        4096,
        decode_detail_event,
        Arc::new(SocketEvent::connection_id),
    );

    let cancel = CancellationToken::new();
    let mut handles = Vec::new();
    for _ in 0..4 {
        let queue = Arc::clone(&queue);
        let loader = Arc::clone(&loader);
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            queue.start(&cancel, loader.as_ref())
        }));
    }
    for handle in handles {
        handle.await.expect("join").expect("start");
    }

    assert_eq!(loader.readers_started(), 2);
    assert_eq!(queue.state(), StartState::Started);

    cancel.cancel();
    queue.wait_for_shutdown().await;
}

#[tokio::test]
async fn full_partition_blocks_push_until_started() {
    let (queue, log) = recording_queue(1, 1);
    let queue = Arc::new(queue);

    let first = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            queue.push("a", SocketEvent::Data(data_event(1, 0))).await;
        })
    };
    first.await.expect("first push");
    assert_eq!(queue.queue_depth(0), Some(1));

    let second = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            queue.push("a", SocketEvent::Data(data_event(1, 1))).await;
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        !second.is_finished(),
        "push into a full partition should wait"
    );
    assert!(log.lock().is_empty());

    let cancel = CancellationToken::new();
    queue
        .start(&cancel, &ChannelLoader::new(1))
        .expect("start");

    tokio::time::timeout(Duration::from_secs(1), second)
        .await
        .expect("push proceeds once the worker drains")
        .expect("second push");

    wait_for_len(&log, 2).await;
    let ids: Vec<u64> = log.lock().iter().map(|(_, _, id)| *id).collect();
    assert_eq!(ids, vec![0, 1]);

    cancel.cancel();
    queue.wait_for_shutdown().await;
}

/// Blocks inside the first consume until released.
struct GatedRecorder {
    log: Log,
    gate: parking_lot::Mutex<std::sync::mpsc::Receiver<()>>,
    blocked_once: AtomicBool,
}

impl PartitionConsumer for GatedRecorder {
    fn start(&self, _cancel: CancellationToken) {}

    fn consume(&self, event: SocketEvent) {
        self.log
            .lock()
            .push((0, event.connection_id(), data_id(&event)));
        if !self.blocked_once.swap(true, Ordering::SeqCst) {
            let _ = self.gate.lock().recv();
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_discards_queued_events() {
    let log: Log = Arc::default();
    let (release, gate) = std::sync::mpsc::channel();
    let mut gate = Some(gate);
    let queue = EventQueue::new(1, 8, |_| GatedRecorder {
        log: Arc::clone(&log),
        gate: parking_lot::Mutex::new(gate.take().expect("single partition")),
        blocked_once: AtomicBool::new(false),
    })
    .expect("queue");

    let cancel = CancellationToken::new();
    queue
        .start(&cancel, &ChannelLoader::new(1))
        .expect("start");

    queue.push("c", SocketEvent::Data(data_event(1, 0))).await;
    wait_for_len(&log, 1).await;

    for id in 1..=5 {
        queue.push("c", SocketEvent::Data(data_event(1, id))).await;
    }
    assert_eq!(queue.partitions()[0].depth(), 5);

    cancel.cancel();
    release.send(()).expect("release gate");
    queue.wait_for_shutdown().await;

    assert_eq!(log.lock().len(), 1);
}

#[derive(Default)]
struct Broadcasts {
    configs: AtomicUsize,
    closes: AtomicUsize,
}

struct BroadcastCounter {
    counts: Arc<Broadcasts>,
}

impl Analyzer for BroadcastCounter {
    fn start(&self, _cancel: CancellationToken) {}
    fn receive_socket_detail(&self, _event: SocketDetailEvent) {}
    fn receive_socket_data(&self, _event: SocketDataUploadEvent) {}
    fn update_extension_config(&self, _config: &ExtensionConfig) {
        self.counts.configs.fetch_add(1, Ordering::SeqCst);
    }
    fn receive_socket_close(&self, _event: &SocketCloseEvent) {
        self.counts.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn control_signals_reach_every_partition_after_start() {
    let counts = Arc::new(Broadcasts::default());
    let shared = Arc::clone(&counts);
    let factory: AnalyzerFactory = Arc::new(move |_partition: usize, _cfg: &AnalyzerConfig| {
        Arc::new(BroadcastCounter {
            counts: Arc::clone(&shared),
        }) as Arc<dyn Analyzer>
    });

    let mut listener = Listener::new(4096, factory);
    listener
        .init_socket_data_queue(6, 8, &AnalyzerConfig::default())
        .expect("init");

    let cancel = CancellationToken::new();
    listener
        .start_socket_data(&cancel, &ChannelLoader::new(4), &SocketSources::default())
        .expect("start");

    listener.handle_control(&ControlSignal::ConfigUpdate(ExtensionConfig::default()));
    listener.handle_control(&ControlSignal::Close(SocketCloseEvent {
        conid: 1,
        random_id: 77,
        pid: 10,
        socket_fd: 3,
        end_time_ns: 9,
    }));

    assert_eq!(counts.configs.load(Ordering::SeqCst), 6);
    assert_eq!(counts.closes.load(Ordering::SeqCst), 6);

    cancel.cancel();
    listener.wait_for_shutdown().await;
}

#[test]
fn routing_is_a_pure_function_of_key_and_count() {
    let (a, _) = recording_queue(7, 1);
    let (b, _) = recording_queue(7, 1);

    for conid in 0..50u64 {
        let key = SocketEvent::Data(data_event(conid, 0)).connection_id();
        assert_eq!(a.partition_for(&key), b.partition_for(&key));
        assert_eq!(a.partition_for(&key), partition_index(&key, 7));
    }

    let source = EventSource::new("custom_source");
    assert_eq!(source.name(), "custom_source");
}
