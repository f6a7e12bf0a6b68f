//! Client <-> mock-server integration over localhost TCP.

use std::sync::Arc;
use std::time::Duration;

use umdt::core::client::{ClientEngine, ReadRequest, WriteRequest, WriteValue};
use umdt::core::decoding::{Endian, EndianMode, FloatValue};
use umdt::core::events::EventKind;
use umdt::core::pdu::DataKind;
use umdt::core::prober::{ProbeCombo, Prober, TargetSpec};
use umdt::core::server::models::{FaultProfile, RegisterGroup, RegisterRule};
use umdt::core::server::{MockServer, MockServerConfig};
use umdt::core::transport::Endpoint;
use umdt::UmdtError;

fn config() -> MockServerConfig {
    MockServerConfig::with_groups(vec![
        RegisterGroup::new("low", DataKind::Holding, 0, 16),
        RegisterGroup::new("floats", DataKind::Holding, 100, 8),
        RegisterGroup::new("coils", DataKind::Coil, 0, 16),
        RegisterGroup::new("inputs", DataKind::Input, 0, 4).with_initial(vec![7, 8, 9]),
    ])
}

async fn start_server(config: MockServerConfig) -> (Arc<MockServer>, Endpoint) {
    let server = Arc::new(MockServer::new(config).unwrap());
    let addr = server.start_tcp("127.0.0.1", 0).await.unwrap();
    (server, Endpoint::tcp("127.0.0.1", addr.port()))
}

async fn client_for(endpoint: &Endpoint) -> ClientEngine {
    ClientEngine::connect(endpoint.clone(), Duration::from_secs(2))
        .await
        .unwrap()
}

#[tokio::test]
async fn register_write_read_round_trip() {
    let (server, endpoint) = start_server(config()).await;
    let client = client_for(&endpoint).await;

    let outcome = client
        .write(WriteRequest::register_text(1, 3, "0x1234"))
        .await
        .unwrap();
    assert_eq!(outcome.registers, vec![0x1234]);

    let read = client
        .read(ReadRequest::registers(1, DataKind::Holding, 3, 1))
        .await
        .unwrap();
    assert_eq!(read.registers, vec![0x1234]);

    client.close().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn float32_big_endian_read() {
    // S2: registers 0x4120 0x0000 at address 100 decode to 10.0 as float32
    let (server, endpoint) = start_server(config()).await;
    server.set(DataKind::Holding, 100, 0x4120).await.unwrap();
    server.set(DataKind::Holding, 101, 0x0000).await.unwrap();

    let client = client_for(&endpoint).await;
    let read = client
        .read(
            ReadRequest::registers(1, DataKind::Holding, 100, 1)
                .long()
                .endian(EndianMode::One(Endian::Big)),
        )
        .await
        .unwrap();

    assert_eq!(read.registers, vec![0x4120, 0x0000]);
    assert_eq!(read.decoded.len(), 1);
    let row = &read.decoded[0].rows[0];
    assert_eq!(row.float32, Some(FloatValue::Number(10.0)));

    client.close().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn coil_round_trip() {
    let (server, endpoint) = start_server(config()).await;
    let client = client_for(&endpoint).await;

    client.write(WriteRequest::coil(1, 5, true)).await.unwrap();
    let read = client
        .read(ReadRequest::registers(1, DataKind::Coil, 0, 8))
        .await
        .unwrap();
    assert_eq!(read.bits.len(), 8);
    assert!(read.bits[5]);
    assert!(!read.bits[4]);

    client.close().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn multi_register_write_uses_fc16() {
    let (server, endpoint) = start_server(config()).await;
    let client = client_for(&endpoint).await;

    // 32-bit float write lands in two registers
    let outcome = client
        .write(
            WriteRequest::register_text(1, 100, "10.0")
                .long()
                .float()
                .endian(Endian::Big),
        )
        .await
        .unwrap();
    assert_eq!(outcome.registers, vec![0x4120, 0x0000]);

    assert_eq!(server.get(DataKind::Holding, 100).await.unwrap(), 0x4120);
    assert_eq!(server.get(DataKind::Holding, 101).await.unwrap(), 0x0000);

    client.close().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn unmapped_read_surfaces_exception() {
    let (server, endpoint) = start_server(config()).await;
    let client = client_for(&endpoint).await;

    let err = client
        .read(ReadRequest::registers(1, DataKind::Holding, 5000, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, UmdtError::Exception(0x02)));

    client.close().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn frozen_value_rule_masks_writes() {
    // S5: frozen-value(1234) at holding 10; write 9999 succeeds, read sees 1234
    let (server, endpoint) = start_server(config()).await;
    server.add_rule(
        DataKind::Holding,
        10,
        RegisterRule::FrozenValue { value: 1234 },
    );

    let client = client_for(&endpoint).await;
    client
        .write(WriteRequest::register_text(1, 10, "9999"))
        .await
        .unwrap();

    let read = client
        .read(ReadRequest::registers(1, DataKind::Holding, 10, 1))
        .await
        .unwrap();
    assert_eq!(read.registers, vec![1234]);

    client.close().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn exception_rule_answers_all_access() {
    let (server, endpoint) = start_server(config()).await;
    server.add_rule(DataKind::Holding, 2, RegisterRule::Exception { code: 0x04 });

    let client = client_for(&endpoint).await;
    let err = client
        .read(ReadRequest::registers(1, DataKind::Holding, 0, 8))
        .await
        .unwrap_err();
    assert!(matches!(err, UmdtError::Exception(0x04)));

    client.close().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn scan_collects_mapped_ranges_only() {
    let (server, endpoint) = start_server(config()).await;
    server.set(DataKind::Holding, 7, 42).await.unwrap();
    server.set(DataKind::Holding, 103, 77).await.unwrap();

    let client = client_for(&endpoint).await;
    let hits = client.scan(1, DataKind::Holding, 0, 120).await.unwrap();

    // 16 cells at 0..16 plus 8 at 100..108; the gap answered
    // IllegalDataAddress and was skipped silently
    assert_eq!(hits.len(), 24);
    assert_eq!(
        hits.iter().find(|h| h.address == 7).map(|h| h.value),
        Some(42)
    );
    assert_eq!(
        hits.iter().find(|h| h.address == 103).map(|h| h.value),
        Some(77)
    );
    assert!(hits.iter().all(|h| h.address < 16 || (100..108).contains(&h.address)));

    client.close().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn probe_counts_exception_as_alive() {
    // S4: a server answering exception 0x02 is alive; a closed port is not
    let (server, endpoint) = start_server(config()).await;
    server.add_rule(DataKind::Holding, 0, RegisterRule::Exception { code: 0x02 });

    let prober = Prober::new(Duration::from_millis(300));
    let combos = vec![
        ProbeCombo::new(endpoint.clone(), 1),
        ProbeCombo::new(Endpoint::tcp("127.0.0.1", 1), 1),
    ];
    let results = prober.run(combos, TargetSpec::default()).await;

    let live: Vec<_> = results.iter().filter(|r| r.alive).collect();
    assert_eq!(live.len(), 1);
    assert!(live[0].uri.contains(&endpoint.describe()));
    assert!(live[0].summary.starts_with("exception:"));

    server.stop().await;
}

#[tokio::test]
async fn probe_gateway_exception_not_alive() {
    let (server, endpoint) = start_server(config()).await;
    server.add_rule(DataKind::Holding, 0, RegisterRule::Exception { code: 0x0B });

    let prober = Prober::new(Duration::from_millis(300));
    let results = prober
        .run(vec![ProbeCombo::new(endpoint, 1)], TargetSpec::default())
        .await;
    assert!(!results[0].alive);
    assert!(results[0].summary.starts_with("gateway-error"));

    server.stop().await;
}

#[tokio::test]
async fn fault_drop_times_out_and_reports() {
    // S7: drop_rate=1.0 swallows the request; the event bus records the drop
    let (server, endpoint) = start_server(config()).await;
    let mut events = server.subscribe();
    server.update_faults(FaultProfile {
        drop_rate: 1.0,
        ..Default::default()
    });

    let client = ClientEngine::connect(endpoint, Duration::from_millis(300))
        .await
        .unwrap();
    let err = client
        .read(ReadRequest::registers(1, DataKind::Holding, 0, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, UmdtError::Timeout { .. }));

    let mut saw_drop = false;
    while let Some(event) = events.try_next() {
        if event.kind == EventKind::FaultInjected && event.payload["kind"] == "drop" {
            saw_drop = true;
        }
    }
    assert!(saw_drop);

    client.close().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn fault_latency_delays_response() {
    let (server, endpoint) = start_server(config()).await;
    server.update_faults(FaultProfile {
        latency_ms: 150,
        ..Default::default()
    });

    let client = client_for(&endpoint).await;
    let start = std::time::Instant::now();
    client
        .read(ReadRequest::registers(1, DataKind::Holding, 0, 1))
        .await
        .unwrap();
    assert!(start.elapsed() >= Duration::from_millis(140));

    client.close().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn monitor_streams_samples() {
    let (server, endpoint) = start_server(config()).await;
    server.set(DataKind::Holding, 0, 5).await.unwrap();

    let client = client_for(&endpoint).await;
    let mut handle = client.monitor(
        ReadRequest::registers(1, DataKind::Holding, 0, 1),
        Duration::from_millis(50),
    );

    let first = handle.next().await.unwrap();
    assert_eq!(first.sequence, 1);
    assert_eq!(first.result.unwrap().registers, vec![5]);

    server.set(DataKind::Holding, 0, 6).await.unwrap();
    let mut saw_update = false;
    for _ in 0..10 {
        let sample = handle.next().await.unwrap();
        if let Ok(outcome) = sample.result {
            if outcome.registers == vec![6] {
                saw_update = true;
                break;
            }
        }
    }
    assert!(saw_update);

    handle.stop();
    client.close().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn concurrent_sessions_are_isolated() {
    let (server, endpoint) = start_server(config()).await;
    let mut tasks = Vec::new();
    for i in 0..4u16 {
        let endpoint = endpoint.clone();
        tasks.push(tokio::spawn(async move {
            let client = ClientEngine::connect(endpoint, Duration::from_secs(2))
                .await
                .unwrap();
            client
                .write(WriteRequest {
                    unit: 1,
                    kind: DataKind::Holding,
                    address: i,
                    value: WriteValue::Registers(vec![1000 + i]),
                    long: false,
                    signed: false,
                    float: false,
                    endian: Endian::Big,
                })
                .await
                .unwrap();
            let read = client
                .read(ReadRequest::registers(1, DataKind::Holding, i, 1))
                .await
                .unwrap();
            client.close().await.unwrap();
            read.registers[0]
        }));
    }
    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap(), 1000 + i as u16);
    }
    server.stop().await;
}

#[tokio::test]
async fn read_write_multiple_registers_fc23() {
    let (server, endpoint) = start_server(config()).await;
    server.set(DataKind::Holding, 0, 0xAAAA).await.unwrap();

    // Drive FC 23 through a raw transport exchange: write 0xBBBB to
    // address 1 and read back addresses 0..2 in one transaction.
    use umdt::core::frame::{build_frame, decode_tcp, ModbusMode};
    use umdt::core::pdu::build_read_write_request;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let addr = match &endpoint {
        Endpoint::Tcp { host, port } => format!("{host}:{port}"),
        _ => unreachable!(),
    };
    let mut socket = tokio::net::TcpStream::connect(&addr).await.unwrap();
    let pdu = build_read_write_request(0, 2, 1, &[0xBBBB]);
    socket
        .write_all(&build_frame(ModbusMode::Tcp, 1, pdu, 77))
        .await
        .unwrap();

    let mut reply = vec![0u8; 256];
    let n = socket.read(&mut reply).await.unwrap();
    let captured = decode_tcp(&reply[..n]);
    assert!(captured.valid);
    assert_eq!(captured.transaction_id, Some(77));
    assert_eq!(captured.function, 0x17);
    // byte count 4, values AAAA BBBB
    assert_eq!(captured.payload, vec![0x04, 0xAA, 0xAA, 0xBB, 0xBB]);

    server.stop().await;
}
