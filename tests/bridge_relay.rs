//! Bridge integration: TCP master -> bridge -> TCP mock slave.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use umdt::core::bridge::{Bridge, BridgeConfig};
use umdt::core::client::{ClientEngine, ReadRequest, WriteRequest};
use umdt::core::pdu::DataKind;
use umdt::core::script::{HookOutcome, ScriptCtx, ScriptHook};
use umdt::core::pdu::Request;
use umdt::core::server::models::RegisterGroup;
use umdt::core::server::{MockServer, MockServerConfig};
use umdt::core::transport::Endpoint;
use umdt::utils::error::Result;
use umdt::UmdtError;

async fn start_slave() -> (Arc<MockServer>, Endpoint) {
    let config = MockServerConfig::with_groups(vec![
        RegisterGroup::new("hr", DataKind::Holding, 0, 64),
        RegisterGroup::new("remapped", DataKind::Holding, 40000, 16),
    ]);
    let server = Arc::new(MockServer::new(config).unwrap());
    let addr = server.start_tcp("127.0.0.1", 0).await.unwrap();
    (server, Endpoint::tcp("127.0.0.1", addr.port()))
}

async fn start_bridge(downstream: Endpoint, config: BridgeConfig) -> (Arc<Bridge>, Endpoint) {
    let bridge = Arc::new(
        Bridge::new(BridgeConfig {
            upstream: Endpoint::tcp("127.0.0.1", 0),
            downstream,
            downstream_timeout: Duration::from_millis(500),
            ..config
        })
        .unwrap(),
    );
    let addr = bridge.start().await.unwrap().unwrap();
    (bridge, Endpoint::tcp("127.0.0.1", addr.port()))
}

#[tokio::test]
async fn transparent_relay_round_trip() {
    let (slave, downstream) = start_slave().await;
    let (bridge, upstream) = start_bridge(downstream, BridgeConfig::default()).await;

    let client = ClientEngine::connect(upstream, Duration::from_secs(2))
        .await
        .unwrap();

    client
        .write(WriteRequest::register_text(1, 7, "4242"))
        .await
        .unwrap();
    assert_eq!(slave.get(DataKind::Holding, 7).await.unwrap(), 4242);

    let read = client
        .read(ReadRequest::registers(1, DataKind::Holding, 7, 1))
        .await
        .unwrap();
    assert_eq!(read.registers, vec![4242]);

    let stats = bridge.stats();
    assert_eq!(stats.requests_processed, 2);
    assert_eq!(stats.responses_relayed, 2);
    assert_eq!(stats.requests_blocked, 0);

    client.close().await.unwrap();
    bridge.stop().await;
    slave.stop().await;
}

/// S6: rewrite FC 03 addresses down by 1000 on ingress.
struct AddressRemapHook;

#[async_trait]
impl ScriptHook for AddressRemapHook {
    fn name(&self) -> &str {
        "address-remap"
    }

    async fn ingress(&self, mut request: Request, _ctx: &ScriptCtx) -> Result<HookOutcome> {
        if request.function == 0x03 {
            if let Some(address) = request.address() {
                request.set_address(address - 1000);
            }
        }
        Ok(HookOutcome::Forward(request))
    }
}

#[tokio::test]
async fn address_remap_hook_with_dual_pcap() {
    let dir = tempfile::tempdir().unwrap();
    let up_pcap = dir.path().join("upstream.pcap");
    let down_pcap = dir.path().join("downstream.pcap");

    let (slave, downstream) = start_slave().await;
    slave.set(DataKind::Holding, 40000, 1717).await.unwrap();

    let (bridge, upstream) = start_bridge(
        downstream,
        BridgeConfig {
            upstream_pcap: Some(up_pcap.clone()),
            downstream_pcap: Some(down_pcap.clone()),
            ..Default::default()
        },
    )
    .await;
    bridge.register_hook(Arc::new(AddressRemapHook));

    let client = ClientEngine::connect(upstream, Duration::from_secs(2))
        .await
        .unwrap();

    // Master asks for 41000; the slave only maps 40000
    let read = client
        .read(ReadRequest::registers(1, DataKind::Holding, 41000, 1))
        .await
        .unwrap();
    assert_eq!(read.registers, vec![1717]);

    client.close().await.unwrap();
    bridge.stop().await;
    slave.stop().await;

    // Both capture files carry a global header plus records; the upstream
    // one contains the original address, the downstream one the remapped.
    let up_bytes = std::fs::read(&up_pcap).unwrap();
    let down_bytes = std::fs::read(&down_pcap).unwrap();
    assert!(up_bytes.len() > 24);
    assert!(down_bytes.len() > 24);

    let addr_41000 = 41000u16.to_be_bytes();
    let addr_40000 = 40000u16.to_be_bytes();
    assert!(up_bytes
        .windows(2)
        .any(|w| w == addr_41000));
    assert!(down_bytes
        .windows(2)
        .any(|w| w == addr_40000));
}

/// Drops every request whose function code is 0x06.
struct DropWritesHook;

#[async_trait]
impl ScriptHook for DropWritesHook {
    fn name(&self) -> &str {
        "drop-writes"
    }

    async fn ingress(&self, request: Request, _ctx: &ScriptCtx) -> Result<HookOutcome> {
        if request.function == 0x06 {
            return Ok(HookOutcome::Drop);
        }
        Ok(HookOutcome::Forward(request))
    }
}

#[tokio::test]
async fn ingress_drop_silences_request() {
    let (slave, downstream) = start_slave().await;
    let (bridge, upstream) = start_bridge(downstream, BridgeConfig::default()).await;
    bridge.register_hook(Arc::new(DropWritesHook));

    let client = ClientEngine::connect(upstream, Duration::from_millis(300))
        .await
        .unwrap();

    let err = client
        .write(WriteRequest::register_text(1, 0, "5"))
        .await
        .unwrap_err();
    assert!(matches!(err, UmdtError::Timeout { .. }));
    assert_eq!(slave.get(DataKind::Holding, 0).await.unwrap(), 0);
    assert_eq!(bridge.stats().requests_blocked, 1);

    // Reads still pass
    let read = client
        .read(ReadRequest::registers(1, DataKind::Holding, 0, 1))
        .await
        .unwrap();
    assert_eq!(read.registers, vec![0]);

    client.close().await.unwrap();
    bridge.stop().await;
    slave.stop().await;
}

/// Short-circuits writes with an interlock exception.
struct InterlockHook;

#[async_trait]
impl ScriptHook for InterlockHook {
    fn name(&self) -> &str {
        "interlock"
    }

    async fn ingress(&self, request: Request, ctx: &ScriptCtx) -> Result<HookOutcome> {
        if request.function == 0x06 && ctx.get("armed").is_none() {
            return Ok(HookOutcome::Exception(0x02));
        }
        Ok(HookOutcome::Forward(request))
    }
}

#[tokio::test]
async fn ingress_exception_short_circuits() {
    let (slave, downstream) = start_slave().await;
    let (bridge, upstream) = start_bridge(downstream, BridgeConfig::default()).await;
    bridge.register_hook(Arc::new(InterlockHook));

    let client = ClientEngine::connect(upstream, Duration::from_secs(1))
        .await
        .unwrap();

    let err = client
        .write(WriteRequest::register_text(1, 0, "5"))
        .await
        .unwrap_err();
    assert!(matches!(err, UmdtError::Exception(0x02)));
    // The slave never saw the write
    assert_eq!(slave.get(DataKind::Holding, 0).await.unwrap(), 0);

    client.close().await.unwrap();
    bridge.stop().await;
    slave.stop().await;
}

#[tokio::test]
async fn silent_downstream_answers_gateway_exception() {
    // A listener that accepts and then never replies
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut sink = vec![0u8; 1024];
                use tokio::io::AsyncReadExt;
                while let Ok(n) = socket.read(&mut sink).await {
                    if n == 0 {
                        break;
                    }
                }
            });
        }
    });

    let (bridge, upstream) = start_bridge(
        Endpoint::tcp("127.0.0.1", addr.port()),
        BridgeConfig::default(),
    )
    .await;

    let client = ClientEngine::connect(upstream, Duration::from_secs(2))
        .await
        .unwrap();
    let err = client
        .read(ReadRequest::registers(1, DataKind::Holding, 0, 1))
        .await
        .unwrap_err();
    // Downstream timeout became a gateway-target-failed exception upstream
    assert!(matches!(err, UmdtError::Exception(0x0B)));

    client.close().await.unwrap();
    bridge.stop().await;
}

#[tokio::test]
async fn multiple_masters_share_one_downstream() {
    let (slave, downstream) = start_slave().await;
    let (bridge, upstream) = start_bridge(downstream, BridgeConfig::default()).await;

    let mut tasks = Vec::new();
    for i in 0..4u16 {
        let upstream = upstream.clone();
        tasks.push(tokio::spawn(async move {
            let client = ClientEngine::connect(upstream, Duration::from_secs(2))
                .await
                .unwrap();
            client
                .write(WriteRequest::register_text(1, 10 + i, format!("{}", 100 + i)))
                .await
                .unwrap();
            let read = client
                .read(ReadRequest::registers(1, DataKind::Holding, 10 + i, 1))
                .await
                .unwrap();
            client.close().await.unwrap();
            read.registers[0]
        }));
    }
    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap(), 100 + i as u16);
    }

    bridge.stop().await;
    slave.stop().await;
}
