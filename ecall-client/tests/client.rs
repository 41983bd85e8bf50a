//! End-to-end calls against in-process servers on loopback.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ecall_client::{
    BreakerConfig, BreakerStatus, Client, ClientConfig, Format, Header, Node, NodeProvider, PoolConfig, RpcError,
    StaticNodes, Strategy,
};
use ecall_common::error::{ERROR_METHOD_NOT_FOUND, ERROR_SERVICE_NOT_FOUND};
use ecall_common::protocol::encode_value;
use ecall_server::{Router, Server, ServerConfig};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

const TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Sum {
    a: i64,
    b: i64,
}

fn calc_router(tag: &'static str) -> Router {
    Router::new("calc")
        .route("add", |_ctx, req: Sum| async move { Ok::<_, RpcError>(req.a + req.b) })
        .route("fail", |_ctx, _req: ()| async move { Err::<(), _>(RpcError::logic(2100, "nope")) })
        .route("whoami", move |_ctx, _req: ()| async move { Ok::<_, RpcError>(tag.to_string()) })
        .route("sleep", |_ctx, millis: u64| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok::<_, RpcError>(millis)
        })
        .route_raw("echo", |_ctx, body| async move { Ok::<_, RpcError>(body) })
}

/// Test logs follow `RUST_LOG`; silent by default.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Starts a server and returns the node that reaches it.
async fn start_server(tag: &'static str) -> Node {
    init_tracing();
    let config = ServerConfig {
        listen: "127.0.0.1:0".to_string(),
        service: "calc".to_string(),
        ..ServerConfig::default()
    };
    let server = Server::bind(config, calc_router(tag)).await.unwrap();
    let port = server.local_addr().unwrap().port();
    tokio::spawn(server.serve());
    Node::new("127.0.0.1", port, 1)
}

fn client_config(format: Format) -> ClientConfig {
    ClientConfig {
        format,
        strategy: Strategy::RoundRobin,
        pool: PoolConfig {
            min_size: 1,
            max_size: 2,
            ..PoolConfig::default()
        },
        ..ClientConfig::default()
    }
}

async fn single_node_client(format: Format) -> (Client, Arc<StaticNodes>) {
    let node = start_server("a").await;
    let provider = Arc::new(StaticNodes::new().with_service("calc", vec![node]));
    (Client::with_config(provider.clone(), client_config(format)), provider)
}

#[tokio::test]
async fn typed_request_in_both_formats() {
    for format in [Format::MsgPack, Format::Json] {
        let (client, _) = single_node_client(format).await;
        let sum: i64 = client.request("calc", "add", &Sum { a: 40, b: 2 }, TIMEOUT).await.unwrap();
        assert_eq!(sum, 42);
        assert_eq!(client.pending_calls(), 0);
    }
}

#[tokio::test]
async fn logic_and_system_errors_map_by_code() {
    let (client, _) = single_node_client(Format::MsgPack).await;

    let err = client.request::<_, ()>("calc", "fail", &(), TIMEOUT).await.unwrap_err();
    assert_eq!(err, RpcError::logic(2100, "nope"));

    let err = client.request::<_, ()>("calc", "divide", &(), TIMEOUT).await.unwrap_err();
    assert!(matches!(err, RpcError::System { code: ERROR_METHOD_NOT_FOUND, .. }));
}

#[tokio::test]
async fn slow_call_times_out_and_releases_session() {
    let (client, provider) = single_node_client(Format::Json).await;

    let err = client
        .request::<_, u64>("calc", "sleep", &400u64, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::Timeout);
    assert_eq!(client.pending_calls(), 0);
    let nodes = provider.nodes("calc").unwrap();
    assert_eq!(nodes[0].active(), 0);

    // The late response is dropped and the connection stays usable.
    tokio::time::sleep(Duration::from_millis(450)).await;
    let sum: i64 = client.request("calc", "add", &Sum { a: 1, b: 1 }, TIMEOUT).await.unwrap();
    assert_eq!(sum, 2);
}

#[tokio::test]
async fn unknown_service_and_empty_node_list() {
    let (client, provider) = single_node_client(Format::Json).await;

    let err = client.request::<_, ()>("billing", "charge", &(), TIMEOUT).await.unwrap_err();
    assert_eq!(err.code(), ERROR_SERVICE_NOT_FOUND);

    provider.set_nodes("calc", Vec::new());
    let err = client.request::<_, i64>("calc", "add", &Sum { a: 1, b: 2 }, TIMEOUT).await.unwrap_err();
    assert_eq!(err.code(), ERROR_SERVICE_NOT_FOUND);
}

#[tokio::test]
async fn route_key_sticks_to_one_node() {
    let provider = Arc::new(StaticNodes::new().with_service(
        "calc",
        vec![start_server("a").await, start_server("b").await, start_server("c").await],
    ));
    let client = Client::with_config(provider, client_config(Format::Json));

    let mut seen = Vec::new();
    for _ in 0..6 {
        let header = Header::new("calc", "whoami").with_route_key("user-42");
        let packet = client.request_with_header(Format::Json, header, &(), TIMEOUT).await.unwrap();
        seen.push(packet.into_result::<String>().unwrap());
    }
    assert!(seen.iter().all(|tag| tag == &seen[0]));

    // Without a route key round robin visits every node.
    let mut tags = Vec::new();
    for _ in 0..3 {
        tags.push(client.request::<_, String>("calc", "whoami", &(), TIMEOUT).await.unwrap());
    }
    tags.sort();
    assert_eq!(tags, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn concurrent_calls_share_few_connections() {
    let (client, _) = single_node_client(Format::MsgPack).await;

    let calls = (0..64i64).map(|i| {
        let client = client.clone();
        async move { client.request::<_, i64>("calc", "add", &Sum { a: i, b: i }, TIMEOUT).await }
    });
    let results = futures::future::join_all(calls).await;
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), 2 * i as i64);
    }

    let pools = client.service("calc").pools();
    assert_eq!(pools.len(), 1);
    assert!(pools[0].1.size() <= 2);
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn async_request_resolves_out_of_order() {
    let (client, _) = single_node_client(Format::Json).await;

    let slow = client.request_async("calc", "sleep", &150u64, TIMEOUT).await.unwrap();
    let fast = client.request_async("calc", "sleep", &1u64, TIMEOUT).await.unwrap();
    assert_ne!(slow.seq(), fast.seq());

    assert_eq!(fast.wait_for::<u64>().await.unwrap(), 1);
    assert_eq!(client.pending_calls(), 1);
    assert_eq!(slow.wait_for::<u64>().await.unwrap(), 150);
}

#[tokio::test]
async fn raw_request_passes_body_through() {
    let (client, _) = single_node_client(Format::MsgPack).await;

    let body = Bytes::from(encode_value(Format::Json, &Sum { a: 3, b: 4 }).unwrap());
    let header = Header::new("calc", "echo").with_trace_id("trace-1");
    let packet = client.request_raw(Format::Json, header, body.clone(), TIMEOUT).await.unwrap();
    assert_eq!(packet.format(), Format::Json);
    assert_eq!(packet.header().trace_id, "trace-1");
    assert_eq!(packet.body(), &body);
    assert_eq!(packet.decode_body::<Sum>().unwrap(), Sum { a: 3, b: 4 });
}

#[tokio::test]
async fn guarded_request_opens_breaker_on_failures() {
    let node = start_server("a").await;
    let provider = Arc::new(StaticNodes::new().with_service("calc", vec![node]));
    let config = ClientConfig {
        breaker: BreakerConfig {
            minimum_invokes: 2,
            open_duration: Duration::from_secs(30),
            ..BreakerConfig::default()
        },
        ..client_config(Format::Json)
    };
    let client = Client::with_config(provider, config);

    for _ in 0..3 {
        let err = client.guarded_request::<_, ()>("calc", "fail", &(), TIMEOUT).await.unwrap_err();
        assert_eq!(err.code(), 2100);
    }
    assert_eq!(client.breakers().status("calc.fail"), Some(BreakerStatus::Open));
    assert_eq!(client.guarded_request::<_, ()>("calc", "fail", &(), TIMEOUT).await, Ok(None));

    // Other methods have their own breaker.
    let sum = client.guarded_request::<_, i64>("calc", "add", &Sum { a: 2, b: 2 }, TIMEOUT).await;
    assert_eq!(sum, Ok(Some(4)));
}

#[tokio::test]
async fn shutdown_fails_later_requests() {
    let (client, provider) = single_node_client(Format::Json).await;
    let sum: i64 = client.request("calc", "add", &Sum { a: 1, b: 2 }, TIMEOUT).await.unwrap();
    assert_eq!(sum, 3);

    client.shutdown();
    assert!(client.request::<_, i64>("calc", "add", &Sum { a: 1, b: 2 }, TIMEOUT).await.is_err());

    // A node that shows up later gets no fresh pool.
    provider.set_nodes("calc", vec![start_server("late").await]);
    let err = client.request::<_, i64>("calc", "add", &Sum { a: 1, b: 1 }, TIMEOUT).await.unwrap_err();
    assert!(matches!(err, RpcError::System { .. }));

    // Neither does a service never called before.
    provider.set_nodes("search", vec![start_server("s").await]);
    assert!(client.request::<_, String>("search", "whoami", &(), TIMEOUT).await.is_err());
    assert!(client.service("search").pools().is_empty());
}

#[tokio::test]
async fn responses_wait_for_a_busy_dispatcher() {
    let node = start_server("a").await;
    let provider = Arc::new(StaticNodes::new().with_service("calc", vec![node]));
    let mut config = client_config(Format::MsgPack);
    config.connection.dispatch_workers = 1;
    config.pool.max_size = 1;
    let client = Client::with_config(provider, config);

    let calls = (0..200i64).map(|i| {
        let client = client.clone();
        async move {
            client
                .request::<_, i64>("calc", "add", &Sum { a: i, b: 1 }, Duration::from_secs(5))
                .await
        }
    });
    let results = futures::future::join_all(calls).await;
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), i as i64 + 1);
    }
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn departed_node_pool_is_retired() {
    let a = start_server("a").await;
    let b = start_server("b").await;
    let b_addr = b.addr();
    let provider = Arc::new(StaticNodes::new().with_service("calc", vec![a.clone(), b]));
    let client = Client::with_config(provider.clone(), client_config(Format::Json));

    for _ in 0..2 {
        client.request::<_, String>("calc", "whoami", &(), TIMEOUT).await.unwrap();
    }
    let pools = client.service("calc").pools();
    assert_eq!(pools.len(), 2);
    let (_, b_pool) = pools.iter().find(|(addr, _)| *addr == b_addr).cloned().unwrap();

    provider.set_nodes("calc", vec![a]);
    let tag: String = client.request("calc", "whoami", &(), TIMEOUT).await.unwrap();
    assert_eq!(tag, "a");

    let remaining = client.service("calc").pools();
    assert_eq!(remaining.len(), 1);
    assert_ne!(remaining[0].0, b_addr);
    assert!(b_pool.is_shutdown());
    assert_eq!(b_pool.idle_len(), 0);
}
