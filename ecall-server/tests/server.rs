use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ecall_common::{
    decode, encode, ConnectionConfig, Connection, Dispatcher, Format, FrameHandler, FrameLimits, Header, RpcError,
};
use ecall_server::{CallMonitor, Pipeline, Router, Server, ServerConfig};
use futures::future::BoxFuture;
use tokio::sync::mpsc;

struct Inbox(mpsc::UnboundedSender<Bytes>);

impl FrameHandler for Inbox {
    fn handle<'a>(&'a self, frame: Bytes, _conn: Arc<Connection>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let _ = self.0.send(frame);
        })
    }
}

#[tokio::test]
async fn monitored_server_counts_calls_per_method() {
    let monitor = CallMonitor::new();
    let router = Router::new("greeter")
        .route("hello", |_ctx, name: String| async move { Ok::<_, RpcError>(format!("hello {name}")) })
        .route("reject", |_ctx, _name: String| async move { Err::<String, _>(RpcError::logic(3000, "no")) });
    let pipeline = Pipeline::builder(router).with(monitor.clone()).build();

    let config = ServerConfig {
        listen: "127.0.0.1:0".to_string(),
        service: "greeter".to_string(),
        ..ServerConfig::default()
    };
    let server = Server::bind(config, pipeline).await.unwrap();
    let addr = server.local_addr().unwrap().to_string();
    tokio::spawn(server.serve());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = Connection::connect(&addr, &ConnectionConfig::default(), Dispatcher::new(Arc::new(Inbox(tx)), 8))
        .await
        .unwrap();

    let calls = [("hello", 1u64), ("hello", 2), ("reject", 3)];
    for (method, seq) in calls {
        let header = Header::new("greeter", method).with_seq(seq);
        conn.send(encode(Format::MsgPack, &header, "ann").unwrap()).await.unwrap();
    }

    let mut replies = Vec::new();
    for _ in 0..calls.len() {
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        replies.push(decode(frame, &FrameLimits::default()).unwrap());
    }
    replies.sort_by_key(|packet| packet.header().seq);

    assert_eq!(replies[0].clone().into_result::<String>().unwrap(), "hello ann");
    assert_eq!(replies[2].header().ret, 3000);
    assert_eq!(replies[2].header().msg, "no");

    let report = monitor.take_snapshot();
    assert_eq!(report["hello"].requests_total, 2);
    assert_eq!(report["hello"].errors_total, 0);
    assert_eq!(report["reject"].errors_total, 1);
    assert!(monitor.snapshot().is_empty());
}
