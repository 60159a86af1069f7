//! Shared harness for broker integration tests: boots a broker on an
//! ephemeral port against tempdir storage and in-process coordination,
//! and speaks the wire protocol over a raw TCP stream.
#![allow(dead_code)]

use quiver_coordination::{Coordination, MemoryCoordination};
use quiver_wire::{
    ConnectRequest, ErrorCode, FetchRequest, Message, PutOffset, PutRecord, SessionType,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use broker::config::BrokerConfig;
use broker::supervisor::{BrokerHandle, BrokerServer};
use broker::transport::codec;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestBroker {
    pub handle: BrokerHandle,
    pub coordination: Arc<MemoryCoordination>,
    _data_dir: tempfile::TempDir,
    _log_dir: tempfile::TempDir,
}

pub async fn boot() -> TestBroker {
    boot_with(|_| {}).await
}

pub async fn boot_with(mutate: impl FnOnce(&mut BrokerConfig)) -> TestBroker {
    let data_dir = tempfile::tempdir().expect("data dir");
    let log_dir = tempfile::tempdir().expect("log dir");
    let mut config = BrokerConfig {
        port: 0,
        data_dir: data_dir.path().to_path_buf(),
        log_dir: log_dir.path().to_path_buf(),
        ..BrokerConfig::default()
    };
    mutate(&mut config);
    let coordination = Arc::new(MemoryCoordination::new());
    let handle = BrokerServer::new(config)
        .with_coordination(coordination.clone())
        .start()
        .await
        .expect("boot broker");
    TestBroker {
        handle,
        coordination,
        _data_dir: data_dir,
        _log_dir: log_dir,
    }
}

impl TestBroker {
    pub async fn client(&self) -> TestClient {
        TestClient::connect(self.handle.local_addr()).await
    }
}

pub struct TestClient {
    stream: TcpStream,
}

pub fn node_id() -> Vec<u8> {
    rand::random::<[u8; 24]>().to_vec()
}

impl TestClient {
    pub async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect to broker");
        Self { stream }
    }

    pub async fn send(&mut self, message: &Message) {
        codec::write_message(&mut self.stream, message)
            .await
            .expect("send message");
    }

    /// Next message, or `None` on a clean server FIN.
    pub async fn recv(&mut self) -> Option<Message> {
        timeout(RECV_TIMEOUT, codec::read_message(&mut self.stream, 16 * 1024 * 1024))
            .await
            .expect("recv timed out")
            .expect("recv failed")
    }

    /// Next message if one arrives within `wait`.
    pub async fn try_recv(&mut self, wait: Duration) -> Option<Message> {
        match timeout(wait, codec::read_message(&mut self.stream, 16 * 1024 * 1024)).await {
            Ok(result) => result.expect("recv failed"),
            Err(_) => None,
        }
    }

    pub async fn request(&mut self, message: &Message) -> Message {
        self.send(message).await;
        self.recv().await.expect("response")
    }

    pub async fn create_topic(&mut self, name: &str, num_fragments: u32) {
        let response = self
            .request(&Message::CreateTopicRequest {
                name: name.to_string(),
                description: format!("{name} topic"),
                num_fragments,
                replication_factor: 1,
            })
            .await;
        assert_eq!(response, Message::CreateTopicResponse {});
    }

    pub async fn connect_session(
        &mut self,
        session_type: SessionType,
        topic: &str,
        fragment_ids: Vec<u32>,
    ) {
        let response = self
            .request(&Message::ConnectRequest(ConnectRequest {
                session_type,
                topic: topic.to_string(),
                fragment_ids,
            }))
            .await;
        assert_eq!(response, Message::ConnectResponse {});
    }

    pub async fn put(&mut self, records: Vec<PutRecord>) -> Vec<PutOffset> {
        let response = self.request(&Message::PutRequest { records }).await;
        match response {
            Message::PutResponse { offsets } => offsets,
            other => panic!("expected PutResponse, got {other:?}"),
        }
    }

    pub async fn fetch(&mut self, fragment: u32, start_offset: u64, batch_size: u32) {
        self.send(&Message::FetchRequest(FetchRequest {
            fragment,
            start_offset,
            batch_size,
            flush_interval_ms: 100,
        }))
        .await;
    }

    pub async fn expect_error_ack(&mut self, code: ErrorCode) {
        match self.recv().await {
            Some(Message::ErrorAck { code: got, .. }) => assert_eq!(got, code),
            other => panic!("expected ErrorAck({code:?}), got {other:?}"),
        }
    }
}

/// Poll the durable last offset until it reaches `expected` or `wait`
/// elapses. Returns the final observed value.
pub async fn wait_for_last_offset(
    coordination: &MemoryCoordination,
    topic: &str,
    fragment: u32,
    expected: u64,
    wait: Duration,
) -> u64 {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let observed = coordination
            .fragment_data(topic, fragment)
            .await
            .map(|data| data.last_offset)
            .unwrap_or(0);
        if observed >= expected || tokio::time::Instant::now() >= deadline {
            return observed;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
