//! Engine tests over in-memory control channels.
//!
//! Each test plays the agent by hand: it writes raw frames into one end of a
//! duplex pipe while `Relay::accept` serves the other end.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;

use burrow::relay::{ConnectionStatus, Relay, TunnelRequest};
use burrow::transport::stream::{self, StreamFrameReader, StreamFrameWriter};
use burrow::transport::{FrameReader, FrameWriter};
use burrow::{Frame, RelayConfig, RequestId, ResponseMetadata, TunnelError};

const MAX_FRAME: usize = 1 << 20;

/// Agent end of a control connection.
struct FakeAgent {
    writer: StreamFrameWriter<tokio::io::WriteHalf<DuplexStream>>,
    reader: StreamFrameReader<tokio::io::ReadHalf<DuplexStream>>,
    session: JoinHandle<anyhow::Result<burrow::ConnectionId>>,
}

impl FakeAgent {
    /// Open a pipe and start `relay.accept` on the far end without
    /// sending anything yet.
    fn open(relay: &Relay) -> Self {
        let (agent_side, relay_side) = tokio::io::duplex(64 * 1024);
        let (writer, reader) = stream::split(agent_side, MAX_FRAME);
        let (relay_writer, relay_reader) = stream::split(relay_side, MAX_FRAME);
        let relay = relay.clone();
        let session = tokio::spawn(async move { relay.accept(relay_reader, relay_writer).await });
        Self {
            writer,
            reader,
            session,
        }
    }

    /// Open and register, returning the identity the relay granted.
    async fn connect(relay: &Relay, identity: Option<&str>) -> (Self, Option<String>) {
        let mut agent = Self::open(relay);
        agent
            .send(Frame::Register {
                identity: identity.map(str::to_string),
            })
            .await;
        match agent.recv().await {
            Frame::Registered { identity, .. } => (agent, identity),
            other => panic!("expected Registered, got {other:?}"),
        }
    }

    async fn send(&mut self, frame: Frame) {
        self.writer.send(frame.encode()).await.unwrap();
    }

    async fn recv(&mut self) -> Frame {
        let bytes = self.reader.recv().await.unwrap().unwrap();
        Frame::decode(&bytes).unwrap()
    }

    async fn recv_request(&mut self) -> (RequestId, String) {
        loop {
            match self.recv().await {
                Frame::Request {
                    request_id, path, ..
                } => return (request_id, path),
                Frame::Heartbeat => continue,
                other => panic!("expected Request, got {other:?}"),
            }
        }
    }
}

fn test_config() -> RelayConfig {
    RelayConfig {
        base_domain: Some("example.com".to_string()),
        ..RelayConfig::default()
    }
}

fn get(path: &str) -> TunnelRequest {
    TunnelRequest {
        method: "GET".to_string(),
        path: path.to_string(),
        headers: Vec::new(),
        body: Bytes::new(),
    }
}

fn metadata(request_id: &RequestId) -> Frame {
    Frame::Metadata {
        request_id: request_id.clone(),
        metadata: ResponseMetadata::implicit(),
    }
}

/// Dispatch `path` to the agent holding `host` and read the whole body.
async fn fetch(relay: &Relay, host: &str, path: &str) -> Result<Vec<u8>, TunnelError> {
    let conn = relay.route(Some(host))?;
    let handle = relay.multiplexer().dispatch(&conn, get(path)).await?;
    let response = relay.assembler().open(handle, None).await?;

    let mut body = Vec::new();
    let mut stream = response.body;
    while let Some(chunk) = stream.next().await {
        body.extend_from_slice(&chunk?);
    }
    Ok(body)
}

#[tokio::test]
async fn test_concurrent_requests_stay_ordered_without_cross_talk() {
    const N: usize = 20;
    const ROUNDS: usize = 4;

    let relay = Relay::new(test_config());
    let (mut agent, identity) = FakeAgent::connect(&relay, Some("demo")).await;
    assert_eq!(identity.as_deref(), Some("demo"));

    let mut consumers = Vec::new();
    for i in 0..N {
        let relay = relay.clone();
        consumers.push(tokio::spawn(async move {
            let body = fetch(&relay, "demo.example.com", &format!("/item/{i}"))
                .await
                .unwrap();
            (i, body)
        }));
    }

    let mut requests = Vec::new();
    for _ in 0..N {
        requests.push(agent.recv_request().await);
    }

    for (id, _) in &requests {
        agent.send(metadata(id)).await;
    }
    // Interleave chunks across requests, walking them in a different order
    // each round.
    for round in 0..ROUNDS {
        let order: Vec<&(RequestId, String)> = if round % 2 == 0 {
            requests.iter().collect()
        } else {
            requests.iter().rev().collect()
        };
        for (id, path) in order {
            agent
                .send(Frame::Chunk {
                    request_id: id.clone(),
                    data: Bytes::from(format!("{path}#{round};")),
                })
                .await;
        }
    }
    for (id, _) in &requests {
        agent
            .send(Frame::End {
                request_id: id.clone(),
            })
            .await;
    }

    let mut bodies = HashMap::new();
    for consumer in consumers {
        let (i, body) = consumer.await.unwrap();
        bodies.insert(i, String::from_utf8(body).unwrap());
    }
    for i in 0..N {
        let expected: String = (0..ROUNDS).map(|r| format!("/item/{i}#{r};")).collect();
        assert_eq!(bodies[&i], expected);
    }
    assert!(relay.pending().is_empty());
}

#[tokio::test]
async fn test_first_frame_must_be_register() {
    let relay = Relay::new(test_config());
    let mut agent = FakeAgent::open(&relay);
    agent.send(Frame::Heartbeat).await;

    let result = agent.session.await.unwrap();
    assert!(result.unwrap_err().to_string().contains("Register"));
    assert!(relay.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_silent_handshake_times_out() {
    let relay = Relay::new(test_config());
    let agent = FakeAgent::open(&relay);

    assert!(agent.session.await.unwrap().is_err());
    assert!(relay.registry().is_empty());
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection_alive() {
    let relay = Relay::new(test_config());
    let (mut agent, _) = FakeAgent::connect(&relay, Some("demo")).await;

    agent.writer.send(vec![0xEE, 0x00, 0x01]).await.unwrap();
    agent.writer.send(vec![0x05, 0x00, 0x00]).await.unwrap();
    agent.send(Frame::Heartbeat).await;

    assert_eq!(agent.recv().await, Frame::HeartbeatAck);
    assert_eq!(relay.registry().len(), 1);
}

#[tokio::test]
async fn test_duplicate_identities_are_both_routable() {
    let relay = Relay::new(test_config());
    let (mut first, first_identity) = FakeAgent::connect(&relay, Some("name")).await;
    let (mut second, second_identity) = FakeAgent::connect(&relay, Some("name")).await;
    assert_eq!(first_identity.as_deref(), Some("name"));
    assert_eq!(second_identity.as_deref(), Some("name-1"));

    let fetch_first = tokio::spawn({
        let relay = relay.clone();
        async move { fetch(&relay, "name.example.com", "/").await }
    });
    let fetch_second = tokio::spawn({
        let relay = relay.clone();
        async move { fetch(&relay, "name-1.example.com", "/").await }
    });

    for (agent, reply) in [(&mut first, "first"), (&mut second, "second")] {
        let (id, _) = agent.recv_request().await;
        agent
            .send(Frame::Chunk {
                request_id: id.clone(),
                data: Bytes::from_static(reply.as_bytes()),
            })
            .await;
        agent.send(Frame::End { request_id: id }).await;
    }

    assert_eq!(fetch_first.await.unwrap().unwrap(), b"first");
    assert_eq!(fetch_second.await.unwrap().unwrap(), b"second");
}

#[tokio::test]
async fn test_unknown_identity_creates_no_pending_request() {
    let relay = Relay::new(test_config());
    let (_agent, _) = FakeAgent::connect(&relay, Some("demo")).await;

    let err = fetch(&relay, "ghost.example.com", "/").await.unwrap_err();
    assert_eq!(err, TunnelError::IdentityNotFound("ghost".to_string()));
    assert_eq!(err.http_status().as_u16(), 404);
    assert!(relay.pending().is_empty());
}

#[tokio::test]
async fn test_agent_disconnect_fails_pending_requests() {
    let relay = Relay::new(test_config());
    let (mut agent, _) = FakeAgent::connect(&relay, Some("demo")).await;

    let request = tokio::spawn({
        let relay = relay.clone();
        async move { fetch(&relay, "demo.example.com", "/slow").await }
    });
    agent.recv_request().await;

    let FakeAgent {
        mut writer,
        reader,
        session,
    } = agent;
    writer.close().await.unwrap();
    drop(writer);
    drop(reader);

    let err = request.await.unwrap().unwrap_err();
    assert_eq!(err, TunnelError::AgentDisconnected);
    assert_eq!(err.http_status().as_u16(), 502);

    session.await.unwrap().unwrap();
    assert!(relay.registry().is_empty());
    assert!(relay.pending().is_empty());
}

#[tokio::test]
async fn test_late_frames_do_not_resurrect_requests() {
    let relay = Relay::new(test_config());
    let (mut agent, _) = FakeAgent::connect(&relay, Some("demo")).await;

    let request = tokio::spawn({
        let relay = relay.clone();
        async move { fetch(&relay, "demo.example.com", "/").await }
    });
    let (id, _) = agent.recv_request().await;
    agent.send(metadata(&id)).await;
    agent
        .send(Frame::End {
            request_id: id.clone(),
        })
        .await;
    assert_eq!(request.await.unwrap().unwrap(), b"");

    agent
        .send(Frame::Chunk {
            request_id: id.clone(),
            data: Bytes::from_static(b"too late"),
        })
        .await;
    agent.send(Frame::Heartbeat).await;
    assert_eq!(agent.recv().await, Frame::HeartbeatAck);

    assert!(!relay.pending().contains(&id));
    assert!(relay.pending().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_silent_agent_is_dropped_within_one_cycle() {
    let relay = Relay::new(RelayConfig {
        heartbeat_interval_secs: 1,
        heartbeat_multiplier: 2,
        ..test_config()
    });
    let maintenance = relay.spawn_maintenance();
    let (mut agent, _) = FakeAgent::connect(&relay, Some("demo")).await;

    let request = tokio::spawn({
        let relay = relay.clone();
        async move { fetch(&relay, "demo.example.com", "/").await }
    });
    agent.recv_request().await;

    // The agent never answers: after 2s of silence the next monitor tick
    // closes the connection.
    let err = request.await.unwrap().unwrap_err();
    assert_eq!(err, TunnelError::AgentDisconnected);
    assert!(relay.registry().is_empty());
    assert!(relay.pending().is_empty());

    relay.shutdown();
    for task in maintenance {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn test_shutdown_rejects_new_requests_on_draining_connection() {
    let relay = Relay::new(test_config());
    let (agent, _) = FakeAgent::connect(&relay, Some("demo")).await;

    relay.shutdown();
    let conn = relay.route(Some("demo.example.com")).unwrap();
    assert_eq!(conn.status(), ConnectionStatus::Draining);
    assert_eq!(
        relay.multiplexer().dispatch(&conn, get("/")).await.unwrap_err(),
        TunnelError::AgentUnreachable
    );

    relay.close_all("test over");
    assert!(agent.session.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_cancelled_request_unblocks_read_loop() {
    let relay = Relay::new(RelayConfig {
        queue_capacity: 1,
        ..test_config()
    });
    let (mut agent, _) = FakeAgent::connect(&relay, Some("demo")).await;

    let conn = relay.route(Some("demo.example.com")).unwrap();
    let handle = relay.multiplexer().dispatch(&conn, get("/slow")).await.unwrap();
    let (id, _) = agent.recv_request().await;

    // Metadata fills the queue; the chunk parks the read loop behind it.
    agent.send(metadata(&id)).await;
    agent
        .send(Frame::Chunk {
            request_id: id.clone(),
            data: Bytes::from_static(b"stuck"),
        })
        .await;
    agent.send(Frame::Heartbeat).await;
    let blocked = tokio::time::timeout(Duration::from_millis(200), agent.recv()).await;
    assert!(blocked.is_err(), "read loop answered while parked on a full queue");

    drop(handle);

    let ack = tokio::time::timeout(Duration::from_secs(1), agent.recv())
        .await
        .expect("read loop still blocked after the caller went away");
    assert_eq!(ack, Frame::HeartbeatAck);
    assert!(relay.pending().is_empty());
    assert_eq!(relay.registry().len(), 1);
}
