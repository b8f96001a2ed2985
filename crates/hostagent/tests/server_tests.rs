//! Connection handler and client over in-memory and Unix socket transports.
#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Harness, eventually};
use hostagent::allowlist::ProcessPathAllowList;
use hostagent::checksum::compute_checksum;
use hostagent::client::{AgentClient, remote_code};
use hostagent::server::AgentServer;
use hostagent::transport::Listener;
use hostagent::WaitEvent;
use hostagent_protocol::{
    AgentRequest, AgentResponse, ErrorCode, Expose, KeepAliveRequest, MountRequest, Protocol,
    StartRequest, VolumePath, WaitRequest,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

struct Conn {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl Conn {
    fn open(server: &Arc<AgentServer>) -> Self {
        let (client, server_side) = tokio::io::duplex(64 * 1024);
        let server = Arc::clone(server);
        tokio::spawn(async move { server.handle_connection(server_side).await });
        let (reader, writer) = tokio::io::split(client);
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn send(&mut self, req: &AgentRequest) {
        self.send_raw(&serde_json::to_string(req).unwrap()).await;
    }

    async fn recv(&mut self) -> AgentResponse {
        let line = tokio::time::timeout(Duration::from_secs(10), self.lines.next_line())
            .await
            .expect("no response")
            .unwrap()
            .expect("connection closed");
        serde_json::from_str(&line).unwrap()
    }
}

async fn start_request(h: &Harness, name: &str, body: &str) -> StartRequest {
    let path = h.script(name, body);
    StartRequest {
        checksum: compute_checksum(&path).await.unwrap(),
        path: path.to_string_lossy().into_owned(),
        ..Default::default()
    }
}

fn server_for(h: &Harness) -> Arc<AgentServer> {
    Arc::new(AgentServer::new(h.service(ProcessPathAllowList::default())))
}

#[tokio::test]
async fn test_ping_and_bad_json() {
    let h = Harness::new();
    let mut conn = Conn::open(&server_for(&h));

    conn.send(&AgentRequest::Ping).await;
    assert!(matches!(conn.recv().await, AgentResponse::Pong));

    conn.send_raw("{not json").await;
    match conn.recv().await {
        AgentResponse::Error(e) => assert_eq!(e.code, ErrorCode::InvalidArgument),
        other => panic!("unexpected: {other:?}"),
    }

    // Connection still usable.
    conn.send(&AgentRequest::Version).await;
    match conn.recv().await {
        AgentResponse::Version(v) => assert_eq!(v.agent_version, env!("CARGO_PKG_VERSION")),
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn test_mount_frames() {
    let h = Harness::new();
    let backing = h.dir.path().join("backing");
    std::fs::create_dir_all(&backing).unwrap();
    h.containers.insert("app=flannel", "/var/run/secrets", &backing);
    let destination = h.dir.path().join("host/secrets");
    let mut conn = Conn::open(&server_for(&h));

    conn.send(&AgentRequest::Mount(MountRequest {
        selectors: vec!["app=flannel".to_string()],
        paths: vec![VolumePath::new(
            "/var/run/secrets",
            destination.to_string_lossy(),
        )],
    }))
    .await;
    match conn.recv().await {
        AgentResponse::Mounted(m) => {
            assert_eq!(m.destinations, vec![destination.display().to_string()])
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(std::fs::read_link(&destination).unwrap(), backing);

    conn.send(&AgentRequest::Mount(MountRequest {
        selectors: vec!["app=other".to_string()],
        ..Default::default()
    }))
    .await;
    match conn.recv().await {
        AgentResponse::Error(e) => assert_eq!(e.code, ErrorCode::InvalidArgument),
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn test_start_then_wait_on_one_connection() {
    let h = Harness::new();
    let mut conn = Conn::open(&server_for(&h));

    conn.send(&AgentRequest::Start(
        start_request(&h, "banner", "printf 'hello\\0world'\nexit 4").await,
    ))
    .await;
    let name = match conn.recv().await {
        AgentResponse::Started(s) => s.process_name,
        other => panic!("unexpected: {other:?}"),
    };
    assert_eq!(name, "hostagent-banner");

    conn.send(&AgentRequest::Wait(WaitRequest {
        process_name: name.clone(),
    }))
    .await;
    let mut stdout = Vec::new();
    let exit_code = loop {
        match conn.recv().await {
            AgentResponse::Stdout(chunk) => stdout.extend(chunk.to_bytes().unwrap()),
            AgentResponse::Stderr(_) => panic!("nothing written to stderr"),
            AgentResponse::Exited(e) => break e.exit_code,
            other => panic!("unexpected: {other:?}"),
        }
    };
    assert_eq!(stdout, b"hello\0world");
    assert_eq!(exit_code, Some(4));

    // The wait stream hands the connection back.
    conn.send(&AgentRequest::Ping).await;
    assert!(matches!(conn.recv().await, AgentResponse::Pong));
}

#[tokio::test]
async fn test_wait_unknown_and_stray_close() {
    let h = Harness::new();
    let mut conn = Conn::open(&server_for(&h));

    conn.send(&AgentRequest::Wait(WaitRequest {
        process_name: "hostagent-ghost".to_string(),
    }))
    .await;
    match conn.recv().await {
        AgentResponse::Error(e) => assert_eq!(e.code, ErrorCode::NotFound),
        other => panic!("unexpected: {other:?}"),
    }

    conn.send(&AgentRequest::KeepAliveClose).await;
    match conn.recv().await {
        AgentResponse::Error(e) => assert_eq!(e.code, ErrorCode::InvalidArgument),
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn test_keep_alive_close_acks_after_kill() {
    let h = Harness::new();
    let server = server_for(&h);
    let mut control = Conn::open(&server);
    control
        .send(&AgentRequest::Start(
            start_request(&h, "svc", "exec sleep 30").await,
        ))
        .await;
    let name = match control.recv().await {
        AgentResponse::Started(s) => s.process_name,
        other => panic!("unexpected: {other:?}"),
    };
    let process = h.registry.get(&name).unwrap();

    let mut session = Conn::open(&server);
    for _ in 0..3 {
        session
            .send(&AgentRequest::KeepAlive(KeepAliveRequest {
                process_name: name.clone(),
            }))
            .await;
    }
    session.send(&AgentRequest::KeepAliveClose).await;
    assert!(matches!(session.recv().await, AgentResponse::KeepAliveAck));

    assert!(!process.is_running());
    assert!(h.registry.is_empty());
}

#[tokio::test]
async fn test_dropped_keep_alive_connection_kills() {
    let h = Harness::new();
    let server = server_for(&h);
    let mut control = Conn::open(&server);
    control
        .send(&AgentRequest::Start(
            start_request(&h, "svc", "exec sleep 30").await,
        ))
        .await;
    let name = match control.recv().await {
        AgentResponse::Started(s) => s.process_name,
        other => panic!("unexpected: {other:?}"),
    };

    let mut session = Conn::open(&server);
    session
        .send(&AgentRequest::KeepAlive(KeepAliveRequest {
            process_name: name.clone(),
        }))
        .await;
    drop(session);

    let registry = h.registry.clone();
    assert!(eventually(Duration::from_secs(10), || registry.is_empty()).await);
}

#[tokio::test]
async fn test_client_end_to_end_over_socket() {
    let h = Harness::new();
    let endpoint = h.dir.path().join("agent.sock").to_string_lossy().into_owned();
    let listener = Listener::bind(&endpoint).await.unwrap();
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(server_for(&h).serve(listener, shutdown.clone()));

    let client = AgentClient::new(endpoint.clone());
    assert!(client.ping().await.unwrap());

    let mut request = start_request(&h, "echoserver", "echo listening on 9000\nexec sleep 30").await;
    request.exposes = vec![Expose::new(Protocol::Tcp, 9000)];
    let name = client.start(request).await.unwrap();
    assert_eq!(name, "hostagent-echoserver");
    assert!(h.shell.commands()[0].contains("'hostagent-echoserver-TCP-9000'"));

    let session = client.keep_alive(&name).await.unwrap();
    let mut wait = client.wait(&name).await.unwrap();
    match wait.next().await.unwrap() {
        Some(WaitEvent::Stdout(data)) => assert_eq!(data, b"listening on 9000\n"),
        other => panic!("unexpected: {other:?}"),
    }

    session.close().await.unwrap();
    assert!(h.registry.is_empty());
    let commands = h.shell.commands();
    assert!(commands.last().unwrap().contains("'hostagent-echoserver-*'"));

    // The killed process ends the wait stream.
    let mut exited = false;
    while let Some(event) = wait.next().await.unwrap() {
        if let WaitEvent::Exited(_) = event {
            exited = true;
        }
    }
    assert!(exited);

    // Remote errors keep their code.
    let err = client.wait("hostagent-ghost").await.unwrap().next().await.unwrap_err();
    assert_eq!(remote_code(&err), Some(ErrorCode::NotFound));

    shutdown.cancel();
    server.await.unwrap().unwrap();
    assert!(!std::path::Path::new(&endpoint).exists());
}
