//! End-to-end test against the spawned server binary: seeds accounts,
//! exercises the api channel, and verifies fan-out across the
//! notifications, ride, and driver socket endpoints.

use std::{net::SocketAddr, path::Path, process::Stdio, time::Duration};

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    process::{Child, ChildStdout, Command},
    time::timeout,
};

use taxi_dispatch::message::{read_message, write_message, ServerToClient};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

const SEED: &str = r#"[
    {"token": "t-rita", "username": "rita"},
    {"token": "t-dave", "username": "dave", "is_driver": true,
     "taxi": {"license_plate": "TN-100", "lat": 36.8, "lng": 10.18}},
    {"token": "t-joe", "username": "joe"}
]"#;

#[tokio::test]
async fn dispatch_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("taxi_dispatch");
    let seed_path = std::env::temp_dir().join(format!("dispatch-seed-{}.json", std::process::id()));
    std::fs::write(&seed_path, SEED).context("write seed file")?;

    let (mut server, mut server_stdout) = spawn_server(&binary, &seed_path).await?;
    let addr = read_listen_addr(&mut server_stdout).await?;

    // Drain remaining server logs so the pipe never fills.
    let log_task = tokio::spawn(async move {
        let mut buffer = String::new();
        while matches!(server_stdout.read_line(&mut buffer).await, Ok(n) if n > 0) {
            buffer.clear();
        }
    });

    let outcome = run_scenario(addr).await;

    let _ = server.kill().await;
    let _ = server.wait().await;
    let _ = log_task.await;
    let _ = std::fs::remove_file(&seed_path);

    outcome
}

async fn run_scenario(addr: SocketAddr) -> Result<()> {
    // Unauthenticated notifications connections are refused with 4001.
    let (mut bad_reader, mut bad_writer) = connect(addr).await?;
    write_message(
        &mut bad_writer,
        &json!({"channel": "notifications", "token": "t-wrong"}),
    )
    .await?;
    match read_frame(&mut bad_reader).await? {
        Some(ServerToClient::Error { code, .. }) => assert_eq!(code, Some(4001)),
        other => return Err(anyhow!("expected 4001 refusal, got {other:?}")),
    }

    // A ride channel for an unknown ride closes without a welcome.
    let (mut ghost_reader, mut ghost_writer) = connect(addr).await?;
    write_message(&mut ghost_writer, &json!({"channel": "ride", "ride_id": 999})).await?;
    assert!(read_frame(&mut ghost_reader).await?.is_none());

    // Rita watches her personal notifications.
    let mut rita_inbox = join_channel(addr, json!({"channel": "notifications", "token": "t-rita"}))
        .await
        .context("rita notifications")?;

    // Rita creates a ride; the seeded taxi is bound by nearest-match.
    let mut rita_api = ApiClient::connect(addr, "t-rita").await?;
    let ride = rita_api
        .request(json!({"op": "create_ride",
            "start_lat": 36.8, "start_lng": 10.18,
            "end_lat": 36.9, "end_lng": 10.3}))
        .await?;
    assert_eq!(ride["status"], json!("waiting"));
    assert_eq!(ride["taxi"], json!(1));
    let ride_id = ride["id"].as_u64().context("ride id")?;

    // Two participants watch the ride channel.
    let mut rita_ride = join_channel(addr, json!({"channel": "ride", "ride_id": ride_id})).await?;
    let mut dave_ride = join_channel(addr, json!({"channel": "ride", "ride_id": ride_id})).await?;
    // And one observer watches dave's location stream (dave is user 2).
    let mut dave_feed = join_channel(addr, json!({"channel": "driver", "driver_id": 2})).await?;

    // Dave accepts; Rita is notified on her personal group.
    let mut dave_api = ApiClient::connect(addr, "t-dave").await?;
    let accepted = dave_api
        .request(json!({"op": "accept_ride", "ride_id": ride_id}))
        .await?;
    assert_eq!(accepted["status"], json!("accepted"));

    match read_frame(&mut rita_inbox.reader).await? {
        Some(ServerToClient::Event(event)) => {
            let event = serde_json::to_value(&event)?;
            assert_eq!(event["event"], json!("ride_status"));
            assert_eq!(event["status"], json!("accepted"));
        }
        other => return Err(anyhow!("expected ride_status for rita, got {other:?}")),
    }

    // A malformed ride frame is dropped silently; the channel keeps working.
    rita_ride.writer.write_all(b"this is not json\n").await?;
    rita_ride
        .send(&json!({"action": "chat", "data": {"text": "see you at the corner"}}))
        .await?;
    for participant in [&mut rita_ride, &mut dave_ride] {
        match read_frame(&mut participant.reader).await? {
            Some(ServerToClient::Event(event)) => {
                let event = serde_json::to_value(&event)?;
                assert_eq!(event["event"], json!("ride_event"));
                assert_eq!(event["action"], json!("chat"));
            }
            other => return Err(anyhow!("expected chat fan-out, got {other:?}")),
        }
    }

    // Dave reports a new position: his location stream and the active ride
    // group each see exactly one event.
    let ok = dave_api
        .request(json!({"op": "update_location", "taxi_id": 1, "lat": 36.81, "lng": 10.19}))
        .await?;
    assert_eq!(ok["status"], json!("ok"));

    match read_frame(&mut dave_feed.reader).await? {
        Some(ServerToClient::Event(event)) => {
            let event = serde_json::to_value(&event)?;
            assert_eq!(event["event"], json!("driver_location"));
            assert_eq!(event["lat"], json!(36.81));
        }
        other => return Err(anyhow!("expected driver_location, got {other:?}")),
    }
    match read_frame(&mut rita_ride.reader).await? {
        Some(ServerToClient::Event(event)) => {
            let event = serde_json::to_value(&event)?;
            assert_eq!(event["event"], json!("ride_event"));
            assert_eq!(event["action"], json!("location"));
        }
        other => return Err(anyhow!("expected ride location event, got {other:?}")),
    }

    // Errors travel back with their taxonomy kind: joe is not the passenger.
    let mut joe_api = ApiClient::connect(addr, "t-joe").await?;
    let denied = joe_api
        .request_raw(json!({"op": "pending_requests", "ride_id": ride_id}))
        .await?;
    match denied {
        ServerToClient::ApiError { kind, .. } => assert_eq!(kind, "forbidden"),
        other => return Err(anyhow!("expected forbidden error, got {other:?}")),
    }

    Ok(())
}

struct Channel {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Channel {
    async fn send(&mut self, frame: &Value) -> Result<()> {
        write_message(&mut self.writer, frame).await?;
        Ok(())
    }
}

/// Connects, sends the hello, and waits for the welcome frame so the
/// subscription is live before the caller proceeds.
async fn join_channel(addr: SocketAddr, hello: Value) -> Result<Channel> {
    let (mut reader, mut writer) = connect(addr).await?;
    write_message(&mut writer, &hello).await?;
    match read_frame(&mut reader).await? {
        Some(ServerToClient::Welcome { .. }) => Ok(Channel { reader, writer }),
        other => Err(anyhow!("expected welcome, got {other:?}")),
    }
}

struct ApiClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

impl ApiClient {
    async fn connect(addr: SocketAddr, token: &str) -> Result<Self> {
        let (mut reader, mut writer) = connect(addr).await?;
        write_message(&mut writer, &json!({"channel": "api", "token": token})).await?;
        match read_frame(&mut reader).await? {
            Some(ServerToClient::Welcome { .. }) => Ok(Self {
                reader,
                writer,
                next_id: 1,
            }),
            other => Err(anyhow!("expected api welcome, got {other:?}")),
        }
    }

    /// Sends one operation and returns the successful result payload.
    async fn request(&mut self, op: Value) -> Result<Value> {
        match self.request_raw(op).await? {
            ServerToClient::Response { result, .. } => Ok(result),
            other => Err(anyhow!("expected response, got {other:?}")),
        }
    }

    async fn request_raw(&mut self, mut op: Value) -> Result<ServerToClient> {
        let id = self.next_id;
        self.next_id += 1;
        op["id"] = json!(id);
        write_message(&mut self.writer, &op).await?;
        let frame = read_frame(&mut self.reader)
            .await?
            .context("api connection closed mid-request")?;
        Ok(frame)
    }
}

async fn connect(addr: SocketAddr) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

/// Reads one server frame with a timeout; `None` means the peer closed.
async fn read_frame(reader: &mut BufReader<OwnedReadHalf>) -> Result<Option<ServerToClient>> {
    match timeout(READ_TIMEOUT, read_message::<_, ServerToClient>(reader)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(anyhow!("timed out waiting for server frame")),
    }
}

async fn spawn_server(binary: &Path, seed: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("serve")
        .arg("--listen")
        .arg("127.0.0.1:0")
        .arg("--seed")
        .arg(seed)
        .env("RUST_LOG_STYLE", "never")
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd.spawn().context("failed to spawn dispatch server")?;
    let stdout = child
        .stdout
        .take()
        .context("server stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

async fn read_listen_addr(reader: &mut BufReader<ChildStdout>) -> Result<SocketAddr> {
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = timeout(READ_TIMEOUT, reader.read_line(&mut line))
            .await
            .context("timed out waiting for listen banner")??;
        if bytes == 0 {
            return Err(anyhow!("server exited before announcing its address"));
        }
        if let Some(pos) = line.find("listening on ") {
            let tail = line[pos + "listening on ".len()..].trim();
            // tracing may append escape codes when colors are on
            let addr = tail
                .split(|c: char| c.is_whitespace() || c == '\u{1b}')
                .next()
                .unwrap_or(tail);
            return addr
                .parse()
                .with_context(|| format!("unexpected listen banner: {line}"));
        }
    }
}
