use std::{
    path::Path,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Result};
use memory_store::{command::PROMPT, Config, Server, ServerState, Store};
use tempfile::TempDir;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(2);

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    /// Connects and consumes the welcome line.
    async fn connect(server: &Server) -> Result<Self> {
        let stream = TcpStream::connect(server.local_addr()).await?;
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
        };
        let welcome = client.read_message().await?;
        assert_eq!(welcome, "--- Welcome to RuntimeDB server");
        Ok(client)
    }

    async fn send(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        Ok(())
    }

    async fn request(&mut self, line: &str) -> Result<String> {
        self.send(line).await?;
        self.read_message().await
    }

    /// Reads one message, dropping the prompt the previous message left
    /// at the start of the line.
    async fn read_message(&mut self) -> Result<String> {
        let mut line = String::new();
        let read = timeout(READ_TIMEOUT, self.reader.read_line(&mut line)).await??;
        if read == 0 {
            return Err(anyhow!("connection closed"));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        Ok(line.strip_prefix(PROMPT).unwrap_or(line).to_string())
    }

    /// Waits for the server to close the connection and returns whatever
    /// bytes arrived before it did.
    async fn read_to_close(&mut self, within: Duration) -> Result<String> {
        let mut rest = String::new();
        timeout(within, self.reader.read_to_string(&mut rest)).await??;
        Ok(rest)
    }
}

async fn start(dir: &TempDir, grace_period: Duration) -> Result<Server> {
    let config = Config {
        addr: "127.0.0.1:0".parse()?,
        snapshot_path: dir.path().join("db.json"),
        grace_period,
    };
    Server::bind(config).await
}

fn snapshot_at(path: &Path) -> Store {
    Store::load(path)
}

#[tokio::test]
async fn set_then_get_returns_the_value() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = start(&dir, Duration::from_secs(1)).await?;
    let mut client = Client::connect(&server).await?;

    assert_eq!(client.request("set foo bar").await?, "--- OK, inserted the data");
    assert_eq!(client.request("get foo").await?, "bar");

    client.send("exit").await?;
    server.stop().await
}

#[tokio::test]
async fn missing_keys_and_deletes_report_not_found() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = start(&dir, Duration::from_secs(1)).await?;
    let mut client = Client::connect(&server).await?;

    assert_eq!(client.request("get missing").await?, "--- Key missing not found");

    client.request("set foo bar").await?;
    assert_eq!(client.request("delete foo").await?, "--- OK, deleted the data");
    assert_eq!(client.request("get foo").await?, "--- Key foo not found");

    client.send("exit").await?;
    server.stop().await
}

#[tokio::test]
async fn unknown_commands_are_echoed_and_keep_the_connection() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = start(&dir, Duration::from_secs(1)).await?;
    let mut client = Client::connect(&server).await?;

    let reply = client.request("banana").await?;
    assert!(reply.contains("banana"), "unexpected reply {reply:?}");
    assert!(reply.starts_with("--- UNKNOWN"));

    let reply = client.request("set key with spaces").await?;
    assert!(reply.starts_with("--- UNKNOWN"));
    assert_eq!(client.request("get key").await?, "--- Key key not found");

    client.send("exit").await?;
    server.stop().await
}

#[tokio::test]
async fn invalid_utf8_gets_a_reply_and_keeps_the_connection() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = start(&dir, Duration::from_secs(1)).await?;
    let mut client = Client::connect(&server).await?;

    client.writer.write_all(b"\xffbad\nget foo\n").await?;
    let reply = client.read_message().await?;
    assert!(reply.starts_with("--- UNKNOWN: "), "unexpected reply {reply:?}");
    assert_eq!(client.read_message().await?, "--- Key foo not found");

    client.send("exit").await?;
    server.stop().await
}

#[tokio::test]
async fn exit_closes_without_a_reply() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = start(&dir, Duration::from_secs(1)).await?;
    let mut client = Client::connect(&server).await?;

    client.send("exit").await?;
    // Only the prompt that followed the welcome line is left on the wire.
    let rest = client.read_to_close(READ_TIMEOUT).await?;
    assert_eq!(rest, PROMPT);

    server.stop().await
}

#[tokio::test]
async fn connections_share_one_store() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = start(&dir, Duration::from_secs(1)).await?;
    let mut alice = Client::connect(&server).await?;
    let mut bob = Client::connect(&server).await?;

    alice.request("set shared one").await?;
    assert_eq!(bob.request("get shared").await?, "one");
    bob.request("set shared two").await?;
    assert_eq!(alice.request("get shared").await?, "two");

    alice.send("exit").await?;
    bob.send("exit").await?;
    server.stop().await
}

#[tokio::test]
async fn registry_tracks_open_connections() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = start(&dir, Duration::from_secs(1)).await?;

    let mut client = Client::connect(&server).await?;
    assert_eq!(server.registry().len(), 1);

    client.send("exit").await?;
    client.read_to_close(READ_TIMEOUT).await?;

    let deadline = Instant::now() + READ_TIMEOUT;
    while !server.registry().is_empty() {
        assert!(Instant::now() < deadline, "connection was never unregistered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    server.stop().await
}

#[tokio::test]
async fn stop_saves_snapshot_and_restart_loads_it() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = start(&dir, Duration::from_secs(1)).await?;
    let mut client = Client::connect(&server).await?;

    client.request("set alpha 1").await?;
    client.request("set beta 2").await?;
    client.request("delete beta").await?;
    client.send("exit").await?;

    assert_eq!(server.state(), ServerState::Running);
    server.stop().await?;

    let saved = snapshot_at(&dir.path().join("db.json"));
    assert_eq!(saved.get("alpha").as_deref(), Some("1"));
    assert_eq!(saved.get("beta"), None);

    let restarted = start(&dir, Duration::from_secs(1)).await?;
    let mut client = Client::connect(&restarted).await?;
    assert_eq!(client.request("get alpha").await?, "1");
    client.send("exit").await?;
    restarted.stop().await
}

#[tokio::test]
async fn stop_with_no_clients_returns_promptly() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = start(&dir, Duration::from_secs(30)).await?;

    timeout(Duration::from_secs(2), server.stop()).await??;
    assert!(dir.path().join("db.json").exists());
    Ok(())
}

#[tokio::test]
async fn shutdown_warns_then_force_closes_idle_clients() -> Result<()> {
    let grace = Duration::from_millis(500);
    let dir = tempfile::tempdir()?;
    let server = start(&dir, grace).await?;
    let mut client = Client::connect(&server).await?;
    client.request("set kept value").await?;

    let started = Instant::now();
    let stopping = tokio::spawn(server.stop());

    let warning = client.read_message().await?;
    assert_eq!(warning, "--- Host wants to shut down the server in 500ms");

    let rest = client.read_to_close(grace + Duration::from_secs(2)).await?;
    assert_eq!(rest, PROMPT);
    let elapsed = started.elapsed();
    assert!(elapsed >= grace, "closed after {elapsed:?}, before the grace period");

    timeout(Duration::from_secs(3), stopping).await???;
    assert!(started.elapsed() < grace + Duration::from_secs(2));

    let saved = snapshot_at(&dir.path().join("db.json"));
    assert_eq!(saved.get("kept").as_deref(), Some("value"));
    Ok(())
}

#[tokio::test]
async fn state_changes_are_visible_while_stopping() -> Result<()> {
    let grace = Duration::from_millis(300);
    let dir = tempfile::tempdir()?;
    let server = start(&dir, grace).await?;
    let mut client = Client::connect(&server).await?;

    let mut states = server.subscribe_state();
    assert_eq!(*states.borrow(), ServerState::Running);
    let stopping = tokio::spawn(server.stop());

    // The idle client holds the server in its grace period.
    timeout(READ_TIMEOUT, states.wait_for(|s| *s == ServerState::ShuttingDown)).await??;
    let warning = client.read_message().await?;
    assert!(warning.starts_with("--- Host wants to shut down the server"));

    timeout(READ_TIMEOUT, states.wait_for(|s| *s == ServerState::Stopped)).await??;
    timeout(READ_TIMEOUT, stopping).await???;
    Ok(())
}

#[tokio::test]
async fn clients_leaving_during_grace_period_end_the_wait() -> Result<()> {
    let grace = Duration::from_secs(10);
    let dir = tempfile::tempdir()?;
    let server = start(&dir, grace).await?;
    let mut client = Client::connect(&server).await?;

    let started = Instant::now();
    let stopping = tokio::spawn(server.stop());

    let warning = client.read_message().await?;
    assert!(warning.starts_with("--- Host wants to shut down the server"));
    // The client may still issue commands while it is being warned.
    assert_eq!(client.request("set late write").await?, "--- OK, inserted the data");
    client.send("exit").await?;

    timeout(Duration::from_secs(3), stopping).await???;
    assert!(started.elapsed() < grace);

    let saved = snapshot_at(&dir.path().join("db.json"));
    assert_eq!(saved.get("late").as_deref(), Some("write"));
    Ok(())
}

#[tokio::test]
async fn listener_is_released_after_stop() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = start(&dir, Duration::from_secs(1)).await?;
    let addr = server.local_addr();
    server.stop().await?;

    assert!(TcpStream::connect(addr).await.is_err());
    Ok(())
}

#[tokio::test]
async fn stop_reports_snapshot_failures() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = Config {
        addr: "127.0.0.1:0".parse()?,
        snapshot_path: dir.path().join("missing-dir").join("db.json"),
        grace_period: Duration::from_secs(1),
    };
    let server = Server::bind(config).await?;

    assert!(server.stop().await.is_err());
    Ok(())
}
