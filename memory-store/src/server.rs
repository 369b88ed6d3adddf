use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    select,
    sync::{mpsc, oneshot, watch},
    task::{JoinHandle, JoinSet},
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    command::{write_reply, WELCOME},
    config::Config,
    connection::{process, Outcome},
    registry::{ConnectionHandle, ConnectionId, Notice, Registration, Registry},
    store::Store,
};

/// How long force-closed connections get to finish before their tasks are
/// aborted outright.
const FORCE_CLOSE_SLACK: Duration = Duration::from_secs(1);

/// Pause after an accept error that is likely to repeat, such as running out
/// of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServerState {
    Running,
    ShuttingDown,
    Stopped,
}

/// A running key-value server.
///
/// [`Server::bind`] loads the snapshot, binds the listener and starts the
/// accept loop in the background. [`Server::stop`] drains connections and
/// writes the snapshot back.
pub struct Server {
    local_addr: SocketAddr,
    config: Config,
    shared: Arc<ServerShared>,
    shutdown: oneshot::Sender<()>,
    exited: JoinHandle<()>,
}

struct ServerShared {
    store: Arc<Store>,
    registry: Arc<Registry>,
    state: watch::Sender<ServerState>,
    grace_period: Duration,
}

impl ServerShared {
    /// Moves the state machine forward; backwards transitions are ignored.
    fn advance(&self, next: ServerState) {
        self.state.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        });
    }
}

impl Server {
    pub async fn bind(config: Config) -> Result<Self> {
        let store = Arc::new(Store::load(&config.snapshot_path));
        let listener = TcpListener::bind(config.addr)
            .await
            .with_context(|| format!("failed to bind {}", config.addr))?;
        let local_addr = listener.local_addr()?;

        let (state, _) = watch::channel(ServerState::Running);
        let shared = Arc::new(ServerShared {
            store,
            registry: Arc::new(Registry::new()),
            state,
            grace_period: config.grace_period,
        });

        let (shutdown, shutdown_rx) = oneshot::channel();
        let exited = tokio::spawn(serve(listener, Arc::clone(&shared), shutdown_rx));

        Ok(Self {
            local_addr,
            config,
            shared,
            shutdown,
            exited,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.shared.store
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }

    pub fn state(&self) -> ServerState {
        *self.shared.state.borrow()
    }

    /// Returns a receiver that sees every later state change, including the
    /// ones made while [`Server::stop`] runs.
    pub fn subscribe_state(&self) -> watch::Receiver<ServerState> {
        self.shared.state.subscribe()
    }

    /// Waits for `signal`, then shuts down.
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        signal.await;
        self.stop().await
    }

    /// Shuts the server down and saves the snapshot.
    ///
    /// Stops accepting, warns connected clients, waits up to the grace
    /// period for them to leave, force-closes the rest, and only then
    /// writes the store to disk. Returns once all of that has happened.
    pub async fn stop(self) -> Result<()> {
        let Server {
            config,
            shared,
            shutdown,
            exited,
            ..
        } = self;

        info!("stopping the database server");
        // The accept loop may already be gone; it then has nothing to drain.
        let _ = shutdown.send(());
        exited
            .await
            .map_err(|err| anyhow!("accept loop panicked: {err}"))?;

        info!(path = %config.snapshot_path.display(), "saving records to file");
        shared
            .store
            .save(&config.snapshot_path)
            .context("failed to save snapshot")?;
        info!("database server successfully stopped");
        Ok(())
    }
}

async fn serve(
    listener: TcpListener,
    state: Arc<ServerShared>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut connections = JoinSet::new();
    info!("listening for clients");

    loop {
        select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => spawn_connection(stream, peer, &state, &mut connections),
                Err(err) => match accept_backoff(&err) {
                    None => debug!(error = %err, "transient accept error"),
                    Some(pause) => {
                        warn!(error = %err, ?pause, "failed to accept connection");
                        sleep(pause).await;
                    }
                },
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(err) = joined {
                    warn!(error = %err, "connection task failed");
                }
            }
        }
    }

    info!("shutting down the server");
    state.advance(ServerState::ShuttingDown);
    drop(listener);

    drain_connections(&state, &mut connections).await;
    state.advance(ServerState::Stopped);
}

/// Errors caused by a single client going away are retried at once; anything
/// else waits a little so a persistent failure does not spin the loop.
fn accept_backoff(err: &io::Error) -> Option<Duration> {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted => None,
        _ => Some(ACCEPT_BACKOFF),
    }
}

fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: &Arc<ServerShared>,
    connections: &mut JoinSet<()>,
) {
    let id = state.registry.next_id();
    let (handle, notices) = ConnectionHandle::new(id, Some(peer));
    let registration = state.registry.register(id, handle);
    let store = Arc::clone(&state.store);

    connections.spawn(handle_connection(stream, peer, store, registration, notices));
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    store: Arc<Store>,
    registration: Registration,
    mut notices: mpsc::UnboundedReceiver<Notice>,
) {
    let id: ConnectionId = registration.id();
    info!(id, %peer, "client joined");

    let (reader, mut writer) = stream.into_split();
    let result: io::Result<Outcome> = async {
        write_reply(&mut writer, WELCOME).await?;
        process(BufReader::new(reader), &mut writer, &store, &mut notices).await
    }
    .await;

    match result {
        Ok(Outcome::Closed) => debug!(id, "connection closed by server"),
        Ok(outcome) => debug!(id, ?outcome, "connection finished"),
        Err(err) => debug!(id, error = %err, "connection ended with error"),
    }

    if let Err(err) = writer.shutdown().await {
        debug!(id, error = %err, "failed to shut down connection cleanly");
    }
    drop(registration);
    info!(id, %peer, "client left");
}

async fn drain_connections(state: &ServerShared, connections: &mut JoinSet<()>) {
    let remaining = state.registry.len();
    if remaining > 0 {
        let grace = state.grace_period;
        info!(remaining, ?grace, "warning connected clients");
        let warning = format!("--- Host wants to shut down the server in {grace:?}");
        state.registry.for_each(|id, handle| {
            if let Err(err) = handle.warn(warning.clone()) {
                warn!(id, peer = ?handle.peer(), error = %err, "could not warn connection");
            }
        });

        if timeout(grace, join_all(connections)).await.is_ok() {
            info!("all clients left before the grace period ended");
            return;
        }

        info!("closing all connections");
        state.registry.for_each(|id, handle| {
            if let Err(err) = handle.close() {
                warn!(id, peer = ?handle.peer(), error = %err, "could not close connection");
            }
        });
    }

    if timeout(FORCE_CLOSE_SLACK, join_all(connections)).await.is_err() {
        warn!(
            remaining = connections.len(),
            "connections did not close in time, aborting"
        );
        connections.abort_all();
        join_all(connections).await;
    }
}

async fn join_all(connections: &mut JoinSet<()>) {
    while let Some(joined) = connections.join_next().await {
        if let Err(err) = joined {
            if !err.is_cancelled() {
                warn!(error = %err, "connection task failed");
            }
        }
    }
}
