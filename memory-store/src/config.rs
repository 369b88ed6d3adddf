use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_SNAPSHOT_PATH: &str = "db.json";
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Everything the server needs to know up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Address the listener binds to. Port 0 picks an ephemeral port.
    pub addr: SocketAddr,
    /// Snapshot loaded at startup and rewritten on shutdown.
    pub snapshot_path: PathBuf,
    /// How long connected clients get between the shutdown warning and the
    /// forced close.
    pub grace_period: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            snapshot_path: PathBuf::from(DEFAULT_SNAPSHOT_PATH),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}
