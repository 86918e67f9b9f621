//! Daemon status checking

use crate::paths::Paths;
use crate::process;

/// Status of the sealkeep daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    Running,
    Stopped,
    /// Socket or process file left behind by a dead daemon
    Stale,
}

impl DaemonStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Stale => "stale",
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Running => "●",
            Self::Stopped => "○",
            Self::Stale => "●",
        }
    }
}

/// Check the daemon's status from its socket and process file
pub fn check_daemon(paths: &Paths) -> (DaemonStatus, Option<u32>) {
    let socket_exists = paths.socket.exists();
    let pid = process::read_pid(&paths.pid);
    let alive = pid.map(process::is_alive).unwrap_or(false);

    let status = match (socket_exists, alive) {
        (true, true) => DaemonStatus::Running,
        (false, false) if pid.is_none() => DaemonStatus::Stopped,
        // Process running without its socket, or a socket with no process
        _ => DaemonStatus::Stale,
    };

    (status, pid.filter(|_| alive))
}
