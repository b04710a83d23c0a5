//! Handle for the external SSH tunnel process.
//!
//! The tunnel is a long-running `tsh ssh --dynamic-forward` child that
//! exposes a SOCKS5 listener on a local port. The handle owns at most one
//! child at a time; usability of the tunnel is discovered by the health
//! prober, never at launch time.

use std::process::Stdio;
use tokio::process::{Child, Command};

use crate::error::TunnelError;

const TUNNEL_LOGIN: &str = "root";

/// Owns at most one live tunnel process.
#[derive(Debug)]
pub struct Tunnel {
    binary: String,
    child: Option<Child>,
}

impl Tunnel {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            child: None,
        }
    }

    /// Spawn the tunnel process targeting `node`, listening on `local_port`.
    ///
    /// Succeeds as soon as the process exists; a tunnel that comes up and
    /// then dies is caught by the next probe, not here. Any previous child
    /// must have been stopped first - the supervisor enforces that ordering.
    pub fn start(&mut self, node: &str, local_port: u16) -> Result<(), TunnelError> {
        debug_assert!(self.child.is_none(), "tunnel started while already live");

        let child = Command::new(&self.binary)
            .args(["ssh", "--no-remote-exec", "--dynamic-forward"])
            .arg(local_port.to_string())
            .arg(format!("{TUNNEL_LOGIN}@{node}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| TunnelError::LaunchFailed {
                node: node.to_string(),
                port: local_port,
                source: err,
            })?;

        self.child = Some(child);
        Ok(())
    }

    /// Kill and reap the tunnel process. The underlying tool has no graceful
    /// shutdown protocol, so this is a forceful kill.
    ///
    /// Idempotent: stopping a never-started or already-stopped tunnel is a
    /// no-op. The handle is cleared even when the kill itself errors.
    pub async fn stop(&mut self) -> Result<(), TunnelError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        child
            .kill()
            .await
            .map_err(|err| TunnelError::StopFailed { source: err })?;
        Ok(())
    }

    /// Whether a tunnel process handle is currently held.
    pub fn is_live(&self) -> bool {
        self.child.is_some()
    }

    /// OS pid of the live tunnel process, if any.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }
}
