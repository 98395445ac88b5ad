//! Container launch mechanics for game instances.
//!
//! This module only deals with the container runtime: building the argument
//! list, spawning the process, pumping its output into the per-party log,
//! and waiting for exit. Lifecycle eventing (`game:started`, `game:over`)
//! and store updates belong to the matchmaker, which drives this.

use std::process::{ExitStatus, Stdio};

use log::{debug, info};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::entity::{Game, Party, PartyId};
use crate::error::ApiError;

/// Spawns game containers through a configurable runtime (`docker` in
/// production; tests substitute a stub script).
pub struct GameLauncher {
    runtime: String,
}

/// A launched container being waited on.
#[derive(Debug)]
pub struct RunningGame {
    partyid: PartyId,
    child: Child,
}

impl GameLauncher {
    #[must_use]
    pub fn new(runtime: String) -> Self {
        GameLauncher { runtime }
    }

    /// The runtime argument list: `run --rm -p ext:int ... <image>`, one
    /// binding per internal port of the game.
    #[must_use]
    pub fn container_args(game: &Game, party: &Party) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--rm".to_string()];
        for (internal, external) in game.internal_ports.iter().zip(&party.external_ports) {
            args.push("-p".to_string());
            args.push(format!("{external}:{internal}"));
        }
        args.push(game.image.clone());
        args
    }

    /// Start the container for `party`. The child is NOT killed when the
    /// handle drops: the host's lifecycle manager owns running containers.
    ///
    /// # Errors
    /// Returns `Unavailable` when the runtime cannot spawn (launch-failed).
    pub fn launch(&self, game: &Game, party: &Party) -> Result<RunningGame, ApiError> {
        let args = GameLauncher::container_args(game, party);
        debug!("Launching {} {}", self.runtime, args.join(" "));
        let child = Command::new(&self.runtime)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| ApiError::Unavailable(format!("cannot launch image {}: {e}", game.image)))?;

        info!("Launched image {} for party {}", game.image, party.partyid);
        Ok(RunningGame {
            partyid: party.partyid,
            child,
        })
    }
}

impl RunningGame {
    /// Pump container output into the party log and wait for exit.
    ///
    /// Returns `None` when `shutdown` fired first; the container keeps
    /// running, only the wait is abandoned.
    pub async fn wait(mut self, shutdown: &CancellationToken) -> Option<ExitStatus> {
        if let Some(stdout) = self.child.stdout.take() {
            tokio::spawn(pump_log(self.partyid, "stdout", stdout));
        }
        if let Some(stderr) = self.child.stderr.take() {
            tokio::spawn(pump_log(self.partyid, "stderr", stderr));
        }

        tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                info!("Shutdown: abandoning wait on party {}", self.partyid);
                None
            }
            status = self.child.wait() => match status {
                Ok(status) => {
                    info!("Container for party {} exited: {status}", self.partyid);
                    Some(status)
                }
                Err(e) => {
                    info!("Container wait for party {} failed: {e}", self.partyid);
                    None
                }
            },
        }
    }
}

/// Copy one output stream of the container into the log, line by line.
async fn pump_log<R: AsyncRead + Unpin>(partyid: PartyId, label: &'static str, stream: R) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!("[party {partyid} {label}] {line}");
    }
}
