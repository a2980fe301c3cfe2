#[cfg(test)]
mod agent_test;

pub(crate) mod agent_check;
pub mod agent_config;
pub(crate) mod agent_gather;
pub(crate) mod agent_internal;

use std::fmt;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::candidate::Candidate;
use crate::error::*;
use agent_config::AgentConfig;
use agent_internal::{AgentInternal, Msg};

/// Messages emitted to the process driving the agent.
#[derive(Debug, Clone)]
pub enum Event {
    /// The credentials the peer must use to reach us, to be forwarded over
    /// the signalling channel before any check can succeed.
    LocalCredentials { ufrag: String, pwd: String },
    /// A local candidate was gathered or discovered; forward its marshalled
    /// form to the peer.
    NewCandidate(Candidate),
    /// Every gathering transaction has finished.
    GatheringComplete,
    /// A candidate pair produced a valid response for the first time.
    Connected,
    /// The selected pair changed; traffic should use these candidates.
    SelectedPair { local: Candidate, remote: Candidate },
    /// No usable path to the peer was found.
    Failed,
}

/// Lifecycle state of the agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum AgentState {
    #[serde(rename = "idle")]
    Idle,
    #[serde(rename = "gathering")]
    Gathering,
    #[serde(rename = "checking")]
    Checking,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "closed")]
    Closed,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Idle => "idle",
            Self::Gathering => "gathering",
            Self::Checking => "checking",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Handle to an ICE agent task.
///
/// All methods post a message into the agent's mailbox; the state machine
/// itself runs in a single task and processes one message at a time.
pub struct Agent {
    msg_tx: mpsc::Sender<Msg>,
}

impl Agent {
    /// Creates the agent task and returns the handle together with the
    /// receiver its events are delivered on. Must be called from within a
    /// tokio runtime.
    ///
    /// Unparseable STUN server entries are dropped with a warning; nothing
    /// about the configuration is fatal.
    pub fn new(config: AgentConfig) -> (Self, mpsc::Receiver<Event>) {
        let (msg_tx, msg_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(16);

        let internal = AgentInternal::new(config, event_tx, msg_tx.clone());
        tokio::spawn(async move {
            internal.run_loop(msg_rx).await;
        });

        (Self { msg_tx }, event_rx)
    }

    /// Starts the agent: local credentials are generated and signalled,
    /// host candidates gathered and the check ticker armed.
    pub async fn run(&self) -> Result<()> {
        self.post(Msg::Run).await
    }

    /// Sets the credentials of the remote agent.
    pub async fn set_remote_credentials(
        &self,
        remote_ufrag: String,
        remote_pwd: String,
    ) -> Result<()> {
        if remote_ufrag.is_empty() {
            return Err(Error::ErrRemoteUfragEmpty);
        } else if remote_pwd.is_empty() {
            return Err(Error::ErrRemotePwdEmpty);
        }

        self.post(Msg::SetRemoteCredentials(remote_ufrag, remote_pwd))
            .await
    }

    /// Runs the Gatherer again, picking up host candidates that appeared
    /// after `run`. Candidates already known are ignored.
    pub async fn gather_candidates(&self) -> Result<()> {
        self.post(Msg::GatherCandidates).await
    }

    /// Adds a new remote candidate received over the signalling channel.
    pub async fn add_remote_candidate(&self, c: Candidate) -> Result<()> {
        self.post(Msg::AddRemoteCandidate(c)).await
    }

    /// Tells the agent the peer will signal no further candidates.
    pub async fn end_of_candidates(&self) -> Result<()> {
        self.post(Msg::EndOfCandidates).await
    }

    /// Shuts the agent down, cancelling the ticker and closing its sockets.
    pub async fn close(&self) -> Result<()> {
        self.post(Msg::Close).await
    }

    async fn post(&self, msg: Msg) -> Result<()> {
        self.msg_tx.send(msg).await.map_err(|_| Error::ErrClosed)
    }
}
