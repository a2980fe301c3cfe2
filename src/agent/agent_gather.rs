use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use stun::agent::TransactionId;
use stun::message::{Message, BINDING_REQUEST};
use tokio::time::Instant;

use crate::agent::agent_config::{IpFilterFn, DEFAULT_RTO};
use crate::candidate::Candidate;
use crate::error::*;

/// Produces the host candidates an agent starts from.
///
/// Enumerating OS network interfaces and binding their sockets is the
/// caller's business; the agent only requires that every returned candidate
/// carries the connection it can send from.
#[async_trait]
pub trait Gatherer {
    async fn gather_host_candidates(
        &self,
        ip_filter: Option<&IpFilterFn>,
    ) -> Result<Vec<Candidate>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum GatherTransactionState {
    Waiting,
    InProgress,
    Completed,
    Failed,
}

/// One server-reflexive discovery: a binding request from a host socket to
/// one STUN server. Advanced one per Ta tick, retransmitted on the RFC 5389
/// schedule.
pub(crate) struct GatherTransaction {
    pub(crate) transaction_id: TransactionId,
    pub(crate) server: SocketAddr,
    /// Base address of the host candidate whose socket this uses.
    pub(crate) base: SocketAddr,
    pub(crate) state: GatherTransactionState,
    pub(crate) raw: Vec<u8>,
    pub(crate) attempts: u16,
    pub(crate) rto: Duration,
    pub(crate) deadline: Instant,
}

impl GatherTransaction {
    pub(crate) fn new(base: SocketAddr, server: SocketAddr) -> Result<Self> {
        let transaction_id = TransactionId::new();

        let mut msg = Message::new();
        msg.build(&[Box::new(BINDING_REQUEST), Box::new(transaction_id)])?;

        Ok(Self {
            transaction_id,
            server,
            base,
            state: GatherTransactionState::Waiting,
            raw: msg.raw,
            attempts: 0,
            rto: DEFAULT_RTO,
            deadline: Instant::now(),
        })
    }

    pub(crate) fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            GatherTransactionState::Completed | GatherTransactionState::Failed
        )
    }
}
