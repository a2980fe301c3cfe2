use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::agent_gather::Gatherer;
use crate::control::Role;

/// The pacing interval between check transmissions (Ta, RFC 8445 section
/// 6.1.4.2). One outbound request per tick at most.
pub(crate) const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Initial retransmission timeout for a STUN transaction (RFC 5389 section
/// 7.2.1); doubles after every retransmit.
pub(crate) const DEFAULT_RTO: Duration = Duration::from_millis(500);

/// Retransmissions after the initial send before a transaction is given up.
pub(crate) const MAX_RETRANSMISSIONS: u16 = 6;

/// Attempts per datagram before a transient transport failure is treated as
/// fatal for the pair.
pub(crate) const MAX_SEND_RETRIES: usize = 3;

pub type IpFilterFn = Box<dyn (Fn(IpAddr) -> bool) + Send + Sync>;

/// Collects the arguments to `Agent` construction into a single structure.
pub struct AgentConfig {
    /// The role this agent plays for the whole session. Exactly one side of
    /// a session is controlling; conflicts are resolved via tie-breakers.
    pub role: Role,

    /// Produces the host candidates the agent starts from; enumeration of
    /// OS interfaces lives behind this seam.
    pub gatherer: Arc<dyn Gatherer + Send + Sync>,

    /// STUN server URIs (`stun:<host>:<port>`) used to discover
    /// server-reflexive candidates. Unparseable entries are dropped with a
    /// warning.
    pub stun_servers: Vec<String>,

    /// Accepts or rejects gathered host addresses. The default accepts
    /// everything the gatherer produced.
    pub ip_filter: Option<IpFilterFn>,

    /// Overrides the Ta pacing interval. Only useful for testing.
    pub check_interval: Option<Duration>,
}

impl AgentConfig {
    pub fn new(role: Role, gatherer: Arc<dyn Gatherer + Send + Sync>) -> Self {
        Self {
            role,
            gatherer,
            stun_servers: vec![],
            ip_filter: None,
            check_interval: None,
        }
    }
}
