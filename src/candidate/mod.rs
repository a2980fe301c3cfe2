
use crate::control::Role;
use crate::error::*;
use crate::rand::generate_cand_id;

use crc::{Crc, CRC_32_ISCSI};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub(crate) const RECEIVE_MTU: usize = 8192;
pub(crate) const DEFAULT_LOCAL_PREFERENCE: u16 = 65535;

/// The single data-stream component this agent negotiates.
pub(crate) const COMPONENT_RTP: u16 = 1;

/// Represents the type of candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CandidateType {
    #[serde(rename = "host")]
    Host,
    #[serde(rename = "srflx")]
    ServerReflexive,
    #[serde(rename = "prflx")]
    PeerReflexive,
    #[serde(rename = "relay")]
    Relay,
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
        };
        write!(f, "{}", s)
    }
}

impl CandidateType {
    /// Returns the preference weight of a `CandidateType`.
    ///
    /// 4.1.2.2.  Guidelines for Choosing Type and Local Preferences
    /// The RECOMMENDED values are 126 for host candidates, 100
    /// for server reflexive candidates, 110 for peer reflexive candidates,
    /// and 0 for relayed candidates.
    #[must_use]
    pub const fn preference(self) -> u16 {
        match self {
            Self::Host => 126,
            Self::PeerReflexive => 110,
            Self::ServerReflexive => 100,
            Self::Relay => 0,
        }
    }
}

/// A transport address offered for connectivity, together with the base
/// address the agent actually sends from. Server- and peer-reflexive
/// candidates share the socket of the host candidate they were discovered
/// through, so NAT bindings are reused.
#[derive(Clone)]
pub struct Candidate {
    pub(crate) id: String,
    candidate_type: CandidateType,
    addr: SocketAddr,
    base_addr: SocketAddr,
    component: u16,
    foundation_override: String,
    priority_override: u32,
    stun_server: Option<SocketAddr>,
    pub(crate) conn: Option<Arc<dyn util::Conn + Send + Sync>>,
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.base_addr == self.addr {
            write!(f, "udp {} {}", self.candidate_type, self.addr)
        } else {
            write!(
                f,
                "udp {} {} related {}",
                self.candidate_type, self.addr, self.base_addr
            )
        }
    }
}

impl fmt::Debug for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr && self.base_addr == other.base_addr
    }
}

impl Candidate {
    /// Creates a host candidate bound to `addr`; its base is itself.
    pub fn host(addr: SocketAddr, conn: Arc<dyn util::Conn + Send + Sync>) -> Self {
        Self {
            id: generate_cand_id(),
            candidate_type: CandidateType::Host,
            addr,
            base_addr: addr,
            component: COMPONENT_RTP,
            foundation_override: String::new(),
            priority_override: 0,
            stun_server: None,
            conn: Some(conn),
        }
    }

    /// Creates a server-reflexive candidate discovered through `host` via a
    /// gathering request to `server`. Shares the host's socket and base.
    pub fn server_reflexive(host: &Candidate, mapped: SocketAddr, server: SocketAddr) -> Self {
        Self {
            id: generate_cand_id(),
            candidate_type: CandidateType::ServerReflexive,
            addr: mapped,
            base_addr: host.base_addr,
            component: host.component,
            foundation_override: String::new(),
            priority_override: 0,
            stun_server: Some(server),
            conn: host.conn.clone(),
        }
    }

    /// Creates a local peer-reflexive candidate discovered by a connectivity
    /// check sent through `base`.
    pub fn peer_reflexive(base: &Candidate, mapped: SocketAddr) -> Self {
        Self {
            id: generate_cand_id(),
            candidate_type: CandidateType::PeerReflexive,
            addr: mapped,
            base_addr: base.base_addr,
            component: base.component,
            foundation_override: String::new(),
            priority_override: 0,
            stun_server: None,
            conn: base.conn.clone(),
        }
    }

    /// Creates a remote peer-reflexive candidate for a binding request that
    /// arrived from an address the peer never signalled. The priority is the
    /// one announced in the request's PRIORITY attribute.
    pub fn remote_peer_reflexive(addr: SocketAddr, priority: u32) -> Self {
        Self {
            id: generate_cand_id(),
            candidate_type: CandidateType::PeerReflexive,
            addr,
            base_addr: addr,
            component: COMPONENT_RTP,
            foundation_override: String::new(),
            priority_override: priority,
            stun_server: None,
            conn: None,
        }
    }

    #[must_use]
    pub fn candidate_type(&self) -> CandidateType {
        self.candidate_type
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn base_addr(&self) -> SocketAddr {
        self.base_addr
    }

    #[must_use]
    pub fn component(&self) -> u16 {
        self.component
    }

    /// Candidates can only be paired within one address family.
    #[must_use]
    pub fn family_matches(&self, other: &Candidate) -> bool {
        self.addr.is_ipv4() == other.addr.is_ipv4()
    }

    /// An opaque string grouping candidates of the same type, obtained from
    /// the same base and the same STUN server. Pairs whose foundations match
    /// an already-listed pair start out frozen.
    pub fn foundation(&self) -> String {
        if !self.foundation_override.is_empty() {
            return self.foundation_override.clone();
        }

        let mut buf = vec![];
        buf.extend_from_slice(self.candidate_type.to_string().as_bytes());
        buf.extend_from_slice(self.base_addr.ip().to_string().as_bytes());
        buf.extend_from_slice(b"udp");
        if let Some(server) = &self.stun_server {
            buf.extend_from_slice(server.to_string().as_bytes());
        }

        let checksum = Crc::<u32>::new(&CRC_32_ISCSI).checksum(&buf);

        format!("{}", checksum)
    }

    /// Computes the priority for this candidate (RFC 8445 section 5.1.2.1).
    pub fn priority(&self) -> u32 {
        if self.priority_override != 0 {
            return self.priority_override;
        }

        (1 << 24) * u32::from(self.candidate_type.preference())
            + (1 << 8) * u32::from(DEFAULT_LOCAL_PREFERENCE)
            + (256 - u32::from(self.component))
    }

    /// The priority this candidate would have if the peer discovered it as
    /// peer reflexive, announced in the PRIORITY attribute of every check.
    pub fn prflx_priority(&self) -> u32 {
        (1 << 24) * u32::from(CandidateType::PeerReflexive.preference())
            + (1 << 8) * u32::from(DEFAULT_LOCAL_PREFERENCE)
            + (256 - u32::from(self.component))
    }

    /// Returns the string representation used on the signalling channel.
    pub fn marshal(&self) -> String {
        let mut val = format!(
            "{} {} udp {} {} {} typ {}",
            self.foundation(),
            self.component,
            self.priority(),
            self.addr.ip(),
            self.addr.port(),
            self.candidate_type
        );

        if self.base_addr != self.addr {
            val += format!(" raddr {} rport {}", self.base_addr.ip(), self.base_addr.port())
                .as_str();
        }

        val
    }
}

/// Creates a remote Candidate from its string representation.
pub fn unmarshal_candidate(raw: &str) -> Result<Candidate> {
    let split: Vec<&str> = raw.split_whitespace().collect();
    if split.len() < 8 {
        return Err(Error::Other(format!(
            "{:?} ({})",
            Error::ErrAttributeTooShortIceCandidate,
            split.len()
        )));
    }

    let foundation = split[0].to_owned();
    let component: u16 = split[1].parse()?;
    // split[2] is the transport; only udp is paired, anything else is kept
    // verbatim and never matched against a local candidate.
    let priority: u32 = split[3].parse()?;
    let ip = split[4].parse().map_err(|_| Error::ErrAddressParseFailed)?;
    let port: u16 = split[5].parse()?;
    let addr = SocketAddr::new(ip, port);

    let typ = split[7];
    let candidate_type = match typ {
        "host" => CandidateType::Host,
        "srflx" => CandidateType::ServerReflexive,
        "prflx" => CandidateType::PeerReflexive,
        "relay" => CandidateType::Relay,
        _ => {
            return Err(Error::Other(format!(
                "{:?} ({})",
                Error::ErrUnknownCandidateType,
                typ
            )))
        }
    };

    let mut base_addr = addr;
    if split.len() > 8 {
        let split2 = &split[8..];
        if split2[0] == "raddr" {
            if split2.len() < 4 {
                return Err(Error::Other(format!(
                    "{:?}: incorrect length",
                    Error::ErrParseRelatedAddr
                )));
            }

            let rel_ip = split2[1]
                .parse()
                .map_err(|_| Error::ErrAddressParseFailed)?;
            let rel_port: u16 = split2[3].parse()?;
            base_addr = SocketAddr::new(rel_ip, rel_port);
        }
    }

    Ok(Candidate {
        id: generate_cand_id(),
        candidate_type,
        addr,
        base_addr,
        component,
        foundation_override: foundation,
        priority_override: priority,
        stun_server: None,
        conn: None,
    })
}

/// Represents the ICE candidate pair state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CandidatePairState {
    /// A check for this pair would duplicate one already listed; it waits for
    /// its foundation to be unfrozen.
    #[serde(rename = "frozen")]
    Frozen,

    /// A check has not been sent for this pair.
    #[serde(rename = "waiting")]
    Waiting,

    /// A check has been sent for this pair and the transaction is in
    /// progress.
    #[serde(rename = "in-progress")]
    InProgress,

    /// A check for this pair was done and produced a successful result.
    #[serde(rename = "succeeded")]
    Succeeded,

    /// A check for this pair was done and failed, either never producing any
    /// response or producing an unrecoverable failure response.
    #[serde(rename = "failed")]
    Failed,
}

impl fmt::Display for CandidatePairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Frozen => "frozen",
            Self::Waiting => "waiting",
            Self::InProgress => "in-progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Stable identifier assigned to a pair at creation, used for
/// back-references instead of pointers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairId(u64);

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

fn next_pair_id() -> PairId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    PairId(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// Represents a combination of a local and remote candidate with the shared
/// check state.
#[derive(Clone)]
pub struct CandidatePair {
    pub id: PairId,
    pub local: Candidate,
    pub remote: Candidate,
    pub(crate) role: Role,
    pub state: CandidatePairState,
    /// A check on this pair produced a valid response.
    pub(crate) valid: bool,
    /// The agent intends to nominate this pair at its next successful check.
    pub(crate) nominate: bool,
    /// The pair has been nominated by us or by the peer.
    pub nominated: bool,
    /// For a valid pair discovered through a peer-reflexive local candidate,
    /// the conn-check pair whose check discovered it.
    pub(crate) discovered_from: Option<PairId>,
}

impl fmt::Debug for CandidatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} prio {} (local, prio {}) {} <-> {} (remote, prio {})",
            self.id,
            self.priority(),
            self.local.priority(),
            self.local,
            self.remote,
            self.remote.priority()
        )
    }
}

impl fmt::Display for CandidatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} prio {} (local, prio {}) {} <-> {} (remote, prio {})",
            self.id,
            self.priority(),
            self.local.priority(),
            self.local,
            self.remote,
            self.remote.priority()
        )
    }
}

impl PartialEq for CandidatePair {
    fn eq(&self, other: &Self) -> bool {
        self.local == other.local && self.remote == other.remote
    }
}

impl CandidatePair {
    #[must_use]
    pub fn new(
        local: Candidate,
        remote: Candidate,
        role: Role,
        initial_state: CandidatePairState,
    ) -> Self {
        Self {
            id: next_pair_id(),
            local,
            remote,
            role,
            state: initial_state,
            valid: false,
            nominate: false,
            nominated: false,
            discovered_from: None,
        }
    }

    /// RFC 8445 section 6.1.2.3.  Computing Pair Priority and Ordering Pairs
    /// Let G be the priority for the candidate provided by the controlling
    /// agent.  Let D be the priority for the candidate provided by the
    /// controlled agent.
    /// pair priority = 2^32*MIN(G,D) + 2*MAX(G,D) + (G>D?1:0)
    pub fn priority(&self) -> u64 {
        let (g, d) = if self.role.is_controlling() {
            (self.local.priority(), self.remote.priority())
        } else {
            (self.remote.priority(), self.local.priority())
        };

        (1u64 << 32) * u64::from(std::cmp::min(g, d))
            + 2 * u64::from(std::cmp::max(g, d))
            + u64::from(g > d)
    }

    /// The key under which the checklist prunes redundant pairs: checks from
    /// a reflexive candidate are sent from its base, so two pairs sharing
    /// base and remote are indistinguishable on the wire.
    pub(crate) fn prune_key(&self) -> (SocketAddr, SocketAddr, SocketAddr) {
        (
            self.local.base_addr(),
            self.remote.addr(),
            self.remote.base_addr(),
        )
    }

    pub(crate) fn foundations(&self) -> (String, String) {
        (self.local.foundation(), self.remote.foundation())
    }
}
