use super::agent_config::AgentConfig;
use super::agent_gather::Gatherer;
use super::*;
use crate::candidate::candidate_pair_test::addr;
use crate::candidate::{unmarshal_candidate, Candidate, CandidateType};
use crate::control::*;

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use stun::agent::TransactionId;
use stun::attributes::{ATTR_ICE_CONTROLLED, ATTR_ICE_CONTROLLING, ATTR_USERNAME};
use stun::error_code::{ErrorCodeAttribute, CODE_ROLE_CONFLICT};
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::*;
use stun::textattrs::Username;
use stun::xoraddr::XorMappedAddress;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// In-memory stand-in for a UDP socket: sends are captured, receives are
/// injected by the test.
struct PipeConn {
    local: SocketAddr,
    inbound: Mutex<mpsc::Receiver<(Vec<u8>, SocketAddr)>>,
    outbound: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
}

#[async_trait]
impl util::Conn for PipeConn {
    async fn connect(&self, _addr: SocketAddr) -> std::result::Result<(), util::Error> {
        Ok(())
    }
    async fn recv(&self, _buf: &mut [u8]) -> std::result::Result<usize, util::Error> {
        Err(util::Error::Other("not connected".to_owned()))
    }
    async fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> std::result::Result<(usize, SocketAddr), util::Error> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some((data, src)) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok((data.len(), src))
            }
            None => Err(util::Error::Other("pipe closed".to_owned())),
        }
    }
    async fn send(&self, _buf: &[u8]) -> std::result::Result<usize, util::Error> {
        Err(util::Error::Other("not connected".to_owned()))
    }
    async fn send_to(
        &self,
        buf: &[u8],
        target: SocketAddr,
    ) -> std::result::Result<usize, util::Error> {
        let _ = self.outbound.send((buf.to_vec(), target));
        Ok(buf.len())
    }
    async fn local_addr(&self) -> std::result::Result<SocketAddr, util::Error> {
        Ok(self.local)
    }
    async fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
    async fn close(&self) -> std::result::Result<(), util::Error> {
        Ok(())
    }
}

/// Hands the agent a fixed set of host candidates.
struct StaticGatherer {
    cands: Mutex<Vec<Candidate>>,
}

#[async_trait]
impl Gatherer for StaticGatherer {
    async fn gather_host_candidates(
        &self,
        _ip_filter: Option<&super::agent_config::IpFilterFn>,
    ) -> crate::error::Result<Vec<Candidate>> {
        Ok(self.cands.lock().await.drain(..).collect())
    }
}

struct TestPeer {
    agent: Agent,
    events: mpsc::Receiver<Event>,
    to_agent: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    from_agent: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>,
    ufrag: String,
    pwd: String,
}

impl TestPeer {
    /// Spawns an agent with one host candidate on an in-memory socket and
    /// runs it up to the point where local credentials are known.
    async fn spawn(role: Role, local: &str) -> Self {
        let local_addr = addr(local);
        let (to_agent, inbound) = mpsc::channel(64);
        let (outbound, from_agent) = mpsc::unbounded_channel();
        let conn = Arc::new(PipeConn {
            local: local_addr,
            inbound: Mutex::new(inbound),
            outbound,
        });

        let gatherer = Arc::new(StaticGatherer {
            cands: Mutex::new(vec![Candidate::host(local_addr, conn)]),
        });

        let mut config = AgentConfig::new(role, gatherer);
        config.check_interval = Some(Duration::from_millis(5));
        let (agent, events) = Agent::new(config);

        let mut peer = Self {
            agent,
            events,
            to_agent,
            from_agent,
            ufrag: String::new(),
            pwd: String::new(),
        };

        peer.agent.run().await.unwrap();
        if let Event::LocalCredentials { ufrag, pwd } = peer.expect_event(is_credentials).await {
            peer.ufrag = ufrag;
            peer.pwd = pwd;
        }
        // Gathering must have finished before tests inject traffic, or the
        // host socket would not be known yet.
        peer.expect_event(is_gathering_complete).await;
        peer
    }

    async fn expect_event(&mut self, pred: fn(&Event) -> bool) -> Event {
        loop {
            let event = timeout(EVENT_TIMEOUT, self.events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    }

    async fn expect_no_event(&mut self, pred: fn(&Event) -> bool, wait: Duration) {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match timeout(remaining, self.events.recv()).await {
                Err(_) => return,
                Ok(None) => return,
                Ok(Some(event)) => {
                    assert!(!pred(&event), "unexpected event: {:?}", event);
                }
            }
        }
    }

    async fn inject(&self, raw: &[u8], from: &str) {
        self.to_agent
            .send((raw.to_vec(), addr(from)))
            .await
            .unwrap();
    }

    /// Next captured outbound datagram, decoded as STUN.
    async fn next_outbound(&mut self) -> (Message, SocketAddr) {
        let (raw, dst) = timeout(EVENT_TIMEOUT, self.from_agent.recv())
            .await
            .expect("timed out waiting for outbound packet")
            .expect("outbound channel closed");
        let mut m = Message::new();
        m.write(&raw).unwrap();
        (m, dst)
    }

    /// Skips retransmits and responses until an outbound binding request
    /// matching `pred` appears.
    async fn next_request(&mut self, pred: fn(&Message) -> bool) -> (Message, SocketAddr) {
        loop {
            let (m, dst) = self.next_outbound().await;
            if m.typ == BINDING_REQUEST && pred(&m) {
                return (m, dst);
            }
        }
    }
}

fn is_credentials(e: &Event) -> bool {
    matches!(e, Event::LocalCredentials { .. })
}
fn is_connected(e: &Event) -> bool {
    matches!(e, Event::Connected)
}
fn is_selected(e: &Event) -> bool {
    matches!(e, Event::SelectedPair { .. })
}
fn is_failed(e: &Event) -> bool {
    matches!(e, Event::Failed)
}
fn is_new_candidate(e: &Event) -> bool {
    matches!(e, Event::NewCandidate(_))
}
fn is_gathering_complete(e: &Event) -> bool {
    matches!(e, Event::GatheringComplete)
}
fn any_request(_m: &Message) -> bool {
    true
}
fn with_use_candidate(m: &Message) -> bool {
    UseCandidateAttr::is_set(m)
}

/// A symmetric success response to a captured check, integrity-protected
/// with the password the agent believes the peer holds.
fn success_response(req: &Message, mapped: SocketAddr, pwd: &str) -> Message {
    let mut out = Message::new();
    out.build(&[
        Box::new(req.clone()),
        Box::new(BINDING_SUCCESS),
        Box::new(XorMappedAddress {
            ip: mapped.ip(),
            port: mapped.port(),
        }),
        Box::new(MessageIntegrity::new_short_term_integrity(pwd.to_owned())),
        Box::new(FINGERPRINT),
    ])
    .unwrap();
    out
}

/// A binding request as the fake remote agent would send it.
fn peer_request(
    agent_ufrag: &str,
    agent_pwd: &str,
    peer_ufrag: &str,
    peer_role: Role,
    tie_breaker: u64,
    use_candidate: bool,
) -> Message {
    let mut m = Message::new();
    let mut setters: Vec<Box<dyn Setter>> = vec![
        Box::new(BINDING_REQUEST),
        Box::new(TransactionId::new()),
        Box::new(Username::new(
            ATTR_USERNAME,
            format!("{}:{}", agent_ufrag, peer_ufrag),
        )),
    ];
    if use_candidate {
        setters.push(Box::new(UseCandidateAttr::new()));
    }
    setters.push(Box::new(AttrControl {
        role: peer_role,
        tie_breaker,
    }));
    setters.push(Box::new(PriorityAttr(1862270975)));
    setters.push(Box::new(MessageIntegrity::new_short_term_integrity(
        agent_pwd.to_owned(),
    )));
    setters.push(Box::new(FINGERPRINT));
    m.build(&setters).unwrap();
    m
}

#[tokio::test]
async fn test_controlling_happy_path() {
    let mut peer = TestPeer::spawn(Role::Controlling, "10.0.0.1:40000").await;

    peer.agent
        .set_remote_credentials("u".to_owned(), "p".to_owned())
        .await
        .unwrap();
    peer.agent
        .add_remote_candidate(
            unmarshal_candidate("647372371 1 udp 2130706431 10.0.0.2 50000 typ host").unwrap(),
        )
        .await
        .unwrap();

    let (req, dst) = peer.next_request(any_request).await;
    assert_eq!(dst, addr("10.0.0.2:50000"));
    assert!(req.contains(ATTR_ICE_CONTROLLING));
    assert!(!UseCandidateAttr::is_set(&req));

    let mut username = Username::new(ATTR_USERNAME, String::new());
    username.get_from(&req).unwrap();
    assert_eq!(username.to_string(), format!("u:{}", peer.ufrag));

    // Symmetric answer: the peer saw us exactly where we sent from.
    let resp = success_response(&req, addr("10.0.0.1:40000"), "p");
    peer.inject(&resp.raw, "10.0.0.2:50000").await;

    peer.expect_event(is_connected).await;

    // Regular nomination: the succeeded pair is re-checked with
    // USE-CANDIDATE on a later tick.
    let (nominate_req, _) = peer.next_request(with_use_candidate).await;
    let resp = success_response(&nominate_req, addr("10.0.0.1:40000"), "p");
    peer.inject(&resp.raw, "10.0.0.2:50000").await;

    peer.expect_event(is_selected).await;
    peer.expect_no_event(is_selected, Duration::from_millis(100))
        .await;

    peer.agent.close().await.unwrap();
}

#[tokio::test]
async fn test_controlled_nomination_on_waiting_pair() {
    let mut peer = TestPeer::spawn(Role::Controlled, "10.0.0.1:40000").await;

    peer.agent
        .set_remote_credentials("ru".to_owned(), "rp".to_owned())
        .await
        .unwrap();

    // The controlling peer nominates before our own check ever ran.
    let req = peer_request(&peer.ufrag, &peer.pwd, "ru", Role::Controlling, 1, true);
    peer.inject(&req.raw, "10.0.0.2:50000").await;

    // Always answered, and with the observed source reflected back.
    let (resp, dst) = peer.next_outbound().await;
    assert_eq!(resp.typ, BINDING_SUCCESS);
    assert_eq!(dst, addr("10.0.0.2:50000"));
    let mut mapped = XorMappedAddress::default();
    mapped.get_from(&resp).unwrap();
    assert_eq!(SocketAddr::new(mapped.ip, mapped.port), addr("10.0.0.2:50000"));

    // Nomination is deferred until our own check on the pair succeeds.
    peer.expect_no_event(is_selected, Duration::from_millis(50))
        .await;

    let (our_check, dst) = peer.next_request(any_request).await;
    assert_eq!(dst, addr("10.0.0.2:50000"));
    assert!(our_check.contains(ATTR_ICE_CONTROLLED));
    assert!(!UseCandidateAttr::is_set(&our_check));

    let resp = success_response(&our_check, addr("10.0.0.1:40000"), "rp");
    peer.inject(&resp.raw, "10.0.0.2:50000").await;

    peer.expect_event(is_connected).await;
    peer.expect_event(is_selected).await;

    // Keepalive tolerance: a duplicate of the nominating request is
    // answered and changes nothing.
    let dup = peer_request(&peer.ufrag, &peer.pwd, "ru", Role::Controlling, 1, true);
    peer.inject(&dup.raw, "10.0.0.2:50000").await;
    let (resp, _) = peer.next_outbound().await;
    assert_eq!(resp.typ, BINDING_SUCCESS);
    peer.expect_no_event(is_selected, Duration::from_millis(100))
        .await;

    peer.agent.close().await.unwrap();
}

#[tokio::test]
async fn test_peer_reflexive_discovery() {
    let mut peer = TestPeer::spawn(Role::Controlling, "10.0.0.1:40000").await;

    peer.agent
        .set_remote_credentials("u".to_owned(), "p".to_owned())
        .await
        .unwrap();
    peer.agent
        .add_remote_candidate(
            unmarshal_candidate("647372371 1 udp 2130706431 10.0.0.2 50000 typ host").unwrap(),
        )
        .await
        .unwrap();

    let (req, _) = peer.next_request(any_request).await;

    // A NAT rewrote our source; the peer reports where it really saw us.
    let resp = success_response(&req, addr("1.2.3.4:40001"), "p");
    peer.inject(&resp.raw, "10.0.0.2:50000").await;

    let event = peer.expect_event(is_new_candidate).await;
    if let Event::NewCandidate(c) = event {
        assert_eq!(c.candidate_type(), CandidateType::PeerReflexive);
        assert_eq!(c.addr(), addr("1.2.3.4:40001"));
        assert_eq!(c.base_addr(), addr("10.0.0.1:40000"));
    }
    peer.expect_event(is_connected).await;

    peer.agent.close().await.unwrap();
}

#[tokio::test]
async fn test_asymmetric_response_rejected() {
    let mut peer = TestPeer::spawn(Role::Controlling, "10.0.0.1:40000").await;

    peer.agent
        .set_remote_credentials("u".to_owned(), "p".to_owned())
        .await
        .unwrap();
    peer.agent
        .add_remote_candidate(
            unmarshal_candidate("647372371 1 udp 2130706431 10.0.0.2 50000 typ host").unwrap(),
        )
        .await
        .unwrap();

    let (req, _) = peer.next_request(any_request).await;

    // Response arrives from an address we never sent to.
    let resp = success_response(&req, addr("10.0.0.1:40000"), "p");
    peer.inject(&resp.raw, "10.0.0.3:50000").await;

    peer.expect_no_event(is_connected, Duration::from_millis(100))
        .await;

    // The pair failed; with end-of-candidates nothing can ever succeed.
    peer.agent.end_of_candidates().await.unwrap();
    peer.expect_event(is_failed).await;

    peer.agent.close().await.unwrap();
}

#[tokio::test]
async fn test_end_of_candidates_without_pairs_fails() {
    let mut peer = TestPeer::spawn(Role::Controlling, "10.0.0.1:40000").await;

    peer.agent
        .set_remote_credentials("u".to_owned(), "p".to_owned())
        .await
        .unwrap();
    peer.agent.end_of_candidates().await.unwrap();

    peer.expect_event(is_failed).await;
}

#[tokio::test]
async fn test_duplicate_remote_candidate_is_idempotent() {
    let mut peer = TestPeer::spawn(Role::Controlling, "10.0.0.1:40000").await;

    peer.agent
        .set_remote_credentials("u".to_owned(), "p".to_owned())
        .await
        .unwrap();
    let line = "647372371 1 udp 2130706431 10.0.0.2 50000 typ host";
    peer.agent
        .add_remote_candidate(unmarshal_candidate(line).unwrap())
        .await
        .unwrap();
    peer.agent
        .add_remote_candidate(unmarshal_candidate(line).unwrap())
        .await
        .unwrap();

    // One pair, one check; the duplicate changed nothing.
    let (first, _) = peer.next_request(any_request).await;
    match timeout(Duration::from_millis(100), peer.from_agent.recv()).await {
        Err(_) => {}
        Ok(Some((raw, _))) => {
            let mut m = Message::new();
            m.write(&raw).unwrap();
            assert_eq!(
                m.transaction_id, first.transaction_id,
                "a second transmission may only be a retransmit"
            );
        }
        Ok(None) => panic!("outbound channel closed"),
    }

    peer.agent.close().await.unwrap();
}

#[tokio::test]
async fn test_role_conflict_on_inbound_request() {
    let mut peer = TestPeer::spawn(Role::Controlled, "10.0.0.1:40000").await;

    peer.agent
        .set_remote_credentials("ru".to_owned(), "rp".to_owned())
        .await
        .unwrap();

    // Both sides believe they are controlled; our tie-breaker always wins
    // against zero, so we switch to controlling.
    let req = peer_request(&peer.ufrag, &peer.pwd, "ru", Role::Controlled, 0, false);
    peer.inject(&req.raw, "10.0.0.2:50000").await;

    let (resp, _) = peer.next_outbound().await;
    assert_eq!(resp.typ, BINDING_SUCCESS);

    let (our_check, _) = peer.next_request(any_request).await;
    assert!(
        our_check.contains(ATTR_ICE_CONTROLLING),
        "agent must check as controlling after the switch"
    );

    peer.agent.close().await.unwrap();
}

#[tokio::test]
async fn test_role_conflict_response_switches_role() {
    let mut peer = TestPeer::spawn(Role::Controlling, "10.0.0.1:40000").await;

    peer.agent
        .set_remote_credentials("u".to_owned(), "p".to_owned())
        .await
        .unwrap();
    peer.agent
        .add_remote_candidate(
            unmarshal_candidate("647372371 1 udp 2130706431 10.0.0.2 50000 typ host").unwrap(),
        )
        .await
        .unwrap();

    let (req, _) = peer.next_request(any_request).await;
    assert!(req.contains(ATTR_ICE_CONTROLLING));

    // The peer rejects our role claim.
    let mut conflict = Message::new();
    conflict
        .build(&[
            Box::new(req.clone()),
            Box::new(BINDING_ERROR),
            Box::new(ErrorCodeAttribute {
                code: CODE_ROLE_CONFLICT,
                reason: b"Role Conflict".to_vec(),
            }),
            Box::new(MessageIntegrity::new_short_term_integrity("p".to_owned())),
            Box::new(FINGERPRINT),
        ])
        .unwrap();
    peer.inject(&conflict.raw, "10.0.0.2:50000").await;

    // The pair is re-checked in the controlled role.
    let (retry, _) = peer.next_request(|m| m.contains(ATTR_ICE_CONTROLLED)).await;
    assert!(!retry.contains(ATTR_ICE_CONTROLLING));

    peer.agent.close().await.unwrap();
}
