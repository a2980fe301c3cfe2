use std::net::SocketAddr;

use stun::agent::TransactionId;
use stun::attributes::*;
use stun::error_code::{ErrorCodeAttribute, CODE_ROLE_CONFLICT};
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::*;
use stun::textattrs::Username;
use stun::xoraddr::XorMappedAddress;
use tokio::time::Instant;

use crate::agent::agent_config::DEFAULT_RTO;
use crate::agent::agent_gather::GatherTransactionState;
use crate::agent::agent_internal::{AgentInternal, ConnCheck};
use crate::agent::Event;
use crate::candidate::*;
use crate::control::*;
use crate::error::*;

impl AgentInternal {
    /// Builds and transmits the connectivity check for a waiting pair
    /// (RFC 8445 section 7.2.4). USE-CANDIDATE rides along only when the
    /// controlling agent nominates.
    pub(crate) async fn send_conn_check(&mut self, id: PairId) {
        let (local, remote, nominate) = match self.checklist.get(id) {
            Some(p) => (p.local.clone(), p.remote.clone(), p.nominate),
            None => return,
        };

        let username = format!("{}:{}", self.remote_ufrag, self.local_ufrag);
        let use_candidate = self.role.is_controlling() && nominate;

        let mut msg = Message::new();
        {
            let mut setters: Vec<Box<dyn Setter>> = vec![
                Box::new(BINDING_REQUEST),
                Box::new(TransactionId::new()),
                Box::new(Username::new(ATTR_USERNAME, username)),
            ];
            if use_candidate {
                setters.push(Box::new(UseCandidateAttr::new()));
            }
            setters.push(Box::new(AttrControl {
                role: self.role,
                tie_breaker: self.tie_breaker,
            }));
            setters.push(Box::new(PriorityAttr(local.prflx_priority())));
            setters.push(Box::new(MessageIntegrity::new_short_term_integrity(
                self.remote_pwd.clone(),
            )));
            setters.push(Box::new(FINGERPRINT));

            if let Err(err) = msg.build(&setters) {
                log::error!("{}", err);
                return;
            }
        }

        log::trace!(
            "[{}]: ping STUN from {} to {}",
            self.get_name(),
            local,
            remote
        );

        if !self
            .send_datagram(local.base_addr(), remote.addr(), &msg.raw)
            .await
        {
            self.fail_pair(id);
            return;
        }

        if let Some(p) = self.checklist.get_mut(id) {
            p.state = CandidatePairState::InProgress;
        }
        self.conn_checks.insert(
            msg.transaction_id,
            ConnCheck {
                pair_id: id,
                dst: remote.addr(),
                base: local.base_addr(),
                raw: msg.raw.clone(),
                is_use_candidate: use_candidate,
                attempts: 1,
                rto: DEFAULT_RTO,
                deadline: Instant::now() + DEFAULT_RTO,
            },
        );
    }

    /// Demultiplexes STUN traffic arriving on a local socket.
    pub(crate) async fn handle_inbound(
        &mut self,
        m: &mut Message,
        base: SocketAddr,
        src: SocketAddr,
    ) {
        if m.typ.method != METHOD_BINDING
            || !(m.typ.class == CLASS_SUCCESS_RESPONSE
                || m.typ.class == CLASS_ERROR_RESPONSE
                || m.typ.class == CLASS_REQUEST)
        {
            log::trace!(
                "[{}]: unhandled STUN from {} class({}) method({})",
                self.get_name(),
                src,
                m.typ.class,
                m.typ.method
            );
            return;
        }

        if m.typ.class == CLASS_REQUEST {
            self.handle_binding_request(m, base, src).await;
        } else {
            self.handle_response(m, base, src).await;
        }
    }

    /// Answers a peer's connectivity check (RFC 8445 section 7.3): always a
    /// binding success carrying the source the request arrived from, plus
    /// the checklist bookkeeping for nominations and peer-reflexive
    /// discovery. Anything that fails authentication is dropped silently.
    async fn handle_binding_request(
        &mut self,
        m: &mut Message,
        base: SocketAddr,
        src: SocketAddr,
    ) {
        let local = match self
            .local_candidates
            .iter()
            .find(|c| c.candidate_type() == CandidateType::Host && c.addr() == base)
        {
            Some(c) => c.clone(),
            None => {
                log::warn!(
                    "[{}]: request on unknown local socket {}",
                    self.get_name(),
                    base
                );
                return;
            }
        };

        let username = format!("{}:{}", self.local_ufrag, self.remote_ufrag);
        if let Err(err) = assert_inbound_username(m, &username) {
            log::debug!("[{}]: discard message from ({}), {}", self.get_name(), src, err);
            return;
        }
        if let Err(err) = assert_inbound_message_integrity(m, self.local_pwd.as_bytes()) {
            log::debug!("[{}]: discard message from ({}), {}", self.get_name(), src, err);
            return;
        }
        if let Err(err) = FINGERPRINT.check(m) {
            log::debug!("[{}]: discard message from ({}), {}", self.get_name(), src, err);
            return;
        }

        // Both sides claiming the same role: the larger tie-breaker keeps it
        // (RFC 8445 section 7.3.1.1).
        if self.role.is_controlling() && m.contains(ATTR_ICE_CONTROLLING) {
            let mut theirs = AttrControlling(0);
            if theirs.get_from(m).is_ok() {
                if self.tie_breaker >= theirs.0 {
                    self.send_role_conflict(m, base, src).await;
                    return;
                }
                self.switch_role();
            }
        } else if !self.role.is_controlling() && m.contains(ATTR_ICE_CONTROLLED) {
            let mut theirs = AttrControlled(0);
            if theirs.get_from(m).is_ok() {
                if self.tie_breaker >= theirs.0 {
                    self.switch_role();
                } else {
                    self.send_role_conflict(m, base, src).await;
                    return;
                }
            }
        }

        self.send_binding_success(m, base, src).await;

        let remote = match self.remote_candidates.iter().find(|c| c.addr() == src) {
            Some(c) => c.clone(),
            None => {
                // The peer checks from an address it never signalled;
                // remember it as peer reflexive with the priority the
                // request announced.
                let mut prio = PriorityAttr::default();
                let priority = if prio.get_from(m).is_ok() {
                    prio.0
                } else {
                    local.prflx_priority()
                };
                let c = Candidate::remote_peer_reflexive(src, priority);
                log::debug!(
                    "[{}]: adding a new peer-reflexive candidate: {}",
                    self.get_name(),
                    src
                );
                self.remote_candidates.push(c.clone());
                c
            }
        };

        // Nomination requests only carry meaning for the controlled side;
        // everything else about a USE-CANDIDATE from a confused peer is
        // tolerated.
        let use_candidate =
            UseCandidateAttr::is_set(m) && !self.role.is_controlling();

        let existing = self.checklist.find(&local, &remote).map(|p| (p.id, p.state));

        match existing {
            None => {
                let id = self.insert_pair(local, remote);
                if use_candidate {
                    if let Some(p) = self.checklist.get_mut(id) {
                        p.nominate = true;
                    }
                }
            }
            Some((id, state)) => {
                if !use_candidate {
                    // Keepalive or retransmit; the answer above suffices.
                    return;
                }
                if state == CandidatePairState::Succeeded {
                    // The check this pair sent produced a valid pair;
                    // nominate that one (RFC 8445 section 7.3.1.5).
                    let w = self
                        .checklist
                        .discovered_by(id)
                        .map(|p| p.id)
                        .unwrap_or(id);
                    let valid = self.checklist.get(w).map(|p| p.valid).unwrap_or(false);
                    if valid {
                        if let Some(p) = self.checklist.get_mut(w) {
                            p.nominated = true;
                            p.nominate = false;
                        }
                        self.maybe_select(w).await;
                    }
                } else if let Some(p) = self.checklist.get_mut(id) {
                    // Nomination is deferred until this pair's own check
                    // succeeds.
                    p.nominate = true;
                }
            }
        }
    }

    async fn send_binding_success(&mut self, m: &Message, base: SocketAddr, src: SocketAddr) {
        let mut out = Message::new();
        let result = out.build(&[
            Box::new(m.clone()),
            Box::new(BINDING_SUCCESS),
            Box::new(XorMappedAddress {
                ip: src.ip(),
                port: src.port(),
            }),
            Box::new(MessageIntegrity::new_short_term_integrity(
                self.local_pwd.clone(),
            )),
            Box::new(FINGERPRINT),
        ]);

        if let Err(err) = result {
            log::warn!(
                "[{}]: failed to build binding success for {}: {}",
                self.get_name(),
                src,
                err
            );
        } else {
            self.send_datagram(base, src, &out.raw).await;
        }
    }

    async fn send_role_conflict(&mut self, m: &Message, base: SocketAddr, src: SocketAddr) {
        let mut out = Message::new();
        let result = out.build(&[
            Box::new(m.clone()),
            Box::new(BINDING_ERROR),
            Box::new(ErrorCodeAttribute {
                code: CODE_ROLE_CONFLICT,
                reason: b"Role Conflict".to_vec(),
            }),
            Box::new(MessageIntegrity::new_short_term_integrity(
                self.local_pwd.clone(),
            )),
            Box::new(FINGERPRINT),
        ]);

        if let Err(err) = result {
            log::warn!(
                "[{}]: failed to build role conflict for {}: {}",
                self.get_name(),
                src,
                err
            );
        } else {
            log::debug!("[{}]: role conflict, answering 487 to {}", self.get_name(), src);
            self.send_datagram(base, src, &out.raw).await;
        }
    }

    /// Matches a binding response against the pending tables: gathering
    /// transactions first (they are unauthenticated), then connectivity
    /// checks, otherwise the transaction id is unknown and the message
    /// dropped.
    async fn handle_response(&mut self, m: &mut Message, base: SocketAddr, src: SocketAddr) {
        if let Some(idx) = self
            .gather_txns
            .iter()
            .position(|t| t.transaction_id == m.transaction_id && !t.is_terminal())
        {
            self.handle_gather_response(m, idx, base, src).await;
            return;
        }

        if !self.conn_checks.contains_key(&m.transaction_id) {
            log::warn!(
                "[{}]: discard message from ({}), unknown TransactionID 0x{:?}",
                self.get_name(),
                src,
                m.transaction_id
            );
            return;
        }

        if let Err(err) = assert_inbound_message_integrity(m, self.remote_pwd.as_bytes()) {
            log::debug!("[{}]: discard message from ({}), {}", self.get_name(), src, err);
            return;
        }
        if let Err(err) = FINGERPRINT.check(m) {
            log::debug!("[{}]: discard message from ({}), {}", self.get_name(), src, err);
            return;
        }

        let check = match self.conn_checks.remove(&m.transaction_id) {
            Some(c) => c,
            None => return,
        };

        if m.typ.class == CLASS_ERROR_RESPONSE {
            self.handle_check_error(m, check).await;
        } else {
            self.handle_check_success(m, check, base, src).await;
        }
    }

    /// A 487 means the peer won the role conflict: switch and re-check the
    /// pair; every other error response fails it.
    async fn handle_check_error(&mut self, m: &Message, check: ConnCheck) {
        let mut code = ErrorCodeAttribute::default();
        if code.get_from(m).is_ok() && code.code == CODE_ROLE_CONFLICT {
            self.switch_role();
            if let Some(p) = self.checklist.get_mut(check.pair_id) {
                if p.state == CandidatePairState::InProgress {
                    p.state = CandidatePairState::Waiting;
                }
            }
        } else {
            log::warn!(
                "[{}]: check on {} answered with error {}",
                self.get_name(),
                check.pair_id,
                code.code.0
            );
            self.fail_pair(check.pair_id);
        }
    }

    /// Applies RFC 8445 section 7.2.5: enforce response symmetry, discover a
    /// peer-reflexive local candidate when the mapped address is new, then
    /// run the add-valid-pair rules and any pending nomination.
    async fn handle_check_success(
        &mut self,
        m: &mut Message,
        check: ConnCheck,
        base: SocketAddr,
        src: SocketAddr,
    ) {
        let c_id = check.pair_id;
        let (c_local, c_remote, c_nominate, c_foundations) = match self.checklist.get(c_id) {
            Some(p) => (p.local.clone(), p.remote.clone(), p.nominate, p.foundations()),
            None => return,
        };

        // A response must come from where the request went, on the socket it
        // left from; a rewriting NAT in between cannot be worked around
        // (RFC 8445 section 7.2.5.2.1).
        if src != c_remote.addr() || base != c_local.base_addr() {
            log::debug!(
                "[{}]: discard message: transaction source and destination does not match expected({}), actual({})",
                self.get_name(),
                c_remote.addr(),
                src
            );
            self.fail_pair(c_id);
            return;
        }

        let mut xor_addr = XorMappedAddress::default();
        if let Err(err) = xor_addr.get_from(m) {
            log::warn!(
                "[{}]: response without XOR-MAPPED-ADDRESS from {}: {}",
                self.get_name(),
                src,
                err
            );
            self.fail_pair(c_id);
            return;
        }
        let mapped = SocketAddr::new(xor_addr.ip, xor_addr.port);

        let v_local = match self.local_candidates.iter().find(|c| c.addr() == mapped) {
            Some(c) => c.clone(),
            None => {
                let prflx = Candidate::peer_reflexive(&c_local, mapped);
                log::debug!(
                    "[{}]: adding a new peer-reflexive local candidate: {}",
                    self.get_name(),
                    mapped
                );
                self.local_candidates.push(prflx.clone());
                self.emit(Event::NewCandidate(prflx.clone())).await;
                prflx
            }
        };

        // Add-valid-pair rules: the pair the network proved is either the
        // conn-check pair itself, an already-listed pair, or a fresh valid
        // pair appended to the checklist.
        let mut fresh_valid = false;
        let mut already_nominatable = false;
        let w_id = if v_local == c_local {
            if let Some(p) = self.checklist.get_mut(c_id) {
                p.state = CandidatePairState::Succeeded;
                fresh_valid = !p.valid;
                p.valid = true;
            }
            c_id
        } else if let Some(e) = self.checklist.find(&v_local, &c_remote) {
            let e_id = e.id;
            // A valid pair that was already awaiting nomination gets
            // nominated by this response, whatever check produced it.
            already_nominatable = e.valid && e.nominate;
            if let Some(p) = self.checklist.get_mut(c_id) {
                p.state = CandidatePairState::Succeeded;
            }
            if let Some(p) = self.checklist.get_mut(e_id) {
                p.state = CandidatePairState::Succeeded;
                fresh_valid = !p.valid;
                p.valid = true;
                if e_id != c_id {
                    p.discovered_from = Some(c_id);
                }
            }
            e_id
        } else {
            if let Some(p) = self.checklist.get_mut(c_id) {
                p.state = CandidatePairState::Succeeded;
            }
            let mut v = CandidatePair::new(
                v_local,
                c_remote.clone(),
                self.role,
                CandidatePairState::Succeeded,
            );
            v.valid = true;
            v.discovered_from = Some(c_id);
            fresh_valid = true;
            self.checklist.append(v)
        };

        self.checklist.unfreeze_foundation(&c_foundations);

        if fresh_valid {
            log::trace!(
                "[{}]: found valid candidate pair {}",
                self.get_name(),
                w_id
            );
            self.emit(Event::Connected).await;
        }

        let w_nominate = self.checklist.get(w_id).map(|p| p.nominate).unwrap_or(false);

        if already_nominatable {
            self.nominate_pair(w_id).await;
        } else if self.role.is_controlling() {
            if check.is_use_candidate {
                // Our nomination check came back; the pair is the one.
                self.nominate_pair(w_id).await;
            } else if c_nominate || w_nominate {
                // Nomination intent raced with a plain check in flight;
                // re-check the valid pair with USE-CANDIDATE on a later tick.
                if let Some(p) = self.checklist.get_mut(w_id) {
                    p.nominate = true;
                    p.state = CandidatePairState::Waiting;
                }
            }
        } else if c_nominate || w_nominate {
            // The peer asked for this pair with USE-CANDIDATE before the
            // check succeeded; it is nominated now.
            self.nominate_pair(w_id).await;
        }
    }

    async fn nominate_pair(&mut self, id: PairId) {
        let valid = self.checklist.get(id).map(|p| p.valid).unwrap_or(false);
        if !valid {
            return;
        }
        if let Some(p) = self.checklist.get_mut(id) {
            p.nominated = true;
            p.nominate = false;
        }
        self.maybe_select(id).await;
    }

    async fn handle_gather_response(
        &mut self,
        m: &mut Message,
        idx: usize,
        base: SocketAddr,
        src: SocketAddr,
    ) {
        let txn_base = self.gather_txns[idx].base;
        let server = self.gather_txns[idx].server;

        if base != txn_base || src != server {
            log::debug!(
                "[{}]: gather reply from unexpected source {} (wanted {})",
                self.get_name(),
                src,
                server
            );
            return;
        }

        if m.typ.class != CLASS_SUCCESS_RESPONSE {
            log::debug!(
                "[{}]: gather transaction to {} answered with an error",
                self.get_name(),
                server
            );
            self.gather_txns[idx].state = GatherTransactionState::Failed;
            self.check_gathering_done().await;
            return;
        }

        let mut xor_addr = XorMappedAddress::default();
        if let Err(err) = xor_addr.get_from(m) {
            log::warn!(
                "[{}]: gather reply without XOR-MAPPED-ADDRESS from {}: {}",
                self.get_name(),
                server,
                err
            );
            self.gather_txns[idx].state = GatherTransactionState::Failed;
            self.check_gathering_done().await;
            return;
        }

        self.gather_txns[idx].state = GatherTransactionState::Completed;
        let mapped = SocketAddr::new(xor_addr.ip, xor_addr.port);

        let host = self
            .local_candidates
            .iter()
            .find(|c| c.candidate_type() == CandidateType::Host && c.addr() == txn_base)
            .cloned();

        if let Some(host) = host {
            let srflx = Candidate::server_reflexive(&host, mapped, server);
            // A mapped address equal to the base means no NAT on this path;
            // the host candidate already covers it.
            if !self.local_candidates.iter().any(|c| c == &srflx) {
                log::debug!(
                    "[{}]: discovered server-reflexive candidate {}",
                    self.get_name(),
                    srflx
                );
                self.emit(Event::NewCandidate(srflx.clone())).await;
                self.pair_new_local_candidate(&srflx);
                self.local_candidates.push(srflx);
            }
        }

        self.check_gathering_done().await;
    }

    async fn check_gathering_done(&mut self) {
        if self.gather_txns.iter().all(|t| t.is_terminal()) {
            self.finish_gathering().await;
        }
    }
}

fn assert_inbound_username(m: &Message, expected_username: &str) -> Result<()> {
    let mut username = Username::new(ATTR_USERNAME, String::new());
    username.get_from(m)?;

    if username.to_string() != expected_username {
        return Err(Error::Other(format!(
            "{:?} expected({}) actual({})",
            Error::ErrMismatchUsername,
            expected_username,
            username,
        )));
    }

    Ok(())
}

fn assert_inbound_message_integrity(m: &mut Message, key: &[u8]) -> Result<()> {
    let message_integrity_attr = MessageIntegrity(key.to_vec());
    Ok(message_integrity_attr.check(m)?)
}
