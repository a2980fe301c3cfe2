use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use stun::agent::TransactionId;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::agent::agent_config::*;
use crate::agent::agent_gather::*;
use crate::agent::{AgentState, Event};
use crate::candidate::*;
use crate::checklist::Checklist;
use crate::control::Role;
use crate::error::*;
use crate::rand::{generate_pwd, generate_ufrag};
use crate::url::Url;

/// Everything the agent reacts to arrives as one of these; the loop in
/// [`AgentInternal::run_loop`] processes them one at a time, so handlers
/// never observe each other mid-mutation.
pub(crate) enum Msg {
    Run,
    SetRemoteCredentials(String, String),
    GatherCandidates,
    AddRemoteCandidate(Candidate),
    EndOfCandidates,
    HostsGathered(Vec<Candidate>),
    Datagram(Datagram),
    Close,
}

/// A packet read from one of the agent's sockets.
pub(crate) struct Datagram {
    pub(crate) buf: Vec<u8>,
    pub(crate) src: SocketAddr,
    /// Local address of the socket the packet arrived on.
    pub(crate) base: SocketAddr,
}

/// An in-flight connectivity check, kept keyed by transaction id until a
/// response arrives or the retransmission budget runs out.
pub(crate) struct ConnCheck {
    pub(crate) pair_id: PairId,
    pub(crate) dst: SocketAddr,
    pub(crate) base: SocketAddr,
    pub(crate) raw: Vec<u8>,
    pub(crate) is_use_candidate: bool,
    pub(crate) attempts: u16,
    pub(crate) rto: Duration,
    pub(crate) deadline: Instant,
}

pub(crate) struct AgentInternal {
    pub(crate) role: Role,
    pub(crate) tie_breaker: u64,
    pub(crate) state: AgentState,
    pub(crate) check_interval: Duration,

    pub(crate) urls: Vec<Url>,
    pub(crate) ip_filter: Arc<Option<IpFilterFn>>,
    gatherer: Arc<dyn Gatherer + Send + Sync>,

    pub(crate) local_ufrag: String,
    pub(crate) local_pwd: String,
    pub(crate) remote_ufrag: String,
    pub(crate) remote_pwd: String,

    pub(crate) local_candidates: Vec<Candidate>,
    pub(crate) remote_candidates: Vec<Candidate>,
    pub(crate) checklist: Checklist,
    pub(crate) conn_checks: HashMap<TransactionId, ConnCheck>,
    pub(crate) gather_txns: Vec<GatherTransaction>,
    gathering_complete: bool,
    pub(crate) end_of_candidates: bool,
    pub(crate) selected_pair: Option<PairId>,

    event_tx: mpsc::Sender<Event>,
    msg_tx: mpsc::Sender<Msg>,
}

impl AgentInternal {
    pub(crate) fn new(
        config: AgentConfig,
        event_tx: mpsc::Sender<Event>,
        msg_tx: mpsc::Sender<Msg>,
    ) -> Self {
        let mut urls = vec![];
        for raw in &config.stun_servers {
            match Url::parse_url(raw) {
                Ok(url) => urls.push(url),
                Err(err) => {
                    log::warn!("Discarding STUN server url {}: {}", raw, err);
                }
            }
        }

        Self {
            role: config.role,
            tie_breaker: rand::random::<u64>(),
            state: AgentState::Idle,
            check_interval: config.check_interval.unwrap_or(DEFAULT_CHECK_INTERVAL),

            urls,
            ip_filter: Arc::new(config.ip_filter),
            gatherer: config.gatherer,

            local_ufrag: String::new(),
            local_pwd: String::new(),
            remote_ufrag: String::new(),
            remote_pwd: String::new(),

            local_candidates: vec![],
            remote_candidates: vec![],
            checklist: Checklist::new(),
            conn_checks: HashMap::new(),
            gather_txns: vec![],
            gathering_complete: false,
            end_of_candidates: false,
            selected_pair: None,

            event_tx,
            msg_tx,
        }
    }

    pub(crate) fn get_name(&self) -> &str {
        if self.role.is_controlling() {
            "controlling"
        } else {
            "controlled"
        }
    }

    /// The Ta ticker runs from `run()` until a pair is selected or the agent
    /// gives up.
    fn ticking(&self) -> bool {
        matches!(self.state, AgentState::Gathering | AgentState::Checking)
    }

    pub(crate) async fn run_loop(mut self, mut msg_rx: mpsc::Receiver<Msg>) {
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick(), if self.ticking() => {
                    self.on_ta_tick().await;
                }
                msg = msg_rx.recv() => {
                    match msg {
                        Some(Msg::Close) | None => {
                            self.shutdown().await;
                            return;
                        }
                        Some(msg) => self.handle_msg(msg).await,
                    }
                }
            }
        }
    }

    async fn handle_msg(&mut self, msg: Msg) {
        match msg {
            Msg::Run => self.handle_run().await,
            Msg::SetRemoteCredentials(ufrag, pwd) => {
                self.remote_ufrag = ufrag;
                self.remote_pwd = pwd;
            }
            Msg::GatherCandidates => self.handle_gather_candidates(),
            Msg::AddRemoteCandidate(c) => self.handle_add_remote_candidate(c).await,
            Msg::EndOfCandidates => self.handle_end_of_candidates().await,
            Msg::HostsGathered(cands) => self.handle_hosts_gathered(cands).await,
            Msg::Datagram(dgram) => self.handle_datagram(dgram).await,
            // Handled by run_loop before dispatch.
            Msg::Close => {}
        }
    }

    async fn handle_run(&mut self) {
        if self.state != AgentState::Idle {
            log::warn!("[{}]: {}", self.get_name(), Error::ErrMultipleStart);
            return;
        }

        self.local_ufrag = generate_ufrag();
        self.local_pwd = generate_pwd();
        self.emit(Event::LocalCredentials {
            ufrag: self.local_ufrag.clone(),
            pwd: self.local_pwd.clone(),
        })
        .await;

        self.state = AgentState::Gathering;
        self.spawn_host_gathering();
    }

    /// Re-runs the Gatherer; already-known candidates are deduplicated, so
    /// this only ever adds.
    fn handle_gather_candidates(&mut self) {
        if self.state == AgentState::Idle {
            log::warn!("[{}]: gather_candidates before run", self.get_name());
            return;
        }
        self.spawn_host_gathering();
    }

    fn spawn_host_gathering(&self) {
        let gatherer = Arc::clone(&self.gatherer);
        let ip_filter = Arc::clone(&self.ip_filter);
        let msg_tx = self.msg_tx.clone();
        tokio::spawn(async move {
            match gatherer.gather_host_candidates((*ip_filter).as_ref()).await {
                Ok(cands) => {
                    let _ = msg_tx.send(Msg::HostsGathered(cands)).await;
                }
                Err(err) => {
                    log::warn!("Failed to gather host candidates: {}", err);
                    let _ = msg_tx.send(Msg::HostsGathered(vec![])).await;
                }
            }
        });
    }

    async fn handle_hosts_gathered(&mut self, cands: Vec<Candidate>) {
        let servers = self.resolve_stun_servers().await;

        for c in cands {
            if self.local_candidates.iter().any(|l| l == &c) {
                continue;
            }

            if let Some(conn) = &c.conn {
                let conn = Arc::clone(conn);
                let base = c.base_addr();
                let msg_tx = self.msg_tx.clone();
                tokio::spawn(async move {
                    recv_loop(conn, base, msg_tx).await;
                });
            } else {
                log::warn!(
                    "[{}]: host candidate {} has no socket, dropping",
                    self.get_name(),
                    c
                );
                continue;
            }

            for server in &servers {
                if server.is_ipv4() != c.addr().is_ipv4() {
                    continue;
                }
                match GatherTransaction::new(c.base_addr(), *server) {
                    Ok(txn) => self.gather_txns.push(txn),
                    Err(err) => {
                        log::warn!("[{}]: failed to build gather request: {}", self.get_name(), err);
                    }
                }
            }

            self.emit(Event::NewCandidate(c.clone())).await;
            self.pair_new_local_candidate(&c);
            self.local_candidates.push(c);
        }

        if self.gather_txns.is_empty() {
            self.finish_gathering().await;
        }
    }

    async fn resolve_stun_servers(&self) -> Vec<SocketAddr> {
        let mut servers = vec![];
        for url in &self.urls {
            if let Ok(ip) = url.host.parse::<IpAddr>() {
                servers.push(SocketAddr::new(ip, url.port));
                continue;
            }
            match tokio::net::lookup_host((url.host.as_str(), url.port)).await {
                Ok(mut addrs) => {
                    if let Some(addr) = addrs.next() {
                        servers.push(addr);
                    } else {
                        log::warn!("No address found for STUN server {}", url);
                    }
                }
                Err(err) => {
                    log::warn!("Failed to resolve STUN server {}: {}", url, err);
                }
            }
        }
        servers
    }

    pub(crate) async fn finish_gathering(&mut self) {
        if self.gathering_complete {
            return;
        }
        self.gathering_complete = true;
        if self.state == AgentState::Gathering {
            self.state = AgentState::Checking;
        }
        self.emit(Event::GatheringComplete).await;
    }

    /// Forms pairs of a freshly gathered or discovered local candidate
    /// against every compatible remote candidate.
    pub(crate) fn pair_new_local_candidate(&mut self, local: &Candidate) {
        let remotes: Vec<Candidate> = self
            .remote_candidates
            .iter()
            .filter(|r| r.family_matches(local))
            .cloned()
            .collect();
        for remote in remotes {
            self.insert_pair(local.clone(), remote);
        }
    }

    async fn handle_add_remote_candidate(&mut self, c: Candidate) {
        if self.remote_candidates.iter().any(|r| r == &c) {
            return;
        }

        let locals: Vec<Candidate> = self
            .local_candidates
            .iter()
            .filter(|l| l.family_matches(&c))
            .cloned()
            .collect();
        for local in locals {
            self.insert_pair(local, c.clone());
        }

        self.remote_candidates.push(c);
    }

    pub(crate) fn insert_pair(&mut self, local: Candidate, remote: Candidate) -> PairId {
        if let Some(existing) = self.checklist.find(&local, &remote) {
            return existing.id;
        }
        let pair = CandidatePair::new(local, remote, self.role, CandidatePairState::Waiting);
        log::trace!("[{}]: adding pair {}", self.get_name(), pair);
        self.checklist.insert(pair)
    }

    async fn handle_end_of_candidates(&mut self) {
        self.end_of_candidates = true;
        if self.role.is_controlling() {
            // Same promotion the Ta tick performs once the checklist drains.
            self.try_nominate_or_fail().await;
        }
    }

    async fn handle_datagram(&mut self, dgram: Datagram) {
        // Keepalive requests on the selected pair still deserve an answer
        // after checking concluded.
        if matches!(self.state, AgentState::Idle | AgentState::Closed) {
            return;
        }

        if !stun::message::is_message(&dgram.buf) {
            log::trace!(
                "[{}]: non-STUN packet from {}, ignoring",
                self.get_name(),
                dgram.src
            );
            return;
        }

        let mut m = stun::message::Message {
            raw: vec![],
            ..Default::default()
        };
        m.raw.extend_from_slice(&dgram.buf);
        if let Err(err) = m.decode() {
            log::debug!(
                "[{}]: failed to decode STUN from {}: {}",
                self.get_name(),
                dgram.src,
                err
            );
            return;
        }

        self.handle_inbound(&mut m, dgram.base, dgram.src).await;
    }

    /// One Ta tick: retransmission bookkeeping first, then either one
    /// gathering send or one connectivity check (RFC 8445 pacing: a single
    /// transmission per tick).
    async fn on_ta_tick(&mut self) {
        self.scan_deadlines().await;

        if self.advance_gathering().await {
            return;
        }

        if self.remote_ufrag.is_empty() || self.remote_pwd.is_empty() {
            // Cannot authenticate a check until the peer's credentials arrive.
            return;
        }

        if let Some(pair) = self.checklist.highest_in_state(CandidatePairState::Waiting) {
            let id = pair.id;
            self.send_conn_check(id).await;
            return;
        }

        if !self.checklist.any_in_state(CandidatePairState::InProgress)
            && self.role.is_controlling()
        {
            self.try_nominate_or_fail().await;
        } else {
            self.maybe_fail().await;
        }
    }

    /// Retransmits whatever is past its deadline and fails transactions that
    /// ran out of budget (RFC 5389 section 7.2.1).
    async fn scan_deadlines(&mut self) {
        let now = Instant::now();

        for i in 0..self.gather_txns.len() {
            if self.gather_txns[i].state != GatherTransactionState::InProgress
                || self.gather_txns[i].deadline > now
            {
                continue;
            }
            if self.gather_txns[i].attempts > MAX_RETRANSMISSIONS {
                log::debug!(
                    "[{}]: gather transaction to {} timed out",
                    self.get_name(),
                    self.gather_txns[i].server
                );
                self.gather_txns[i].state = GatherTransactionState::Failed;
                continue;
            }

            let (base, server, raw) = (
                self.gather_txns[i].base,
                self.gather_txns[i].server,
                self.gather_txns[i].raw.clone(),
            );
            let sent = self.send_datagram(base, server, &raw).await;
            let txn = &mut self.gather_txns[i];
            if sent {
                txn.attempts += 1;
                txn.rto *= 2;
                txn.deadline = now + txn.rto;
            } else {
                txn.state = GatherTransactionState::Failed;
            }
        }
        if self
            .gather_txns
            .iter()
            .all(|t| t.is_terminal())
            && !self.gather_txns.is_empty()
        {
            self.finish_gathering().await;
        }

        let expired: Vec<TransactionId> = self
            .conn_checks
            .iter()
            .filter(|(_, c)| c.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            let check = match self.conn_checks.get(&id) {
                Some(c) => c,
                None => continue,
            };

            if check.attempts > MAX_RETRANSMISSIONS {
                let pair_id = check.pair_id;
                self.conn_checks.remove(&id);
                log::debug!(
                    "[{}]: connectivity check on {} ran out of retransmissions",
                    self.get_name(),
                    pair_id
                );
                self.fail_pair(pair_id);
                continue;
            }

            let (base, dst, raw) = (check.base, check.dst, check.raw.clone());
            let sent = self.send_datagram(base, dst, &raw).await;
            if let Some(check) = self.conn_checks.get_mut(&id) {
                if sent {
                    check.attempts += 1;
                    check.rto *= 2;
                    check.deadline = now + check.rto;
                } else {
                    let pair_id = check.pair_id;
                    self.conn_checks.remove(&id);
                    self.fail_pair(pair_id);
                }
            }
        }
    }

    /// Advances exactly one waiting gathering transaction. Returns true when
    /// a transmission happened, consuming this tick.
    async fn advance_gathering(&mut self) -> bool {
        let idx = match self
            .gather_txns
            .iter()
            .position(|t| t.state == GatherTransactionState::Waiting)
        {
            Some(idx) => idx,
            None => return false,
        };

        let (base, server, raw) = (
            self.gather_txns[idx].base,
            self.gather_txns[idx].server,
            self.gather_txns[idx].raw.clone(),
        );
        let sent = self.send_datagram(base, server, &raw).await;
        let now = Instant::now();
        let txn = &mut self.gather_txns[idx];
        if sent {
            txn.state = GatherTransactionState::InProgress;
            txn.attempts = 1;
            txn.deadline = now + txn.rto;
        } else {
            txn.state = GatherTransactionState::Failed;
        }

        true
    }

    /// Controlling-side nomination: with nothing waiting or in progress,
    /// promote the best succeeded pair and re-check it with USE-CANDIDATE.
    pub(crate) async fn try_nominate_or_fail(&mut self) {
        if self.selected_pair.is_some()
            || self.checklist.any_in_state(CandidatePairState::Waiting)
            || self.checklist.any_in_state(CandidatePairState::InProgress)
        {
            return;
        }

        if let Some(pair) = self.checklist.highest_in_state(CandidatePairState::Succeeded) {
            let id = pair.id;
            if let Some(p) = self.checklist.get_mut(id) {
                p.state = CandidatePairState::Waiting;
                p.nominate = true;
            }
            log::trace!(
                "[{}]: promoting pair {} for nomination",
                self.get_name(),
                id
            );
        } else {
            self.maybe_fail().await;
        }
    }

    /// Declares failure once no path can ever materialise: every listed pair
    /// failed, or the peer signalled end-of-candidates and nothing usable is
    /// left. An empty checklist while signalling is in flight keeps waiting.
    async fn maybe_fail(&mut self) {
        if self.selected_pair.is_some() || self.state == AgentState::Failed {
            return;
        }

        let nothing_left = !self.checklist.any_in_state(CandidatePairState::Waiting)
            && !self.checklist.any_in_state(CandidatePairState::InProgress)
            && !self.checklist.any_in_state(CandidatePairState::Frozen)
            && !self.checklist.any_in_state(CandidatePairState::Succeeded);

        if !nothing_left {
            return;
        }

        let all_failed = !self.checklist.is_empty();
        if all_failed || self.end_of_candidates {
            log::info!("[{}]: no usable candidate pair", self.get_name());
            self.state = AgentState::Failed;
            self.emit(Event::Failed).await;
        }
    }

    /// Marks a pair failed and wakes same-foundation pairs that were frozen
    /// behind it.
    pub(crate) fn fail_pair(&mut self, id: PairId) {
        if let Some(p) = self.checklist.get_mut(id) {
            p.state = CandidatePairState::Failed;
            let foundations = p.foundations();
            self.checklist.unfreeze_foundation(&foundations);
        }
    }

    /// Applies the selection policy: first nomination selects, later ones
    /// replace the selection only with strictly greater priority.
    pub(crate) async fn maybe_select(&mut self, id: PairId) {
        let candidate_priority = match self.checklist.get(id) {
            Some(p) => p.priority(),
            None => return,
        };

        let replace = match self.selected_pair {
            None => true,
            Some(cur) => {
                cur != id
                    && self
                        .checklist
                        .get(cur)
                        .map(|p| candidate_priority > p.priority())
                        .unwrap_or(true)
            }
        };

        if !replace {
            return;
        }

        let (local, remote) = match self.checklist.get(id) {
            Some(p) => (p.local.clone(), p.remote.clone()),
            None => return,
        };
        self.selected_pair = Some(id);
        self.state = AgentState::Completed;
        log::info!(
            "[{}]: selected pair {} -> {}",
            self.get_name(),
            local,
            remote
        );
        self.emit(Event::SelectedPair { local, remote }).await;
    }

    /// Role conflicts resolved against us re-stamp every pair and future
    /// check with the other role.
    pub(crate) fn switch_role(&mut self) {
        self.role = self.role.flip();
        log::debug!("[{}]: switched role after conflict", self.get_name());
        let role = self.role;
        self.checklist.set_role(role);
    }

    /// Sends one datagram from the socket owning `base`, retrying a bounded
    /// number of times on transient transport errors.
    pub(crate) async fn send_datagram(
        &self,
        base: SocketAddr,
        dst: SocketAddr,
        raw: &[u8],
    ) -> bool {
        let conn = match self
            .local_candidates
            .iter()
            .find(|c| c.base_addr() == base)
            .and_then(|c| c.conn.as_ref())
        {
            Some(conn) => conn,
            None => {
                log::warn!("[{}]: no socket for base {}", self.get_name(), base);
                return false;
            }
        };

        for attempt in 1..=MAX_SEND_RETRIES {
            match conn.send_to(raw, dst).await {
                Ok(_) => return true,
                Err(err) => {
                    log::trace!(
                        "[{}]: send to {} failed (attempt {}): {}",
                        self.get_name(),
                        dst,
                        attempt,
                        err
                    );
                }
            }
        }

        log::warn!("[{}]: {} to {}", self.get_name(), Error::ErrSendPacket, dst);
        false
    }

    pub(crate) async fn emit(&self, event: Event) {
        let _ = self.event_tx.send(event).await;
    }

    async fn shutdown(&mut self) {
        self.state = AgentState::Closed;
        self.conn_checks.clear();
        for c in &self.local_candidates {
            if let Some(conn) = &c.conn {
                let _ = conn.close().await;
            }
        }
    }
}

/// Reads datagrams off one socket and forwards them into the mailbox, where
/// they compete with the Ta ticker like any other message.
async fn recv_loop(
    conn: Arc<dyn util::Conn + Send + Sync>,
    base: SocketAddr,
    msg_tx: mpsc::Sender<Msg>,
) {
    let mut buffer = vec![0u8; RECEIVE_MTU];
    loop {
        match conn.recv_from(&mut buffer).await {
            Ok((n, src)) => {
                let dgram = Datagram {
                    buf: buffer[..n].to_vec(),
                    src,
                    base,
                };
                if msg_tx.send(Msg::Datagram(dgram)).await.is_err() {
                    return;
                }
            }
            Err(_) => return,
        }
    }
}
