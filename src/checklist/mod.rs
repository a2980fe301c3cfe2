
use crate::candidate::{Candidate, CandidatePair, CandidatePairState, PairId};
use crate::control::Role;

use std::collections::HashSet;

/// The ordered collection of candidate pairs a session is checking, kept
/// sorted by pair priority descending (ties broken by creation order).
#[derive(Default)]
pub struct Checklist {
    pairs: Vec<CandidatePair>,
}

impl Checklist {
    pub fn new() -> Self {
        Self { pairs: vec![] }
    }

    /// Inserts a pair formed from candidate exchange and re-prunes.
    ///
    /// The initial state is frozen when another listed pair already covers
    /// the same foundation tuple, waiting otherwise (RFC 8445 section
    /// 6.1.2.6). Returns the id of the pair that covers the inserted
    /// addresses after pruning.
    pub fn insert(&mut self, mut pair: CandidatePair) -> PairId {
        let foundations = pair.foundations();
        if self
            .pairs
            .iter()
            .any(|p| p.foundations() == foundations)
        {
            pair.state = CandidatePairState::Frozen;
        } else {
            pair.state = CandidatePairState::Waiting;
        }

        let key = pair.prune_key();
        let inserted = pair.id;
        self.pairs.push(pair);
        self.resort();
        self.prune();

        // The inserted pair may have lost to a higher-priority twin.
        self.pairs
            .iter()
            .find(|p| p.prune_key() == key)
            .map(|p| p.id)
            .unwrap_or(inserted)
    }

    /// Appends a valid pair discovered by a connectivity check, without
    /// pruning: formation-time redundancy rules do not apply to pairs the
    /// network has already proven.
    pub fn append(&mut self, pair: CandidatePair) -> PairId {
        let id = pair.id;
        self.pairs.push(pair);
        self.resort();
        id
    }

    /// Drops every pair whose check would be indistinguishable from a
    /// higher-priority one: same local base, same remote candidate
    /// (RFC 8445 section 6.1.2.4).
    fn prune(&mut self) {
        let mut seen = HashSet::new();
        self.pairs.retain(|p| seen.insert(p.prune_key()));
    }

    fn resort(&mut self) {
        self.pairs
            .sort_by(|a, b| b.priority().cmp(&a.priority()).then(a.id.cmp(&b.id)));
    }

    pub fn get(&self, id: PairId) -> Option<&CandidatePair> {
        self.pairs.iter().find(|p| p.id == id)
    }

    pub fn get_mut(&mut self, id: PairId) -> Option<&mut CandidatePair> {
        self.pairs.iter_mut().find(|p| p.id == id)
    }

    /// Returns the unique pair matching both candidates under candidate
    /// equality, or nothing.
    pub fn find(&self, local: &Candidate, remote: &Candidate) -> Option<&CandidatePair> {
        self.pairs
            .iter()
            .find(|p| &p.local == local && &p.remote == remote)
    }

    pub fn find_mut(&mut self, local: &Candidate, remote: &Candidate) -> Option<&mut CandidatePair> {
        self.pairs
            .iter_mut()
            .find(|p| &p.local == local && &p.remote == remote)
    }

    /// The highest-priority pair currently in the given state. The list is
    /// kept sorted, so the first hit wins deterministically.
    pub fn highest_in_state(&self, state: CandidatePairState) -> Option<&CandidatePair> {
        self.pairs.iter().find(|p| p.state == state)
    }

    pub fn any_in_state(&self, state: CandidatePairState) -> bool {
        self.pairs.iter().any(|p| p.state == state)
    }

    /// The valid pair discovered by the check on `id`, when there is one.
    pub fn discovered_by(&self, id: PairId) -> Option<&CandidatePair> {
        self.pairs.iter().find(|p| p.discovered_from == Some(id))
    }

    /// Thaws every frozen pair sharing the given foundation tuple, called
    /// when a check on that foundation concludes.
    pub fn unfreeze_foundation(&mut self, foundations: &(String, String)) {
        for p in &mut self.pairs {
            if p.state == CandidatePairState::Frozen && &p.foundations() == foundations {
                p.state = CandidatePairState::Waiting;
            }
        }
    }

    /// Re-stamps every pair with the agent's new role and restores the
    /// priority order, used when a role conflict is resolved against us.
    pub fn set_role(&mut self, role: Role) {
        for p in &mut self.pairs {
            p.role = role;
        }
        self.resort();
    }

    pub fn iter(&self) -> impl Iterator<Item = &CandidatePair> {
        self.pairs.iter()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}
