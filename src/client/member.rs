//! Cluster membership view and member selection.
//!
//! The client keeps a local view of `(leader, term, members)` refreshed
//! from registration and keep-alive responses. The term is monotonic: a
//! response carrying a higher term replaces the cached leader, a stale
//! term is ignored.

use crate::rpc::{Member, MemberKind, QueryConsistency};
use rand::seq::SliceRandom;
use rand::Rng;

/// Client-side view of the cluster.
#[derive(Debug, Clone)]
pub struct Membership {
    members: Vec<Member>,
    leader: u64,
    term: u64,
}

impl Membership {
    /// Create a view over an initial member list with no known leader.
    pub fn new(members: Vec<Member>) -> Self {
        Self {
            members,
            leader: 0,
            term: 0,
        }
    }

    /// The known leader id, zero when unknown.
    pub fn leader(&self) -> u64 {
        self.leader
    }

    /// The highest term observed.
    pub fn term(&self) -> u64 {
        self.term
    }

    /// The known members.
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Forget the cached leader.
    pub fn clear_leader(&mut self) {
        self.leader = 0;
    }

    /// Merge a server response's cluster view into this one.
    ///
    /// A higher term always adopts the response's leader (even "unknown");
    /// within the current term a concrete leader fills in a missing one.
    /// A stale term changes nothing.
    pub fn configure(&mut self, term: u64, leader: u64, members: Vec<Member>) {
        if term > self.term {
            self.term = term;
            self.leader = leader;
        } else if term == self.term && leader != 0 {
            self.leader = leader;
        }
        if !members.is_empty() {
            self.members = members;
        }
    }

    /// The member record for the known leader, if any.
    pub fn leader_member(&self) -> Option<&Member> {
        if self.leader == 0 {
            return None;
        }
        self.members.iter().find(|m| m.id == self.leader)
    }

    fn voting(&self) -> Vec<&Member> {
        self.members
            .iter()
            .filter(|m| m.kind == MemberKind::Voting)
            .collect()
    }

    fn random_voting(&self, rng: &mut impl Rng) -> Option<Member> {
        self.voting().choose(rng).map(|m| (*m).clone())
    }

    fn random_any(&self, rng: &mut impl Rng) -> Option<Member> {
        self.members.choose(rng).cloned()
    }

    /// Select the member for a command: the leader when known, otherwise
    /// uniformly at random from all known members. Registration uses the
    /// same candidate pool.
    pub fn select_for_command(&self, rng: &mut impl Rng) -> Option<Member> {
        match self.leader_member() {
            Some(leader) => Some(leader.clone()),
            None => self.random_any(rng),
        }
    }

    /// Select the member for a query, honoring its consistency level.
    pub fn select_for_query(
        &self,
        consistency: QueryConsistency,
        rng: &mut impl Rng,
    ) -> Option<Member> {
        if consistency.requires_leader() {
            self.select_for_command(rng)
        } else {
            self.random_any(rng)
        }
    }

    /// Select the member for a keep-alive: only voting members carry
    /// keep-alive traffic.
    pub fn select_for_keep_alive(&self, rng: &mut impl Rng) -> Option<Member> {
        match self.leader_member() {
            Some(leader) => Some(leader.clone()),
            None => self.random_voting(rng),
        }
    }
}
