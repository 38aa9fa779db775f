//! Vote rules and primary leases.
//!
//! A member grants its vote for term `T` only if `T` is greater than every
//! term it has seen, it has not voted in `T`, and the candidate's last
//! applied OpTime is at least its own. A strict majority of the configured
//! members elects.

use std::time::{Duration, Instant};

use kestrel_common::{NodeId, OpTime};

#[derive(Debug, Clone, Copy)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate: NodeId,
    pub last_optime: OpTime,
}

/// Per-member voting state.
#[derive(Debug, Clone, Copy, Default)]
pub struct VoterState {
    /// Highest term this member has seen.
    pub term: u64,
    pub voted_for: Option<(u64, NodeId)>,
}

impl VoterState {
    /// Decide a vote, recording it when granted.
    pub fn consider(&mut self, req: &VoteRequest, own_last: OpTime) -> bool {
        if req.term <= self.term {
            // A candidate retrying the same term gets the same answer.
            return self.voted_for == Some((req.term, req.candidate));
        }
        if req.last_optime < own_last {
            return false;
        }
        self.term = req.term;
        self.voted_for = Some((req.term, req.candidate));
        true
    }

    /// Learn a higher term without voting.
    pub fn observe_term(&mut self, term: u64) -> bool {
        if term > self.term {
            self.term = term;
            true
        } else {
            false
        }
    }
}

pub fn majority_of(members: usize) -> usize {
    members / 2 + 1
}

/// Time-bounded right to accept writes, renewed by majority heartbeats.
#[derive(Debug, Clone, Copy)]
pub struct Lease {
    expires_at: Instant,
}

impl Lease {
    pub fn grant(duration: Duration) -> Self {
        Self {
            expires_at: Instant::now() + duration,
        }
    }

    pub fn is_valid(&self) -> bool {
        Instant::now() < self.expires_at
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::LogicalTimestamp;

    fn ot(secs: u32, term: u64) -> OpTime {
        OpTime::new(LogicalTimestamp::new(secs, 0), term)
    }

    #[test]
    fn test_one_vote_per_term() {
        let mut v = VoterState::default();
        let a = VoteRequest {
            term: 2,
            candidate: NodeId(1),
            last_optime: ot(5, 1),
        };
        let b = VoteRequest {
            candidate: NodeId(2),
            ..a
        };
        assert!(v.consider(&a, ot(5, 1)));
        assert!(!v.consider(&b, ot(5, 1)));
        assert!(v.consider(&a, ot(5, 1)));
    }

    #[test]
    fn test_stale_candidate_rejected() {
        let mut v = VoterState::default();
        let req = VoteRequest {
            term: 3,
            candidate: NodeId(1),
            last_optime: ot(4, 1),
        };
        assert!(!v.consider(&req, ot(6, 1)));
        assert_eq!(v.term, 0);
    }

    #[test]
    fn test_majority_sizes() {
        assert_eq!(majority_of(1), 1);
        assert_eq!(majority_of(3), 2);
        assert_eq!(majority_of(4), 3);
        assert_eq!(majority_of(5), 3);
    }

    #[test]
    fn test_lease_expiry() {
        assert!(Lease::grant(Duration::from_secs(5)).is_valid());
        assert!(!Lease::grant(Duration::ZERO).is_valid());
    }
}
