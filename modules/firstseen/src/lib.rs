//! Per-import reduction of identity sightings into first-/last-seen
//! candidates.
//!
//! An identity is either an IP or an FQDN, never both; the reduction is a
//! commutative min/max fold, so the result is deterministic regardless of
//! record order. The store merges candidates against existing rows with the
//! same min/max semantics.

use std::collections::HashMap;
use std::net::IpAddr;
use tracing::warn;
use uid_correlate::{Correlated, FqdnSource};

/// Identity key: exactly one of ip or fqdn.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Ip(IpAddr),
    Fqdn(String),
}

/// Candidate first-/last-seen window for one identity within one import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub identity: Identity,
    pub first_seen: i64,
    pub last_seen: i64,
}

#[derive(Debug, Default)]
pub struct FirstSeenTracker {
    seen: HashMap<Identity, (i64, i64)>,
}

impl FirstSeenTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive identity updates from a correlated record:
    /// - FQDN resolved: the fqdn and, for conn-backed protocols, the dst IP.
    /// - No FQDN: the dst IP alone.
    /// - DNS: only the query; answers never advance IP identities, and the
    ///   resolver address is covered by the flow's own conn record.
    pub fn observe(&mut self, rec: &Correlated) {
        match (&rec.fqdn, rec.source) {
            (Some(fqdn), Some(FqdnSource::Dns)) => {
                self.observe_identity(Identity::Fqdn(fqdn.clone()), rec.ts);
            }
            (Some(fqdn), _) => {
                self.observe_identity(Identity::Fqdn(fqdn.clone()), rec.ts);
                self.observe_identity(Identity::Ip(rec.dst), rec.ts);
            }
            (None, _) => {
                if rec.source != Some(FqdnSource::Dns) {
                    self.observe_identity(Identity::Ip(rec.dst), rec.ts);
                }
            }
        }
    }

    pub fn observe_identity(&mut self, identity: Identity, ts: i64) {
        self.seen
            .entry(identity)
            .and_modify(|(first, last)| {
                if ts < *first {
                    *first = ts;
                }
                if ts > *last {
                    *last = ts;
                }
            })
            .or_insert((ts, ts));
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn into_candidates(self) -> Vec<Candidate> {
        self.seen
            .into_iter()
            .map(|(identity, (first_seen, last_seen))| Candidate { identity, first_seen, last_seen })
            .collect()
    }
}

/// Clamp a candidate against an already-stored window. A candidate that would
/// move an existing first_seen forward is an invariant violation: warned,
/// clamped, never fatal.
pub fn clamp_against_existing(candidate: &mut Candidate, existing_first: i64, existing_last: i64) {
    if candidate.first_seen > existing_first {
        warn!(
            identity = ?candidate.identity,
            candidate_first = candidate.first_seen,
            existing_first,
            "first_seen would move forward; clamping to stored minimum"
        );
    }
    candidate.first_seen = candidate.first_seen.min(existing_first);
    candidate.last_seen = candidate.last_seen.max(existing_last);
}
