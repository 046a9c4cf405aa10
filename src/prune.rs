//! Admission pruning policy.
//!
//! When a demotion pushes the admissible-connection count over the hard
//! limit, the manager asks a [`PrunePolicy`] which peers to evict and then
//! cancels the victims' connection tasks. The policy is pure selection; it
//! never touches the table itself.

use std::collections::{HashMap, HashSet};

use rand::seq::IteratorRandom;

use crate::conn::{ConnectionType, PeerAddr};

/// Pure selection of prune victims among candidate peers.
pub trait PrunePolicy<A>: Send + Sync + 'static {
    /// Choose up to `count` victims among `candidates`.
    ///
    /// Implementations must only return addresses present in `candidates`.
    fn select(&self, candidates: &HashMap<A, ConnectionType>, count: usize) -> HashSet<A>;
}

/// Uniformly random victim choice.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomPrunePolicy;

impl<A: PeerAddr> PrunePolicy<A> for RandomPrunePolicy {
    fn select(&self, candidates: &HashMap<A, ConnectionType>, count: usize) -> HashSet<A> {
        let mut rng = rand::thread_rng();
        candidates
            .keys()
            .cloned()
            .choose_multiple(&mut rng, count)
            .into_iter()
            .collect()
    }
}
