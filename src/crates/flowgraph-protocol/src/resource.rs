//! Cluster resource accounting.
//!
//! A [`Resource`] is used in two roles: as a capacity advertised by an agent
//! and as a demand declared by a container. Comparison is a partial order
//! over all numeric fields; the `host` label never participates.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Host capacity or container demand.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Endpoint label of the owning host. For agents this carries the
    /// frontier listener endpoint (`host:port`).
    pub host: String,
    pub num_cpus: u64,
    pub memory_limit_in_bytes: u64,
    pub space_limit_in_bytes: u64,
}

impl Resource {
    pub fn new(num_cpus: u64, memory_limit_in_bytes: u64, space_limit_in_bytes: u64) -> Self {
        Self {
            host: String::new(),
            num_cpus,
            memory_limit_in_bytes,
            space_limit_in_bytes,
        }
    }

    /// Whether `self` dominates `demand` in every dimension.
    pub fn can_accommodate(&self, demand: &Resource) -> bool {
        self.num_cpus >= demand.num_cpus
            && self.memory_limit_in_bytes >= demand.memory_limit_in_bytes
            && self.space_limit_in_bytes >= demand.space_limit_in_bytes
    }

    /// Strict domination: dominates and differs in at least one dimension.
    pub fn dominates(&self, other: &Resource) -> bool {
        self.can_accommodate(other)
            && (self.num_cpus != other.num_cpus
                || self.memory_limit_in_bytes != other.memory_limit_in_bytes
                || self.space_limit_in_bytes != other.space_limit_in_bytes)
    }

    /// Reserve `demand` out of this capacity.
    ///
    /// The caller must have checked [`can_accommodate`](Self::can_accommodate)
    /// first; underflow is a placement-logic bug.
    pub fn take(&mut self, demand: &Resource) {
        debug_assert!(self.can_accommodate(demand), "resource underflow");
        self.num_cpus = self.num_cpus.saturating_sub(demand.num_cpus);
        self.memory_limit_in_bytes = self
            .memory_limit_in_bytes
            .saturating_sub(demand.memory_limit_in_bytes);
        self.space_limit_in_bytes = self
            .space_limit_in_bytes
            .saturating_sub(demand.space_limit_in_bytes);
    }

    /// Return a previously taken `demand` to this capacity.
    pub fn give(&mut self, demand: &Resource) {
        self.num_cpus += demand.num_cpus;
        self.memory_limit_in_bytes += demand.memory_limit_in_bytes;
        self.space_limit_in_bytes += demand.space_limit_in_bytes;
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[host={} cpus={} memory={}B space={}B]",
            if self.host.is_empty() { "?" } else { &self.host },
            self.num_cpus,
            self.memory_limit_in_bytes,
            self.space_limit_in_bytes
        )
    }
}
