//! # Load Balancer
//!
//! Purpose: Pick one node per call from a freshly fetched node list.
//!
//! ## Design Principles
//! 1. **Stateless Input**: The node list is passed per call; the balancer only
//!    keeps its round-robin counter.
//! 2. **Lock-Free**: The counter and the nodes' `active` gauges are atomics.
//! 3. **Sticky Routing**: A non-empty route key always selects by hash so the
//!    same key lands on the same node while the list is unchanged.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ecall_common::error::{RpcError, ERROR_INTERNAL, ERROR_SERVICE_NOT_FOUND};
use ecall_common::types::Node;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Node selection strategy; the discriminants are the wire-compatible tags.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Fewest in-flight calls.
    LeastActive = 1,
    /// Uniform random.
    #[default]
    Random = 2,
    /// CRC32 of the route key.
    Hash = 3,
    RoundRobin = 4,
    /// Random, proportional to node weight.
    WeightedRandom = 5,
}

impl TryFrom<u8> for Strategy {
    type Error = BalanceError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(Strategy::LeastActive),
            2 => Ok(Strategy::Random),
            3 => Ok(Strategy::Hash),
            4 => Ok(Strategy::RoundRobin),
            5 => Ok(Strategy::WeightedRandom),
            other => Err(BalanceError::UnknownStrategy(other)),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::LeastActive => "least_active",
            Strategy::Random => "random",
            Strategy::Hash => "hash",
            Strategy::RoundRobin => "round_robin",
            Strategy::WeightedRandom => "weighted_random",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BalanceError {
    #[error("service not found: empty node list")]
    NoNodes,

    #[error("invalid load balance strategy {0}")]
    UnknownStrategy(u8),
}

impl From<BalanceError> for RpcError {
    fn from(err: BalanceError) -> Self {
        match err {
            BalanceError::NoNodes => RpcError::system(ERROR_SERVICE_NOT_FOUND, err.to_string()),
            BalanceError::UnknownStrategy(_) => RpcError::system(ERROR_INTERNAL, err.to_string()),
        }
    }
}

/// CRC32 (IEEE) of a route key.
pub fn hash_key(key: &str) -> u32 {
    crc32fast::hash(key.as_bytes())
}

#[derive(Debug, Default)]
pub struct LoadBalancer {
    counter: AtomicU64,
}

impl LoadBalancer {
    pub fn new() -> Self {
        LoadBalancer::default()
    }

    /// Selects a node.
    ///
    /// A non-empty `route_key` overrides `strategy` with [`Strategy::Hash`].
    pub fn pick(&self, nodes: &[Arc<Node>], strategy: Strategy, route_key: &str) -> Result<Arc<Node>, BalanceError> {
        if nodes.is_empty() {
            return Err(BalanceError::NoNodes);
        }
        let strategy = if route_key.is_empty() { strategy } else { Strategy::Hash };

        let index = match strategy {
            Strategy::LeastActive => least_active(nodes),
            Strategy::Random => rand::thread_rng().gen_range(0..nodes.len()),
            Strategy::Hash => hash_key(route_key) as usize % nodes.len(),
            Strategy::RoundRobin => self.next_round_robin(nodes.len()),
            Strategy::WeightedRandom => weighted_random(nodes),
        };
        Ok(nodes[index].clone())
    }

    fn next_round_robin(&self, len: usize) -> usize {
        (self.counter.fetch_add(1, Ordering::Relaxed) % len as u64) as usize
    }
}

/// Smallest `active`; ties go to the earliest index.
fn least_active(nodes: &[Arc<Node>]) -> usize {
    let mut best = 0;
    let mut best_active = nodes[0].active();
    for (index, node) in nodes.iter().enumerate().skip(1) {
        let active = node.active();
        if active < best_active {
            best = index;
            best_active = active;
        }
    }
    best
}

/// Draws `r` in `[0, total)` and walks the list subtracting weights until
/// `r` falls inside a node's share. All-zero weights fall back to uniform.
fn weighted_random(nodes: &[Arc<Node>]) -> usize {
    let total: u64 = nodes.iter().map(|node| u64::from(node.weight)).sum();
    let mut rng = rand::thread_rng();
    if total == 0 {
        return rng.gen_range(0..nodes.len());
    }

    let mut remaining = rng.gen_range(0..total);
    for (index, node) in nodes.iter().enumerate() {
        let weight = u64::from(node.weight);
        if remaining < weight {
            return index;
        }
        remaining -= weight;
    }
    nodes.len() - 1
}
