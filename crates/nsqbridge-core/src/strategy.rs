//! Dispatch strategy
//!
//! Picks the pool connection(s) that receive an outbound publish.

use std::sync::atomic::{AtomicUsize, Ordering};

use nsqbridge_types::Strategy;

/// Target selection, fixed at pool construction
#[derive(Debug)]
pub enum Dispatcher {
    /// Next connection in sequence, wrapping around
    RoundRobin { cursor: AtomicUsize },
    /// Every connection
    FanOut,
}

impl Dispatcher {
    pub fn new(strategy: Strategy) -> Self {
        match strategy {
            Strategy::RoundRobin => Self::RoundRobin {
                cursor: AtomicUsize::new(0),
            },
            Strategy::FanOut => Self::FanOut,
        }
    }

    pub fn strategy(&self) -> Strategy {
        match self {
            Self::RoundRobin { .. } => Strategy::RoundRobin,
            Self::FanOut => Strategy::FanOut,
        }
    }

    /// Select targets from the current connections
    ///
    /// Returns `None` when there is nothing to publish to. The round-robin
    /// cursor is read and advanced in one atomic step.
    pub fn select<T: Clone>(&self, connections: &[T]) -> Option<Vec<T>> {
        if connections.is_empty() {
            return None;
        }

        match self {
            Self::RoundRobin { cursor } => {
                let index = cursor.fetch_add(1, Ordering::Relaxed) % connections.len();
                Some(vec![connections[index].clone()])
            }
            Self::FanOut => Some(connections.to_vec()),
        }
    }
}
