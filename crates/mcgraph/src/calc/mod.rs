//! Incremental relation calculators.
//!
//! A calculator owns the storage of one derived relation and decides, one
//! pass at a time, whether the current graph is consistent with it. The
//! graph runs every registered calculator round-robin until a full round
//! reports no change, stopping early on the first inconsistency.

pub mod order;
pub mod psc;

use std::collections::HashMap;
use std::fmt;

use crate::event::Event;
use crate::graph::ExecutionGraph;
use crate::vv::View;

pub use order::{
    ChannelAccess, CoherenceCalculator, MemoryAccess, OrderCalculator, OrderedAccess,
    SendOrderCalculator,
};
pub use psc::PscCalculator;

/// Names the relation a calculator maintains.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RelationKind {
    /// Per-address coherence order.
    Coherence,
    /// Per-channel send order.
    SendOrder,
    /// Total order over SC events.
    Psc,
}

/// Outcome of one calculator pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CalculationResult {
    pub changed: bool,
    pub consistent: bool,
}

impl CalculationResult {
    pub fn new(changed: bool, consistent: bool) -> Self {
        Self { changed, consistent }
    }

    pub fn consistent() -> Self {
        Self::new(false, true)
    }

    pub fn inconsistent() -> Self {
        Self::new(false, false)
    }

    pub fn merge(&mut self, other: CalculationResult) {
        self.changed |= other.changed;
        self.consistent &= other.consistent;
    }
}

impl Default for CalculationResult {
    fn default() -> Self {
        Self::consistent()
    }
}

pub trait Calculator: fmt::Debug {
    fn kind(&self) -> RelationKind;

    /// Allocate or clear the relation storage for a fresh check.
    fn init_calc(&mut self, g: &ExecutionGraph);

    /// One incremental pass.
    fn do_calc(&mut self, g: &ExecutionGraph) -> CalculationResult;

    /// Drop every entry that refers to an event outside `preds`.
    fn remove_after(&mut self, g: &ExecutionGraph, preds: &View);

    fn clone_calc(&self) -> Box<dyn Calculator>;
}

/// A binary relation over a fixed set of events, stored as an adjacency
/// matrix.
#[derive(Clone, Debug, Default)]
pub struct Relation {
    elems: Vec<Event>,
    index: HashMap<Event, usize>,
    matrix: Vec<Vec<bool>>,
}

impl Relation {
    pub fn new(elems: Vec<Event>) -> Self {
        let index = elems.iter().enumerate().map(|(i, &e)| (e, i)).collect();
        let n = elems.len();
        Self { elems, index, matrix: vec![vec![false; n]; n] }
    }

    pub fn elems(&self) -> &[Event] {
        &self.elems
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub fn index_of(&self, e: Event) -> Option<usize> {
        self.index.get(&e).copied()
    }

    pub fn add_edge_idx(&mut self, i: usize, j: usize) {
        self.matrix[i][j] = true;
    }

    /// Edges touching events outside the relation are ignored.
    pub fn add_edge(&mut self, a: Event, b: Event) {
        if let (Some(i), Some(j)) = (self.index_of(a), self.index_of(b)) {
            self.add_edge_idx(i, j);
        }
    }

    pub fn add_edges_from_to(&mut self, from: &[Event], to: &[Event]) {
        for &a in from {
            for &b in to {
                self.add_edge(a, b);
            }
        }
    }

    pub fn has_edge_idx(&self, i: usize, j: usize) -> bool {
        self.matrix[i][j]
    }

    pub fn has_edge(&self, a: Event, b: Event) -> bool {
        match (self.index_of(a), self.index_of(b)) {
            (Some(i), Some(j)) => self.has_edge_idx(i, j),
            _ => false,
        }
    }

    pub fn edge_count(&self) -> usize {
        self.matrix.iter().map(|row| row.iter().filter(|&&b| b).count()).sum()
    }

    /// Floyd-Warshall style closure.
    pub fn trans_closure(&mut self) {
        let n = self.elems.len();
        for k in 0..n {
            for i in 0..n {
                if !self.matrix[i][k] {
                    continue;
                }
                for j in 0..n {
                    if self.matrix[k][j] {
                        self.matrix[i][j] = true;
                    }
                }
            }
        }
    }

    pub fn is_irreflexive(&self) -> bool {
        (0..self.elems.len()).all(|i| !self.matrix[i][i])
    }
}
