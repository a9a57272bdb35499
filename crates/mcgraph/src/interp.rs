//! Collaborator seams: the interpreter that produces labels and the
//! optional persistency checker.

use crate::error::Result;
use crate::graph::ExecutionGraph;
use crate::label::Label;
use crate::vv::View;

/// What a thread wants to do next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NextEvent {
    /// Append this label to the thread.
    Label(Label),
    /// The thread cannot make progress right now.
    Blocked,
    /// The thread has nothing left to run.
    ThreadFinished,
}

/// Produces the next label of a thread given the current graph.
///
/// The graph is the only state shared with the driver: after a backtrack
/// the interpreter sees the restored graph and must resume from it.
pub trait Interpreter {
    fn next_event(&mut self, thread: usize, g: &ExecutionGraph) -> Result<NextEvent>;
}

/// Computes persistency (pb) views for disk labels.
pub trait PersistencyChecker {
    fn calc_dsk_mem_access_pb_view(&self, g: &ExecutionGraph, lab: &Label) -> View;

    fn calc_dsk_fence_pb_view(&self, g: &ExecutionGraph, lab: &Label) -> View;
}
