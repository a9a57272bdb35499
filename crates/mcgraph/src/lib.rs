//! Execution-graph exploration core for stateless model checking.
//!
//! A program is explored one consistent execution graph at a time. Each new
//! event is added with a choice of where it reads from or where it sits in
//! the coherence (memory) or send (channel) order, and every alternative
//! choice is recorded as a revisit on a stamp-keyed worklist. Calculators
//! decide whether a graph is consistent; inconsistent graphs are dropped and
//! the next revisit is restored.
//!
//! The driver reports one of three verdicts: every execution verified, a
//! data race between two plain accesses, or an internal invariant violation.

pub mod calc;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod graph;
pub mod interp;
pub mod label;
pub mod program;
pub mod race;
pub mod revisit;
pub mod views;
pub mod vv;
pub mod worklist;

pub use config::{Config, PrefixViewPolicy};
pub use engine::{Driver, DriverState, ExplorationResult, Verdict};
pub use error::{Error, Result};
pub use event::{Addr, ChannelId, Event, Stamp};
pub use graph::ExecutionGraph;
pub use interp::{Interpreter, NextEvent, PersistencyChecker};
pub use label::{Label, LabelKind, MemOrdering};
pub use program::{Instr, Program};
pub use revisit::Revisit;
pub use vv::View;
pub use worklist::Worklist;
