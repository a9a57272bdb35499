//! The exploration driver.
//!
//! The driver owns one execution graph and mutates it in place. Each step
//! either asks the interpreter for the next label (Running), checks the
//! graph against every calculator (Checking), or restores an alternative
//! saved on the worklist (Backtracking). The search ends when the worklist
//! runs dry (Terminal) or on the first race.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use crate::calc::{ChannelAccess, MemoryAccess, OrderedAccess, PscCalculator, RelationKind};
use crate::config::Config;
use crate::error::{bug, Error, Result};
use crate::event::{Event, Stamp};
use crate::graph::ExecutionGraph;
use crate::interp::{Interpreter, NextEvent, PersistencyChecker};
use crate::label::{Label, LabelKind};
use crate::race::RaceDetector;
use crate::revisit::{
    BackwardRevisit, ForwardRevisit, OptionalRevisit, OrderPlacement, Revisit, SendRevisit,
    WriteRevisit,
};
use crate::views::update_label_views;
use crate::vv::View;
use crate::worklist::Worklist;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverState {
    Running,
    Checking,
    Backtracking,
    Terminal,
}

/// Outcome of a whole search.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Every consistent execution was explored without finding a race.
    Verified,
    /// Two accesses race; the search stopped at the first one.
    Race(Event, Event),
    /// No consistent complete execution exists.
    Inconsistent,
    /// The checker found a defect in itself.
    InternalInvariantViolation(String),
}

/// Result of exploring all executions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExplorationResult {
    /// Complete consistent executions visited.
    pub executions_explored: u64,
    /// Executions that ended with every unfinished thread blocked.
    pub blocked_executions: u64,
    /// The search stopped at `max_executions` with alternatives left.
    pub truncated: bool,
    pub verdict: Verdict,
}

pub struct Driver<'c, I: Interpreter> {
    config: &'c Config,
    interpreter: I,
    persistency: Option<Box<dyn PersistencyChecker + 'c>>,

    /// The current execution, mutated in place across the whole search.
    graph: ExecutionGraph,

    /// Alternatives still to explore.
    worklist: Worklist,

    state: DriverState,
    race: RaceDetector,

    /// Thread that produced the last label; scheduling sticks to it.
    current_thread: usize,

    /// Threads that reported they cannot proceed in the current graph.
    blocked: BTreeSet<usize>,

    /// Memory access to race-check once the graph is known consistent.
    pending_race_check: Option<Event>,

    executions_explored: u64,
    blocked_executions: u64,
    truncated: bool,
    warned_graph_size: bool,
}

impl<'c, I: Interpreter> Driver<'c, I> {
    pub fn new(config: &'c Config, interpreter: I) -> Self {
        let mut graph = ExecutionGraph::new(config.prefix_view, config.out_of_order);
        graph.add_calculator(Box::new(PscCalculator::new()));
        Self {
            config,
            interpreter,
            persistency: None,
            graph,
            worklist: Worklist::new(),
            state: DriverState::Running,
            race: RaceDetector::new(config.lock_discipline),
            current_thread: 0,
            blocked: BTreeSet::new(),
            pending_race_check: None,
            executions_explored: 0,
            blocked_executions: 0,
            truncated: false,
            warned_graph_size: false,
        }
    }

    pub fn with_persistency(
        config: &'c Config,
        interpreter: I,
        checker: Box<dyn PersistencyChecker + 'c>,
    ) -> Self {
        let mut driver = Self::new(config, interpreter);
        driver.persistency = Some(checker);
        driver
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn graph(&self) -> &ExecutionGraph {
        &self.graph
    }

    /// Explores every consistent execution of the program.
    pub fn explore(&mut self) -> Result<ExplorationResult> {
        self.config.validate()?;
        if self.config.persevere && self.persistency.is_none() {
            return Err(Error::UnsupportedConfiguration(
                "persistency checking needs a persistency checker".into(),
            ));
        }

        loop {
            let step = match self.state {
                DriverState::Running => self.run_step(),
                DriverState::Checking => self.check_step(),
                DriverState::Backtracking => self.backtrack_step(),
                DriverState::Terminal => break,
            };
            match step {
                Ok(None) => {}
                Ok(Some(verdict)) => return Ok(self.finish(verdict)),
                Err(e) if e.is_internal() => {
                    return Ok(self.finish(Verdict::InternalInvariantViolation(e.to_string())))
                }
                Err(e) => return Err(e),
            }
        }

        let verdict = if self.executions_explored == 0 {
            Verdict::Inconsistent
        } else {
            Verdict::Verified
        };
        Ok(self.finish(verdict))
    }

    fn finish(&mut self, verdict: Verdict) -> ExplorationResult {
        self.state = DriverState::Terminal;
        info!(
            executions = self.executions_explored,
            blocked = self.blocked_executions,
            truncated = self.truncated,
            ?verdict,
            "exploration finished"
        );
        ExplorationResult {
            executions_explored: self.executions_explored,
            blocked_executions: self.blocked_executions,
            truncated: self.truncated,
            verdict,
        }
    }

    fn update_views(&mut self, e: Event) -> Result<()> {
        let persistency = if self.config.persevere { self.persistency.as_deref() } else { None };
        update_label_views(&mut self.graph, e, persistency)
    }

    // -----------------------------------------------------------------------
    // Running
    // -----------------------------------------------------------------------

    fn is_runnable(&self, thread: usize) -> bool {
        self.graph.thread_size(thread) > 0
            && !self.graph.is_thread_finished(thread)
            && !self.blocked.contains(&thread)
    }

    fn pick_thread(&self) -> Option<usize> {
        if self.is_runnable(self.current_thread) {
            return Some(self.current_thread);
        }
        (0..self.graph.num_threads()).find(|&t| self.is_runnable(t))
    }

    fn run_step(&mut self) -> Result<Option<Verdict>> {
        self.check_graph_size();

        let Some(thread) = self.pick_thread() else {
            self.complete_execution();
            return Ok(None);
        };
        self.current_thread = thread;

        match self.interpreter.next_event(thread, &self.graph)? {
            NextEvent::Blocked => {
                debug!(thread, "thread blocked");
                self.blocked.insert(thread);
            }
            NextEvent::ThreadFinished => self.add_event(thread, Label::thread_finish())?,
            NextEvent::Label(lab) => self.add_event(thread, lab)?,
        }
        Ok(None)
    }

    fn check_graph_size(&mut self) {
        let size = self.graph.graph_size();
        if !self.warned_graph_size && size > self.config.warn_on_graph_size {
            warn!(size, threshold = self.config.warn_on_graph_size, "execution graph is large");
            self.warned_graph_size = true;
        }
    }

    fn complete_execution(&mut self) {
        let all_finished = (0..self.graph.num_threads())
            .all(|t| self.graph.thread_size(t) == 0 || self.graph.is_thread_finished(t));
        if all_finished {
            self.executions_explored += 1;
            debug!(
                execution = self.executions_explored,
                size = self.graph.graph_size(),
                "execution complete"
            );
        } else {
            self.blocked_executions += 1;
            debug!(blocked = ?self.blocked, "execution blocked");
        }

        let limit_hit =
            self.config.max_executions.is_some_and(|max| self.executions_explored >= max);
        if limit_hit && !self.worklist.is_empty() {
            info!(pending = self.worklist.len(), "execution limit reached");
            self.truncated = true;
            self.worklist.clear();
        }
        self.state = if limit_hit { DriverState::Terminal } else { DriverState::Backtracking };
    }

    fn add_event(&mut self, thread: usize, lab: Label) -> Result<()> {
        if let LabelKind::ThreadJoin { child } = lab.kind() {
            if !self.graph.is_thread_finished(*child) {
                debug!(thread, child, "join waits for child");
                self.blocked.insert(thread);
                return Ok(());
            }
        }

        let e = self.graph.add_label(thread, lab);
        self.blocked.clear();
        let lab = self.graph.event_label(e)?;
        debug!(event = %e, kind = lab.kind_name(), stamp = lab.stamp(), "label added");
        let kind = lab.kind().clone();

        match &kind {
            LabelKind::Read(_) => self.handle_load::<MemoryAccess>(e)?,
            LabelKind::Receive(_) => self.handle_load::<ChannelAccess>(e)?,
            LabelKind::Write(_) => self.handle_store::<MemoryAccess>(e)?,
            LabelKind::Send(_) => self.handle_store::<ChannelAccess>(e)?,
            &LabelKind::ThreadCreate { child } => {
                self.update_views(e)?;
                if self.graph.thread_size(child) != 0 {
                    return Err(bug!("thread {child} started twice"));
                }
                let start = self.graph.add_label(child, Label::thread_start(e));
                self.update_views(start)?;
                debug!(event = %start, "thread started");
            }
            LabelKind::Optional { .. } => {
                self.update_views(e)?;
                let stamp = lab_stamp(&self.graph, e)?;
                self.push(stamp, Revisit::Optional(OptionalRevisit::new(e)));
            }
            _ => self.update_views(e)?,
        }

        self.state = DriverState::Checking;
        Ok(())
    }

    fn push(&mut self, stamp: Stamp, revisit: Revisit) {
        debug!(%revisit, stamp, "revisit pushed");
        self.worklist.push(stamp, revisit);
    }

    /// Reads the latest coherent store and saves every other one.
    fn handle_load<A: OrderedAccess>(&mut self, e: Event) -> Result<()> {
        let g = &self.graph;
        let loc = A::load_loc(g.event_label(e)?).ok_or_else(|| bug!("{e} is not a load"))?;
        let calc = A::order(g);
        let stores = calc.coherent_stores(g, loc, e);
        let Some((&chosen, rest)) = stores.split_last() else {
            return Err(bug!("no coherent store for {e}"));
        };
        let alternatives: Vec<Revisit> = rest
            .iter()
            .map(|&s| Revisit::Forward(ForwardRevisit::new(e, s, calc.is_maximal(loc, s))))
            .collect();

        let stamp = lab_stamp(g, e)?;
        for rev in alternatives {
            self.push(stamp, rev);
        }
        self.graph.change_rf(e, Some(chosen))?;
        self.update_views(e)?;
        if self.graph.event_label(e)?.is_mem_access() {
            self.pending_race_check = Some(e);
        }
        Ok(())
    }

    /// Places a store order-maximally, saves the other admissible offsets,
    /// then looks for loads it can revisit.
    fn handle_store<A: OrderedAccess>(&mut self, e: Event) -> Result<()> {
        self.update_views(e)?;
        let lab = self.graph.event_label(e)?;
        let loc = A::store_loc(lab).ok_or_else(|| bug!("{e} is not a store"))?;

        if lab.is_rmw_write() {
            // Atomicity pins the write right after the store its read saw.
            let src = self
                .graph
                .previous_label(e)?
                .rf()
                .ok_or_else(|| bug!("RMW {e} has no source"))?;
            A::order_mut(&mut self.graph).add_after(loc, e, src)?;
        } else {
            let (begin, end) = A::order(&self.graph).possible_placings(&self.graph, loc, e);
            A::order_mut(&mut self.graph).add_at_offset(loc, e, end)?;
            let stamp = lab_stamp(&self.graph, e)?;
            for offset in begin..end {
                let rev = match A::KIND {
                    RelationKind::SendOrder => Revisit::Send(SendRevisit::new(e, offset)),
                    _ => Revisit::Write(WriteRevisit::new(e, offset)),
                };
                self.push(stamp, rev);
            }
        }

        self.calc_revisits::<A>(e)?;
        if self.graph.event_label(e)?.is_mem_access() {
            self.pending_race_check = Some(e);
        }
        Ok(())
    }

    fn calc_revisits<A: OrderedAccess>(&mut self, store: Event) -> Result<()> {
        let loads = A::order(&self.graph).coherent_revisits(&self.graph, store)?;
        for r in loads {
            let Some(br) = self.backward_revisit::<A>(store, r)? else {
                continue;
            };
            let rev = match A::KIND {
                RelationKind::SendOrder => Revisit::BackwardSR(br),
                _ => Revisit::Backward(br),
            };
            let stamp = lab_stamp(&self.graph, r)?;
            self.push(stamp, rev);
        }
        Ok(())
    }

    /// Builds the revisit of `load` by `store`, or `None` when the resulting
    /// graph is reached through another revisit.
    fn backward_revisit<A: OrderedAccess>(
        &self,
        store: Event,
        load: Event,
    ) -> Result<Option<BackwardRevisit>> {
        let g = &self.graph;
        let load_stamp = lab_stamp(g, load)?;
        let keep = prefix_closure(g, store, load_stamp)?;
        if keep.contains(load) {
            return Ok(None);
        }

        let deleted = |e: Event| -> bool {
            g.event_label(e).is_ok_and(|l| l.stamp() > load_stamp) && !keep.contains(e)
        };

        // An RMW read that lost its source to this store's RMW is revisited
        // whatever choice it was added with.
        let pinned = shares_rmw_source(g, store, load)?;
        for lab in g.labels() {
            if lab.stamp() < load_stamp || keep.contains(lab.pos()) {
                continue;
            }
            if lab.pos() == load && pinned {
                continue;
            }
            if !lab.added_max() {
                return Ok(None);
            }
        }

        let store_lab = g.event_label(store)?;
        let loc = A::store_loc(store_lab).ok_or_else(|| bug!("{store} is not a store"))?;
        if !store_lab.is_rmw_write() {
            // Among placements that only differ around deleted stores, only
            // the latest one revisits.
            let next = A::order(g).succs(loc, store)?.first().copied();
            if next.is_some_and(|n| deleted(n)) {
                return Ok(None);
            }
        }

        let mut prefix: Vec<&Label> = g
            .labels()
            .filter(|l| l.stamp() > load_stamp && keep.contains(l.pos()))
            .collect();
        prefix.sort_by_key(|l| l.stamp());

        let mut placements = Vec::new();
        for lab in &prefix {
            let (order, pos) = if let Some(addr) = MemoryAccess::store_loc(lab) {
                (MemoryAccess::order(g).order(addr), lab.pos())
            } else if let Some(ch) = ChannelAccess::store_loc(lab) {
                (ChannelAccess::order(g).order(ch), lab.pos())
            } else {
                continue;
            };
            let offset = order
                .iter()
                .filter(|&&s| !deleted(s))
                .position(|&s| s == pos)
                .ok_or_else(|| bug!("{pos} missing from its order"))?;
            placements.push(OrderPlacement::new(pos, offset));
        }

        let prefix = prefix.into_iter().map(Label::detached_copy).collect();
        BackwardRevisit::new(g, load, store, prefix, placements).map(Some)
    }

    // -----------------------------------------------------------------------
    // Checking
    // -----------------------------------------------------------------------

    fn check_step(&mut self) -> Result<Option<Verdict>> {
        let result = self.graph.do_calcs();
        if !result.consistent {
            debug!("graph inconsistent");
            self.pending_race_check = None;
            self.state = DriverState::Backtracking;
            return Ok(None);
        }

        if let Some(e) = self.pending_race_check.take() {
            if let Some(other) = self.race.find_data_race_for_mem_access(&self.graph, e)? {
                warn!(event = %e, other = %other, "data race");
                return Ok(Some(Verdict::Race(e, other)));
            }
        }
        self.state = DriverState::Running;
        Ok(None)
    }

    // -----------------------------------------------------------------------
    // Backtracking
    // -----------------------------------------------------------------------

    fn backtrack_step(&mut self) -> Result<Option<Verdict>> {
        self.blocked.clear();
        self.pending_race_check = None;

        let Some((stamp, revisit)) = self.worklist.pop() else {
            self.state = DriverState::Terminal;
            return Ok(None);
        };
        debug!(%revisit, stamp, remaining = self.worklist.len(), "revisit popped");

        // A revisited load moves after the prefix it now reads from, so it
        // is cut together with everything added after it.
        let cut = match &revisit {
            Revisit::Backward(_) | Revisit::BackwardSR(_) | Revisit::BackwardHelper(_) => {
                stamp.saturating_sub(1)
            }
            _ => stamp,
        };
        self.graph.cut_to_stamp(cut);

        match revisit {
            Revisit::Forward(fr) => {
                let e = fr.pos();
                self.graph.change_rf(e, Some(fr.rev()))?;
                self.graph.event_label_mut(e)?.set_added_max(fr.is_maximal());
                self.update_views(e)?;
                self.check_race_later(e)?;
            }
            Revisit::Write(wr) => self.move_store::<MemoryAccess>(wr.pos(), wr.mo_pos())?,
            Revisit::Send(sr) => self.move_store::<ChannelAccess>(sr.pos(), sr.so_pos())?,
            Revisit::Backward(br) | Revisit::BackwardSR(br) => {
                let store = br.rev();
                let (load, prefix, placements) = br.take();
                self.restore_prefix(prefix, placements)?;
                self.graft_revisited_load(load, store)?;
            }
            Revisit::BackwardRS(br) => {
                // The send at `pos` stays; the receive in the prefix reads it.
                let (send, receive) = (br.pos(), br.rev());
                let (_, prefix, placements) = br.take();
                self.restore_prefix(prefix, placements)?;
                if lab_stamp(&self.graph, receive)? < lab_stamp(&self.graph, send)? {
                    return Err(bug!("{receive} would read from the later send {send}"));
                }
                self.revisit_load(receive, send)?;
            }
            Revisit::BackwardHelper(hr) => {
                let mid = hr.mid();
                let br = hr.into_inner();
                let store = br.rev();
                let (load, prefix, placements) = br.take();
                self.restore_prefix(prefix, placements)?;
                let mid_lab = self.graph.event_label(mid)?;
                let addr = self.graph.event_label(store)?.addr();
                if !mid_lab.is_write() || mid_lab.addr() != addr {
                    return Err(bug!("helper {mid} does not write the revisited location"));
                }
                self.graft_revisited_load(load, store)?;
            }
            Revisit::Optional(or) => {
                self.graph.expand_optional(or.pos())?;
            }
        }

        self.state = DriverState::Checking;
        Ok(None)
    }

    fn check_race_later(&mut self, e: Event) -> Result<()> {
        if self.graph.event_label(e)?.is_mem_access() {
            self.pending_race_check = Some(e);
        }
        Ok(())
    }

    fn move_store<A: OrderedAccess>(&mut self, e: Event, offset: usize) -> Result<()> {
        let lab = self.graph.event_label(e)?;
        let loc = A::store_loc(lab).ok_or_else(|| bug!("{e} is not a store"))?;
        A::order_mut(&mut self.graph).change_offset(loc, e, offset)?;
        self.graph.event_label_mut(e)?.set_added_max(false);
        self.calc_revisits::<A>(e)?;
        self.check_race_later(e)
    }

    fn restore_prefix(
        &mut self,
        prefix: Vec<Label>,
        placements: Vec<OrderPlacement>,
    ) -> Result<()> {
        let grafted = self.graph.graft_prefix(prefix, placements)?;
        for e in grafted {
            self.update_views(e)?;
        }
        Ok(())
    }

    /// Re-adds a load cut by its backward revisit, now reading from `store`.
    fn graft_revisited_load(&mut self, mut load: Label, store: Event) -> Result<()> {
        load.set_rf(Some(store));
        load.set_added_max(false);
        let e = self.graph.graft_label(load)?;
        self.update_views(e)?;
        self.check_race_later(e)
    }

    fn revisit_load(&mut self, load: Event, store: Event) -> Result<()> {
        self.graph.change_rf(load, Some(store))?;
        self.graph.event_label_mut(load)?.set_added_max(false);
        self.update_views(load)?;
        self.check_race_later(load)
    }
}

fn lab_stamp(g: &ExecutionGraph, e: Event) -> Result<Stamp> {
    Ok(g.event_label(e)?.stamp())
}

/// The store's prefix view, closed under the sources of every event in it
/// that was added after `stamp`.
fn prefix_closure(g: &ExecutionGraph, store: Event, stamp: Stamp) -> Result<View> {
    let mut keep = g.prefix_view(store)?.clone();
    loop {
        let mut missing = Vec::new();
        for lab in g.labels() {
            if lab.stamp() <= stamp || !keep.contains(lab.pos()) {
                continue;
            }
            let sources = [
                lab.rf(),
                match lab.kind() {
                    LabelKind::ThreadStart { parent_create } => Some(*parent_create),
                    LabelKind::ThreadJoin { child } => g.last_thread_label(*child).map(Label::pos),
                    _ => None,
                },
            ];
            missing.extend(sources.into_iter().flatten().filter(|&s| !keep.contains(s)));
        }
        if missing.is_empty() {
            return Ok(keep);
        }
        for s in missing {
            keep.update(g.prefix_view(s)?);
        }
    }
}

/// Whether `load` is an RMW read taking its value from the same store as
/// the read half of the RMW `store`. Both cannot hold, so the load has to
/// move.
fn shares_rmw_source(g: &ExecutionGraph, store: Event, load: Event) -> Result<bool> {
    let load_lab = g.event_label(load)?;
    if !load_lab.is_rmw_read() || !g.event_label(store)?.is_rmw_write() {
        return Ok(false);
    }
    let src = g.previous_label(store)?.rf();
    Ok(src.is_some() && src == load_lab.rf())
}
