//! The execution graph: per-thread label sequences plus the derived order
//! relations.
//!
//! Labels live in an arena indexed by `Event`. Everything outside the graph
//! holds events, never references, so truncation cannot leave dangling
//! pointers behind.

use tracing::trace;

use crate::calc::{
    CalculationResult, Calculator, ChannelAccess, CoherenceCalculator, MemoryAccess,
    OrderedAccess, Relation, RelationKind, SendOrderCalculator,
};
use crate::config::PrefixViewPolicy;
use crate::error::{bug, Error, Result};
use crate::event::{Addr, ChannelId, Event, Stamp};
use crate::label::{Label, LabelKind};
use crate::revisit::OrderPlacement;
use crate::vv::View;

#[derive(Debug)]
pub struct ExecutionGraph {
    threads: Vec<Vec<Label>>,
    next_stamp: Stamp,
    policy: PrefixViewPolicy,
    co: CoherenceCalculator,
    so: SendOrderCalculator,
    calculators: Vec<Box<dyn Calculator>>,
}

impl ExecutionGraph {
    /// A graph holding only the initializer.
    pub fn new(policy: PrefixViewPolicy, out_of_order: bool) -> Self {
        let mut init = Label::init();
        let mut v = View::new();
        v.set(0, 1);
        init.set_hb_view(v.clone());
        init.set_porf_view(v.clone());
        init.set_pporf_view(v);
        Self {
            threads: vec![vec![init]],
            next_stamp: 1,
            policy,
            co: CoherenceCalculator::new(out_of_order),
            so: SendOrderCalculator::new(out_of_order),
            calculators: Vec::new(),
        }
    }

    pub fn policy(&self) -> PrefixViewPolicy {
        self.policy
    }

    // -----------------------------------------------------------------------
    // Event access
    // -----------------------------------------------------------------------

    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }

    pub fn thread_size(&self, thread: usize) -> u32 {
        self.threads.get(thread).map_or(0, |t| t.len() as u32)
    }

    /// Total number of events.
    pub fn graph_size(&self) -> usize {
        self.threads.iter().map(Vec::len).sum()
    }

    pub fn contains(&self, e: Event) -> bool {
        e.index < self.thread_size(e.thread)
    }

    pub fn event_label(&self, e: Event) -> Result<&Label> {
        self.threads
            .get(e.thread)
            .and_then(|t| t.get(e.index as usize))
            .ok_or(Error::InvalidEvent(e))
    }

    pub fn event_label_mut(&mut self, e: Event) -> Result<&mut Label> {
        self.threads
            .get_mut(e.thread)
            .and_then(|t| t.get_mut(e.index as usize))
            .ok_or(Error::InvalidEvent(e))
    }

    pub fn thread_labels(&self, thread: usize) -> &[Label] {
        self.threads.get(thread).map_or(&[], |t| t.as_slice())
    }

    /// Every label, thread by thread.
    pub fn labels(&self) -> impl Iterator<Item = &Label> + '_ {
        self.threads.iter().flatten()
    }

    pub fn last_thread_label(&self, thread: usize) -> Option<&Label> {
        self.threads.get(thread).and_then(|t| t.last())
    }

    pub fn previous_label(&self, e: Event) -> Result<&Label> {
        if e.index == 0 {
            return Err(bug!("{e} has no predecessor"));
        }
        self.event_label(e.prev())
    }

    pub fn is_thread_finished(&self, thread: usize) -> bool {
        self.last_thread_label(thread).is_some_and(Label::is_thread_finish)
    }

    /// One past the highest stamp handed out so far.
    pub fn next_stamp(&self) -> Stamp {
        self.next_stamp
    }

    /// The view covering every event currently in the graph.
    pub fn full_view(&self) -> View {
        let mut v = View::new();
        for (t, labels) in self.threads.iter().enumerate() {
            v.set(t, labels.len() as u32);
        }
        v
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Appends `label` to `thread` and gives it the next stamp.
    pub fn add_label(&mut self, thread: usize, mut label: Label) -> Event {
        if thread >= self.threads.len() {
            self.threads.resize_with(thread + 1, Vec::new);
        }
        let pos = Event::new(thread, self.threads[thread].len() as u32);
        label.set_pos(pos);
        label.set_stamp(self.next_stamp);
        self.next_stamp += 1;
        self.threads[thread].push(label);
        trace!(%pos, "label added");
        pos
    }

    /// Re-inserts a label saved from an earlier state of this graph. The
    /// label keeps its identity, receives a fresh stamp, and registers with
    /// the store it reads from.
    pub fn graft_label(&mut self, label: Label) -> Result<Event> {
        let pos = label.pos();
        if pos.index != self.thread_size(pos.thread) {
            return Err(bug!("grafted {pos} does not extend its thread"));
        }
        let rf = label.rf();
        if let Some(src) = rf {
            if !self.contains(src) {
                return Err(bug!("grafted {pos} reads from missing {src}"));
            }
        }
        let added = self.add_label(pos.thread, label);
        if let Some(src) = rf {
            self.register_reader(src, added)?;
        }
        Ok(added)
    }

    /// Grafts every saved label and replays the order placements of the
    /// saved stores.
    pub fn graft_prefix(
        &mut self,
        prefix: Vec<Label>,
        placements: Vec<OrderPlacement>,
    ) -> Result<Vec<Event>> {
        let mut grafted = Vec::with_capacity(prefix.len());
        for lab in prefix {
            grafted.push(self.graft_label(lab)?);
        }
        let mut placements = placements;
        placements.sort_by_key(|p| p.offset);
        for p in placements {
            let lab = self.event_label(p.event)?;
            if let Some(addr) = MemoryAccess::store_loc(lab) {
                self.co.add_at_offset(addr, p.event, p.offset)?;
            } else if let Some(ch) = ChannelAccess::store_loc(lab) {
                self.so.add_at_offset(ch, p.event, p.offset)?;
            } else {
                return Err(bug!("placement for non-store {}", p.event));
            }
        }
        Ok(grafted)
    }

    fn register_reader(&mut self, src: Event, reader: Event) -> Result<()> {
        if src.is_initializer() {
            return Ok(());
        }
        match self.event_label_mut(src)?.readers_mut() {
            Some(readers) => {
                if !readers.contains(&reader) {
                    readers.push(reader);
                }
                Ok(())
            }
            None => Err(bug!("{reader} reads from non-store {src}")),
        }
    }

    /// Rewires the reads-from edge of a read or receive. The caller is
    /// responsible for recomputing the views that depend on it.
    pub fn change_rf(&mut self, load: Event, src: Option<Event>) -> Result<()> {
        let lab = self.event_label(load)?;
        if !lab.is_read() && !lab.is_receive() {
            return Err(bug!("{load} is not a load"));
        }
        if let Some(s) = src {
            let slab = self.event_label(s)?;
            let matches = s.is_initializer()
                || (lab.is_read() && slab.is_write() && slab.addr() == lab.addr())
                || (lab.is_receive() && slab.is_send() && slab.channel() == lab.channel());
            if !matches {
                return Err(bug!("{load} cannot read from {s}"));
            }
        }

        if let Some(old) = lab.rf() {
            if let Ok(old_lab) = self.event_label_mut(old) {
                if let Some(readers) = old_lab.readers_mut() {
                    readers.retain(|&r| r != load);
                }
            }
        }
        self.event_label_mut(load)?.set_rf(src);
        if let Some(s) = src {
            self.register_reader(s, load)?;
        }
        Ok(())
    }

    /// Channel flavor of `change_rf`: `receive` takes its message from `send`.
    pub fn change_receive_rf(&mut self, ch: ChannelId, receive: Event, send: Event) -> Result<()> {
        if self.event_label(receive)?.channel() != Some(ch) {
            return Err(bug!("{receive} does not receive on channel {ch}"));
        }
        self.change_rf(receive, Some(send))
    }

    /// Marks the optional block at `e` as expanded.
    pub fn expand_optional(&mut self, e: Event) -> Result<()> {
        match self.event_label_mut(e)?.kind_mut() {
            LabelKind::Optional { expanded } => {
                *expanded = true;
                Ok(())
            }
            _ => Err(bug!("{e} is not an optional block")),
        }
    }

    /// Removes every label with a stamp greater than `stamp`, along with the
    /// order and relation entries that mention them.
    pub fn cut_to_stamp(&mut self, stamp: Stamp) {
        for labels in &mut self.threads {
            if let Some(cut) = labels.iter().position(|l| l.stamp() > stamp) {
                labels.truncate(cut);
            }
        }
        let kept = self.full_view();
        self.repair_edges(&kept);
        self.restrict_calculators(&kept);
    }

    // Drops reader entries and rf edges that point outside `kept`.
    fn repair_edges(&mut self, kept: &View) {
        for lab in self.threads.iter_mut().flatten() {
            if let Some(readers) = lab.readers_mut() {
                readers.retain(|&r| kept.contains(r));
            }
            if let Some(rf) = lab.rf() {
                if !kept.contains(rf) {
                    lab.set_rf(None);
                }
            }
        }
    }

    fn restrict_calculators(&mut self, kept: &View) {
        let mut co = std::mem::take(&mut self.co);
        co.remove_after(self, kept);
        self.co = co;

        let mut so = std::mem::take(&mut self.so);
        so.remove_after(self, kept);
        self.so = so;

        let mut calcs = std::mem::take(&mut self.calculators);
        for calc in calcs.iter_mut() {
            calc.remove_after(self, kept);
        }
        self.calculators = calcs;
    }

    /// A new graph holding exactly the events included in `v`.
    pub fn get_copy_up_to(&self, v: &View) -> ExecutionGraph {
        let threads = self
            .threads
            .iter()
            .enumerate()
            .map(|(t, labels)| {
                let n = (v.get(t) as usize).min(labels.len());
                labels[..n].to_vec()
            })
            .collect();
        let mut copy = ExecutionGraph {
            threads,
            next_stamp: self.next_stamp,
            policy: self.policy,
            co: self.co.clone(),
            so: self.so.clone(),
            calculators: self.calculators.iter().map(|c| c.clone_calc()).collect(),
        };
        let kept = copy.full_view();
        copy.repair_edges(&kept);
        copy.restrict_calculators(&kept);
        copy
    }

    // -----------------------------------------------------------------------
    // Calculators
    // -----------------------------------------------------------------------

    pub fn coherence(&self) -> &CoherenceCalculator {
        &self.co
    }

    pub fn coherence_mut(&mut self) -> &mut CoherenceCalculator {
        &mut self.co
    }

    pub fn send_order(&self) -> &SendOrderCalculator {
        &self.so
    }

    pub fn send_order_mut(&mut self) -> &mut SendOrderCalculator {
        &mut self.so
    }

    pub fn add_calculator(&mut self, calc: Box<dyn Calculator>) {
        self.calculators.push(calc);
    }

    pub fn calculator(&self, kind: RelationKind) -> Option<&dyn Calculator> {
        match kind {
            RelationKind::Coherence => Some(&self.co as &dyn Calculator),
            RelationKind::SendOrder => Some(&self.so as &dyn Calculator),
            _ => self.calculators.iter().find(|c| c.kind() == kind).map(|c| c.as_ref()),
        }
    }

    fn num_calculators(&self) -> usize {
        2 + self.calculators.len()
    }

    // Runs `f` on calculator `slot` while the calculator is detached from
    // the graph, so it can read the rest of the graph freely.
    fn with_calculator<R>(
        &mut self,
        slot: usize,
        f: impl FnOnce(&ExecutionGraph, &mut dyn Calculator) -> R,
    ) -> R {
        match slot {
            0 => {
                let mut co = std::mem::take(&mut self.co);
                let r = f(self, &mut co as &mut dyn Calculator);
                self.co = co;
                r
            }
            1 => {
                let mut so = std::mem::take(&mut self.so);
                let r = f(self, &mut so as &mut dyn Calculator);
                self.so = so;
                r
            }
            i => {
                let mut calcs = std::mem::take(&mut self.calculators);
                let r = f(self, calcs[i - 2].as_mut());
                self.calculators = calcs;
                r
            }
        }
    }

    /// Runs every calculator to a fixpoint. Stops at the first
    /// inconsistency.
    pub fn do_calcs(&mut self) -> CalculationResult {
        for slot in 0..self.num_calculators() {
            self.with_calculator(slot, |g, c| c.init_calc(g));
        }
        let mut rounds = 0;
        loop {
            rounds += 1;
            let mut round = CalculationResult::consistent();
            for slot in 0..self.num_calculators() {
                let r = self.with_calculator(slot, |g, c| c.do_calc(g));
                round.merge(r);
                if !round.consistent {
                    trace!(rounds, slot, "inconsistent");
                    return round;
                }
            }
            if !round.changed {
                trace!(rounds, "fixpoint");
                return round;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Prefix views and revisit candidates
    // -----------------------------------------------------------------------

    /// The causal view that must be kept verbatim when `e`'s prefix is saved.
    pub fn prefix_view(&self, e: Event) -> Result<&View> {
        let lab = self.event_label(e)?;
        Ok(match self.policy {
            PrefixViewPolicy::Porf => lab.porf_view(),
            PrefixViewPolicy::Dependencies => lab.pporf_view(),
        })
    }

    /// Loads on the same location as `store` that are not in its prefix
    /// view, and so could be revisited to read from it.
    pub fn revisitable(&self, store: Event) -> Result<Vec<Event>> {
        let slab = self.event_label(store)?;
        let before = self.prefix_view(store)?;
        let same_loc = |lab: &Label| match (slab.addr(), slab.channel()) {
            (Some(addr), _) if slab.is_write() => MemoryAccess::load_loc(lab) == Some(addr),
            (_, Some(ch)) if slab.is_send() => ChannelAccess::load_loc(lab) == Some(ch),
            _ => false,
        };

        let mut loads = Vec::new();
        for (t, labels) in self.threads.iter().enumerate() {
            for lab in labels.iter().skip(before.get(t) as usize) {
                if !same_loc(lab) {
                    continue;
                }
                let depends = lab.pporf_view().contains(store);
                if self.policy == PrefixViewPolicy::Dependencies && depends {
                    continue;
                }
                loads.push(lab.pos());
            }
        }
        Ok(loads)
    }

    // -----------------------------------------------------------------------
    // Ordering queries
    // -----------------------------------------------------------------------

    /// `a` is hb-before (or equal to) `b`.
    pub fn is_hb_before(&self, a: Event, b: Event) -> bool {
        self.event_label(b).is_ok_and(|lab| lab.hb_view().contains(a))
    }

    /// `a` or one of its readers is hb-before `b`.
    pub fn is_write_rf_before(&self, a: Event, b: Event) -> bool {
        if a.is_initializer() {
            return true;
        }
        let Ok(blab) = self.event_label(b) else { return false };
        let before = blab.hb_view();
        before.contains(a)
            || self
                .event_label(a)
                .is_ok_and(|alab| alab.readers().iter().any(|&r| before.contains(r)))
    }

    /// `e` is hb-before `s` or one of its readers.
    pub fn is_hb_opt_rf_before(&self, e: Event, s: Event) -> bool {
        self.is_hb_before(e, s)
            || self
                .event_label(s)
                .is_ok_and(|slab| slab.readers().iter().any(|&r| self.is_hb_before(e, r)))
    }

    /// hb view of `e`'s program-order predecessor.
    pub fn hb_po_before(&self, e: Event) -> Result<&View> {
        Ok(self.previous_label(e)?.hb_view())
    }

    /// The whole hb relation, one row per event.
    pub fn hb_relation(&self) -> Relation {
        let events: Vec<Event> = self.labels().map(Label::pos).collect();
        let mut rel = Relation::new(events);
        for lab in self.labels() {
            for a in lab.hb_view().events() {
                if a != lab.pos() {
                    rel.add_edge(a, lab.pos());
                }
            }
        }
        rel
    }

    // -----------------------------------------------------------------------
    // Location queries
    // -----------------------------------------------------------------------

    pub fn stores_to(&self, addr: Addr) -> Vec<Event> {
        self.labels()
            .filter(|l| MemoryAccess::store_loc(l) == Some(addr))
            .map(Label::pos)
            .collect()
    }

    pub fn loads_from_loc(&self, addr: Addr) -> Vec<Event> {
        self.labels()
            .filter(|l| MemoryAccess::load_loc(l) == Some(addr))
            .map(Label::pos)
            .collect()
    }

    pub fn sends_to(&self, ch: ChannelId) -> Vec<Event> {
        self.labels()
            .filter(|l| ChannelAccess::store_loc(l) == Some(ch))
            .map(Label::pos)
            .collect()
    }

    pub fn receives_on(&self, ch: ChannelId) -> Vec<Event> {
        self.labels()
            .filter(|l| ChannelAccess::load_loc(l) == Some(ch))
            .map(Label::pos)
            .collect()
    }

    pub fn is_rmw_load(&self, e: Event) -> bool {
        self.event_label(e).is_ok_and(Label::is_rmw_read)
    }

    /// SC events other than RMW loads, and the SC fences among them.
    pub fn sc_events(&self) -> (Vec<Event>, Vec<Event>) {
        let mut scs = Vec::new();
        let mut fences = Vec::new();
        for lab in self.labels() {
            if !lab.is_sc() || lab.is_rmw_read() {
                continue;
            }
            scs.push(lab.pos());
            if lab.is_fence() {
                fences.push(lab.pos());
            }
        }
        (scs, fences)
    }

    /// Latest release fence, or release write to `addr`, po-before `e`.
    /// Falls back to the first event of the thread.
    pub fn last_thread_release_at_loc(&self, e: Event, addr: Addr) -> Event {
        let labels = self.thread_labels(e.thread);
        let end = (e.index as usize).min(labels.len());
        labels[..end]
            .iter()
            .rev()
            .find(|l| {
                l.is_at_least_release()
                    && (l.is_fence() || (l.is_write() && l.addr() == Some(addr)))
            })
            .map_or(Event::new(e.thread, 0), Label::pos)
    }

    /// The innermost lock po-before `e` that has not been released yet.
    pub fn last_unmatched_lock(&self, e: Event) -> Option<Event> {
        let labels = self.thread_labels(e.thread);
        let end = (e.index as usize).min(labels.len());
        let mut released: Vec<Addr> = Vec::new();
        for lab in labels[..end].iter().rev() {
            match lab.kind() {
                LabelKind::Unlock { lock } => released.push(*lock),
                LabelKind::Lock { lock } => {
                    if let Some(i) = released.iter().position(|l| l == lock) {
                        released.swap_remove(i);
                    } else {
                        return Some(lab.pos());
                    }
                }
                _ => {}
            }
        }
        None
    }

    /// Value observed by a read or receive; the initializer and bottom
    /// supply zero.
    pub fn read_value(&self, e: Event) -> Result<u64> {
        match self.event_label(e)?.rf() {
            Some(src) if !src.is_initializer() => Ok(self.event_label(src)?.value().unwrap_or(0)),
            _ => Ok(0),
        }
    }
}
