//! Partial SC order over SC-tagged events.
//!
//! The relation is rebuilt from scratch on every pass: initializer-read
//! edges, program order and `sb(≠loc);hb;sb(≠loc)` chains between SC
//! events, and, for every address accessed more than once, the coherence,
//! read-before and `(co|rb);rf` edges routed through SC fences.

use crate::calc::{CalculationResult, Calculator, Relation, RelationKind};
use crate::event::{Addr, Event};
use crate::graph::ExecutionGraph;
use crate::label::Label;
use crate::vv::View;

#[derive(Clone, Debug, Default)]
pub struct PscCalculator {
    psc: Relation,
}

impl PscCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The relation computed by the last pass.
    pub fn relation(&self) -> &Relation {
        &self.psc
    }

    fn calc_psc_relation(&mut self, g: &ExecutionGraph, hb: &Relation, fcs: &[Event]) {
        if self.psc.is_empty() {
            return;
        }
        let ctx = SccContext { g, hb, fcs };
        ctx.add_init_edges(&mut self.psc);
        ctx.add_sb_hb_edges(&mut self.psc);
        for addr in double_locs(g) {
            if let Some(co) = g.coherence().relation(addr) {
                ctx.add_sc_ecos_loc(co, &mut self.psc);
            }
        }
        self.psc.trans_closure();
    }
}

/// Addresses accessed by at least two events, ignoring each thread's first
/// event.
pub fn double_locs(g: &ExecutionGraph) -> Vec<Addr> {
    let mut singles: Vec<Addr> = Vec::new();
    let mut doubles: Vec<Addr> = Vec::new();
    for t in 0..g.num_threads() {
        for lab in g.thread_labels(t).iter().skip(1) {
            let Some(addr) = lab.addr() else { continue };
            if doubles.contains(&addr) {
                continue;
            }
            if let Some(i) = singles.iter().position(|&a| a == addr) {
                singles.remove(i);
                doubles.push(addr);
            } else {
                singles.push(addr);
            }
        }
    }
    doubles
}

struct SccContext<'a> {
    g: &'a ExecutionGraph,
    hb: &'a Relation,
    fcs: &'a [Event],
}

impl SccContext<'_> {
    fn label(&self, e: Event) -> Option<&Label> {
        self.g.event_label(e).ok()
    }

    fn sc_fences_succs(&self, e: Event) -> Vec<Event> {
        if self.g.is_rmw_load(e) {
            return Vec::new();
        }
        self.fcs.iter().copied().filter(|&f| self.hb.has_edge(e, f)).collect()
    }

    fn sc_fences_preds(&self, e: Event) -> Vec<Event> {
        if self.g.is_rmw_load(e) {
            return Vec::new();
        }
        self.fcs.iter().copied().filter(|&f| self.hb.has_edge(f, e)).collect()
    }

    fn sc_succs(&self, e: Event) -> Vec<Event> {
        match self.label(e) {
            Some(lab) if lab.is_rmw_read() => Vec::new(),
            Some(lab) if lab.is_sc() => vec![e],
            _ => self.sc_fences_succs(e),
        }
    }

    fn sc_preds(&self, e: Event) -> Vec<Event> {
        match self.label(e) {
            Some(lab) if lab.is_rmw_read() => Vec::new(),
            Some(lab) if lab.is_sc() => vec![e],
            _ => self.sc_fences_preds(e),
        }
    }

    fn readers(&self, store: Event) -> &[Event] {
        self.label(store).map_or(&[], Label::readers)
    }

    fn rf_sc_succs(&self, store: Event) -> Vec<Event> {
        self.readers(store).iter().flat_map(|&r| self.sc_succs(r)).collect()
    }

    fn rf_sc_fences_succs(&self, store: Event) -> Vec<Event> {
        self.readers(store).iter().flat_map(|&r| self.sc_fences_succs(r)).collect()
    }

    /// Reads of the initial value are ordered before every store to their
    /// address.
    fn add_init_edges(&self, psc: &mut Relation) {
        for lab in self.g.labels() {
            if !lab.is_read() || lab.is_rmw_read() || lab.rf() != Some(Event::INIT) {
                continue;
            }
            let Some(addr) = lab.addr() else { continue };
            let preds = self.sc_preds(lab.pos());
            let fence_preds = self.sc_fences_preds(lab.pos());
            for w in self.g.stores_to(addr) {
                psc.add_edges_from_to(&preds, &self.sc_succs(w));
                for &r in self.readers(w) {
                    psc.add_edges_from_to(&fence_preds, &self.sc_fences_succs(r));
                }
            }
        }
    }

    /// Program order between SC events, and `[SC];sb(≠loc);hb;sb(≠loc);[SC]`
    /// between memory accesses of different threads.
    fn add_sb_hb_edges(&self, psc: &mut Relation) {
        let scs = psc.elems().to_vec();
        for (i, &ei) in scs.iter().enumerate() {
            for (j, &ej) in scs.iter().enumerate() {
                if i == j {
                    continue;
                }
                if ei.thread == ej.thread {
                    if ei.index < ej.index {
                        psc.add_edge_idx(i, j);
                    }
                    continue;
                }
                if self.sb_hb_sb(ei, ej) {
                    psc.add_edge_idx(i, j);
                }
            }
        }
    }

    fn sb_hb_sb(&self, ei: Event, ej: Event) -> bool {
        let (Some(ei_lab), Some(ej_lab)) = (self.label(ei), self.label(ej)) else {
            return false;
        };
        let Some(ej_prev) = (ej.index > 0).then(|| ej.prev()).and_then(|p| self.label(p)) else {
            return false;
        };
        let (Some(ei_addr), Some(ej_addr), Some(prev_addr)) =
            (ei_lab.addr(), ej_lab.addr(), ej_prev.addr())
        else {
            return false;
        };
        if prev_addr == ej_addr {
            return false;
        }
        let Some(ei_next) = self.label(ei.next()) else {
            return false;
        };
        match ei_next.addr() {
            Some(next_addr) => next_addr != ei_addr && self.hb.has_edge(ei.next(), ej_prev.pos()),
            None => false,
        }
    }

    fn add_sc_ecos_loc(&self, co: &Relation, psc: &mut Relation) {
        let stores = co.elems();
        for (i, &s) in stores.iter().enumerate() {
            let mut co_after = Vec::new();
            let mut co_rf_after = Vec::new();
            for (j, &t) in stores.iter().enumerate() {
                if co.has_edge_idx(i, j) {
                    co_after.extend(self.sc_succs(t));
                    co_rf_after.extend(self.rf_sc_fences_succs(t));
                }
            }
            self.add_rb_edges(&co_after, &co_rf_after, psc, s);
            self.add_mo_rf_edges(&co_after, &co_rf_after, psc, s);
        }
    }

    fn add_rb_edges(
        &self,
        co_after: &[Event],
        co_rf_after: &[Event],
        psc: &mut Relation,
        store: Event,
    ) {
        for &r in self.readers(store) {
            psc.add_edges_from_to(&self.sc_preds(r), co_after);
            psc.add_edges_from_to(&self.sc_fences_preds(r), co_rf_after);
        }
    }

    fn add_mo_rf_edges(
        &self,
        co_after: &[Event],
        co_rf_after: &[Event],
        psc: &mut Relation,
        store: Event,
    ) {
        let preds = self.sc_preds(store);
        let fence_preds = self.sc_fences_preds(store);
        let rfs = self.rf_sc_succs(store);
        psc.add_edges_from_to(&preds, co_after);
        psc.add_edges_from_to(&preds, &rfs);
        psc.add_edges_from_to(&fence_preds, co_rf_after);
    }
}

impl Calculator for PscCalculator {
    fn kind(&self) -> RelationKind {
        RelationKind::Psc
    }

    fn init_calc(&mut self, g: &ExecutionGraph) {
        let (scs, _) = g.sc_events();
        self.psc = Relation::new(scs);
    }

    fn do_calc(&mut self, g: &ExecutionGraph) -> CalculationResult {
        let mut hb = g.hb_relation();
        hb.trans_closure();
        if !hb.is_irreflexive() {
            return CalculationResult::inconsistent();
        }

        let (scs, fcs) = g.sc_events();
        self.psc = Relation::new(scs);
        self.calc_psc_relation(g, &hb, &fcs);
        if !self.psc.is_irreflexive() {
            tracing::trace!(sc_events = self.psc.len(), "psc cycle");
            return CalculationResult::inconsistent();
        }
        CalculationResult::consistent()
    }

    fn remove_after(&mut self, _g: &ExecutionGraph, _preds: &View) {
        // Rebuilt on every pass.
        self.psc = Relation::default();
    }

    fn clone_calc(&self) -> Box<dyn Calculator> {
        Box::new(self.clone())
    }
}
