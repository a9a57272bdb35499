//! Event labels: the typed payload attached to each graph event.
//!
//! A label is a shared header (position, stamp, ordering tag and views)
//! plus a `LabelKind` payload. Components outside the graph refer to labels
//! by `Event` only; the graph owns every label.

use std::fmt;

use crate::event::{Addr, ChannelId, Event, Stamp};
use crate::vv::View;

/// Ordering tag of an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemOrdering {
    NotAtomic,
    Relaxed,
    Acquire,
    Release,
    AcqRel,
    SeqCst,
}

impl MemOrdering {
    pub fn is_not_atomic(self) -> bool {
        self == MemOrdering::NotAtomic
    }

    pub fn is_at_least_acquire(self) -> bool {
        matches!(self, MemOrdering::Acquire | MemOrdering::AcqRel | MemOrdering::SeqCst)
    }

    pub fn is_at_least_release(self) -> bool {
        matches!(self, MemOrdering::Release | MemOrdering::AcqRel | MemOrdering::SeqCst)
    }

    pub fn is_at_most_acquire(self) -> bool {
        !self.is_at_least_release()
    }

    pub fn is_at_most_release(self) -> bool {
        !self.is_at_least_acquire()
    }

    pub fn is_sc(self) -> bool {
        self == MemOrdering::SeqCst
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RmwKind {
    /// Fetch-and-modify.
    Fai,
    /// Compare-and-swap that succeeded.
    Cas,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceKind {
    Plain,
    DskFsync,
    DskSync,
    DskPbarrier,
}

/// Linux-kernel memory model primitives. The core has no LKMM mode, so
/// these only ever surface as an unsupported configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LkmmKind {
    SmpFence,
    RcuLock,
    RcuUnlock,
    RcuSync,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadLabel {
    pub addr: Addr,
    /// The write this read observes; `None` is bottom.
    pub rf: Option<Event>,
    pub rmw: Option<RmwKind>,
    pub disk: bool,
    pub added_max: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteLabel {
    pub addr: Addr,
    pub value: u64,
    /// View published to synchronizing readers.
    pub msg_view: View,
    pub readers: Vec<Event>,
    pub rmw: Option<RmwKind>,
    pub disk: bool,
    pub added_max: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendLabel {
    pub channel: ChannelId,
    pub value: u64,
    pub msg_view: View,
    pub readers: Vec<Event>,
    pub added_max: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceiveLabel {
    pub channel: ChannelId,
    pub rf: Option<Event>,
    pub added_max: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LabelKind {
    /// The initializer; index 0 of the main thread.
    Init,
    Read(ReadLabel),
    Write(WriteLabel),
    Fence(FenceKind),
    ThreadCreate { child: usize },
    ThreadStart { parent_create: Event },
    ThreadJoin { child: usize },
    ThreadFinish,
    ChannelOpen { channel: ChannelId },
    Send(SendLabel),
    Receive(ReceiveLabel),
    Malloc { addr: Addr, size: u64 },
    Free { addr: Addr },
    Lock { lock: Addr },
    Unlock { lock: Addr },
    /// Marks an optional block; the block body runs only once expanded.
    Optional { expanded: bool },
    DskOpen,
    Lkmm(LkmmKind),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Label {
    pos: Event,
    stamp: Stamp,
    ordering: MemOrdering,
    hb_view: View,
    porf_view: View,
    pporf_view: View,
    pb_view: View,
    deps: Vec<Event>,
    kind: LabelKind,
}

impl Label {
    pub fn new(ordering: MemOrdering, kind: LabelKind) -> Self {
        Self {
            pos: Event::INIT,
            stamp: 0,
            ordering,
            hb_view: View::new(),
            porf_view: View::new(),
            pporf_view: View::new(),
            pb_view: View::new(),
            deps: Vec::new(),
            kind,
        }
    }

    pub fn init() -> Self {
        Self::new(MemOrdering::Release, LabelKind::Init)
    }

    pub fn read(addr: Addr, ordering: MemOrdering) -> Self {
        Self::new(
            ordering,
            LabelKind::Read(ReadLabel { addr, rf: None, rmw: None, disk: false, added_max: true }),
        )
    }

    pub fn write(addr: Addr, value: u64, ordering: MemOrdering) -> Self {
        Self::new(
            ordering,
            LabelKind::Write(WriteLabel {
                addr,
                value,
                msg_view: View::new(),
                readers: Vec::new(),
                rmw: None,
                disk: false,
                added_max: true,
            }),
        )
    }

    /// The read half of a read-modify-write.
    pub fn rmw_read(addr: Addr, kind: RmwKind, ordering: MemOrdering) -> Self {
        let mut lab = Self::read(addr, ordering);
        if let LabelKind::Read(r) = &mut lab.kind {
            r.rmw = Some(kind);
        }
        lab
    }

    /// The write half of a read-modify-write.
    pub fn rmw_write(addr: Addr, value: u64, kind: RmwKind, ordering: MemOrdering) -> Self {
        let mut lab = Self::write(addr, value, ordering);
        if let LabelKind::Write(w) = &mut lab.kind {
            w.rmw = Some(kind);
        }
        lab
    }

    pub fn disk_read(addr: Addr, ordering: MemOrdering) -> Self {
        let mut lab = Self::read(addr, ordering);
        if let LabelKind::Read(r) = &mut lab.kind {
            r.disk = true;
        }
        lab
    }

    pub fn disk_write(addr: Addr, value: u64, ordering: MemOrdering) -> Self {
        let mut lab = Self::write(addr, value, ordering);
        if let LabelKind::Write(w) = &mut lab.kind {
            w.disk = true;
        }
        lab
    }

    pub fn fence(ordering: MemOrdering) -> Self {
        Self::new(ordering, LabelKind::Fence(FenceKind::Plain))
    }

    pub fn disk_fence(kind: FenceKind) -> Self {
        Self::new(MemOrdering::Release, LabelKind::Fence(kind))
    }

    pub fn send(channel: ChannelId, value: u64) -> Self {
        Self::new(
            MemOrdering::Release,
            LabelKind::Send(SendLabel {
                channel,
                value,
                msg_view: View::new(),
                readers: Vec::new(),
                added_max: true,
            }),
        )
    }

    pub fn receive(channel: ChannelId) -> Self {
        Self::new(
            MemOrdering::Acquire,
            LabelKind::Receive(ReceiveLabel { channel, rf: None, added_max: true }),
        )
    }

    pub fn thread_create(child: usize) -> Self {
        Self::new(MemOrdering::Release, LabelKind::ThreadCreate { child })
    }

    pub fn thread_start(parent_create: Event) -> Self {
        Self::new(MemOrdering::Acquire, LabelKind::ThreadStart { parent_create })
    }

    pub fn thread_join(child: usize) -> Self {
        Self::new(MemOrdering::Acquire, LabelKind::ThreadJoin { child })
    }

    pub fn thread_finish() -> Self {
        Self::new(MemOrdering::Release, LabelKind::ThreadFinish)
    }

    pub fn channel_open(channel: ChannelId) -> Self {
        Self::new(MemOrdering::NotAtomic, LabelKind::ChannelOpen { channel })
    }

    pub fn lock(lock: Addr) -> Self {
        Self::new(MemOrdering::Acquire, LabelKind::Lock { lock })
    }

    pub fn unlock(lock: Addr) -> Self {
        Self::new(MemOrdering::Release, LabelKind::Unlock { lock })
    }

    pub fn malloc(addr: Addr, size: u64) -> Self {
        Self::new(MemOrdering::NotAtomic, LabelKind::Malloc { addr, size })
    }

    pub fn free(addr: Addr) -> Self {
        Self::new(MemOrdering::NotAtomic, LabelKind::Free { addr })
    }

    pub fn optional() -> Self {
        Self::new(MemOrdering::NotAtomic, LabelKind::Optional { expanded: false })
    }

    pub fn dsk_open() -> Self {
        Self::new(MemOrdering::NotAtomic, LabelKind::DskOpen)
    }

    pub fn lkmm(kind: LkmmKind) -> Self {
        Self::new(MemOrdering::SeqCst, LabelKind::Lkmm(kind))
    }

    pub fn with_deps(mut self, deps: Vec<Event>) -> Self {
        self.deps = deps;
        self
    }

    pub fn pos(&self) -> Event {
        self.pos
    }

    pub fn thread(&self) -> usize {
        self.pos.thread
    }

    pub fn index(&self) -> u32 {
        self.pos.index
    }

    pub(crate) fn set_pos(&mut self, pos: Event) {
        self.pos = pos;
    }

    pub fn stamp(&self) -> Stamp {
        self.stamp
    }

    pub(crate) fn set_stamp(&mut self, stamp: Stamp) {
        self.stamp = stamp;
    }

    pub fn ordering(&self) -> MemOrdering {
        self.ordering
    }

    pub fn kind(&self) -> &LabelKind {
        &self.kind
    }

    pub(crate) fn kind_mut(&mut self) -> &mut LabelKind {
        &mut self.kind
    }

    pub fn hb_view(&self) -> &View {
        &self.hb_view
    }

    pub fn porf_view(&self) -> &View {
        &self.porf_view
    }

    /// Program order restricted to declared dependencies, union reads-from.
    pub fn pporf_view(&self) -> &View {
        &self.pporf_view
    }

    /// Persistency-barrier view, maintained by the persistency collaborator.
    pub fn pb_view(&self) -> &View {
        &self.pb_view
    }

    pub fn set_hb_view(&mut self, v: View) {
        self.hb_view = v;
    }

    pub fn set_porf_view(&mut self, v: View) {
        self.porf_view = v;
    }

    pub fn set_pporf_view(&mut self, v: View) {
        self.pporf_view = v;
    }

    pub fn set_pb_view(&mut self, v: View) {
        self.pb_view = v;
    }

    pub fn deps(&self) -> &[Event] {
        &self.deps
    }

    pub fn is_sc(&self) -> bool {
        self.ordering.is_sc()
    }

    pub fn is_not_atomic(&self) -> bool {
        self.ordering.is_not_atomic()
    }

    pub fn is_at_least_acquire(&self) -> bool {
        self.ordering.is_at_least_acquire()
    }

    pub fn is_at_least_release(&self) -> bool {
        self.ordering.is_at_least_release()
    }

    pub fn is_at_most_release(&self) -> bool {
        self.ordering.is_at_most_release()
    }

    pub fn is_at_most_acquire(&self) -> bool {
        self.ordering.is_at_most_acquire()
    }

    pub fn is_read(&self) -> bool {
        matches!(self.kind, LabelKind::Read(_))
    }

    pub fn is_write(&self) -> bool {
        matches!(self.kind, LabelKind::Write(_))
    }

    pub fn is_mem_access(&self) -> bool {
        self.is_read() || self.is_write()
    }

    pub fn is_send(&self) -> bool {
        matches!(self.kind, LabelKind::Send(_))
    }

    pub fn is_receive(&self) -> bool {
        matches!(self.kind, LabelKind::Receive(_))
    }

    pub fn is_fence(&self) -> bool {
        matches!(self.kind, LabelKind::Fence(_))
    }

    pub fn is_thread_finish(&self) -> bool {
        matches!(self.kind, LabelKind::ThreadFinish)
    }

    pub fn is_rmw_read(&self) -> bool {
        matches!(&self.kind, LabelKind::Read(r) if r.rmw.is_some())
    }

    pub fn is_rmw_write(&self) -> bool {
        matches!(&self.kind, LabelKind::Write(w) if w.rmw.is_some())
    }

    /// Disk accesses and disk fences.
    pub fn is_disk(&self) -> bool {
        match &self.kind {
            LabelKind::Read(r) => r.disk,
            LabelKind::Write(w) => w.disk,
            LabelKind::Fence(k) => *k != FenceKind::Plain,
            LabelKind::DskOpen => true,
            _ => false,
        }
    }

    /// Address of a memory access.
    pub fn addr(&self) -> Option<Addr> {
        match &self.kind {
            LabelKind::Read(r) => Some(r.addr),
            LabelKind::Write(w) => Some(w.addr),
            _ => None,
        }
    }

    pub fn channel(&self) -> Option<ChannelId> {
        match &self.kind {
            LabelKind::Send(s) => Some(s.channel),
            LabelKind::Receive(r) => Some(r.channel),
            LabelKind::ChannelOpen { channel } => Some(*channel),
            _ => None,
        }
    }

    /// Reads-from source of a read or receive.
    pub fn rf(&self) -> Option<Event> {
        match &self.kind {
            LabelKind::Read(r) => r.rf,
            LabelKind::Receive(r) => r.rf,
            _ => None,
        }
    }

    pub(crate) fn set_rf(&mut self, rf: Option<Event>) {
        match &mut self.kind {
            LabelKind::Read(r) => r.rf = rf,
            LabelKind::Receive(r) => r.rf = rf,
            _ => {}
        }
    }

    /// Readers of a write or receivers of a send. The initializer keeps no
    /// reader list.
    pub fn readers(&self) -> &[Event] {
        match &self.kind {
            LabelKind::Write(w) => &w.readers,
            LabelKind::Send(s) => &s.readers,
            _ => &[],
        }
    }

    pub(crate) fn readers_mut(&mut self) -> Option<&mut Vec<Event>> {
        match &mut self.kind {
            LabelKind::Write(w) => Some(&mut w.readers),
            LabelKind::Send(s) => Some(&mut s.readers),
            _ => None,
        }
    }

    pub fn msg_view(&self) -> Option<&View> {
        match &self.kind {
            LabelKind::Write(w) => Some(&w.msg_view),
            LabelKind::Send(s) => Some(&s.msg_view),
            _ => None,
        }
    }

    pub fn set_msg_view(&mut self, v: View) {
        match &mut self.kind {
            LabelKind::Write(w) => w.msg_view = v,
            LabelKind::Send(s) => s.msg_view = v,
            _ => {}
        }
    }

    /// Value stored by a write or carried by a send.
    pub fn value(&self) -> Option<u64> {
        match &self.kind {
            LabelKind::Write(w) => Some(w.value),
            LabelKind::Send(s) => Some(s.value),
            _ => None,
        }
    }

    /// Whether this label was added with its order-maximal choice. Labels
    /// without a choice count as maximal; an optional block counts as
    /// maximal until expanded.
    pub fn added_max(&self) -> bool {
        match &self.kind {
            LabelKind::Read(r) => r.added_max,
            LabelKind::Write(w) => w.added_max,
            LabelKind::Send(s) => s.added_max,
            LabelKind::Receive(r) => r.added_max,
            LabelKind::Optional { expanded } => !expanded,
            _ => true,
        }
    }

    pub(crate) fn set_added_max(&mut self, max: bool) {
        match &mut self.kind {
            LabelKind::Read(r) => r.added_max = max,
            LabelKind::Write(w) => w.added_max = max,
            LabelKind::Send(s) => s.added_max = max,
            LabelKind::Receive(r) => r.added_max = max,
            _ => {}
        }
    }

    /// A copy suitable for saving inside a revisit: same identity, views and
    /// rf, but no reader list (readers re-register when regrafted).
    pub fn detached_copy(&self) -> Label {
        let mut lab = self.clone();
        if let Some(readers) = lab.readers_mut() {
            readers.clear();
        }
        lab
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            LabelKind::Init => "Init",
            LabelKind::Read(r) if r.rmw.is_some() => "RmwRead",
            LabelKind::Read(_) => "Read",
            LabelKind::Write(w) if w.rmw.is_some() => "RmwWrite",
            LabelKind::Write(_) => "Write",
            LabelKind::Fence(_) => "Fence",
            LabelKind::ThreadCreate { .. } => "ThreadCreate",
            LabelKind::ThreadStart { .. } => "ThreadStart",
            LabelKind::ThreadJoin { .. } => "ThreadJoin",
            LabelKind::ThreadFinish => "ThreadFinish",
            LabelKind::ChannelOpen { .. } => "ChannelOpen",
            LabelKind::Send(_) => "Send",
            LabelKind::Receive(_) => "Receive",
            LabelKind::Malloc { .. } => "Malloc",
            LabelKind::Free { .. } => "Free",
            LabelKind::Lock { .. } => "Lock",
            LabelKind::Unlock { .. } => "Unlock",
            LabelKind::Optional { .. } => "Optional",
            LabelKind::DskOpen => "DskOpen",
            LabelKind::Lkmm(_) => "Lkmm",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {:?}", self.pos, self.kind_name(), self.ordering)?;
        if let Some(addr) = self.addr() {
            write!(f, " @{addr:#x}")?;
        }
        if let Some(ch) = self.channel() {
            write!(f, " ch{ch}")?;
        }
        if let Some(rf) = self.rf() {
            write!(f, " rf={rf}")?;
        }
        Ok(())
    }
}
