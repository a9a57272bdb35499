//! A scripted interpreter: each thread is a fixed list of instructions.
//!
//! The program keeps no cursor of its own. A thread's position is found by
//! walking the labels the graph already holds for it, so backtracking the
//! graph backtracks the program too.

use crate::error::{bug, Result};
use crate::event::{Addr, ChannelId, Event};
use crate::graph::ExecutionGraph;
use crate::interp::{Interpreter, NextEvent};
use crate::label::{FenceKind, Label, LabelKind, LkmmKind, MemOrdering, RmwKind};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Instr {
    Read { addr: Addr, ordering: MemOrdering },
    Write { addr: Addr, value: u64, ordering: MemOrdering },
    /// Atomic fetch-and-add: a read followed by a write of `read + delta`.
    FetchAdd { addr: Addr, delta: u64, ordering: MemOrdering },
    Fence(MemOrdering),
    /// Start the thread with the given id.
    Spawn(usize),
    /// Wait for the thread with the given id to finish.
    Join(usize),
    Open(ChannelId),
    Send { channel: ChannelId, value: u64 },
    Receive(ChannelId),
    Lock(Addr),
    Unlock(Addr),
    Malloc { addr: Addr, size: u64 },
    Free(Addr),
    /// A block that runs only if the checker decides to expand it.
    Optional(Vec<Instr>),
    DiskOpen,
    DiskRead { addr: Addr },
    DiskWrite { addr: Addr, value: u64 },
    DiskFsync,
    Lkmm(LkmmKind),
}

impl Instr {
    pub fn read(addr: Addr, ordering: MemOrdering) -> Self {
        Instr::Read { addr, ordering }
    }

    pub fn write(addr: Addr, value: u64, ordering: MemOrdering) -> Self {
        Instr::Write { addr, value, ordering }
    }

    pub fn fetch_add(addr: Addr, delta: u64, ordering: MemOrdering) -> Self {
        Instr::FetchAdd { addr, delta, ordering }
    }

    // Number of labels the instruction produces when not nested.
    fn width(&self) -> u32 {
        match self {
            Instr::FetchAdd { .. } => 2,
            _ => 1,
        }
    }

    fn to_label(&self) -> Label {
        match self {
            Instr::Read { addr, ordering } => Label::read(*addr, *ordering),
            Instr::Write { addr, value, ordering } => Label::write(*addr, *value, *ordering),
            Instr::FetchAdd { addr, ordering, .. } => {
                Label::rmw_read(*addr, RmwKind::Fai, *ordering)
            }
            Instr::Fence(ordering) => Label::fence(*ordering),
            Instr::Spawn(child) => Label::thread_create(*child),
            Instr::Join(child) => Label::thread_join(*child),
            Instr::Open(channel) => Label::channel_open(*channel),
            Instr::Send { channel, value } => Label::send(*channel, *value),
            Instr::Receive(channel) => Label::receive(*channel),
            Instr::Lock(lock) => Label::lock(*lock),
            Instr::Unlock(lock) => Label::unlock(*lock),
            Instr::Malloc { addr, size } => Label::malloc(*addr, *size),
            Instr::Free(addr) => Label::free(*addr),
            Instr::Optional(_) => Label::optional(),
            Instr::DiskOpen => Label::dsk_open(),
            Instr::DiskRead { addr } => Label::disk_read(*addr, MemOrdering::Relaxed),
            Instr::DiskWrite { addr, value } => {
                Label::disk_write(*addr, *value, MemOrdering::Relaxed)
            }
            Instr::DiskFsync => Label::disk_fence(FenceKind::DskFsync),
            Instr::Lkmm(kind) => Label::lkmm(*kind),
        }
    }
}

/// Per-thread instruction lists; thread 0 is the main thread.
#[derive(Clone, Debug, Default)]
pub struct Program {
    threads: Vec<Vec<Instr>>,
}

impl Program {
    pub fn new(threads: Vec<Vec<Instr>>) -> Self {
        Self { threads }
    }

    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }

    fn next_for(&self, thread: usize, g: &ExecutionGraph) -> Result<NextEvent> {
        let Some(code) = self.threads.get(thread) else {
            return Err(bug!("no code for thread {thread}"));
        };
        let labels = g.thread_labels(thread);
        let done = labels.len() as u32;
        // Index 0 holds the thread start (or the initializer).
        let mut index = 1;
        let mut frames: Vec<std::slice::Iter<'_, Instr>> = vec![code.iter()];

        while let Some(frame) = frames.last_mut() {
            let Some(instr) = frame.next() else {
                frames.pop();
                continue;
            };
            if index == done {
                return Ok(NextEvent::Label(instr.to_label()));
            }
            let lab = &labels[index as usize];
            match (instr, lab.kind()) {
                (Instr::Optional(body), LabelKind::Optional { expanded }) => {
                    index += 1;
                    if *expanded {
                        frames.push(body.iter());
                    }
                }
                (Instr::FetchAdd { addr, delta, ordering }, _) if index + 1 == done => {
                    let read = Event::new(thread, index);
                    let value = g.read_value(read)?.wrapping_add(*delta);
                    let write = Label::rmw_write(*addr, value, RmwKind::Fai, *ordering);
                    return Ok(NextEvent::Label(write));
                }
                _ => index += instr.width(),
            }
        }

        if index >= done {
            Ok(NextEvent::ThreadFinished)
        } else {
            Err(bug!("thread {thread} has more labels than instructions"))
        }
    }
}

impl Interpreter for Program {
    fn next_event(&mut self, thread: usize, g: &ExecutionGraph) -> Result<NextEvent> {
        self.next_for(thread, g)
    }
}
