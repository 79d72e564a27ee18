//! Deterministic stand-ins for the clock, the shared line and the flag.

use crate::region::StartFlag;
use crate::rendezvous::Clock;
use cache_side_channel::CacheLine;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

/// Counter that advances by `step` on every read.
#[derive(Debug)]
pub struct FakeClock {
    next: Cell<u64>,
    step: u64,
    reads: Cell<usize>,
    // (read index, cycles lost before that read)
    stalls: RefCell<Vec<(usize, u64)>>,
}

impl FakeClock {
    pub fn new(start: u64, step: u64) -> Self {
        FakeClock {
            next: Cell::new(start),
            step,
            reads: Cell::new(0),
            stalls: RefCell::new(Vec::new()),
        }
    }

    /// Pretend the process was descheduled for `cycles` right before read
    /// number `at_read`.
    pub fn stall_at(&self, at_read: usize, cycles: u64) {
        self.stalls.borrow_mut().push((at_read, cycles));
    }

    pub fn reads(&self) -> usize {
        self.reads.get()
    }

    pub fn peek(&self) -> u64 {
        self.next.get()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> u64 {
        let read = self.reads.get();
        let stall: u64 = self
            .stalls
            .borrow()
            .iter()
            .filter(|(at, _)| *at == read)
            .map(|(_, cycles)| *cycles)
            .sum();
        let now = self.next.get() + stall;
        self.next.set(now + self.step);
        self.reads.set(read + 1);
        now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEvent {
    Touch,
    Evict,
    Measure(u64),
}

/// Replays injected latencies, one per measurement, and logs every call.
#[derive(Debug)]
pub struct ScriptedLine {
    latencies: RefCell<VecDeque<u64>>,
    exhausted: u64,
    events: RefCell<Vec<LineEvent>>,
}

impl ScriptedLine {
    pub fn new(latencies: impl IntoIterator<Item = u64>, exhausted: u64) -> Self {
        ScriptedLine {
            latencies: RefCell::new(latencies.into_iter().collect()),
            exhausted,
            events: RefCell::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<LineEvent> {
        self.events.borrow().clone()
    }
}

impl CacheLine for ScriptedLine {
    fn touch(&self) {
        self.events.borrow_mut().push(LineEvent::Touch);
    }

    fn evict(&self) {
        self.events.borrow_mut().push(LineEvent::Evict);
    }

    fn measure_latency(&self) -> u64 {
        let t = self
            .latencies
            .borrow_mut()
            .pop_front()
            .unwrap_or(self.exhausted);
        self.events.borrow_mut().push(LineEvent::Measure(t));
        t
    }
}

/// Records the clock reading of each touch, to map touches back to slots.
#[derive(Debug)]
pub struct TouchLog<'a> {
    clock: &'a FakeClock,
    touches: RefCell<Vec<u64>>,
}

impl<'a> TouchLog<'a> {
    pub fn new(clock: &'a FakeClock) -> Self {
        TouchLog {
            clock,
            touches: RefCell::new(Vec::new()),
        }
    }

    pub fn touches(&self) -> Vec<u64> {
        self.touches.borrow().clone()
    }
}

impl CacheLine for TouchLog<'_> {
    fn touch(&self) {
        self.touches.borrow_mut().push(self.clock.peek());
    }

    fn evict(&self) {}

    fn measure_latency(&self) -> u64 {
        panic!("the sender never measures")
    }
}

/// Two-state cache model: loads cache the line, eviction drops it.
#[derive(Debug)]
pub struct SimulatedLine {
    cached: Cell<bool>,
    hit: u64,
    miss: u64,
}

impl SimulatedLine {
    pub fn new(hit: u64, miss: u64) -> Self {
        SimulatedLine {
            cached: Cell::new(false),
            hit,
            miss,
        }
    }

    pub fn is_cached(&self) -> bool {
        self.cached.get()
    }
}

impl CacheLine for SimulatedLine {
    fn touch(&self) {
        self.cached.set(true);
    }

    fn evict(&self) {
        self.cached.set(false);
    }

    fn measure_latency(&self) -> u64 {
        let t = if self.cached.get() { self.hit } else { self.miss };
        self.cached.set(true);
        t
    }
}

/// Flag whose polls are scripted: down for `down_polls` reads, then up for
/// `up_polls` reads, then down for good.
#[derive(Debug)]
pub struct ScriptedFlag {
    down_polls: usize,
    up_polls: usize,
    polls: Cell<usize>,
}

impl ScriptedFlag {
    pub fn new(down_polls: usize, up_polls: usize) -> Self {
        ScriptedFlag {
            down_polls,
            up_polls,
            polls: Cell::new(0),
        }
    }

    pub fn never_raised() -> Self {
        ScriptedFlag::new(usize::MAX, 0)
    }

    pub fn polls(&self) -> usize {
        self.polls.get()
    }
}

impl StartFlag for ScriptedFlag {
    fn is_set(&self) -> bool {
        let n = self.polls.get();
        self.polls.set(n + 1);
        n >= self.down_polls && n - self.down_polls < self.up_polls
    }

    fn raise(&self) {
        panic!("receiver tests never raise the flag")
    }

    fn lower(&self) {
        panic!("receiver tests never lower the flag")
    }
}

/// Plain flag that remembers its transitions along with the clock.
#[derive(Debug)]
pub struct MemoryFlag<'a> {
    clock: &'a FakeClock,
    value: Cell<bool>,
    // (clock reading, new value)
    history: RefCell<Vec<(u64, bool)>>,
}

impl<'a> MemoryFlag<'a> {
    pub fn new(clock: &'a FakeClock) -> Self {
        MemoryFlag {
            clock,
            value: Cell::new(false),
            history: RefCell::new(Vec::new()),
        }
    }

    pub fn history(&self) -> Vec<(u64, bool)> {
        self.history.borrow().clone()
    }
}

impl StartFlag for MemoryFlag<'_> {
    fn is_set(&self) -> bool {
        self.value.get()
    }

    fn raise(&self) {
        self.value.set(true);
        self.history.borrow_mut().push((self.clock.peek(), true));
    }

    fn lower(&self) {
        self.value.set(false);
        self.history.borrow_mut().push((self.clock.peek(), false));
    }
}
