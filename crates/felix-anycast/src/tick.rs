// Request ticks: correlation ids with a single atomic terminal transition.
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic id correlating a request with its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tick(pub u64);

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tick-{}", self.0)
    }
}

#[derive(Debug, Default)]
pub struct TickGenerator {
    next: AtomicU64,
}

impl TickGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> Tick {
        Tick(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Pending,
    Satisfied,
    Expired,
}

const PENDING: u8 = 0;
const SATISFIED: u8 = 1;
const EXPIRED: u8 = 2;

/// One outstanding get request. It leaves `Pending` exactly once, either
/// satisfied or expired; whoever wins the transition owns the outcome.
///
/// ```
/// use felix_anycast::{RequestTick, Tick, TickOutcome};
///
/// let request = RequestTick::new(Tick(1), None);
/// assert!(request.try_satisfy());
/// assert!(!request.try_expire());
/// assert_eq!(request.outcome(), TickOutcome::Satisfied);
/// ```
#[derive(Debug)]
pub struct RequestTick {
    tick: Tick,
    // None waits until satisfied or cancelled.
    timeout: Option<Duration>,
    issued: Instant,
    state: AtomicU8,
}

impl RequestTick {
    pub fn new(tick: Tick, timeout: Option<Duration>) -> Self {
        Self {
            tick,
            timeout,
            issued: Instant::now(),
            state: AtomicU8::new(PENDING),
        }
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_infinite(&self) -> bool {
        self.timeout.is_none()
    }

    pub fn issued_at(&self) -> Instant {
        self.issued
    }

    pub fn outcome(&self) -> TickOutcome {
        match self.state.load(Ordering::Acquire) {
            PENDING => TickOutcome::Pending,
            SATISFIED => TickOutcome::Satisfied,
            _ => TickOutcome::Expired,
        }
    }

    pub fn try_satisfy(&self) -> bool {
        self.transition(SATISFIED)
    }

    pub fn try_expire(&self) -> bool {
        self.transition(EXPIRED)
    }

    fn transition(&self, to: u8) -> bool {
        self.state
            .compare_exchange(PENDING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
