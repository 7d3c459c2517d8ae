// Shared admission control capping simultaneously active messages across keys.
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use felix_common::DispatchConfig;

use crate::classification::Classifications;
use crate::{DispatchError, Result};

const RESUME_FRACTION: f64 = 0.8;

/// A consumer that stops taking messages while its set is suspended and is
/// woken when the set resumes.
pub trait ConsumerSetMember: Send + Sync {
    fn consumer_set_resumed(&self);
}

#[derive(Debug, Default)]
struct ActiveState {
    current: usize,
    prepared: usize,
    // None means unbounded.
    max_active: Option<usize>,
    resume_threshold: usize,
    suspended: bool,
}

impl ActiveState {
    fn set_limit(&mut self, max_active: usize) {
        if max_active == 0 {
            self.max_active = None;
            self.resume_threshold = 0;
        } else {
            self.max_active = Some(max_active);
            self.resume_threshold = (max_active as f64 * RESUME_FRACTION).round() as usize;
        }
    }
}

enum GateMode {
    Shared(ArcRwLockReadGuard<RawRwLock, ()>),
    Exclusive(ArcRwLockWriteGuard<RawRwLock, ()>),
}

/// A reserved admission slot. Hand it back through
/// [`ConsumerSet::commit_add_active_message`] once a message was locked, or
/// [`ConsumerSet::rollback_add_active_message`] otherwise. Dropping an
/// unresolved permit rolls it back.
pub struct AdmissionPermit {
    set: Arc<ConsumerSet>,
    mode: Option<GateMode>,
}

impl AdmissionPermit {
    /// True when this permit crossed the limit boundary and holds the gate exclusively.
    pub fn is_exclusive(&self) -> bool {
        matches!(self.mode, Some(GateMode::Exclusive(_)))
    }

    pub fn commit(mut self) {
        if let Some(mode) = self.mode.take() {
            self.set.commit_inner(mode);
        }
    }

    pub fn rollback(mut self) {
        if let Some(mode) = self.mode.take() {
            self.set.rollback_inner(mode);
        }
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if let Some(mode) = self.mode.take() {
            self.set.rollback_inner(mode);
        }
    }
}

impl fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("set", &self.set.label)
            .field("exclusive", &self.is_exclusive())
            .finish()
    }
}

/// Named group of consumers sharing one active-message limit.
///
/// Admissions normally run concurrently under the shared side of an internal
/// gate. Only the prepare that would take the set to its limit escalates to
/// the exclusive side, so the suspend decision is made with every other
/// in-flight preparer resolved.
///
/// ```
/// use felix_dispatch::ConsumerSet;
///
/// let set = ConsumerSet::with_limit("orders", 1);
/// let permit = set.prepare_add_active_message().expect("slot");
/// set.commit_add_active_message(permit);
/// assert!(set.is_consumer_set_suspended());
/// assert!(set.prepare_add_active_message().is_none());
/// set.remove_active_messages(1).expect("remove");
/// assert!(!set.is_consumer_set_suspended());
/// ```
pub struct ConsumerSet {
    label: String,
    classifications: Arc<Classifications>,
    gate: Arc<RwLock<()>>,
    active: Mutex<ActiveState>,
    members: Mutex<Vec<Weak<dyn ConsumerSetMember>>>,
    // Rotates the first member woken on each resume.
    resume_start: AtomicUsize,
}

impl ConsumerSet {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Self::with_limit(label, 0)
    }

    /// `max_active == 0` means unbounded.
    pub fn with_limit(label: impl Into<String>, max_active: usize) -> Arc<Self> {
        let mut active = ActiveState::default();
        active.set_limit(max_active);
        Arc::new(Self {
            label: label.into(),
            classifications: Arc::new(Classifications::new()),
            gate: Arc::new(RwLock::new(())),
            active: Mutex::new(active),
            members: Mutex::new(Vec::new()),
            resume_start: AtomicUsize::new(0),
        })
    }

    pub fn from_config(label: impl Into<String>, config: &DispatchConfig) -> Arc<Self> {
        Self::with_limit(label, config.consumer_set_max_active)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn classifications(&self) -> &Arc<Classifications> {
        &self.classifications
    }

    pub fn add_member(&self, member: Weak<dyn ConsumerSetMember>) {
        self.members.lock().push(member);
    }

    pub fn remove_member(&self, member: &Weak<dyn ConsumerSetMember>) {
        self.members
            .lock()
            .retain(|existing| !Weak::ptr_eq(existing, member) && existing.strong_count() > 0);
    }

    pub fn member_count(&self) -> usize {
        self.members
            .lock()
            .iter()
            .filter(|member| member.strong_count() > 0)
            .count()
    }

    /// Reserves one admission slot, or returns `None` if the set is suspended
    /// or full.
    pub fn prepare_add_active_message(self: &Arc<Self>) -> Option<AdmissionPermit> {
        let shared = self.gate.read_arc();
        {
            let mut active = self.active.lock();
            if active.suspended {
                return None;
            }
            let below_boundary = match active.max_active {
                None => true,
                Some(max) => active.current + active.prepared + 1 < max,
            };
            if below_boundary {
                active.prepared += 1;
                return Some(AdmissionPermit {
                    set: Arc::clone(self),
                    mode: Some(GateMode::Shared(shared)),
                });
            }
        }

        // This reservation would reach the limit: wait out every shared
        // preparer and decide alone.
        drop(shared);
        let exclusive = self.gate.write_arc();
        let mut active = self.active.lock();
        if active.suspended {
            return None;
        }
        if let Some(max) = active.max_active
            && active.current + active.prepared >= max
        {
            // Nobody holds a prepare here, so a full set has to be suspended
            // for its members to be woken later.
            active.suspended = true;
            metrics::counter!("felix_consumer_set_suspend_total").increment(1);
            return None;
        }
        active.prepared += 1;
        Some(AdmissionPermit {
            set: Arc::clone(self),
            mode: Some(GateMode::Exclusive(exclusive)),
        })
    }

    pub fn commit_add_active_message(&self, permit: AdmissionPermit) {
        permit.commit();
    }

    pub fn rollback_add_active_message(&self, permit: AdmissionPermit) {
        permit.rollback();
    }

    fn commit_inner(&self, mode: GateMode) {
        let mut active = self.active.lock();
        active.prepared = active.prepared.saturating_sub(1);
        active.current += 1;
        if matches!(mode, GateMode::Exclusive(_)) && active.max_active == Some(active.current) {
            active.suspended = true;
            metrics::counter!("felix_consumer_set_suspend_total").increment(1);
            tracing::debug!(set = %self.label, current = active.current, "consumer set suspended");
        }
        metrics::gauge!("felix_consumer_set_active", "set" => self.label.clone())
            .set(active.current as f64);
        drop(active);
        drop(mode);
    }

    fn rollback_inner(&self, mode: GateMode) {
        let mut active = self.active.lock();
        active.prepared = active.prepared.saturating_sub(1);
        drop(active);
        drop(mode);
    }

    /// Releases `count` active messages, resuming members if the set drops to
    /// its resume threshold.
    pub fn remove_active_messages(&self, count: usize) -> Result<()> {
        let resume = {
            let _shared = self.gate.read();
            let mut active = self.active.lock();
            if count > active.current {
                tracing::error!(
                    set = %self.label,
                    current = active.current,
                    count,
                    "active message count would go negative"
                );
                return Err(DispatchError::InvariantViolation(format!(
                    "consumer set {} removing {count} active messages with only {} active",
                    self.label, active.current
                )));
            }
            active.current -= count;
            metrics::gauge!("felix_consumer_set_active", "set" => self.label.clone())
                .set(active.current as f64);
            if active.suspended && active.current <= active.resume_threshold {
                active.suspended = false;
                true
            } else {
                false
            }
        };
        if resume {
            self.resume_members();
        }
        Ok(())
    }

    /// Reconfigures the limit. Zero means unbounded.
    pub fn set_concurrency_limit(&self, max_active: usize) {
        let resume = {
            let _exclusive = self.gate.write();
            let mut active = self.active.lock();
            active.set_limit(max_active);
            match active.max_active {
                None => std::mem::take(&mut active.suspended),
                Some(_) if active.suspended => {
                    if active.current <= active.resume_threshold {
                        active.suspended = false;
                        true
                    } else {
                        false
                    }
                }
                Some(max) => {
                    if active.current >= max {
                        active.suspended = true;
                        metrics::counter!("felix_consumer_set_suspend_total").increment(1);
                    }
                    false
                }
            }
        };
        tracing::debug!(set = %self.label, max_active, "consumer set limit changed");
        if resume {
            self.resume_members();
        }
    }

    pub fn is_consumer_set_suspended(&self) -> bool {
        self.active.lock().suspended
    }

    pub fn current_active(&self) -> usize {
        self.active.lock().current
    }

    pub fn prepared(&self) -> usize {
        self.active.lock().prepared
    }

    pub fn max_active(&self) -> Option<usize> {
        self.active.lock().max_active
    }

    pub fn resume_threshold(&self) -> usize {
        self.active.lock().resume_threshold
    }

    // Called with no gate or counter lock held: members re-enter this set.
    fn resume_members(&self) {
        let snapshot: Vec<Arc<dyn ConsumerSetMember>> = {
            let mut members = self.members.lock();
            members.retain(|member| member.strong_count() > 0);
            members.iter().filter_map(Weak::upgrade).collect()
        };
        metrics::counter!("felix_consumer_set_resume_total").increment(1);
        tracing::debug!(set = %self.label, members = snapshot.len(), "consumer set resumed");
        if snapshot.is_empty() {
            return;
        }
        let start = self.resume_start.fetch_add(1, Ordering::Relaxed) % snapshot.len();
        for offset in 0..snapshot.len() {
            snapshot[(start + offset) % snapshot.len()].consumer_set_resumed();
        }
    }
}

impl fmt::Debug for ConsumerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let active = self.active.lock();
        f.debug_struct("ConsumerSet")
            .field("label", &self.label)
            .field("current", &active.current)
            .field("prepared", &active.prepared)
            .field("max_active", &active.max_active)
            .field("suspended", &active.suspended)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[derive(Default)]
    struct CountingMember {
        resumed: AtomicUsize,
    }

    impl ConsumerSetMember for CountingMember {
        fn consumer_set_resumed(&self) {
            self.resumed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn member(set: &Arc<ConsumerSet>) -> Arc<CountingMember> {
        let member = Arc::new(CountingMember::default());
        let as_dyn: Arc<dyn ConsumerSetMember> = member.clone();
        set.add_member(Arc::downgrade(&as_dyn));
        member
    }

    #[test]
    fn limit_of_two_suspends_and_resumes_each_member_once() {
        let set = ConsumerSet::with_limit("pair", 2);
        let members = [member(&set), member(&set), member(&set)];
        assert_eq!(set.resume_threshold(), 2);

        let first = set.prepare_add_active_message().expect("first");
        assert!(!first.is_exclusive());
        set.commit_add_active_message(first);
        let second = set.prepare_add_active_message().expect("second");
        assert!(second.is_exclusive());
        set.commit_add_active_message(second);

        assert!(set.prepare_add_active_message().is_none());
        assert!(set.is_consumer_set_suspended());
        assert_eq!(set.current_active(), 2);

        set.remove_active_messages(1).expect("remove");
        assert_eq!(set.current_active(), 1);
        assert!(!set.is_consumer_set_suspended());
        for member in &members {
            assert_eq!(member.resumed.load(Ordering::SeqCst), 1);
        }

        // A further removal below threshold is not a second resume.
        set.remove_active_messages(1).expect("remove");
        for member in &members {
            assert_eq!(member.resumed.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn rollback_and_drop_release_the_reservation() {
        let set = ConsumerSet::with_limit("single", 1);
        let permit = set.prepare_add_active_message().expect("slot");
        assert!(permit.is_exclusive());
        assert_eq!(set.prepared(), 1);
        set.rollback_add_active_message(permit);
        assert_eq!(set.prepared(), 0);
        assert!(!set.is_consumer_set_suspended());

        let dropped = set.prepare_add_active_message().expect("slot");
        drop(dropped);
        assert_eq!(set.prepared(), 0);
        assert_eq!(set.current_active(), 0);
        assert!(set.prepare_add_active_message().is_some());
    }

    #[test]
    fn removing_more_than_active_is_an_invariant_violation() {
        let set = ConsumerSet::with_limit("under", 4);
        let permit = set.prepare_add_active_message().expect("slot");
        set.commit_add_active_message(permit);
        let err = set.remove_active_messages(2).expect_err("underflow");
        assert!(matches!(err, DispatchError::InvariantViolation(_)));
        assert_eq!(set.current_active(), 1);
    }

    #[test]
    fn unbounded_set_never_suspends() {
        let set = ConsumerSet::new("open");
        for _ in 0..100 {
            let permit = set.prepare_add_active_message().expect("slot");
            set.commit_add_active_message(permit);
        }
        assert!(!set.is_consumer_set_suspended());
        assert_eq!(set.max_active(), None);
    }

    #[test]
    fn lowering_the_limit_suspends_and_raising_it_resumes() {
        let set = ConsumerSet::with_limit("elastic", 10);
        let member = member(&set);
        for _ in 0..4 {
            let permit = set.prepare_add_active_message().expect("slot");
            set.commit_add_active_message(permit);
        }
        set.set_concurrency_limit(3);
        assert!(set.is_consumer_set_suspended());
        assert!(set.prepare_add_active_message().is_none());

        set.set_concurrency_limit(0);
        assert!(!set.is_consumer_set_suspended());
        assert_eq!(member.resumed.load(Ordering::SeqCst), 1);
        assert!(set.prepare_add_active_message().is_some());
    }

    #[test]
    fn resume_order_rotates_between_members() {
        struct Recorder {
            id: usize,
            log: Arc<Mutex<Vec<usize>>>,
        }
        impl ConsumerSetMember for Recorder {
            fn consumer_set_resumed(&self) {
                self.log.lock().push(self.id);
            }
        }

        let set = ConsumerSet::with_limit("rr", 1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let recorders: Vec<Arc<dyn ConsumerSetMember>> = (0..3)
            .map(|id| {
                Arc::new(Recorder {
                    id,
                    log: Arc::clone(&log),
                }) as Arc<dyn ConsumerSetMember>
            })
            .collect();
        for recorder in &recorders {
            set.add_member(Arc::downgrade(recorder));
        }

        let mut firsts = Vec::new();
        for _ in 0..3 {
            let permit = set.prepare_add_active_message().expect("slot");
            set.commit_add_active_message(permit);
            set.remove_active_messages(1).expect("remove");
            let mut entries = log.lock();
            firsts.push(entries[0]);
            entries.clear();
        }
        firsts.sort_unstable();
        assert_eq!(firsts, vec![0, 1, 2]);
    }

    #[test]
    fn concurrent_admissions_never_exceed_the_limit() {
        const LIMIT: usize = 5;
        let set = ConsumerSet::with_limit("contended", LIMIT);
        let stop = Arc::new(AtomicBool::new(false));
        let violations = Arc::new(AtomicUsize::new(0));

        let observer = {
            let set = Arc::clone(&set);
            let stop = Arc::clone(&stop);
            let violations = Arc::clone(&violations);
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let active = set.active.lock();
                    if active.current + active.prepared > LIMIT {
                        violations.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        };

        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let set = Arc::clone(&set);
                thread::spawn(move || {
                    for round in 0..2_000 {
                        let Some(permit) = set.prepare_add_active_message() else {
                            thread::yield_now();
                            continue;
                        };
                        if (worker + round) % 3 == 0 {
                            set.rollback_add_active_message(permit);
                        } else {
                            set.commit_add_active_message(permit);
                            set.remove_active_messages(1).expect("remove");
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker");
        }
        stop.store(true, Ordering::Relaxed);
        observer.join().expect("observer");

        assert_eq!(violations.load(Ordering::Relaxed), 0);
        assert_eq!(set.current_active(), 0);
        assert_eq!(set.prepared(), 0);
        assert!(!set.is_consumer_set_suspended());
    }

    #[test]
    fn boundary_prepare_waits_for_shared_preparers() {
        // Two shared reservations are outstanding when a third preparer reaches
        // the boundary; it must not decide until both have resolved.
        let set = ConsumerSet::with_limit("boundary", 3);
        let a = set.prepare_add_active_message().expect("a");
        let b = set.prepare_add_active_message().expect("b");
        assert!(!a.is_exclusive() && !b.is_exclusive());

        let decided = Arc::new(AtomicBool::new(false));
        let contender = {
            let set = Arc::clone(&set);
            let decided = Arc::clone(&decided);
            thread::spawn(move || {
                let permit = set.prepare_add_active_message();
                decided.store(true, Ordering::SeqCst);
                permit.map(|permit| {
                    let exclusive = permit.is_exclusive();
                    permit.commit();
                    exclusive
                })
            })
        };

        thread::sleep(std::time::Duration::from_millis(50));
        assert!(!decided.load(Ordering::SeqCst));
        set.commit_add_active_message(a);
        set.rollback_add_active_message(b);

        let outcome = contender.join().expect("contender");
        assert_eq!(outcome, Some(true));
        assert_eq!(set.current_active(), 2);
        assert!(!set.is_consumer_set_suspended());
    }
}
