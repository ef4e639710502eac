use log::{debug, trace};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fs::OpenOptions;
use std::io::Write;

const KMEMLEAK_PATH: &str = "/sys/kernel/debug/kmemleak";

type LeakCheck = Box<dyn Fn() + Send + Sync>;

#[derive(Debug, Default)]
struct GateState {
    running: usize,
    completed: u64,
    next_ticket: u64,
    next_check: u64,
    draining: bool,
}

/// Admission control for executions.
///
/// Bounds how many executions may be in flight at once. With a leak check
/// installed, every `leak_interval` completed tickets the gate drains: new
/// entries block until in-flight executions finish, the check runs with
/// nothing executing, then the gate reopens.
pub struct Gate {
    capacity: usize,
    leak_interval: u64,
    leak_check: Option<LeakCheck>,
    state: Mutex<GateState>,
    cv: Condvar,
}

/// Admission ticket. Dropping it leaves the gate, so the slot is released on
/// every exit path, unwinding included.
#[must_use = "the gate slot is released as soon as the ticket is dropped"]
pub struct Ticket<'a> {
    gate: &'a Gate,
    id: u64,
}

impl Ticket<'_> {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        self.gate.leave(self.id);
    }
}

impl Gate {
    /// Creates a gate admitting at most `capacity` concurrent executions.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            leak_interval: 0,
            leak_check: None,
            state: Mutex::new(GateState::default()),
            cv: Condvar::new(),
        }
    }

    /// Runs `check` once every `interval` completed tickets.
    pub fn with_leak_check(
        mut self,
        interval: u64,
        check: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        self.leak_interval = interval;
        self.leak_check = Some(Box::new(check));
        self.state.get_mut().next_check = interval;
        self
    }

    /// Maximum number of tickets out at once.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Blocks until a slot is free and the gate is not draining.
    pub fn enter(&self) -> Ticket<'_> {
        let mut state = self.state.lock();
        while state.draining || state.running >= self.capacity {
            self.cv.wait(&mut state);
        }
        state.running += 1;
        let id = state.next_ticket;
        state.next_ticket += 1;
        trace!("gate: ticket {} entered ({} running)", id, state.running);
        Ticket { gate: self, id }
    }

    fn leave(&self, id: u64) {
        let mut state = self.state.lock();
        state.running -= 1;
        state.completed += 1;
        trace!("gate: ticket {} left ({} running)", id, state.running);

        if self.leak_check_due(&state) {
            state.draining = true;
            state.next_check = state.completed + self.leak_interval;
            while state.running > 0 {
                self.cv.wait(&mut state);
            }
            if let Some(check) = &self.leak_check {
                debug!("gate: running leak check after {} tickets", state.completed);
                MutexGuard::unlocked(&mut state, || check());
            }
            state.draining = false;
        }
        self.cv.notify_all();
    }

    fn leak_check_due(&self, state: &GateState) -> bool {
        self.leak_check.is_some()
            && self.leak_interval > 0
            && !state.draining
            && state.completed >= state.next_check
    }

    /// Tickets currently held.
    pub fn in_flight(&self) -> usize {
        self.state.lock().running
    }

    /// Tickets returned since the gate was created.
    pub fn completed(&self) -> u64 {
        self.state.lock().completed
    }
}

/// Asks kmemleak for a scan. Best effort: missing debugfs or permission
/// errors are ignored.
pub fn kmemleak_scan() {
    let result = OpenOptions::new()
        .write(true)
        .open(KMEMLEAK_PATH)
        .and_then(|mut f| f.write_all(b"scan"));
    if let Err(e) = result {
        debug!("kmemleak scan skipped: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn tickets_are_released_on_drop() {
        let gate = Gate::new(2);
        {
            let a = gate.enter();
            let b = gate.enter();
            assert_eq!(gate.in_flight(), 2);
            assert_ne!(a.id(), b.id());
        }
        assert_eq!(gate.in_flight(), 0);
        assert_eq!(gate.completed(), 2);
    }

    #[test]
    fn ticket_is_released_when_execution_panics() {
        let gate = Gate::new(1);
        let result = catch_unwind(AssertUnwindSafe(|| {
            let _ticket = gate.enter();
            panic!("execution blew up");
        }));
        assert!(result.is_err());
        assert_eq!(gate.in_flight(), 0);
        let _ticket = gate.enter();
    }

    #[test]
    fn concurrency_never_exceeds_capacity() {
        let gate = Arc::new(Gate::new(3));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let current = Arc::clone(&current);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    for _ in 0..20 {
                        let _ticket = gate.enter();
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_micros(200));
                        current.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(gate.completed(), 160);
    }

    #[test]
    fn leak_check_runs_every_interval() {
        let checks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&checks);
        let gate = Gate::new(4).with_leak_check(5, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        for _ in 0..23 {
            let _ticket = gate.enter();
        }
        assert_eq!(checks.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn leak_check_sees_no_running_executions() {
        let active = Arc::new(AtomicUsize::new(0));
        let worst = Arc::new(AtomicUsize::new(0));
        let checks = Arc::new(AtomicUsize::new(0));
        let gate = {
            let active = Arc::clone(&active);
            let worst = Arc::clone(&worst);
            let checks = Arc::clone(&checks);
            Arc::new(Gate::new(4).with_leak_check(3, move || {
                worst.fetch_max(active.load(Ordering::SeqCst), Ordering::SeqCst);
                checks.fetch_add(1, Ordering::SeqCst);
            }))
        };
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let active = Arc::clone(&active);
                thread::spawn(move || {
                    for _ in 0..6 {
                        let ticket = gate.enter();
                        active.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_micros(100));
                        active.fetch_sub(1, Ordering::SeqCst);
                        drop(ticket);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(checks.load(Ordering::SeqCst) >= 1);
        assert_eq!(worst.load(Ordering::SeqCst), 0);
        assert_eq!(gate.in_flight(), 0);
    }
}
