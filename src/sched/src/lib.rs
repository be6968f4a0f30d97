//! Single-threaded cooperative event scheduler.
//!
//! A select(2) loop over registered events: fd readability/writability/
//! exceptions plus second-granularity timeouts. Callbacks run on the loop
//! thread; a callback may re-enter `wait_for_events`, in which case the
//! recursive invocation dispatches whatever is already pending and returns
//! without selecting again. Unregistered events are tombstoned and reclaimed
//! at the end of the outermost tick.

use std::cell::RefCell;
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use nix::sys::select::{select, FdSet};
use nix::sys::time::{TimeVal, TimeValLike};
use thiserror::Error;
use tracing::trace;

/// Upper bound on a single select sleep, seconds.
pub const SCHEDULER_MAX_TIMEOUT: u64 = 600;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventSet: u8 {
        const READ_FD   = 1 << 0;
        const WRITE_FD  = 1 << 1;
        const EXCEPT_FD = 1 << 2;
        const TIMEOUT   = 1 << 3;
    }
}

impl EventSet {
    pub fn poll_fd(self) -> bool {
        self.intersects(EventSet::READ_FD | EventSet::WRITE_FD | EventSet::EXCEPT_FD)
    }
}

pub type EventId = u32;

#[derive(Debug, Error)]
pub enum SchedError {
    #[error("event must poll an fd or carry a timeout")]
    NoMode,

    #[error(transparent)]
    Sys(#[from] nix::errno::Errno),
}

pub type Result<T> = std::result::Result<T, SchedError>;

/// Callbacks receive the scheduler so they may register, unregister or
/// re-enter the loop.
pub type EventCallback = Rc<RefCell<dyn FnMut(&mut Scheduler, EventId, EventSet)>>;

struct Event {
    id: EventId,
    mode: EventSet,
    fd: RawFd,
    /// None means no timeout contribution (the event never fires on time).
    timeout: Option<u64>,
    deadline: Option<Instant>,
    cb: EventCallback,
    pending: EventSet,
    masked: bool,
    dead: bool,
}

pub struct Scheduler {
    events: Vec<Event>,
    uuid: EventId,
    depth: u32,
    max_timeout: u64,
}

impl Default for Scheduler {
    fn default() -> Scheduler {
        Scheduler::new()
    }
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler {
            events: Vec::new(),
            uuid: 1,
            depth: 0,
            max_timeout: SCHEDULER_MAX_TIMEOUT,
        }
    }

    fn next_id(&mut self) -> EventId {
        loop {
            let id = self.uuid;
            self.uuid = self.uuid.wrapping_add(1);
            if self.uuid == 0 {
                self.uuid = 1;
            }
            if id != 0 && !self.events.iter().any(|e| e.id == id && !e.dead) {
                return id;
            }
        }
    }

    /// Register an event. `timeout` participates only when `mode` contains
    /// `TIMEOUT`; `None` there means the event never expires on its own.
    pub fn register_event(
        &mut self,
        mode: EventSet,
        fd: RawFd,
        timeout: Option<u64>,
        cb: EventCallback,
    ) -> Result<EventId> {
        if !mode.poll_fd() && !mode.contains(EventSet::TIMEOUT) {
            return Err(SchedError::NoMode);
        }

        let id = self.next_id();
        let deadline = if mode.contains(EventSet::TIMEOUT) {
            timeout.map(|t| Instant::now() + Duration::from_secs(t))
        } else {
            None
        };

        self.events.push(Event {
            id,
            mode,
            fd,
            timeout,
            deadline,
            cb,
            pending: EventSet::empty(),
            masked: false,
            dead: false,
        });

        trace!(id, ?mode, fd, "registered event");
        Ok(id)
    }

    /// Tombstone an event; it stops firing immediately and is reclaimed at
    /// the end of the current outermost tick.
    pub fn unregister_event(&mut self, id: EventId) {
        if id == 0 {
            return;
        }
        if let Some(event) = self.events.iter_mut().find(|e| e.id == id) {
            event.dead = true;
        }
    }

    /// Suspend or resume delivery without removing the event.
    pub fn mask_event(&mut self, id: EventId, masked: bool) {
        if id == 0 {
            return;
        }
        if let Some(event) = self.events.iter_mut().find(|e| e.id == id) {
            event.masked = masked;
        }
    }

    /// Clamp the next tick's select timeout.
    pub fn set_max_timeout(&mut self, timeout: u64) {
        self.max_timeout = self.max_timeout.min(timeout);
    }

    pub fn event_count(&self) -> usize {
        self.events.iter().filter(|e| !e.dead).count()
    }

    /// Compute the select sets and minimal timeout for this tick.
    fn prepare(&self, rfds: &mut FdSet, wfds: &mut FdSet, efds: &mut FdSet) -> (i32, u64) {
        let mut max_fd = -1;
        let mut timeout = SCHEDULER_MAX_TIMEOUT;
        let now = Instant::now();

        for event in &self.events {
            if event.masked || event.dead {
                continue;
            }

            if event.mode.poll_fd() {
                // Safety: registrants own the fd for the event's lifetime.
                let fd = unsafe { BorrowedFd::borrow_raw(event.fd) };
                if event.mode.contains(EventSet::READ_FD) {
                    rfds.insert(fd);
                }
                if event.mode.contains(EventSet::WRITE_FD) {
                    wfds.insert(fd);
                }
                if event.mode.contains(EventSet::EXCEPT_FD) {
                    efds.insert(fd);
                }
                max_fd = max_fd.max(event.fd);
            }

            if event.mode.contains(EventSet::TIMEOUT) {
                if let Some(deadline) = event.deadline {
                    let remaining = deadline.saturating_duration_since(now).as_secs();
                    timeout = timeout.min(remaining);
                }
            }
        }

        (max_fd, timeout.min(self.max_timeout))
    }

    fn check_events(&mut self, rfds: &FdSet, wfds: &FdSet, efds: &FdSet) {
        let now = Instant::now();

        for event in &mut self.events {
            if event.dead {
                continue;
            }

            if event.mode.poll_fd() && !event.masked {
                let fd = unsafe { BorrowedFd::borrow_raw(event.fd) };
                if event.mode.contains(EventSet::READ_FD) && rfds.contains(fd) {
                    event.pending |= EventSet::READ_FD;
                }
                if event.mode.contains(EventSet::WRITE_FD) && wfds.contains(fd) {
                    event.pending |= EventSet::WRITE_FD;
                }
                if event.mode.contains(EventSet::EXCEPT_FD) && efds.contains(fd) {
                    event.pending |= EventSet::EXCEPT_FD;
                }
            }

            if event.pending.is_empty()
                && event.mode.contains(EventSet::TIMEOUT)
                && !event.masked
            {
                if let Some(deadline) = event.deadline {
                    if deadline <= now {
                        event.pending = EventSet::TIMEOUT;
                    }
                }
            }
        }
    }

    /// Dispatch every pending event exactly once. Pending state clears
    /// before the callback so it may re-arm itself.
    fn run_events(&mut self) -> usize {
        let mut dispatched = 0;
        let len = self.events.len();

        for i in 0..len {
            let (id, pending, cb) = {
                let event = &mut self.events[i];
                if event.dead || event.pending.is_empty() {
                    continue;
                }

                let pending = event.pending;
                event.pending = EventSet::empty();

                if event.mode.contains(EventSet::TIMEOUT) {
                    event.deadline = event
                        .timeout
                        .map(|t| Instant::now() + Duration::from_secs(t));
                }

                if event.masked {
                    continue;
                }

                (event.id, pending, event.cb.clone())
            };

            let borrow_result = cb.try_borrow_mut();
            match borrow_result {
                Ok(mut cb_ref) => {
                    cb_ref(self, id, pending);
                    dispatched += 1;
                }
                Err(_) => {
                    // The handler is live further up the stack (recursive
                    // tick); leave the event pending for the outer loop.
                    if let Some(event) = self.events.iter_mut().find(|e| e.id == id) {
                        event.pending = pending;
                    }
                }
            }
        }

        dispatched
    }

    fn gc_events(&mut self) {
        self.events.retain(|e| !e.dead);
    }

    /// One scheduler tick: select on every registered fd with the minimal
    /// timeout, then dispatch. Returns the number of callbacks run.
    pub fn wait_for_events(&mut self) -> Result<usize> {
        self.depth += 1;
        let res = self.tick();
        self.depth -= 1;
        res
    }

    fn tick(&mut self) -> Result<usize> {
        if self.depth > 1 {
            // Recursive invocations continue with the pending set; return as
            // soon as any progress is made.
            let n = self.run_events();
            if n > 0 {
                return Ok(n);
            }
        }

        let mut rfds = FdSet::new();
        let mut wfds = FdSet::new();
        let mut efds = FdSet::new();
        let (max_fd, timeout) = self.prepare(&mut rfds, &mut wfds, &mut efds);

        let mut tv = TimeVal::seconds(timeout as i64);
        select(max_fd + 1, &mut rfds, &mut wfds, &mut efds, &mut tv)?;

        self.check_events(&rfds, &wfds, &efds);
        self.max_timeout = SCHEDULER_MAX_TIMEOUT;

        let n = self.run_events();

        if self.depth == 1 {
            self.gc_events();
        }

        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{pipe, write};
    use std::os::fd::AsRawFd;

    fn counting_cb(counter: Rc<RefCell<Vec<EventId>>>) -> EventCallback {
        Rc::new(RefCell::new(
            move |_s: &mut Scheduler, id: EventId, _ev: EventSet| {
                counter.borrow_mut().push(id);
            },
        ))
    }

    #[test]
    fn ids_are_positive_and_increasing() {
        let mut sched = Scheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let a = sched
            .register_event(EventSet::TIMEOUT, -1, Some(600), counting_cb(log.clone()))
            .unwrap();
        let b = sched
            .register_event(EventSet::TIMEOUT, -1, Some(600), counting_cb(log.clone()))
            .unwrap();
        assert!(a > 0);
        assert!(b > a);

        sched.unregister_event(a);
        assert_eq!(sched.event_count(), 1);
    }

    #[test]
    fn rejects_modeless_registration() {
        let mut sched = Scheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        assert!(matches!(
            sched.register_event(EventSet::empty(), -1, None, counting_cb(log)),
            Err(SchedError::NoMode)
        ));
    }

    #[test]
    fn fd_events_fire_in_registration_order() {
        let mut sched = Scheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let (r1, w1) = pipe().unwrap();
        let (r2, w2) = pipe().unwrap();

        let a = sched
            .register_event(
                EventSet::READ_FD,
                r1.as_raw_fd(),
                None,
                counting_cb(log.clone()),
            )
            .unwrap();
        let b = sched
            .register_event(
                EventSet::READ_FD,
                r2.as_raw_fd(),
                None,
                counting_cb(log.clone()),
            )
            .unwrap();

        // Make both readable, second first; dispatch order must still be
        // registration order.
        write(&w2, b"x").unwrap();
        write(&w1, b"x").unwrap();

        let n = sched.wait_for_events().unwrap();
        assert_eq!(n, 2);
        assert_eq!(*log.borrow(), vec![a, b]);
    }

    #[test]
    fn masked_events_do_not_fire() {
        let mut sched = Scheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let (r, w) = pipe().unwrap();
        let id = sched
            .register_event(
                EventSet::READ_FD,
                r.as_raw_fd(),
                None,
                counting_cb(log.clone()),
            )
            .unwrap();
        sched.mask_event(id, true);

        write(&w, b"x").unwrap();
        sched.set_max_timeout(0);
        sched.wait_for_events().unwrap();
        assert!(log.borrow().is_empty());

        sched.mask_event(id, false);
        sched.wait_for_events().unwrap();
        assert_eq!(*log.borrow(), vec![id]);
    }

    #[test]
    fn timeout_event_fires_and_rearms() {
        let mut sched = Scheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let id = sched
            .register_event(EventSet::TIMEOUT, -1, Some(0), counting_cb(log.clone()))
            .unwrap();

        sched.wait_for_events().unwrap();
        assert_eq!(*log.borrow(), vec![id]);

        // Deadline re-armed to now+0, so it fires again next tick.
        sched.wait_for_events().unwrap();
        assert_eq!(*log.borrow(), vec![id, id]);
    }

    #[test]
    fn callback_may_unregister_itself() {
        let mut sched = Scheduler::new();

        let fired = Rc::new(RefCell::new(0u32));
        let fired2 = fired.clone();
        let cb: EventCallback = Rc::new(RefCell::new(
            move |s: &mut Scheduler, id: EventId, _ev: EventSet| {
                *fired2.borrow_mut() += 1;
                s.unregister_event(id);
            },
        ));

        sched
            .register_event(EventSet::TIMEOUT, -1, Some(0), cb)
            .unwrap();

        sched.wait_for_events().unwrap();
        assert_eq!(*fired.borrow(), 1);
        assert_eq!(sched.event_count(), 0);

        sched.set_max_timeout(0);
        sched.wait_for_events().unwrap();
        assert_eq!(*fired.borrow(), 1);
    }
}
