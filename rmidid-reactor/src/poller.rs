//! Single-threaded cooperative reactor.
//!
//! The [`Poller`] multiplexes file-descriptor readability and timers over
//! one `poll(2)` call per [`Poller::run_once`] iteration. Registrations are
//! owned by tokens: dropping an [`FdToken`] or [`TimerToken`] cancels the
//! registration, and a cancelled callback is never invoked again, even when
//! the cancellation happens from another callback in the same dispatch
//! round. Due timers dispatch before fd events on a tie, in deadline order.
//!
//! The reactor is not thread-safe; every handle, token and callback must
//! stay on the thread that created the poller.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

type Callback = Rc<RefCell<dyn FnMut()>>;

struct FdWatch {
    id: u64,
    fd: RawFd,
    callback: Callback,
}

struct Timer {
    id: u64,
    deadline: Instant,
    period: Option<Duration>,
    callback: Callback,
}

struct PollerInner {
    fds: RefCell<Vec<FdWatch>>,
    timers: RefCell<Vec<Timer>>,
    next_id: Cell<u64>,
}

impl PollerInner {
    fn register_timer(&self, deadline: Instant, period: Option<Duration>, callback: Callback) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.timers.borrow_mut().push(Timer {
            id,
            deadline,
            period,
            callback,
        });
        id
    }

    fn cancel_timer(&self, id: u64) {
        self.timers.borrow_mut().retain(|t| t.id != id);
    }

    fn cancel_fd(&self, id: u64) {
        self.fds.borrow_mut().retain(|w| w.id != id);
    }

    /// Milliseconds until the nearest timer, rounded up; `None` when no
    /// timer is registered.
    fn poll_timeout(&self, now: Instant) -> Option<i32> {
        let nearest = self.timers.borrow().iter().map(|t| t.deadline).min()?;
        let wait = nearest.saturating_duration_since(now);
        let mut ms = wait.as_millis();
        if wait.subsec_nanos() % 1_000_000 != 0 {
            ms += 1;
        }
        Some(ms.min(i32::MAX as u128) as i32)
    }
}

/// Cloneable handle to the reactor.
#[derive(Clone)]
pub struct Poller {
    inner: Rc<PollerInner>,
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}

impl Poller {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(PollerInner {
                fds: RefCell::new(Vec::new()),
                timers: RefCell::new(Vec::new()),
                next_id: Cell::new(1),
            }),
        }
    }

    /// Watches `fd` for readability; `callback` runs once per readable
    /// wakeup until the token is dropped.
    #[must_use = "dropping the token deregisters the watcher"]
    pub fn add_fd_in(&self, fd: RawFd, callback: impl FnMut() + 'static) -> FdToken {
        let inner = &self.inner;
        let id = inner.next_id.get();
        inner.next_id.set(id + 1);
        inner.fds.borrow_mut().push(FdWatch {
            id,
            fd,
            callback: Rc::new(RefCell::new(callback)),
        });
        FdToken {
            poller: Rc::downgrade(inner),
            id,
        }
    }

    /// Schedules a one-shot callback at `now + delay`.
    #[must_use = "dropping the token cancels the timer"]
    pub fn add_timer(&self, delay: Duration, callback: impl FnMut() + 'static) -> TimerToken {
        let id = self.inner.register_timer(
            Instant::now() + delay,
            None,
            Rc::new(RefCell::new(callback)),
        );
        TimerToken {
            poller: Rc::downgrade(&self.inner),
            id,
        }
    }

    /// Schedules a periodic callback every `period`, first firing one
    /// period from now.
    #[must_use = "dropping the token cancels the timer"]
    pub fn add_repeat(&self, period: Duration, callback: impl FnMut() + 'static) -> TimerToken {
        let id = self.inner.register_timer(
            Instant::now() + period,
            Some(period),
            Rc::new(RefCell::new(callback)),
        );
        TimerToken {
            poller: Rc::downgrade(&self.inner),
            id,
        }
    }

    /// Blocks until at least one registration is ready, then dispatches
    /// every due callback. Returns the number of callbacks dispatched, or
    /// `Ok(0)` immediately when nothing is registered.
    pub fn run_once(&self) -> io::Result<usize> {
        let inner = &self.inner;
        if inner.fds.borrow().is_empty() && inner.timers.borrow().is_empty() {
            return Ok(0);
        }

        let timeout = inner.poll_timeout(Instant::now()).unwrap_or(-1);
        let mut pollfds: Vec<libc::pollfd> = inner
            .fds
            .borrow()
            .iter()
            .map(|w| libc::pollfd {
                fd: w.fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        let watch_ids: Vec<u64> = inner.fds.borrow().iter().map(|w| w.id).collect();

        let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }

        let mut dispatched = 0;

        // Timers first, in deadline order. The due set is snapshotted up
        // front so timers armed by a callback wait for the next iteration;
        // cancellations are honoured by re-checking the registry.
        let now = Instant::now();
        let mut due: Vec<(Instant, u64)> = inner
            .timers
            .borrow()
            .iter()
            .filter(|t| t.deadline <= now)
            .map(|t| (t.deadline, t.id))
            .collect();
        due.sort();
        for (_, id) in due {
            let callback = {
                let mut timers = inner.timers.borrow_mut();
                match timers.iter().position(|t| t.id == id) {
                    Some(slot) => {
                        let cb = Rc::clone(&timers[slot].callback);
                        match timers[slot].period {
                            Some(period) => timers[slot].deadline = now + period,
                            None => {
                                timers.remove(slot);
                            }
                        }
                        cb
                    }
                    // Cancelled by an earlier callback in this round.
                    None => continue,
                }
            };
            (callback.borrow_mut())();
            dispatched += 1;
        }

        // Then readable fds, in registration order.
        for (slot, id) in watch_ids.iter().enumerate() {
            let revents = pollfds[slot].revents;
            if revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) == 0 {
                continue;
            }
            let callback = {
                let fds = inner.fds.borrow();
                fds.iter().find(|w| w.id == *id).map(|w| Rc::clone(&w.callback))
            };
            let Some(callback) = callback else {
                continue;
            };
            (callback.borrow_mut())();
            dispatched += 1;
        }

        Ok(dispatched)
    }
}

/// Registration handle for an fd watcher; deregisters on drop.
pub struct FdToken {
    poller: Weak<PollerInner>,
    id: u64,
}

impl Drop for FdToken {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.upgrade() {
            poller.cancel_fd(self.id);
        }
    }
}

/// Registration handle for a timer; cancels on drop.
pub struct TimerToken {
    poller: Weak<PollerInner>,
    id: u64,
}

impl Drop for TimerToken {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.upgrade() {
            poller.cancel_timer(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_poller_returns_immediately() {
        let poller = Poller::new();
        assert_eq!(poller.run_once().unwrap(), 0);
    }

    #[test]
    fn test_one_shot_timer_fires_once() {
        let poller = Poller::new();
        let hits = Rc::new(Cell::new(0));

        let h = hits.clone();
        let _t = poller.add_timer(Duration::from_millis(5), move || h.set(h.get() + 1));

        assert_eq!(poller.run_once().unwrap(), 1);
        assert_eq!(hits.get(), 1);
        // Registration is gone afterwards.
        assert_eq!(poller.run_once().unwrap(), 0);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_dropped_timer_never_fires() {
        let poller = Poller::new();
        let hits = Rc::new(Cell::new(0));

        let h = hits.clone();
        let token = poller.add_timer(Duration::from_millis(1), move || h.set(h.get() + 1));
        drop(token);

        assert_eq!(poller.run_once().unwrap(), 0);
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn test_repeat_timer_keeps_firing() {
        let poller = Poller::new();
        let hits = Rc::new(Cell::new(0));

        let h = hits.clone();
        let _t = poller.add_repeat(Duration::from_millis(2), move || h.set(h.get() + 1));

        while hits.get() < 3 {
            poller.run_once().unwrap();
        }
        assert_eq!(hits.get(), 3);
    }

    #[test]
    fn test_due_timers_dispatch_in_deadline_order() {
        let poller = Poller::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        let _late = poller.add_timer(Duration::from_millis(4), move || o.borrow_mut().push("late"));
        let o = order.clone();
        let _early = poller.add_timer(Duration::from_millis(1), move || o.borrow_mut().push("early"));

        // Sleep past both deadlines so a single iteration sees both due.
        std::thread::sleep(Duration::from_millis(8));
        assert_eq!(poller.run_once().unwrap(), 2);
        assert_eq!(&*order.borrow(), &["early", "late"]);
    }

    #[test]
    fn test_callback_cancels_other_timer() {
        let poller = Poller::new();
        let hits = Rc::new(Cell::new(0));
        let victim: Rc<RefCell<Option<TimerToken>>> = Rc::new(RefCell::new(None));

        let v = victim.clone();
        let _killer = poller.add_timer(Duration::from_millis(1), move || {
            v.borrow_mut().take();
        });
        let h = hits.clone();
        *victim.borrow_mut() = Some(poller.add_timer(Duration::from_millis(2), move || {
            h.set(h.get() + 1)
        }));

        std::thread::sleep(Duration::from_millis(6));
        poller.run_once().unwrap();
        poller.run_once().unwrap();
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn test_timer_armed_from_callback_waits_for_next_iteration() {
        let poller = Poller::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let chained: Rc<RefCell<Option<TimerToken>>> = Rc::new(RefCell::new(None));

        let p = poller.clone();
        let o = order.clone();
        let stash = chained.clone();
        let _t = poller.add_timer(Duration::from_millis(1), move || {
            o.borrow_mut().push("outer");
            let o2 = o.clone();
            *stash.borrow_mut() = Some(
                p.add_timer(Duration::from_millis(0), move || o2.borrow_mut().push("inner")),
            );
        });

        poller.run_once().unwrap();
        assert_eq!(&*order.borrow(), &["outer"]);
        poller.run_once().unwrap();
        assert_eq!(&*order.borrow(), &["outer", "inner"]);
    }

    #[test]
    fn test_fd_readability_dispatch() {
        use std::net::UdpSocket;
        use std::os::unix::io::AsRawFd;

        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver.set_nonblocking(true).unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();

        let poller = Poller::new();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let _watch = poller.add_fd_in(receiver.as_raw_fd(), move || h.set(h.get() + 1));

        sender
            .send_to(b"ping", receiver.local_addr().unwrap())
            .unwrap();
        assert_eq!(poller.run_once().unwrap(), 1);
        assert_eq!(hits.get(), 1);

        // Drain so the next iteration has nothing to report.
        let mut buf = [0u8; 16];
        receiver.recv_from(&mut buf).unwrap();

        let _guard = poller.add_timer(Duration::from_millis(2), || {});
        assert_eq!(poller.run_once().unwrap(), 1); // only the timer
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_timers_dispatch_before_fd_events() {
        use std::net::UdpSocket;
        use std::os::unix::io::AsRawFd;

        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver.set_nonblocking(true).unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender
            .send_to(b"ping", receiver.local_addr().unwrap())
            .unwrap();

        let poller = Poller::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        let _watch = poller.add_fd_in(receiver.as_raw_fd(), move || o.borrow_mut().push("fd"));
        let o = order.clone();
        let _timer = poller.add_timer(Duration::from_millis(1), move || o.borrow_mut().push("timer"));

        std::thread::sleep(Duration::from_millis(4));
        poller.run_once().unwrap();
        assert_eq!(&*order.borrow(), &["timer", "fd"]);
    }
}
