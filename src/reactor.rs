/*
 * Copyright (C) 2025-2026 Aerys Contributors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use slab::Slab;
use std::cell::{Cell, RefCell};
use std::cmp;
use std::collections::BTreeSet;
use std::io;
use std::rc::{Rc, Weak};
use std::task::Waker;
use std::time::{Duration, Instant};

thread_local! {
    static REACTOR: RefCell<Option<Weak<ReactorData>>> = RefCell::new(None);
}

const READ_SLOT: usize = 0;
const WRITE_SLOT: usize = 1;

struct EventRegistration {
    ready: [bool; 2],
    wakers: [Option<Waker>; 2],
}

struct TimerEntry {
    expires: Instant,
    ready: bool,
    waker: Option<Waker>,
}

struct ReactorData {
    registrations: RefCell<Slab<EventRegistration>>,
    timers: RefCell<Slab<TimerEntry>>,
    timer_index: RefCell<BTreeSet<(Instant, usize)>>,
    poll: RefCell<mio::Poll>,
    events: RefCell<mio::Events>,
    current_time: Cell<Instant>,
}

// single-threaded poll loop over socket readiness and timers. there is
// one reactor per thread, installed by new() and discoverable via
// current()
pub struct Reactor {
    data: Rc<ReactorData>,
}

impl Reactor {
    pub fn new(registrations_max: usize) -> Self {
        Self::new_with_time(registrations_max, Instant::now())
    }

    pub fn new_with_time(registrations_max: usize, start: Instant) -> Self {
        let data = Rc::new(ReactorData {
            registrations: RefCell::new(Slab::with_capacity(registrations_max)),
            timers: RefCell::new(Slab::with_capacity(registrations_max)),
            timer_index: RefCell::new(BTreeSet::new()),
            poll: RefCell::new(mio::Poll::new().unwrap()),
            events: RefCell::new(mio::Events::with_capacity(1024)),
            current_time: Cell::new(start),
        });

        REACTOR.with(|r| {
            if r.borrow().is_some() {
                panic!("thread already has a Reactor");
            }

            r.replace(Some(Rc::downgrade(&data)));
        });

        Self { data }
    }

    pub fn current() -> Option<Self> {
        REACTOR.with(|r| {
            (*r.borrow()).as_ref().map(|data| Self {
                data: data.upgrade().expect("reactor dropped"),
            })
        })
    }

    pub fn now(&self) -> Instant {
        self.data.current_time.get()
    }

    pub fn register<S>(
        &self,
        source: &mut S,
        interest: mio::Interest,
    ) -> Result<Registration, io::Error>
    where
        S: mio::event::Source + ?Sized,
    {
        let registrations = &mut *self.data.registrations.borrow_mut();

        if registrations.len() == registrations.capacity() {
            return Err(io::Error::from(io::ErrorKind::WriteZero));
        }

        let key = registrations.insert(EventRegistration {
            ready: [false; 2],
            wakers: [None, None],
        });

        if let Err(e) =
            self.data
                .poll
                .borrow()
                .registry()
                .register(source, mio::Token(key), interest)
        {
            registrations.remove(key);

            return Err(e);
        }

        Ok(Registration {
            data: Rc::clone(&self.data),
            key,
        })
    }

    pub fn register_timer(&self, expires: Instant) -> Result<TimerRegistration, io::Error> {
        let timers = &mut *self.data.timers.borrow_mut();

        if timers.len() == timers.capacity() {
            return Err(io::Error::from(io::ErrorKind::WriteZero));
        }

        let key = timers.insert(TimerEntry {
            expires,
            ready: false,
            waker: None,
        });

        self.data.timer_index.borrow_mut().insert((expires, key));

        Ok(TimerRegistration {
            data: Rc::clone(&self.data),
            key,
        })
    }

    // block until an event or timer fires
    pub fn poll(&self) -> Result<(), io::Error> {
        self.poll_inner(None)
    }

    // process whatever is already pending, moving the clock forward to
    // the given time. used by tests to step deterministically
    pub fn poll_nonblocking(&self, advance_to: Instant) -> Result<(), io::Error> {
        self.poll_inner(Some(advance_to))
    }

    fn poll_inner(&self, advance_to: Option<Instant>) -> Result<(), io::Error> {
        let timeout = match advance_to {
            Some(_) => Some(Duration::from_millis(0)),
            None => {
                let index = self.data.timer_index.borrow();

                index.iter().next().map(|&(expires, _)| {
                    cmp::max(expires, self.now()).duration_since(self.now())
                })
            }
        };

        {
            let poll = &mut *self.data.poll.borrow_mut();
            let events = &mut *self.data.events.borrow_mut();

            match poll.poll(events, timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }

            let registrations = &mut *self.data.registrations.borrow_mut();

            for event in events.iter() {
                let key = usize::from(event.token());

                if let Some(reg) = registrations.get_mut(key) {
                    if event.is_readable() || event.is_read_closed() {
                        reg.ready[READ_SLOT] = true;

                        if let Some(waker) = reg.wakers[READ_SLOT].take() {
                            waker.wake();
                        }
                    }

                    if event.is_writable() || event.is_write_closed() {
                        reg.ready[WRITE_SLOT] = true;

                        if let Some(waker) = reg.wakers[WRITE_SLOT].take() {
                            waker.wake();
                        }
                    }
                }
            }
        }

        let now = match advance_to {
            Some(t) => cmp::max(t, self.data.current_time.get()),
            None => Instant::now(),
        };

        self.data.current_time.set(now);

        self.process_timers(now);

        Ok(())
    }

    fn process_timers(&self, now: Instant) {
        loop {
            let key = {
                let index = &mut *self.data.timer_index.borrow_mut();

                match index.iter().next().copied() {
                    Some((expires, key)) if expires <= now => {
                        index.remove(&(expires, key));

                        key
                    }
                    _ => break,
                }
            };

            let timers = &mut *self.data.timers.borrow_mut();

            let t = &mut timers[key];
            t.ready = true;

            if let Some(waker) = t.waker.take() {
                waker.wake();
            }
        }
    }
}

pub struct Registration {
    data: Rc<ReactorData>,
    key: usize,
}

impl Registration {
    pub fn is_ready(&self, interest: mio::Interest) -> bool {
        let registrations = &*self.data.registrations.borrow();

        let reg = &registrations[self.key];

        (interest.is_readable() && reg.ready[READ_SLOT])
            || (interest.is_writable() && reg.ready[WRITE_SLOT])
    }

    pub fn set_ready(&self, interest: mio::Interest, ready: bool) {
        let registrations = &mut *self.data.registrations.borrow_mut();

        let reg = &mut registrations[self.key];

        if interest.is_readable() {
            reg.ready[READ_SLOT] = ready;
        }

        if interest.is_writable() {
            reg.ready[WRITE_SLOT] = ready;
        }
    }

    pub fn set_waker(&self, waker: &Waker, interest: mio::Interest) {
        let registrations = &mut *self.data.registrations.borrow_mut();

        let reg = &mut registrations[self.key];

        if interest.is_readable() {
            reg.wakers[READ_SLOT] = Some(waker.clone());
        }

        if interest.is_writable() {
            reg.wakers[WRITE_SLOT] = Some(waker.clone());
        }
    }

    pub fn clear_waker(&self, interest: mio::Interest) {
        let registrations = &mut *self.data.registrations.borrow_mut();

        let reg = &mut registrations[self.key];

        if interest.is_readable() {
            reg.wakers[READ_SLOT] = None;
        }

        if interest.is_writable() {
            reg.wakers[WRITE_SLOT] = None;
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.data.registrations.borrow_mut().remove(self.key);
    }
}

pub struct TimerRegistration {
    data: Rc<ReactorData>,
    key: usize,
}

impl TimerRegistration {
    pub fn expires(&self) -> Instant {
        self.data.timers.borrow()[self.key].expires
    }

    pub fn set_expires(&self, expires: Instant) {
        let timers = &mut *self.data.timers.borrow_mut();
        let index = &mut *self.data.timer_index.borrow_mut();

        let t = &mut timers[self.key];

        index.remove(&(t.expires, self.key));
        t.expires = expires;
        t.ready = false;
        index.insert((expires, self.key));
    }

    pub fn is_ready(&self) -> bool {
        self.data.timers.borrow()[self.key].ready
    }

    pub fn set_waker(&self, waker: &Waker) {
        self.data.timers.borrow_mut()[self.key].waker = Some(waker.clone());
    }

    pub fn clear_waker(&self) {
        self.data.timers.borrow_mut()[self.key].waker = None;
    }
}

impl Drop for TimerRegistration {
    fn drop(&mut self) {
        let timers = &mut *self.data.timers.borrow_mut();

        let t = timers.remove(self.key);

        self.data
            .timer_index
            .borrow_mut()
            .remove(&(t.expires, self.key));
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        REACTOR.with(|r| {
            if Rc::strong_count(&self.data) == 1 {
                r.replace(None);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_timer_fires_in_order() {
        let now = Instant::now();

        let reactor = Reactor::new_with_time(4, now);

        let t1 = reactor
            .register_timer(now + Duration::from_millis(20))
            .unwrap();
        let t2 = reactor
            .register_timer(now + Duration::from_millis(10))
            .unwrap();

        reactor
            .poll_nonblocking(now + Duration::from_millis(15))
            .unwrap();

        assert!(!t1.is_ready());
        assert!(t2.is_ready());

        reactor
            .poll_nonblocking(now + Duration::from_millis(25))
            .unwrap();

        assert!(t1.is_ready());
    }

    #[test]
    fn test_timer_reschedule() {
        let now = Instant::now();

        let reactor = Reactor::new_with_time(4, now);

        let t = reactor
            .register_timer(now + Duration::from_millis(10))
            .unwrap();

        t.set_expires(now + Duration::from_millis(50));

        reactor
            .poll_nonblocking(now + Duration::from_millis(20))
            .unwrap();

        assert!(!t.is_ready());

        reactor
            .poll_nonblocking(now + Duration::from_millis(60))
            .unwrap();

        assert!(t.is_ready());
    }

    #[test]
    fn test_current() {
        assert!(Reactor::current().is_none());

        let reactor = Reactor::new(4);

        assert!(Reactor::current().is_some());

        drop(reactor);

        assert!(Reactor::current().is_none());
    }
}
