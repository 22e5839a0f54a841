use crate::sys;

use super::{Ready, Token};

/// One readiness event: the token it was registered with and the set of
/// readiness bits the kernel reported.
#[derive(Copy, Clone, Debug)]
pub struct Event {
    readiness: Ready,
    token: Token,
}

impl Event {
    pub(crate) fn new(readiness: Ready, token: Token) -> Event {
        Event { readiness, token }
    }

    pub fn readiness(&self) -> Ready {
        self.readiness
    }

    pub fn token(&self) -> Token {
        self.token
    }
}

/// A batch of events filled in by one `Epoll::wait` call.
pub struct Events {
    inner: sys::epoll::Events,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: sys::epoll::Events::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<Event> {
        self.inner.get(idx)
    }

    pub(crate) fn inner_mut(&mut self) -> &mut sys::epoll::Events {
        &mut self.inner
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter { events: self, pos: 0 }
    }
}

pub struct Iter<'a> {
    events: &'a Events,
    pos: usize,
}

impl Iterator for Iter<'_> {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        let ev = self.events.get(self.pos);
        if ev.is_some() {
            self.pos += 1;
        }
        ev
    }
}

impl<'a> IntoIterator for &'a Events {
    type Item = Event;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}
