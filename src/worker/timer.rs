//! Deadline queue driving all periodic and one-shot scheduled work.

use futures_util::Stream;
use std::{
    collections::BTreeMap,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, Instant},
};
use tokio::time::{self, Sleep};

#[derive(Clone, Copy, Ord, PartialOrd, Eq, PartialEq)]
pub(crate) struct Timeout {
    deadline: Instant,
    id: u64,
}

/// Stream of scheduled values, yielded in deadline order. Yields `None` when
/// no timeouts are scheduled, so callers must guard with `is_empty`.
pub(crate) struct Timer<T> {
    next_id: u64,
    current: Option<CurrentEntry<T>>,
    queue: BTreeMap<Timeout, T>,
}

impl<T> Timer<T> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            current: None,
            queue: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.queue.is_empty()
    }

    pub fn schedule_in(&mut self, after: Duration, value: T) -> Timeout {
        self.schedule_at(Instant::now() + after, value)
    }

    pub fn schedule_at(&mut self, deadline: Instant, value: T) -> Timeout {
        // An armed sleep later than the new deadline goes back into the
        // queue, otherwise the new entry would only fire after it.
        if let Some(current) = &self.current {
            let key = current.key();

            if deadline < key.deadline {
                let CurrentEntry { value, .. } = self.current.take().unwrap();
                self.queue.insert(key, value);
            }
        }

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let key = Timeout { deadline, id };
        self.queue.insert(key, value);

        key
    }

    pub fn cancel(&mut self, timeout: Timeout) -> bool {
        if let Some(current) = &self.current {
            if current.key() == timeout {
                self.current = None;
                return true;
            }
        }

        self.queue.remove(&timeout).is_some()
    }
}

impl<T: Unpin> Stream for Timer<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(current) = &mut self.current {
                match current.sleep.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        let CurrentEntry { value, .. } = self.current.take().unwrap();
                        return Poll::Ready(Some(value));
                    }
                    Poll::Pending => return Poll::Pending,
                }
            }

            let (key, value) = match self.queue.pop_first() {
                Some(entry) => entry,
                None => return Poll::Ready(None),
            };

            self.current = Some(CurrentEntry {
                sleep: Box::pin(time::sleep_until(key.deadline.into())),
                value,
                id: key.id,
            });
        }
    }
}

struct CurrentEntry<T> {
    sleep: Pin<Box<Sleep>>,
    value: T,
    id: u64,
}

impl<T> CurrentEntry<T> {
    fn key(&self) -> Timeout {
        Timeout {
            deadline: self.sleep.deadline().into_std(),
            id: self.id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn positive_yields_in_deadline_order() {
        let mut timer = Timer::new();
        let start = Instant::now();

        timer.schedule_at(start + Duration::from_millis(20), 'b');
        timer.schedule_at(start + Duration::from_millis(10), 'a');
        timer.schedule_at(start + Duration::from_millis(30), 'c');

        assert_eq!(timer.next().await, Some('a'));
        assert_eq!(timer.next().await, Some('b'));
        assert_eq!(timer.next().await, Some('c'));
        assert!(timer.is_empty());
    }

    #[tokio::test]
    async fn positive_earlier_entry_preempts_armed_sleep() {
        let mut timer = Timer::new();
        let start = Instant::now();

        timer.schedule_at(start + Duration::from_millis(50), 'b');

        // Arm the sleep for 'b', then schedule something earlier.
        futures_util::future::poll_fn(|cx| {
            let _ = Pin::new(&mut timer).poll_next(cx);
            Poll::Ready(())
        })
        .await;
        timer.schedule_at(start + Duration::from_millis(10), 'a');

        assert_eq!(timer.next().await, Some('a'));
        assert_eq!(timer.next().await, Some('b'));
    }

    #[tokio::test]
    async fn positive_cancel_removes_entry() {
        let mut timer = Timer::new();

        let timeout = timer.schedule_in(Duration::from_millis(10), 'a');
        timer.schedule_in(Duration::from_millis(20), 'b');

        assert!(timer.cancel(timeout));
        assert_eq!(timer.next().await, Some('b'));
    }
}
