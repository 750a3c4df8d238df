//! Timer queue driven after the script body completes

use std::time::{Duration, Instant};

/// A scheduled callback
#[derive(Debug, Clone)]
pub struct Timer<T> {
    pub id: u32,
    pub due: Instant,
    /// Period for `setInterval` timers
    pub repeat: Option<Duration>,
    pub callback: T,
    seq: u64,
}

/// Pending timers ordered by due time, FIFO on ties
#[derive(Debug)]
pub struct TimerQueue<T> {
    next_id: u32,
    next_seq: u64,
    timers: Vec<Timer<T>>,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self {
            next_id: 1,
            next_seq: 0,
            timers: Vec::new(),
        }
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a callback and return its id
    pub fn schedule(
        &mut self,
        callback: T,
        now: Instant,
        delay: Duration,
        repeat: Option<Duration>,
    ) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let seq = self.bump_seq();
        self.timers.push(Timer {
            id,
            due: now + delay,
            repeat,
            callback,
            seq,
        });
        id
    }

    /// Put an interval timer back with a new due time, keeping its id
    pub fn requeue(&mut self, mut timer: Timer<T>, due: Instant) {
        timer.due = due;
        timer.seq = self.bump_seq();
        self.timers.push(timer);
    }

    pub fn cancel(&mut self, id: u32) {
        self.timers.retain(|timer| timer.id != id);
    }

    /// Remove and return the timer that fires first
    pub fn pop_next(&mut self) -> Option<Timer<T>> {
        let index = self
            .timers
            .iter()
            .enumerate()
            .min_by_key(|(_, timer)| (timer.due, timer.seq))
            .map(|(index, _)| index)?;
        Some(self.timers.swap_remove(index))
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn clear(&mut self) {
        self.timers.clear();
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_order_by_due_time() {
        let now = Instant::now();
        let mut queue = TimerQueue::new();

        queue.schedule("late", now, Duration::from_millis(300), None);
        queue.schedule("early", now, Duration::from_millis(100), None);
        queue.schedule("middle", now, Duration::from_millis(200), None);

        let order: Vec<_> = std::iter::from_fn(|| queue.pop_next())
            .map(|t| t.callback)
            .collect();
        assert_eq!(order, vec!["early", "middle", "late"]);
    }

    #[test]
    fn test_ties_fire_in_schedule_order() {
        let now = Instant::now();
        let mut queue = TimerQueue::new();

        queue.schedule("a", now, Duration::ZERO, None);
        queue.schedule("b", now, Duration::ZERO, None);
        queue.schedule("c", now, Duration::ZERO, None);

        let order: Vec<_> = std::iter::from_fn(|| queue.pop_next())
            .map(|t| t.callback)
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cancel() {
        let now = Instant::now();
        let mut queue = TimerQueue::new();

        let first = queue.schedule("first", now, Duration::ZERO, None);
        queue.schedule("second", now, Duration::ZERO, None);
        queue.cancel(first);

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_next().unwrap().callback, "second");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_keeps_id() {
        let now = Instant::now();
        let mut queue = TimerQueue::new();
        let period = Duration::from_millis(100);

        let id = queue.schedule("tick", now, period, Some(period));
        let timer = queue.pop_next().unwrap();
        queue.requeue(timer, now + period * 2);

        let again = queue.pop_next().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.due, now + period * 2);
    }

    #[test]
    fn test_ids_are_unique() {
        let now = Instant::now();
        let mut queue = TimerQueue::new();

        let a = queue.schedule((), now, Duration::ZERO, None);
        let b = queue.schedule((), now, Duration::ZERO, None);
        assert_ne!(a, b);
        assert!(a > 0 && b > 0);
    }
}
