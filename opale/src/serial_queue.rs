//! An ordered container of `(serial, value)` pairs.
//!
//! `SerialQueue` is the universal mechanism for tying a piece of work to "when
//! the GPU has finished it": producers push at the queue's pending submit
//! serial, consumers drain everything up to the completed serial reported by
//! the queue timeline semaphore.

use std::collections::VecDeque;

/// FIFO of values keyed by a monotonically non-decreasing serial.
#[derive(Debug)]
pub(crate) struct SerialQueue<T> {
    entries: VecDeque<(u64, T)>,
}

impl<T> Default for SerialQueue<T> {
    fn default() -> Self {
        SerialQueue {
            entries: VecDeque::new(),
        }
    }
}

impl<T> SerialQueue<T> {
    pub(crate) fn new() -> SerialQueue<T> {
        Default::default()
    }

    /// Pushes a value. `serial` must not be smaller than the last pushed serial.
    pub(crate) fn push(&mut self, serial: u64, value: T) {
        debug_assert!(
            self.entries.back().map_or(true, |&(last, _)| serial >= last),
            "serials must be pushed in non-decreasing order"
        );
        self.entries.push_back((serial, value));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn first_serial(&self) -> Option<u64> {
        self.entries.front().map(|&(s, _)| s)
    }

    pub(crate) fn last_serial(&self) -> Option<u64> {
        self.entries.back().map(|&(s, _)| s)
    }

    /// Iterates over values with serial <= `serial`, in push order.
    pub(crate) fn iter_up_to(&self, serial: u64) -> impl Iterator<Item = &T> {
        self.entries
            .iter()
            .take_while(move |&&(s, _)| s <= serial)
            .map(|(_, v)| v)
    }

    /// Removes the prefix with serial <= `serial`.
    pub(crate) fn clear_up_to(&mut self, serial: u64) {
        while self
            .entries
            .front()
            .map_or(false, |&(s, _)| s <= serial)
        {
            self.entries.pop_front();
        }
    }

    /// Removes and returns the prefix with serial <= `serial`.
    pub(crate) fn drain_up_to(&mut self, serial: u64) -> Vec<T> {
        let mut drained = Vec::new();
        while self
            .entries
            .front()
            .map_or(false, |&(s, _)| s <= serial)
        {
            let (_, value) = self.entries.pop_front().unwrap();
            drained.push(value);
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_iterate_prefix() {
        let mut q = SerialQueue::new();
        q.push(1, "a");
        q.push(1, "b");
        q.push(3, "c");
        q.push(7, "d");

        let up_to_3: Vec<_> = q.iter_up_to(3).copied().collect();
        assert_eq!(up_to_3, ["a", "b", "c"]);
        let up_to_0: Vec<_> = q.iter_up_to(0).copied().collect();
        assert!(up_to_0.is_empty());

        assert_eq!(q.first_serial(), Some(1));
        assert_eq!(q.last_serial(), Some(7));
    }

    #[test]
    fn clear_removes_only_prefix() {
        let mut q = SerialQueue::new();
        q.push(2, 20);
        q.push(4, 40);
        q.push(4, 41);
        q.push(9, 90);

        q.clear_up_to(4);
        assert_eq!(q.first_serial(), Some(9));

        q.clear_up_to(u64::MAX);
        assert!(q.is_empty());
        assert_eq!(q.first_serial(), None);
    }

    #[test]
    fn drain_returns_values_in_order() {
        let mut q = SerialQueue::new();
        q.push(1, 1);
        q.push(2, 2);
        q.push(5, 5);
        assert_eq!(q.drain_up_to(2), vec![1, 2]);
        assert_eq!(q.drain_up_to(2), Vec::<i32>::new());
        assert_eq!(q.drain_up_to(5), vec![5]);
    }
}
