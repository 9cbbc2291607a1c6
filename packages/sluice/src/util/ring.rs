//! FIFO element buffer owned by the queue mutex.

use std::collections::VecDeque;


/// FIFO buffer with an optional capacity.
///
/// Not internally synchronized: a `RingBuffer` is always owned by whichever
/// lock guards the structure embedding it. The capacity is advisory in one
/// direction only: [`offer`](Self::offer) refuses elements beyond it, but
/// [`push_front`](Self::push_front) may transiently exceed it while surplus
/// elements are being re-homed.
pub struct RingBuffer<T> {
    elems: VecDeque<T>,
    /// maximum length enforced by `offer`, unless unbounded
    bound: Option<usize>,
}

impl<T> RingBuffer<T> {
    /// Construct empty with a maximum length.
    pub fn bounded(capacity: usize) -> Self {
        RingBuffer {
            elems: VecDeque::with_capacity(capacity.min(1024)),
            bound: Some(capacity),
        }
    }

    /// Construct empty with no maximum length.
    pub fn unbounded() -> Self {
        RingBuffer { elems: VecDeque::new(), bound: None }
    }

    /// Maximum length, or `None` if unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.bound
    }

    /// Elements in buffer.
    pub fn len(&self) -> usize {
        self.elems.len()
    }

    /// Whether no elements are buffered.
    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    /// Whether the buffer is at (or beyond) capacity. Always false if unbounded.
    pub fn is_full(&self) -> bool {
        self.bound.is_some_and(|n| self.elems.len() >= n)
    }

    /// Push to back, unless the buffer is full, in which case the element is
    /// handed back.
    pub fn offer(&mut self, elem: T) -> Result<(), T> {
        if self.is_full() {
            Err(elem)
        } else {
            self.elems.push_back(elem);
            Ok(())
        }
    }

    /// Pop from front.
    pub fn poll(&mut self) -> Option<T> {
        self.elems.pop_front()
    }

    /// Re-insert at the front, ignoring capacity.
    pub fn push_front(&mut self, elem: T) {
        self.elems.push_front(elem);
    }

    /// Drain every element in FIFO order.
    pub fn drain_all(&mut self) -> Vec<T> {
        self.elems.drain(..).collect()
    }

    /// Drain at most `n` elements in FIFO order.
    pub fn drain_up_to(&mut self, n: usize) -> Vec<T> {
        let n = n.min(self.elems.len());
        self.elems.drain(..n).collect()
    }
}
