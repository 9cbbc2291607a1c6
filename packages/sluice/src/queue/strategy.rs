// overflow strategies: what happens to surplus elements when the buffer is
// full.

use super::error::ShutdownError;
use crate::util::ring::RingBuffer;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    task::{Context, Poll, Waker},
};


// closed set of overflow behaviors. selected at construction and fixed for
// the queue's lifetime.
pub(crate) enum OverflowStrategy<T> {
    // producers park until space frees, in arrival order.
    Backpressure {
        // parked offer batches in arrival order.
        pending: VecDeque<Arc<PendingOffer<T>>>,
        // total elements across parked batches.
        surplus: usize,
    },
    // surplus is discarded and the offer resolves false.
    Dropping,
    // the oldest buffered element is evicted to make room.
    Sliding,
    // the buffer has no capacity bound, so surplus cannot occur.
    Unbounded,
}

// what became of a surplus handed to the strategy.
pub(crate) enum SurplusOutcome<T> {
    // resolved immediately with the given offer result.
    Resolved(bool),
    // parked; the offer future waits on this entry.
    Parked(Arc<PendingOffer<T>>),
}

impl<T> OverflowStrategy<T> {
    pub(crate) fn backpressure() -> Self {
        OverflowStrategy::Backpressure { pending: VecDeque::new(), surplus: 0 }
    }

    // place surplus elements that did not fit in the buffer.
    pub(crate) fn handle_surplus(
        &mut self,
        items: Vec<T>,
        buffer: &mut RingBuffer<T>,
    ) -> SurplusOutcome<T> {
        match self {
            OverflowStrategy::Backpressure { pending, surplus } => {
                trace!(parked = items.len(), "backpressure parking surplus");
                *surplus += items.len();
                let entry = Arc::new(PendingOffer::new(items));
                pending.push_back(Arc::clone(&entry));
                SurplusOutcome::Parked(entry)
            }
            OverflowStrategy::Dropping => {
                trace!(dropped = items.len(), "dropping surplus");
                SurplusOutcome::Resolved(false)
            }
            OverflowStrategy::Sliding => {
                for item in items {
                    if buffer.is_full() {
                        buffer.poll();
                    }
                    // a slot was just evicted (or the buffer has zero
                    // capacity, in which case the element falls through)
                    let _ = buffer.offer(item);
                }
                SurplusOutcome::Resolved(true)
            }
            OverflowStrategy::Unbounded => {
                // unreachable in practice: an unbounded buffer never refuses
                for item in items {
                    let _ = buffer.offer(item);
                }
                SurplusOutcome::Resolved(true)
            }
        }
    }

    // buffer space opened up: move as many parked elements as now fit,
    // completing parked offers in arrival order.
    pub(crate) fn on_empty_space(&mut self, buffer: &mut RingBuffer<T>) {
        let OverflowStrategy::Backpressure { pending, surplus } = self else { return };
        while !buffer.is_full() {
            let Some(front) = pending.front() else { break };
            if front.move_into(buffer, surplus) {
                pending.pop_front();
            } else {
                // buffer filled again before the batch emptied
                break;
            }
        }
    }

    // elements currently parked.
    pub(crate) fn surplus(&self) -> usize {
        match self {
            OverflowStrategy::Backpressure { surplus, .. } => *surplus,
            _ => 0,
        }
    }

    // remove a parked entry whose offer future was dropped. elements of the
    // batch already moved into the buffer stay there.
    pub(crate) fn cancel(&mut self, entry: &Arc<PendingOffer<T>>) {
        let OverflowStrategy::Backpressure { pending, surplus } = self else { return };
        if let Some(idx) = pending.iter().position(|e| Arc::ptr_eq(e, entry)) {
            pending.remove(idx);
            *surplus -= entry.abandon();
        }
    }

    // shutdown: interrupt every parked offer.
    pub(crate) fn purge(&mut self) {
        let OverflowStrategy::Backpressure { pending, surplus } = self else { return };
        for entry in pending.drain(..) {
            entry.interrupt();
        }
        *surplus = 0;
    }
}


// a batch of elements parked by the backpressure strategy, shared between the
// strategy (which drains it as space frees) and the offer future (which polls
// it). its own lock nests inside the queue lock.
pub(crate) struct PendingOffer<T> {
    state: Mutex<PendingState<T>>,
}

struct PendingState<T> {
    // elements not yet moved into the buffer, in offer order.
    items: VecDeque<T>,
    // waker of the parked offer future.
    waker: Option<Waker>,
    // set once the whole batch is buffered, or shutdown interrupts it.
    result: Option<Result<(), ShutdownError>>,
}

impl<T> PendingOffer<T> {
    fn new(items: Vec<T>) -> Self {
        PendingOffer {
            state: Mutex::new(PendingState {
                items: items.into(),
                waker: None,
                result: None,
            }),
        }
    }

    // move elements into the buffer while it has room. returns whether the
    // batch emptied, in which case the parked future is resolved and woken.
    fn move_into(&self, buffer: &mut RingBuffer<T>, surplus: &mut usize) -> bool {
        let mut state = self.state.lock().unwrap();
        while !buffer.is_full() {
            let Some(item) = state.items.pop_front() else { break };
            *surplus -= 1;
            let _ = buffer.offer(item);
        }
        if state.items.is_empty() {
            state.result = Some(Ok(()));
            if let Some(waker) = state.waker.take() {
                drop(state);
                waker.wake();
            }
            true
        } else {
            false
        }
    }

    // drop remaining elements; returns how many were abandoned.
    fn abandon(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        let abandoned = state.items.len();
        state.items.clear();
        abandoned
    }

    fn interrupt(&self) {
        let mut state = self.state.lock().unwrap();
        state.items.clear();
        state.result = Some(Err(ShutdownError));
        if let Some(waker) = state.waker.take() {
            drop(state);
            waker.wake();
        }
    }

    pub(crate) fn poll(&self, cx: &mut Context) -> Poll<Result<(), ShutdownError>> {
        let mut state = self.state.lock().unwrap();
        if let Some(result) = state.result {
            Poll::Ready(result)
        } else {
            if !state.waker.as_ref().is_some_and(|w| w.will_wake(cx.waker())) {
                state.waker = Some(cx.waker().clone());
            }
            Poll::Pending
        }
    }
}
