// minimal locked core of the queue. the exposed API is a convenience wrapper
// around this.

use super::{
    error::ShutdownError,
    strategy::{OverflowStrategy, PendingOffer, SurplusOutcome},
};
use crate::util::{
    oneshot::OneShot,
    ring::RingBuffer,
};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        Arc, Mutex,
    },
    task::{Context, Poll},
};


// handle to queue shared state.
pub(crate) struct Core<T>(Arc<Shared<T>>);

struct Shared<T> {
    // mutex around lockable state.
    lockable: Mutex<Lockable<T>>,
    // set exactly once, under the lock, by shutdown. reads outside the lock
    // are a fast path only; authoritative checks happen while locked.
    is_shutdown: AtomicBool,
    // settles when shutdown runs; observed by await_shutdown.
    shutdown_hook: OneShot<()>,
}

struct Lockable<T> {
    // element storage.
    buffer: RingBuffer<T>,
    // parked take futures in arrival order.
    takers: VecDeque<Arc<OneShot<T>>>,
    // overflow behavior once the buffer is full.
    strategy: OverflowStrategy<T>,
}

// how a take operation started.
pub(crate) enum TakeStart<T> {
    Ready(Result<T, ShutdownError>),
    Parked(Arc<OneShot<T>>),
}

// how an offer operation started.
pub(crate) enum OfferStart<T> {
    Ready(Result<bool, ShutdownError>),
    Parked(Arc<PendingOffer<T>>),
}

impl<T> Core<T> {
    pub(crate) fn new(buffer: RingBuffer<T>, strategy: OverflowStrategy<T>) -> Self {
        Core(Arc::new(Shared {
            lockable: Mutex::new(Lockable {
                buffer,
                takers: VecDeque::new(),
                strategy,
            }),
            is_shutdown: AtomicBool::new(false),
            shutdown_hook: OneShot::new(),
        }))
    }

    pub(crate) fn clone(&self) -> Self {
        Core(Arc::clone(&self.0))
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.0.is_shutdown.load(Relaxed)
    }

    // begin a take: pop the buffer, or park a one-shot in the takers queue.
    pub(crate) fn take_start(&self) -> TakeStart<T> {
        if self.is_shutdown() {
            return TakeStart::Ready(Err(ShutdownError));
        }
        let mut lock = self.0.lockable.lock().unwrap();
        if self.is_shutdown() {
            return TakeStart::Ready(Err(ShutdownError));
        }
        if let Some(elem) = lock.take_one() {
            TakeStart::Ready(Ok(elem))
        } else {
            let taker = Arc::new(OneShot::new());
            lock.takers.push_back(Arc::clone(&taker));
            TakeStart::Parked(taker)
        }
    }

    // non-suspending take.
    pub(crate) fn try_take(&self) -> Result<Option<T>, ShutdownError> {
        if self.is_shutdown() {
            return Err(ShutdownError);
        }
        let mut lock = self.0.lockable.lock().unwrap();
        if self.is_shutdown() {
            return Err(ShutdownError);
        }
        Ok(lock.take_one())
    }

    // begin an offer: hand the element to a parked taker, buffer it, or let
    // the strategy place the surplus.
    pub(crate) fn offer_start(&self, item: T) -> OfferStart<T> {
        if self.is_shutdown() {
            return OfferStart::Ready(Err(ShutdownError));
        }
        let mut lock = self.0.lockable.lock().unwrap();
        if self.is_shutdown() {
            return OfferStart::Ready(Err(ShutdownError));
        }
        let lockable = &mut *lock;
        let item = match lockable.deliver_to_taker(item) {
            None => return OfferStart::Ready(Ok(true)),
            Some(item) => item,
        };
        match lockable.buffer.offer(item) {
            Ok(()) => OfferStart::Ready(Ok(true)),
            Err(item) => match lockable.strategy.handle_surplus(vec![item], &mut lockable.buffer) {
                SurplusOutcome::Resolved(accepted) => OfferStart::Ready(Ok(accepted)),
                SurplusOutcome::Parked(entry) => OfferStart::Parked(entry),
            },
        }
    }

    // begin a batched offer: parked takers are satisfied first, in arrival
    // order, then the buffer fills, then the strategy places any surplus.
    pub(crate) fn offer_all_start(&self, items: Vec<T>) -> OfferStart<T> {
        if self.is_shutdown() {
            return OfferStart::Ready(Err(ShutdownError));
        }
        let mut lock = self.0.lockable.lock().unwrap();
        if self.is_shutdown() {
            return OfferStart::Ready(Err(ShutdownError));
        }
        let lockable = &mut *lock;
        let mut items = VecDeque::from(items);
        while let Some(item) = items.pop_front() {
            if let Some(item) = lockable.deliver_to_taker(item) {
                items.push_front(item);
                break;
            }
        }
        while !lockable.buffer.is_full() {
            let Some(item) = items.pop_front() else { break };
            let _ = lockable.buffer.offer(item);
        }
        if items.is_empty() {
            return OfferStart::Ready(Ok(true));
        }
        match lockable.strategy.handle_surplus(items.into(), &mut lockable.buffer) {
            SurplusOutcome::Resolved(accepted) => OfferStart::Ready(Ok(accepted)),
            SurplusOutcome::Parked(entry) => OfferStart::Parked(entry),
        }
    }

    // drain the whole buffer (parked surplus stays parked until space opens).
    pub(crate) fn take_all(&self) -> Result<Vec<T>, ShutdownError> {
        if self.is_shutdown() {
            return Err(ShutdownError);
        }
        let mut lock = self.0.lockable.lock().unwrap();
        if self.is_shutdown() {
            return Err(ShutdownError);
        }
        let lockable = &mut *lock;
        let drained = lockable.buffer.drain_all();
        lockable.strategy.on_empty_space(&mut lockable.buffer);
        Ok(drained)
    }

    // drain at most n buffered elements.
    pub(crate) fn take_up_to(&self, n: usize) -> Result<Vec<T>, ShutdownError> {
        if self.is_shutdown() {
            return Err(ShutdownError);
        }
        let mut lock = self.0.lockable.lock().unwrap();
        if self.is_shutdown() {
            return Err(ShutdownError);
        }
        let lockable = &mut *lock;
        let drained = lockable.buffer.drain_up_to(n);
        if !drained.is_empty() {
            lockable.strategy.on_empty_space(&mut lockable.buffer);
        }
        Ok(drained)
    }

    // buffered count, minus parked takers, plus parked surplus. negative
    // when more takers are parked than elements were ever offered.
    pub(crate) fn size(&self) -> isize {
        let lock = self.0.lockable.lock().unwrap();
        lock.buffer.len() as isize - lock.takers.len() as isize
            + lock.strategy.surplus() as isize
    }

    pub(crate) fn capacity(&self) -> Option<usize> {
        self.0.lockable.lock().unwrap().buffer.capacity()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.lockable.lock().unwrap().buffer.is_empty()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.0.lockable.lock().unwrap().buffer.is_full()
    }

    // shut the queue down: interrupt every parked taker and offerer, discard
    // buffered elements, settle the shutdown hook. idempotent.
    pub(crate) fn shutdown(&self) {
        let mut lock = self.0.lockable.lock().unwrap();
        if self.0.is_shutdown.swap(true, Relaxed) {
            return;
        }
        debug!("queue shutting down");
        for taker in lock.takers.drain(..) {
            taker.interrupt();
        }
        lock.strategy.purge();
        drop(lock.buffer.drain_all());
        drop(lock);
        let _ = self.0.shutdown_hook.complete(());
    }

    pub(crate) fn poll_await_shutdown(&self, cx: &mut Context) -> Poll<()> {
        self.0.shutdown_hook.poll_settled(cx)
    }

    // a parked take future was dropped: unpark it, and re-home a value that
    // raced with completion rather than lose it.
    pub(crate) fn cancel_take(&self, taker: &Arc<OneShot<T>>) {
        let mut lock = self.0.lockable.lock().unwrap();
        if let Some(idx) = lock.takers.iter().position(|t| Arc::ptr_eq(t, taker)) {
            lock.takers.remove(idx);
        }
        if let Some(value) = taker.recover() {
            let mut value = Some(value);
            while let Some(next) = lock.takers.pop_front() {
                match next.complete(value.take().unwrap()) {
                    Ok(()) => break,
                    Err(back) => value = Some(back),
                }
            }
            if let Some(value) = value {
                lock.buffer.push_front(value);
            }
        }
    }

    // a parked offer future was dropped: remove its pending entry.
    pub(crate) fn cancel_offer(&self, entry: &Arc<PendingOffer<T>>) {
        let mut lock = self.0.lockable.lock().unwrap();
        lock.strategy.cancel(entry);
    }
}

impl<T> Lockable<T> {
    // pop one element and let the strategy refill the freed slot.
    fn take_one(&mut self) -> Option<T> {
        let elem = self.buffer.poll()?;
        self.strategy.on_empty_space(&mut self.buffer);
        Some(elem)
    }

    // hand an element directly to the longest-parked taker, bypassing the
    // buffer. returns the element back if no taker accepts it.
    fn deliver_to_taker(&mut self, item: T) -> Option<T> {
        let mut item = Some(item);
        while let Some(taker) = self.takers.pop_front() {
            match taker.complete(item.take().unwrap()) {
                Ok(()) => return None,
                // settled concurrently by a racing cancel; try the next one
                Err(back) => item = Some(back),
            }
        }
        item
    }
}
