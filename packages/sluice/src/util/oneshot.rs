//! Exactly-once settlement cell shared between parked tasks and their
//! completers.

use std::{
    sync::Mutex,
    task::{Context, Poll, Waker},
};
use smallvec::SmallVec;


// marker for settlement by interruption rather than by value.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct Interrupted;

// one-shot cell. settles exactly once, with a value or an interruption, and
// wakes every waker parked on it at that moment.
pub(crate) struct OneShot<T> {
    state: Mutex<State<T>>,
}

enum State<T> {
    // not yet settled. wakers are woken on settlement.
    Pending(SmallVec<[Waker; 1]>),
    // settled with a value. the slot empties once the value is consumed.
    Complete(Option<T>),
    // settled by interruption.
    Interrupted,
}

impl<T> OneShot<T> {
    pub(crate) fn new() -> Self {
        OneShot { state: Mutex::new(State::Pending(SmallVec::new())) }
    }

    // settle with a value. the first settlement wins; a value arriving after
    // settlement is handed back to the caller.
    pub(crate) fn complete(&self, value: T) -> Result<(), T> {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            State::Pending(wakers) => {
                let wakers = std::mem::take(wakers);
                *state = State::Complete(Some(value));
                drop(state);
                for waker in wakers {
                    waker.wake();
                }
                Ok(())
            }
            State::Complete(_) | State::Interrupted => Err(value),
        }
    }

    // settle by interruption. no-op if already settled.
    pub(crate) fn interrupt(&self) {
        let mut state = self.state.lock().unwrap();
        if let State::Pending(wakers) = &mut *state {
            let wakers = std::mem::take(wakers);
            *state = State::Interrupted;
            drop(state);
            for waker in wakers {
                waker.wake();
            }
        }
    }

    // consume the settlement, parking the caller's waker while pending.
    //
    // panics if the value was already consumed: each cell has exactly one
    // consumer, which stops polling once it observes the value.
    pub(crate) fn poll_take(&self, cx: &mut Context) -> Poll<Result<T, Interrupted>> {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            State::Pending(wakers) => {
                push_waker(wakers, cx);
                Poll::Pending
            }
            State::Complete(slot) => {
                let value = slot.take()
                    .expect("one-shot polled after its value was consumed (internal bug)");
                Poll::Ready(Ok(value))
            }
            State::Interrupted => Poll::Ready(Err(Interrupted)),
        }
    }

    // observe settlement without consuming a value. any number of tasks may
    // wait this way.
    pub(crate) fn poll_settled(&self, cx: &mut Context) -> Poll<()> {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            State::Pending(wakers) => {
                push_waker(wakers, cx);
                Poll::Pending
            }
            State::Complete(_) | State::Interrupted => Poll::Ready(()),
        }
    }

    pub(crate) fn is_settled(&self) -> bool {
        !matches!(&*self.state.lock().unwrap(), State::Pending(_))
    }

    // take back a completed-but-unconsumed value. used when the consumer is
    // dropped after a completion it never observed, so the value can be
    // re-homed instead of lost.
    pub(crate) fn recover(&self) -> Option<T> {
        match &mut *self.state.lock().unwrap() {
            State::Complete(slot) => slot.take(),
            State::Pending(_) | State::Interrupted => None,
        }
    }
}

// park the waker unless an equivalent one is already parked.
fn push_waker(wakers: &mut SmallVec<[Waker; 1]>, cx: &mut Context) {
    if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
        wakers.push(cx.waker().clone());
    }
}
