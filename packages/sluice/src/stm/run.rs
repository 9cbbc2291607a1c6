// trampoline evaluation of the expression tree and the commit boundary.

use super::{
    expr::{dismantle, downcast, Cont, Control, Dynamic, Env, Node, Stm, StmValue},
    journal::{register_retry, unregister_retry, Journal},
    tref::Cell,
};
use crate::util::oneshot::OneShot;
use smallvec::SmallVec;
use std::{
    future::Future,
    marker::PhantomData,
    mem,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};


// outcome of evaluating a whole expression against one journal.
pub(crate) enum Exit {
    Success(Dynamic),
    Failure(Dynamic),
    Retry,
}

// suspended work while walking the tree.
enum Frame {
    // apply a continuation to the success value.
    OnSuccess(Cont),
    // handle either outcome.
    Fold { success: Cont, failure: Cont },
    // on failure or retry of the left side, restore the journal snapshot and
    // run the right side.
    OrElse { right: Node, saved: Journal },
    // leaving a provide_environment scope.
    RestoreEnv(Env),
}

// what the trampoline does next.
enum Step {
    Enter(Node),
    Success(Dynamic),
    Failure(Dynamic),
    Retried,
}

// evaluate the tree with an explicit frame stack: stack depth is constant in
// the nesting depth of the expression, which keeps ten-thousand-deep
// combinator chains off the native call stack.
pub(crate) fn eval(root: &Node, journal: &mut Journal, env: &Env) -> Exit {
    let mut stack: SmallVec<[Frame; 16]> = SmallVec::new();
    let mut env = env.clone();
    let mut step = Step::Enter(root.clone());
    loop {
        step = match step {
            Step::Enter(node) => match node {
                Node::Succeed(value) => Step::Success(value),
                Node::Fail(error) => Step::Failure(error),
                Node::Retry => Step::Retried,
                Node::Effect(effect) => match effect(journal, &env) {
                    Ok(value) => Step::Success(value),
                    Err(Control::Fail(error)) => Step::Failure(error),
                    Err(Control::Retry) => Step::Retried,
                },
                Node::FlatMap(inner, cont) => {
                    stack.push(Frame::OnSuccess(cont));
                    Step::Enter(unwrap_subtree(inner))
                }
                Node::Fold(inner, success, failure) => {
                    stack.push(Frame::Fold { success, failure });
                    Step::Enter(unwrap_subtree(inner))
                }
                Node::OrElse(left, right) => {
                    stack.push(Frame::OrElse {
                        right: unwrap_subtree(right),
                        saved: journal.snapshot(),
                    });
                    Step::Enter(unwrap_subtree(left))
                }
                Node::Provide(inner, provided) => {
                    stack.push(Frame::RestoreEnv(mem::replace(&mut env, provided)));
                    Step::Enter(unwrap_subtree(inner))
                }
            },
            Step::Success(value) => match stack.pop() {
                None => return Exit::Success(value),
                Some(Frame::OnSuccess(cont)) => Step::Enter(cont(value)),
                Some(Frame::Fold { success, .. }) => Step::Enter(success(value)),
                // left side succeeded; its journal stands. the unused right
                // side is collapsed iteratively like any other discarded tree
                Some(Frame::OrElse { right, .. }) => {
                    dismantle(right);
                    Step::Success(value)
                }
                Some(Frame::RestoreEnv(saved)) => {
                    env = saved;
                    Step::Success(value)
                }
            },
            Step::Failure(error) => match stack.pop() {
                None => return Exit::Failure(error),
                Some(Frame::OnSuccess(_)) => Step::Failure(error),
                Some(Frame::Fold { failure, .. }) => Step::Enter(failure(error)),
                Some(Frame::OrElse { right, saved }) => {
                    *journal = saved;
                    Step::Enter(right)
                }
                Some(Frame::RestoreEnv(saved)) => {
                    env = saved;
                    Step::Failure(error)
                }
            },
            Step::Retried => match stack.pop() {
                None => return Exit::Retry,
                // retry passes through everything except or_else
                Some(Frame::OnSuccess(_)) | Some(Frame::Fold { .. }) => Step::Retried,
                Some(Frame::OrElse { right, saved }) => {
                    *journal = saved;
                    Step::Enter(right)
                }
                Some(Frame::RestoreEnv(saved)) => {
                    env = saved;
                    Step::Retried
                }
            },
        };
    }
}

// take a subtree out of its Arc, cloning only when the tree is shared.
fn unwrap_subtree(subtree: Arc<Node>) -> Node {
    Arc::try_unwrap(subtree).unwrap_or_else(|arc| (*arc).clone())
}


/// Future executing a transactional expression atomically
///
/// Returned by [`Stm::commit`] and [`atomically`]. Each poll-driven attempt
/// evaluates the expression against a fresh journal; on success the journal
/// is validated and applied under the engine's commit gate, making every
/// write visible at once. A validation conflict is never surfaced: the
/// attempt is discarded and the expression re-executes. An unhandled
/// [`Stm::retry`] parks the future on every reference it read, to re-execute
/// once any of them is written by another commit.
///
/// Dropping the future while parked unregisters it from every reference's
/// waiter list.
pub struct Commit<A, E> {
    node: Node,
    state: CommitState,
    _marker: PhantomData<fn() -> (A, E)>,
}

enum CommitState {
    Run,
    Parked(Parked),
    Done,
}

// registration of a parked transaction on the cells it read. unregisters on
// drop, which covers cancellation as well as normal wakeup.
struct Parked {
    signal: Arc<OneShot<()>>,
    cells: Vec<Arc<Cell>>,
}

impl Drop for Parked {
    fn drop(&mut self) {
        unregister_retry(&self.cells, &self.signal);
    }
}

impl<A, E> Commit<A, E> {
    pub(crate) fn new(stm: Stm<A, E>) -> Self {
        Commit {
            node: stm.into_node(),
            state: CommitState::Run,
            _marker: PhantomData,
        }
    }

    /// Whether this future has already resolved
    pub fn is_terminated(&self) -> bool {
        matches!(self.state, CommitState::Done)
    }
}

impl<A, E> Unpin for Commit<A, E> {}

impl<A: StmValue, E: StmValue> Future for Commit<A, E> {
    type Output = Result<A, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                // for implementation of FusedFuture
                CommitState::Done => return Poll::Pending,
                CommitState::Parked(parked) => match parked.signal.poll_settled(cx) {
                    // a tracked reference changed; run again from scratch
                    Poll::Ready(()) => this.state = CommitState::Run,
                    Poll::Pending => return Poll::Pending,
                },
                CommitState::Run => {
                    let mut journal = Journal::new();
                    match eval(&this.node, &mut journal, &Env::default()) {
                        Exit::Success(value) => {
                            if journal.commit() {
                                this.state = CommitState::Done;
                                return Poll::Ready(Ok(downcast::<A>(value)));
                            }
                            // conflict: invisible to the caller. yield so a
                            // storm of conflicting transactions stays fair.
                            trace!("transaction conflict, scheduling re-run");
                            cx.waker().wake_by_ref();
                            return Poll::Pending;
                        }
                        Exit::Failure(error) => {
                            this.state = CommitState::Done;
                            return Poll::Ready(Err(downcast::<E>(error)));
                        }
                        Exit::Retry => {
                            let cells = journal.tracked_cells();
                            if cells.is_empty() {
                                // nothing read, so nothing can ever wake it
                                warn!("transaction retried without reading any reference; parking forever");
                            }
                            let signal = Arc::new(OneShot::new());
                            register_retry(&cells, &signal);
                            // a tracked reference may have changed between
                            // evaluation and registration; parking now would
                            // miss that wakeup
                            if !journal.validate() {
                                drop(Parked { signal, cells });
                                continue;
                            }
                            trace!(tracked = cells.len(), "transaction parked on retry");
                            this.state = CommitState::Parked(Parked { signal, cells });
                        }
                    }
                }
            }
        }
    }
}

#[cfg(feature = "futures")]
impl<A: StmValue, E: StmValue> futures::future::FusedFuture for Commit<A, E> {
    fn is_terminated(&self) -> bool {
        Self::is_terminated(self)
    }
}

impl<A, E> Drop for Commit<A, E> {
    fn drop(&mut self) {
        dismantle(mem::replace(&mut self.node, Node::Retry));
    }
}


/// Execute a transactional expression atomically
///
/// Free-function form of [`Stm::commit`].
pub fn atomically<A: StmValue, E: StmValue>(stm: Stm<A, E>) -> Commit<A, E> {
    stm.commit()
}
