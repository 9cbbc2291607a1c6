// the stm expression tree. building one of these performs no effects; only
// commit interprets it, possibly many times.

use super::{
    journal::Journal,
    run::Commit,
};
use std::{
    any::{type_name, Any, TypeId},
    collections::HashMap,
    convert::Infallible,
    marker::PhantomData,
    mem,
    sync::Arc,
};


// type-erased value flowing through a transaction.
pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

// continuation from a value to the next expression to evaluate.
pub(crate) type Cont = Arc<dyn Fn(Dynamic) -> Node + Send + Sync>;

pub(crate) fn dynamic<T: StmValue>(value: T) -> Dynamic {
    Arc::new(value)
}

pub(crate) fn downcast<T: StmValue>(value: Dynamic) -> T {
    match value.downcast::<T>() {
        Ok(arc) => Arc::try_unwrap(arc).unwrap_or_else(|arc| (*arc).clone()),
        Err(_) => panic!(
            "transactional value was not a `{}` (internal bug)",
            type_name::<T>(),
        ),
    }
}

/// Bound for values, errors, and services flowing through transactions
///
/// Blanket-implemented; listed in signatures only so the requirement has a
/// name.
pub trait StmValue: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> StmValue for T {}


/// Value of one of two types, produced by [`Stm::or_else_either`]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Either<L, R> {
    Left(L),
    Right(R),
}


// non-value outcomes of evaluating an effect leaf.
pub(crate) enum Control {
    Fail(Dynamic),
    Retry,
}

// tree node. subtrees are Arc'd so that clones of a description share
// structure and re-evaluation is cheap.
#[derive(Clone)]
pub(crate) enum Node {
    Succeed(Dynamic),
    Fail(Dynamic),
    Retry,
    Effect(Arc<dyn Fn(&mut Journal, &Env) -> Result<Dynamic, Control> + Send + Sync>),
    FlatMap(Arc<Node>, Cont),
    // success continuation, failure continuation
    Fold(Arc<Node>, Cont, Cont),
    OrElse(Arc<Node>, Arc<Node>),
    Provide(Arc<Node>, Env),
}

// collapse a tree iteratively. deep combinator chains (tens of thousands of
// nested nodes) would otherwise recurse through drop glue.
pub(crate) fn dismantle(root: Node) {
    let mut work = vec![root];
    while let Some(node) = work.pop() {
        let mut push = |subtree: Arc<Node>| {
            if let Some(inner) = Arc::into_inner(subtree) {
                work.push(inner);
            }
        };
        match node {
            Node::FlatMap(inner, _) | Node::Provide(inner, _) => push(inner),
            Node::Fold(inner, _, _) => push(inner),
            Node::OrElse(left, right) => {
                push(left);
                push(right);
            }
            Node::Succeed(_) | Node::Fail(_) | Node::Retry | Node::Effect(_) => {}
        }
    }
}


/// Type-keyed service environment available to a transaction
///
/// Built once at setup and scoped over an expression with
/// [`Stm::provide_environment`]; read back with [`Stm::service`].
#[derive(Clone, Default)]
pub struct Env {
    services: Arc<HashMap<TypeId, Dynamic>>,
}

impl Env {
    pub fn new() -> Self {
        Env::default()
    }

    /// Add a service, keyed by its type
    pub fn with<S: StmValue>(mut self, service: S) -> Self {
        Arc::make_mut(&mut self.services).insert(TypeId::of::<S>(), dynamic(service));
        self
    }

    // look a service up by type id. absence is a wiring bug, not a
    // recoverable condition.
    pub(crate) fn fetch(&self, id: TypeId, name: &str) -> Dynamic {
        self.services.get(&id).cloned().unwrap_or_else(|| {
            panic!("no service `{name}` provided to transaction")
        })
    }
}


/// Description of a transactional computation producing `A` or failing
/// with `E`
///
/// An `Stm` is an immutable, persistent expression: constructing or combining
/// descriptions performs no side effects, and cloning shares structure.
/// [`commit`](Stm::commit) is the only way to execute one, and may evaluate
/// the description several times — once per conflict or
/// [`retry`](Stm::retry) — so expressions must stay pure apart from their
/// journalled [`TRef`](super::TRef) reads and writes.
pub struct Stm<A, E = Infallible> {
    node: Node,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Stm<A, E> {
    fn clone(&self) -> Self {
        Stm::from_node(self.node.clone())
    }
}

impl<A, E> Drop for Stm<A, E> {
    fn drop(&mut self) {
        dismantle(mem::replace(&mut self.node, Node::Retry));
    }
}

impl<A, E> Stm<A, E> {
    pub(crate) fn from_node(node: Node) -> Self {
        Stm { node, _marker: PhantomData }
    }

    pub(crate) fn into_node(mut self) -> Node {
        mem::replace(&mut self.node, Node::Retry)
    }
}

impl<A: StmValue, E: StmValue> Stm<A, E> {
    /// Succeed with the given value
    pub fn succeed(value: A) -> Stm<A, E> {
        Stm::from_node(Node::Succeed(dynamic(value)))
    }

    /// Fail with the given error
    ///
    /// Propagates through the expression until handled by
    /// [`fold`](Stm::fold)/[`fold_stm`](Stm::fold_stm) or
    /// [`or_else`](Stm::or_else); unhandled, it becomes the commit's error.
    pub fn fail(error: E) -> Stm<A, E> {
        Stm::from_node(Node::Fail(dynamic(error)))
    }

    /// Abandon the current evaluation and re-execute once any transactional
    /// reference read so far changes
    ///
    /// Not an error: the enclosing [`commit`](Stm::commit) parks until a
    /// tracked reference is written by another transaction, then re-runs the
    /// whole expression against a fresh journal. Within
    /// [`or_else`](Stm::or_else), a retry of the left side switches to the
    /// right side instead of parking.
    pub fn retry() -> Stm<A, E> {
        Stm::from_node(Node::Retry)
    }

    /// Read a service of type `A` from the provided environment
    ///
    /// Panics at evaluation time if no enclosing
    /// [`provide_environment`](Stm::provide_environment) supplied one.
    pub fn service() -> Stm<A, E> {
        Stm::effect(|_, env| Ok(env.fetch(TypeId::of::<A>(), type_name::<A>())))
    }

    // effect leaf reading or writing transactional references through the
    // journal.
    pub(crate) fn effect(
        f: impl Fn(&mut Journal, &Env) -> Result<Dynamic, Control> + Send + Sync + 'static,
    ) -> Stm<A, E> {
        Stm::from_node(Node::Effect(Arc::new(f)))
    }

    /// Transform the success value
    pub fn map<B: StmValue>(
        self,
        f: impl Fn(A) -> B + Send + Sync + 'static,
    ) -> Stm<B, E> {
        Stm::from_node(Node::FlatMap(
            Arc::new(self.into_node()),
            Arc::new(move |value| Node::Succeed(dynamic(f(downcast::<A>(value))))),
        ))
    }

    /// Sequence another transactional expression after this one
    pub fn flat_map<B: StmValue>(
        self,
        f: impl Fn(A) -> Stm<B, E> + Send + Sync + 'static,
    ) -> Stm<B, E> {
        Stm::from_node(Node::FlatMap(
            Arc::new(self.into_node()),
            Arc::new(move |value| f(downcast::<A>(value)).into_node()),
        ))
    }

    /// Handle both outcomes, producing a plain value
    pub fn fold<B: StmValue, E2: StmValue>(
        self,
        failure: impl Fn(E) -> B + Send + Sync + 'static,
        success: impl Fn(A) -> B + Send + Sync + 'static,
    ) -> Stm<B, E2> {
        Stm::from_node(Node::Fold(
            Arc::new(self.into_node()),
            Arc::new(move |value| Node::Succeed(dynamic(success(downcast::<A>(value))))),
            Arc::new(move |error| Node::Succeed(dynamic(failure(downcast::<E>(error))))),
        ))
    }

    /// Handle both outcomes, producing a follow-up expression
    pub fn fold_stm<B: StmValue, E2: StmValue>(
        self,
        failure: impl Fn(E) -> Stm<B, E2> + Send + Sync + 'static,
        success: impl Fn(A) -> Stm<B, E2> + Send + Sync + 'static,
    ) -> Stm<B, E2> {
        Stm::from_node(Node::Fold(
            Arc::new(self.into_node()),
            Arc::new(move |value| success(downcast::<A>(value)).into_node()),
            Arc::new(move |error| failure(downcast::<E>(error)).into_node()),
        ))
    }

    /// Transform the failure value
    pub fn map_error<E2: StmValue>(
        self,
        f: impl Fn(E) -> E2 + Send + Sync + 'static,
    ) -> Stm<A, E2> {
        self.fold_stm(move |e| Stm::fail(f(e)), Stm::succeed)
    }

    /// Fall back to `that` if this expression fails or retries
    ///
    /// The left side runs against an isolated journal: on failure or retry
    /// its tentative writes are discarded completely before the right side
    /// runs; on success they are kept.
    pub fn or_else<E2: StmValue>(self, that: Stm<A, E2>) -> Stm<A, E2> {
        Stm::from_node(Node::OrElse(
            Arc::new(self.into_node()),
            Arc::new(that.into_node()),
        ))
    }

    /// Alias for [`or_else`](Stm::or_else)
    pub fn or_try<E2: StmValue>(self, that: Stm<A, E2>) -> Stm<A, E2> {
        self.or_else(that)
    }

    /// Fall back to an expression of a different value type
    pub fn or_else_either<B: StmValue, E2: StmValue>(
        self,
        that: Stm<B, E2>,
    ) -> Stm<Either<A, B>, E2> {
        self.map(Either::Left).or_else(that.map(Either::Right))
    }

    /// Replace failure or retry with the given error
    pub fn or_else_fail<E2: StmValue>(self, error: E2) -> Stm<A, E2> {
        self.or_else(Stm::fail(error))
    }

    /// Replace failure or retry with the given value
    pub fn or_else_succeed<E2: StmValue>(self, value: A) -> Stm<A, E2> {
        self.or_else(Stm::succeed(value))
    }

    /// Discard the outcome, succeeding with unit either way
    pub fn ignore(self) -> Stm<(), E> {
        self.fold(|_| (), |_| ())
    }

    /// Scope a service environment over this expression
    pub fn provide_environment(self, env: Env) -> Stm<A, E> {
        Stm::from_node(Node::Provide(Arc::new(self.into_node()), env))
    }

    /// Run `stm` only if `predicate` holds
    pub fn when(predicate: bool, stm: Stm<A, E>) -> Stm<Option<A>, E> {
        if predicate {
            stm.map(Some)
        } else {
            Stm::succeed(None)
        }
    }

    /// Run `stm` only if the transactional `predicate` evaluates true
    pub fn when_stm(predicate: Stm<bool, E>, stm: Stm<A, E>) -> Stm<Option<A>, E> {
        predicate.flat_map(move |holds| {
            if holds {
                stm.clone().map(Some)
            } else {
                Stm::succeed(None)
            }
        })
    }

    /// Run the expression selected by a partial function of `value`, if any
    pub fn when_case<V>(
        value: V,
        pf: impl FnOnce(&V) -> Option<Stm<A, E>>,
    ) -> Stm<Option<A>, E> {
        match pf(&value) {
            Some(stm) => stm.map(Some),
            None => Stm::succeed(None),
        }
    }

    /// Like [`when_case`](Stm::when_case), with the scrutinee itself
    /// transactional
    pub fn when_case_stm<V: StmValue>(
        value: Stm<V, E>,
        pf: impl Fn(&V) -> Option<Stm<A, E>> + Send + Sync + 'static,
    ) -> Stm<Option<A>, E> {
        value.flat_map(move |v| match pf(&v) {
            Some(stm) => stm.map(Some),
            None => Stm::succeed(None),
        })
    }

    /// Fold every expression's result into an accumulator, in input order
    pub fn merge_all<Z: StmValue>(
        items: impl IntoIterator<Item = Stm<A, E>>,
        zero: Z,
        f: impl Fn(Z, A) -> Z + Send + Sync + 'static,
    ) -> Stm<Z, E> {
        let f = Arc::new(f);
        items.into_iter().fold(Stm::succeed(zero), |acc, stm| {
            let f = Arc::clone(&f);
            acc.flat_map(move |z: Z| {
                let f = Arc::clone(&f);
                stm.clone().map(move |a| f(z.clone(), a))
            })
        })
    }

    /// Combine every expression's result pairwise with `f`, starting from
    /// `initial`
    pub fn reduce_all(
        initial: Stm<A, E>,
        rest: impl IntoIterator<Item = Stm<A, E>>,
        f: impl Fn(A, A) -> A + Send + Sync + 'static,
    ) -> Stm<A, E> {
        let f = Arc::new(f);
        rest.into_iter().fold(initial, |acc, stm| {
            let f = Arc::clone(&f);
            acc.flat_map(move |a: A| {
                let f = Arc::clone(&f);
                stm.clone().map(move |b| f(a.clone(), b))
            })
        })
    }

    /// Check every element, accumulating all failures
    ///
    /// Does not short-circuit: every element is checked, and the expression
    /// fails with the errors of every failing element in input order, or
    /// succeeds with every result in input order.
    pub fn validate<In, I, F>(items: I, f: F) -> Stm<Vec<A>, Vec<E>>
    where
        In: Clone + Send + Sync + 'static,
        I: IntoIterator<Item = In>,
        F: Fn(In) -> Stm<A, E> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let mut acc: Stm<(Vec<A>, Vec<E>), Vec<E>> =
            Stm::succeed((Vec::new(), Vec::new()));
        for item in items {
            let f = Arc::clone(&f);
            acc = acc.flat_map(move |(oks, errs): (Vec<A>, Vec<E>)| {
                f(item.clone()).fold(
                    {
                        let oks = oks.clone();
                        let errs = errs.clone();
                        move |e| {
                            let mut errs = errs.clone();
                            errs.push(e);
                            (oks.clone(), errs)
                        }
                    },
                    move |a| {
                        let mut oks = oks.clone();
                        oks.push(a);
                        (oks, errs.clone())
                    },
                )
            });
        }
        acc.flat_map(|(oks, errs)| {
            if errs.is_empty() {
                Stm::succeed(oks)
            } else {
                Stm::fail(errs)
            }
        })
    }

    /// Check elements in order until one succeeds
    ///
    /// The first succeeding element's result is returned and nothing after it
    /// is checked; if none succeeds, fails with every error in input order.
    pub fn validate_first<In, I, F>(items: I, f: F) -> Stm<A, Vec<E>>
    where
        In: Clone + Send + Sync + 'static,
        I: IntoIterator<Item = In>,
        F: Fn(In) -> Stm<A, E> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let mut acc: Stm<Either<A, Vec<E>>, Vec<E>> =
            Stm::succeed(Either::Right(Vec::new()));
        for item in items {
            let f = Arc::clone(&f);
            acc = acc.flat_map(move |state| match state {
                Either::Left(found) => Stm::succeed(Either::Left(found)),
                Either::Right(errs) => f(item.clone()).fold(
                    move |e| {
                        let mut errs = errs.clone();
                        errs.push(e);
                        Either::Right(errs)
                    },
                    Either::Left,
                ),
            });
        }
        acc.flat_map(|state| match state {
            Either::Left(found) => Stm::succeed(found),
            Either::Right(errs) => Stm::fail(errs),
        })
    }

    /// Compile this description into a future that executes it atomically
    ///
    /// The sole boundary between the transactional world and the async task
    /// world. See [`Commit`] for execution semantics.
    pub fn commit(self) -> Commit<A, E> {
        Commit::new(self)
    }
}

impl<E: StmValue> Stm<(), E> {
    /// Succeed with unit
    pub fn unit() -> Stm<(), E> {
        Stm::succeed(())
    }

    /// Proceed if `predicate` holds, retry otherwise
    pub fn check(predicate: bool) -> Stm<(), E> {
        if predicate {
            Stm::succeed(())
        } else {
            Stm::retry()
        }
    }
}
