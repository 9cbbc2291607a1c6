// transactional references: versioned cells readable and writable only
// through a transaction's journal.

use super::expr::{downcast, dynamic, Dynamic, Stm, StmValue};
use crate::util::oneshot::OneShot;
use std::{
    marker::PhantomData,
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc, Mutex,
    },
};


// next cell id.
static NEXT_ID: AtomicU64 = AtomicU64::new(0);

// type-erased interior of a TRef: the committed value, its version, and the
// signals of transactions parked on retry that read this cell.
pub(crate) struct Cell {
    id: u64,
    versioned: Mutex<Versioned>,
    waiters: Mutex<Vec<Arc<OneShot<()>>>>,
}

struct Versioned {
    value: Dynamic,
    // bumped by one on every committed write
    version: u64,
}

impl Cell {
    pub(crate) fn new(value: Dynamic) -> Arc<Cell> {
        Arc::new(Cell {
            id: NEXT_ID.fetch_add(1, Relaxed),
            versioned: Mutex::new(Versioned { value, version: 0 }),
            waiters: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    // read the committed value and its version as one atomic observation.
    pub(crate) fn read(&self) -> (Dynamic, u64) {
        let versioned = self.versioned.lock().unwrap();
        (Dynamic::clone(&versioned.value), versioned.version)
    }

    pub(crate) fn version(&self) -> u64 {
        self.versioned.lock().unwrap().version
    }

    // apply a committed write. the caller must hold the commit gate. signals
    // of parked transactions are drained into `wake` so the caller can settle
    // them after the gate is released.
    pub(crate) fn apply(&self, value: Dynamic, wake: &mut Vec<Arc<OneShot<()>>>) {
        {
            let mut versioned = self.versioned.lock().unwrap();
            versioned.value = value;
            versioned.version += 1;
        }
        wake.append(&mut self.waiters.lock().unwrap());
    }

    pub(crate) fn register_waiter(&self, signal: &Arc<OneShot<()>>) {
        self.waiters.lock().unwrap().push(Arc::clone(signal));
    }

    pub(crate) fn unregister_waiter(&self, signal: &Arc<OneShot<()>>) {
        self.waiters.lock().unwrap().retain(|s| !Arc::ptr_eq(s, signal));
    }
}


/// Transactional reference to a value of type `T`
///
/// A `TRef` can only be read and written through [`Stm`] values executed by
/// [`commit`](Stm::commit); outside a transaction its content is unreachable.
/// Cloning a `TRef` clones the handle, not the cell: all clones refer to the
/// same transactional state.
pub struct TRef<T> {
    pub(crate) cell: Arc<Cell>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for TRef<T> {
    fn clone(&self) -> Self {
        TRef { cell: Arc::clone(&self.cell), _marker: PhantomData }
    }
}

impl<T: StmValue> TRef<T> {
    fn alloc(initial: T) -> Self {
        TRef { cell: Cell::new(dynamic(initial)), _marker: PhantomData }
    }

    /// Allocate a fresh reference inside the enclosing transaction
    ///
    /// The allocation is journalled like any other write: if the transaction
    /// retries or fails, the reference is discarded with it.
    pub fn make<E: StmValue>(initial: T) -> Stm<TRef<T>, E> {
        Stm::effect(move |journal, _| {
            let tref = TRef::alloc(initial.clone());
            journal.insert_new(&tref.cell, dynamic(initial.clone()));
            Ok(dynamic(tref))
        })
    }

    /// Allocate and commit a fresh reference in one step
    ///
    /// A reference nobody else has seen cannot conflict, so this is a plain
    /// synchronous call rather than a transaction of its own.
    pub fn make_commit(initial: T) -> TRef<T> {
        TRef::alloc(initial)
    }

    /// Read the current value
    pub fn get<E: StmValue>(&self) -> Stm<T, E> {
        let cell = Arc::clone(&self.cell);
        Stm::effect(move |journal, _| Ok(journal.read(&cell)))
    }

    /// Replace the current value
    pub fn set<E: StmValue>(&self, value: T) -> Stm<(), E> {
        let cell = Arc::clone(&self.cell);
        Stm::effect(move |journal, _| {
            journal.write(&cell, dynamic(value.clone()));
            Ok(dynamic(()))
        })
    }

    /// Transform the current value
    pub fn update<E: StmValue>(
        &self,
        f: impl Fn(T) -> T + Send + Sync + 'static,
    ) -> Stm<(), E> {
        let cell = Arc::clone(&self.cell);
        Stm::effect(move |journal, _| {
            let current: T = downcast(journal.read(&cell));
            journal.write(&cell, dynamic(f(current)));
            Ok(dynamic(()))
        })
    }

    /// Transform the current value, returning the value it replaced
    pub fn get_and_update<E: StmValue>(
        &self,
        f: impl Fn(T) -> T + Send + Sync + 'static,
    ) -> Stm<T, E> {
        let cell = Arc::clone(&self.cell);
        Stm::effect(move |journal, _| {
            let current = journal.read(&cell);
            let next: T = f(downcast(Dynamic::clone(&current)));
            journal.write(&cell, dynamic(next));
            Ok(current)
        })
    }

    /// Transform the current value, returning the replacement
    pub fn update_and_get<E: StmValue>(
        &self,
        f: impl Fn(T) -> T + Send + Sync + 'static,
    ) -> Stm<T, E> {
        let cell = Arc::clone(&self.cell);
        Stm::effect(move |journal, _| {
            let current: T = downcast(journal.read(&cell));
            let next = dynamic(f(current));
            journal.write(&cell, Dynamic::clone(&next));
            Ok(next)
        })
    }

    /// Transform the current value while extracting a result
    pub fn modify<B: StmValue, E: StmValue>(
        &self,
        f: impl Fn(T) -> (B, T) + Send + Sync + 'static,
    ) -> Stm<B, E> {
        let cell = Arc::clone(&self.cell);
        Stm::effect(move |journal, _| {
            let current: T = downcast(journal.read(&cell));
            let (out, next) = f(current);
            journal.write(&cell, dynamic(next));
            Ok(dynamic(out))
        })
    }
}
