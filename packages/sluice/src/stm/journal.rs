// per-transaction journal of tentative reads and writes, validated and
// applied atomically at commit time.

use super::{
    expr::Dynamic,
    tref::Cell,
};
use crate::util::oneshot::OneShot;
use std::sync::{Arc, Mutex};


// the one mutually-exclusive section in the engine: validation plus apply
// must be indivisible with respect to other commits, so that a read-only
// transaction can never observe a read-write transaction's partial state.
// the critical section is O(journal size).
static COMMIT_GATE: Mutex<()> = Mutex::new(());

// per-transaction log. at most one entry per distinct cell, holding the
// version observed at first contact and the latest pending value.
#[derive(Clone, Default)]
pub(crate) struct Journal {
    // insertion-ordered; journals are small, so lookups scan linearly
    entries: Vec<Entry>,
}

#[derive(Clone)]
struct Entry {
    cell: Arc<Cell>,
    // version observed when the transaction first touched the cell.
    // meaningless when is_new.
    expected_version: u64,
    // latest pending value (committed value at first read, then whatever the
    // transaction last wrote).
    value: Dynamic,
    // whether the transaction wrote this cell.
    written: bool,
    // whether the cell was allocated by this transaction.
    is_new: bool,
}

impl Journal {
    pub(crate) fn new() -> Self {
        Journal::default()
    }

    // cheap copy for or_else isolation; entries are Arc-valued.
    pub(crate) fn snapshot(&self) -> Journal {
        self.clone()
    }

    fn position(&self, cell: &Cell) -> Option<usize> {
        self.entries.iter().position(|e| e.cell.id() == cell.id())
    }

    // read a cell, journalling the version observed at first contact.
    // repeated reads see the journalled value (read-your-own-writes).
    pub(crate) fn read(&mut self, cell: &Arc<Cell>) -> Dynamic {
        if let Some(idx) = self.position(cell) {
            return Dynamic::clone(&self.entries[idx].value);
        }
        let (value, version) = cell.read();
        self.entries.push(Entry {
            cell: Arc::clone(cell),
            expected_version: version,
            value: Dynamic::clone(&value),
            written: false,
            is_new: false,
        });
        value
    }

    // record a pending write. the cell's committed state is untouched until
    // commit; a blind write still journals the current version so it
    // validates like a read.
    pub(crate) fn write(&mut self, cell: &Arc<Cell>, value: Dynamic) {
        if let Some(idx) = self.position(cell) {
            let entry = &mut self.entries[idx];
            entry.value = value;
            entry.written = true;
            return;
        }
        let (_, version) = cell.read();
        self.entries.push(Entry {
            cell: Arc::clone(cell),
            expected_version: version,
            value,
            written: true,
            is_new: false,
        });
    }

    // record a cell allocated by this transaction. new cells are invisible to
    // other transactions, so they skip validation.
    pub(crate) fn insert_new(&mut self, cell: &Arc<Cell>, value: Dynamic) {
        self.entries.push(Entry {
            cell: Arc::clone(cell),
            expected_version: 0,
            value,
            written: true,
            is_new: true,
        });
    }

    // whether every journalled version still matches the cell's committed
    // version.
    pub(crate) fn validate(&self) -> bool {
        self.entries.iter()
            .all(|e| e.is_new || e.cell.version() == e.expected_version)
    }

    // validate and, if consistent, apply every pending write, bumping each
    // written cell's version by one. parked transactions tracking a written
    // cell are woken after the gate is released. false means a version moved
    // and nothing was applied.
    pub(crate) fn commit(&self) -> bool {
        let mut wake = Vec::new();
        {
            let _gate = COMMIT_GATE.lock().unwrap();
            if !self.validate() {
                return false;
            }
            for entry in &self.entries {
                if entry.written {
                    entry.cell.apply(Dynamic::clone(&entry.value), &mut wake);
                }
            }
        }
        for signal in wake {
            let _ = signal.complete(());
        }
        true
    }

    // cells whose committed state this transaction depends on; a retry parks
    // on all of them.
    pub(crate) fn tracked_cells(&self) -> Vec<Arc<Cell>> {
        self.entries.iter()
            .filter(|e| !e.is_new)
            .map(|e| Arc::clone(&e.cell))
            .collect()
    }
}

// register a retry signal on every tracked cell. used by the commit loop.
pub(crate) fn register_retry(cells: &[Arc<Cell>], signal: &Arc<OneShot<()>>) {
    for cell in cells {
        cell.register_waiter(signal);
    }
}

// remove a retry signal from every cell it was registered on.
pub(crate) fn unregister_retry(cells: &[Arc<Cell>], signal: &Arc<OneShot<()>>) {
    for cell in cells {
        cell.unregister_waiter(signal);
    }
}
