//! Durable FIFO of execution ids.
//!
//! Three lists live in the `state` namespace and are rewritten on every
//! mutation:
//!
//! | key         | contents                                   |
//! |-------------|--------------------------------------------|
//! | `QUEUED`    | the in-memory FIFO, head first             |
//! | `REQUESTED` | every id ever added and not yet removed    |
//! | `COMPLETED` | every id ever dequeued and not yet removed |
//!
//! `COMPLETED` records that an id left the queue, not that its execution
//! finished.

use std::collections::VecDeque;
use std::path::Path;

use fabric_store::{Store, StoreError};
use fabric_types::Qid;
use serde_json::Value;

pub const STATE_NAMESPACE: &str = "state";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskList {
    Queued,
    Requested,
    Completed,
}

impl TaskList {
    const ALL: [TaskList; 3] = [TaskList::Queued, TaskList::Requested, TaskList::Completed];

    fn key(self) -> &'static str {
        match self {
            TaskList::Queued => "QUEUED",
            TaskList::Requested => "REQUESTED",
            TaskList::Completed => "COMPLETED",
        }
    }
}

pub struct TaskQueue {
    store: Store,
    fifo: VecDeque<Qid>,
}

impl TaskQueue {
    /// Open the queue stored under `dir`, restoring any ids still QUEUED.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        let store = Store::new(dir, 1, true);
        let fifo: VecDeque<Qid> = load(&store, TaskList::Queued)?.into();
        if !fifo.is_empty() {
            tracing::info!(count = fifo.len(), "Restoring queued executions");
        }
        Ok(Self { store, fifo })
    }

    #[must_use]
    pub fn empty(&self) -> bool {
        self.fifo.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fifo.len()
    }

    #[must_use]
    pub fn contains(&self, qid: &Qid) -> bool {
        self.fifo.contains(qid)
    }

    /// Append `qid` to the queue. An id already waiting keeps its position.
    pub fn add(&mut self, qid: &Qid) -> Result<(), StoreError> {
        if !self.fifo.contains(qid) {
            self.fifo.push_back(qid.clone());
        }
        self.save_fifo()?;
        self.append(TaskList::Requested, qid)
    }

    /// Pop the head of the queue and mark it dequeued.
    pub fn next(&mut self) -> Result<Option<Qid>, StoreError> {
        let Some(qid) = self.fifo.pop_front() else {
            return Ok(None);
        };
        self.save_fifo()?;
        self.append(TaskList::Completed, &qid)?;
        Ok(Some(qid))
    }

    /// Forget `qid` everywhere: the queue and every tracking list.
    pub fn rem(&mut self, qid: &Qid) -> Result<(), StoreError> {
        let before = self.fifo.len();
        self.fifo.retain(|queued| queued != qid);
        if self.fifo.len() != before {
            self.save_fifo()?;
        }
        self.remove(TaskList::Requested, qid)?;
        self.remove(TaskList::Completed, qid)
    }

    /// De-duplicated union of every tracking list, queued ids first.
    pub fn all(&self) -> Result<Vec<Qid>, StoreError> {
        let mut ids: Vec<Qid> = Vec::new();
        for list in TaskList::ALL {
            for qid in load(&self.store, list)? {
                if !ids.contains(&qid) {
                    ids.push(qid);
                }
            }
        }
        Ok(ids)
    }

    fn save_fifo(&self) -> Result<(), StoreError> {
        let ids: Vec<Qid> = self.fifo.iter().cloned().collect();
        save(&self.store, TaskList::Queued, &ids)
    }

    fn append(&self, list: TaskList, qid: &Qid) -> Result<(), StoreError> {
        let mut ids = load(&self.store, list)?;
        ids.push(qid.clone());
        save(&self.store, list, &ids)
    }

    fn remove(&self, list: TaskList, qid: &Qid) -> Result<(), StoreError> {
        let mut ids = load(&self.store, list)?;
        let before = ids.len();
        ids.retain(|id| id != qid);
        if ids.len() == before {
            return Ok(());
        }
        save(&self.store, list, &ids)
    }
}

fn load(store: &Store, list: TaskList) -> Result<Vec<Qid>, StoreError> {
    let Some(value) = store.get(STATE_NAMESPACE, list.key())? else {
        return Ok(Vec::new());
    };
    match serde_json::from_value(value) {
        Ok(ids) => Ok(ids),
        Err(e) => {
            tracing::error!(list = list.key(), "Discarding malformed task list: {e}");
            Ok(Vec::new())
        }
    }
}

fn save(store: &Store, list: TaskList, ids: &[Qid]) -> Result<(), StoreError> {
    let value = Value::Array(
        ids.iter()
            .map(|qid| Value::String(qid.as_str().to_string()))
            .collect(),
    );
    store.set(STATE_NAMESPACE, list.key(), value)
}
