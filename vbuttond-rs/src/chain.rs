/* Command-chain dispatcher.
 *
 * Maps (virtual button, edge) to an ordered list of actions. The list and the
 * per-edge active bitmap live behind one mutex; every operation acquires it
 * with a bounded timeout and reports contention instead of blocking forever.
 * Two instances exist, one per action vocabulary (see `hid` and `action`). */

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::flags::{EventFlags, DISPATCH_GATE};
use crate::vb::{Edge, Trigger, VirtualButton};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("{0} transport queue is full")]
    QueueFull(&'static str),
    #[error("{0} transport queue is closed")]
    QueueClosed(&'static str),
    #[error("collaborator failed: {0}")]
    Collaborator(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("timed out waiting for the {0} command chain lock")]
    LockTimeout(&'static str),
    #[error("{failed} action(s) failed, first: {first}")]
    Sink { failed: usize, first: SinkError },
}

/* Fires a single action of vocabulary `A`. */
#[async_trait]
pub trait ActionSink<A>: Send + Sync {
    /* Short name used in logs and errors. */
    fn vocabulary(&self) -> &'static str;

    /* `vb` is `None` for single-shot commands. */
    async fn fire(&self, vb: Option<VirtualButton>, edge: Edge, action: &A) -> Result<(), SinkError>;
}

/// One configured action, owned by the chain once added.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainEntry<A> {
    pub vb: VirtualButton,
    pub edge: Edge,
    pub action: A,
    /// Textual form the entry was built from, kept for introspection.
    pub origin: Option<String>,
}

fn edge_slot(edge: Edge) -> usize {
    match edge {
        Edge::Press => 0,
        Edge::Release => 1,
    }
}

struct ChainTable<A> {
    entries: Vec<ChainEntry<A>>,
    /* One bitmap word per edge; bit n set while VB n has at least one entry. */
    active: [u32; 2],
}

impl<A> ChainTable<A> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            active: [0; 2],
        }
    }

    fn remove_vb(&mut self, vb: VirtualButton) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.vb != vb);
        self.active[0] &= !vb.mask();
        self.active[1] &= !vb.mask();
        before - self.entries.len()
    }

    fn push(&mut self, entry: ChainEntry<A>) {
        self.active[edge_slot(entry.edge)] |= entry.vb.mask();
        self.entries.push(entry);
    }

    fn install(&mut self, vb: VirtualButton, entries: Vec<(Edge, A, Option<String>)>) {
        self.remove_vb(vb);
        for (edge, action, origin) in entries {
            self.push(ChainEntry { vb, edge, action, origin });
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.active = [0; 2];
    }
}

/// Exclusive hold on a chain's table while a whole configuration is swapped in.
pub struct ChainRebuild<'a, A> {
    table: MutexGuard<'a, ChainTable<A>>,
}

impl<A> ChainRebuild<'_, A> {
    /* Drop all entries and reset the bitmap. */
    pub fn clear(&mut self) {
        self.table.clear();
    }

    /* Replace everything bound to `vb` with `entries`. */
    pub fn install(&mut self, vb: VirtualButton, entries: Vec<(Edge, A, Option<String>)>) {
        self.table.install(vb, entries);
    }
}

pub struct CommandChain<A, S> {
    name: &'static str,
    table: Mutex<ChainTable<A>>,
    sink: S,
    flags: EventFlags,
    lock_timeout: Duration,
}

impl<A, S> CommandChain<A, S>
where
    A: Clone + Send + Sync + std::fmt::Debug,
    S: ActionSink<A>,
{
    pub fn new(sink: S, flags: EventFlags, lock_timeout: Duration) -> Self {
        Self {
            name: sink.vocabulary(),
            table: Mutex::new(ChainTable::new()),
            sink,
            flags,
            lock_timeout,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    async fn lock(&self) -> Result<MutexGuard<'_, ChainTable<A>>, ChainError> {
        tokio::time::timeout(self.lock_timeout, self.table.lock())
            .await
            .map_err(|_| {
                warn!("{} chain: lock acquire timed out", self.name);
                ChainError::LockTimeout(self.name)
            })
    }

    fn gate_open(&self) -> bool {
        self.flags.all_set(DISPATCH_GATE)
    }

    /* Add one action. A single-shot trigger fires right away and is not stored. */
    pub async fn add(
        &self,
        trigger: Trigger,
        edge: Edge,
        action: A,
        origin: Option<String>,
        replace: bool,
    ) -> Result<(), ChainError> {
        let vb = match trigger {
            Trigger::SingleShot => {
                if !self.gate_open() {
                    debug!("{} chain: single-shot {:?} suppressed, pipeline not stable", self.name, action);
                    return Ok(());
                }
                return self
                    .sink
                    .fire(None, edge, &action)
                    .await
                    .map_err(|first| ChainError::Sink { failed: 1, first });
            }
            Trigger::Button(vb) => vb,
        };

        let mut table = self.lock().await?;
        if replace {
            let removed = table.remove_vb(vb);
            if removed > 0 {
                debug!("{} chain: replaced {} entries of {}", self.name, removed, vb);
            }
        }
        table.push(ChainEntry { vb, edge, action, origin });
        Ok(())
    }

    /* Take the table for a wholesale rebuild. Nothing can dispatch or edit the
     * chain until the returned guard drops. */
    pub async fn lock_for_replace(&self) -> Result<ChainRebuild<'_, A>, ChainError> {
        Ok(ChainRebuild { table: self.lock().await? })
    }

    /* Remove every entry of `vb` (both edges). Returns how many were removed. */
    pub async fn remove(&self, vb: VirtualButton) -> Result<usize, ChainError> {
        let mut table = self.lock().await?;
        Ok(table.remove_vb(vb))
    }

    /* Fire every entry matching (vb, edge), in insertion order. Returns how many fired. */
    pub async fn dispatch(&self, vb: VirtualButton, edge: Edge) -> Result<usize, ChainError> {
        if !self.gate_open() {
            debug!("{} chain: dispatch of {}/{} gated", self.name, vb, edge);
            return Ok(0);
        }

        /* Fire from a snapshot so slow actions never hold the table. */
        let actions: Vec<A> = {
            let table = self.lock().await?;
            if table.active[edge_slot(edge)] & vb.mask() == 0 {
                return Ok(0);
            }
            table
                .entries
                .iter()
                .filter(|e| e.vb == vb && e.edge == edge)
                .map(|e| e.action.clone())
                .collect()
        };

        let mut fired = 0;
        let mut failed = 0;
        let mut first_error = None;
        for action in &actions {
            match self.sink.fire(Some(vb), edge, action).await {
                Ok(()) => fired += 1,
                Err(e) => {
                    warn!("{} chain: action {:?} of {}/{} failed: {}", self.name, action, vb, edge, e);
                    failed += 1;
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(first) => Err(ChainError::Sink { failed, first }),
            None => Ok(fired),
        }
    }

    /* Snapshot of the entries bound to `vb`, in insertion order. */
    pub async fn entries_for(&self, vb: VirtualButton) -> Result<Vec<ChainEntry<A>>, ChainError> {
        let table = self.lock().await?;
        Ok(table.entries.iter().filter(|e| e.vb == vb).cloned().collect())
    }

    /* Reverse lookup: which buttons carry an entry built from `origin`. */
    pub async fn find_origin(&self, origin: &str) -> Result<Vec<(VirtualButton, Edge)>, ChainError> {
        let table = self.lock().await?;
        Ok(table
            .entries
            .iter()
            .filter(|e| e.origin.as_deref() == Some(origin))
            .map(|e| (e.vb, e.edge))
            .collect())
    }

    pub async fn is_active(&self, vb: VirtualButton, edge: Edge) -> Result<bool, ChainError> {
        let table = self.lock().await?;
        Ok(table.active[edge_slot(edge)] & vb.mask() != 0)
    }

    pub async fn len(&self) -> Result<usize, ChainError> {
        Ok(self.lock().await?.entries.len())
    }
}
