//! Per-session memoization of task resolution.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, ValidationError};
use crate::store::TaskData;
use crate::task::TaskKey;

/// How concurrent requires of one task key within a session are reconciled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SharePolicy {
    /// A key is resolved at most once per session. Concurrent callers block
    /// until the in-flight resolution finishes and receive its result,
    /// success or failure.
    #[default]
    Blocking,
    /// A result already visited in this session is reused, otherwise the
    /// caller resolves the key itself. Concurrent callers of an unvisited key
    /// may resolve it more than once. Meant for single-threaded use and
    /// benchmarking.
    NonSharing,
}

impl SharePolicy {
    pub(crate) fn build(self) -> Box<dyn Share> {
        match self {
            SharePolicy::Blocking => Box::new(BlockingShare::default()),
            SharePolicy::NonSharing => Box::new(NonSharingShare),
        }
    }
}

pub(crate) trait Share: Send + Sync {
    /// Returns the visited result for `key` if there is one, otherwise the
    /// result of `resolve`. `resolve` is expected to mark the key as visited
    /// before returning successfully.
    fn share(
        &self,
        key: &TaskKey,
        visited: &dyn Fn() -> Option<Arc<TaskData>>,
        resolve: &dyn Fn() -> Result<Arc<TaskData>, Error>,
    ) -> Result<Arc<TaskData>, Error>;
}

pub(crate) struct NonSharingShare;

impl Share for NonSharingShare {
    fn share(
        &self,
        _: &TaskKey,
        visited: &dyn Fn() -> Option<Arc<TaskData>>,
        resolve: &dyn Fn() -> Result<Arc<TaskData>, Error>,
    ) -> Result<Arc<TaskData>, Error> {
        match visited() {
            Some(data) => Ok(data),
            None => resolve(),
        }
    }
}

enum SlotState {
    Running,
    Done(Result<Arc<TaskData>, Error>),
}

struct Slot {
    owner: ThreadId,
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl Slot {
    fn new() -> Self {
        Self {
            owner: thread::current().id(),
            state: Mutex::new(SlotState::Running),
            ready: Condvar::new(),
        }
    }

    fn wait(&self) -> Result<Arc<TaskData>, Error> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                SlotState::Done(result) => return result.clone(),
                SlotState::Running => self.ready.wait(&mut state),
            }
        }
    }

    fn finish(&self, result: Result<Arc<TaskData>, Error>) {
        *self.state.lock() = SlotState::Done(result);
        self.ready.notify_all();
    }
}

/// The owner's hold on a slot. Dropping it, also while unwinding, fails the
/// slot if nobody finished it and releases the key.
struct Owned<'a> {
    share: &'a BlockingShare,
    key: &'a TaskKey,
    slot: Arc<Slot>,
}

impl Drop for Owned<'_> {
    fn drop(&mut self) {
        let mut state = self.slot.state.lock();
        if matches!(*state, SlotState::Running) {
            tracing::warn!(key = %self.key, "resolution unwound");
            *state = SlotState::Done(Err(Error::Exec {
                key: self.key.clone(),
                error: Arc::new(anyhow::anyhow!("Resolution of task '{}' panicked", self.key)),
            }));
            self.slot.ready.notify_all();
        }
        drop(state);
        self.share.in_flight.lock().remove(self.key);
    }
}

#[derive(Default)]
pub(crate) struct BlockingShare {
    in_flight: Mutex<HashMap<TaskKey, Arc<Slot>>>,
}

impl Share for BlockingShare {
    fn share(
        &self,
        key: &TaskKey,
        visited: &dyn Fn() -> Option<Arc<TaskData>>,
        resolve: &dyn Fn() -> Result<Arc<TaskData>, Error>,
    ) -> Result<Arc<TaskData>, Error> {
        if let Some(data) = visited() {
            return Ok(data);
        }

        let (slot, owned) = {
            let mut in_flight = self.in_flight.lock();
            // The previous owner may have finished between the first lookup
            // and taking the lock.
            if let Some(data) = visited() {
                return Ok(data);
            }
            match in_flight.get(key) {
                Some(slot) => (slot.clone(), false),
                None => {
                    let slot = Arc::new(Slot::new());
                    in_flight.insert(key.clone(), slot.clone());
                    (slot, true)
                }
            }
        };

        if !owned {
            // Waiting on ourselves would never wake up.
            if slot.owner == thread::current().id() {
                return Err(ValidationError::Cycle {
                    key: key.clone(),
                    chain: vec![key.clone()],
                }
                .into());
            }
            tracing::trace!(key = %key, "waiting for in-flight resolution");
            return slot.wait();
        }

        let hold = Owned {
            share: self,
            key,
            slot,
        };
        let result = resolve();
        hold.slot.finish(result.clone());
        result
    }
}
