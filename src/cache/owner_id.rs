//! Owner Id Allocator
//!
//! Issues small integer ids used to attribute cached bytes to a logical
//! owner (a table, a column family). Ids are granted and returned at owner
//! lifecycle boundaries, so a single coarse mutex is enough here.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Owner identifier attached to cache entries
pub type OwnerId = u16;

/// Sentinel meaning "no owner"
pub const UNKNOWN_OWNER_ID: OwnerId = 0;

/// Smallest id handed out by the allocator
pub const MIN_OWNER_ID: OwnerId = 1;

/// Largest id handed out by the allocator
pub const MAX_OWNER_ID: OwnerId = OwnerId::MAX;

/// Maximum number of freed ids kept for reuse
pub const MAX_FREE_LIST_SIZE: usize = 10_000;

struct AllocatorState {
    free_ids: VecDeque<OwnerId>,
    next_id: OwnerId,
    exhausted: bool,
}

/// Allocator for [`OwnerId`] values
pub struct OwnerIdAllocator {
    state: Mutex<AllocatorState>,
    max_id: OwnerId,
    max_free_list: usize,
}

impl OwnerIdAllocator {
    /// Create an allocator spanning the full id range
    pub fn new() -> Self {
        Self::with_limits(MAX_OWNER_ID, MAX_FREE_LIST_SIZE)
    }

    /// Create an allocator with a custom id ceiling and free list bound
    pub fn with_limits(max_id: OwnerId, max_free_list: usize) -> Self {
        let max_id = max_id.max(MIN_OWNER_ID);
        Self {
            state: Mutex::new(AllocatorState {
                free_ids: VecDeque::new(),
                next_id: MIN_OWNER_ID,
                exhausted: false,
            }),
            max_id,
            max_free_list,
        }
    }

    /// Grant an unused id, reusing freed ids before extending the counter
    pub fn allocate(&self) -> Result<OwnerId> {
        let mut state = self.state.lock();

        if let Some(id) = state.free_ids.pop_front() {
            return Ok(id);
        }

        if state.exhausted {
            return Err(Error::ResourceExhausted(format!(
                "all owner ids up to {} are in use",
                self.max_id
            )));
        }

        let id = state.next_id;
        if id == self.max_id {
            state.exhausted = true;
        } else {
            state.next_id += 1;
        }
        Ok(id)
    }

    /// Return an id to the pool and reset the caller's copy to unknown
    pub fn free(&self, id: &mut OwnerId) {
        if *id == UNKNOWN_OWNER_ID {
            return;
        }

        {
            let mut state = self.state.lock();
            // A discarded id is never reused; accounting is best-effort.
            if state.free_ids.len() < self.max_free_list {
                state.free_ids.push_back(*id);
            }
        }
        *id = UNKNOWN_OWNER_ID;
    }

    /// Number of ids waiting on the free list
    pub fn free_list_len(&self) -> usize {
        self.state.lock().free_ids.len()
    }
}

impl Default for OwnerIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OwnerIdAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("OwnerIdAllocator")
            .field("next_id", &state.next_id)
            .field("exhausted", &state.exhausted)
            .field("free_ids", &state.free_ids.len())
            .field("max_id", &self.max_id)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
