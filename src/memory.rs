//! Memory accounting for spooled results
//!
//! A [`MemoryManager`] hands out [`MemoryChunk`] reservations from a budget
//! that is shared by every concurrent consumer in the process. The spooler
//! only ever talks to the trait; [`GlobalMemoryManager`] is the bundled
//! implementation.
//!
//! # Architecture
//!
//! ```text
//! GlobalMemoryManager (max = 64 MB)
//!   └─→ Budget { used: Mutex<usize>, released: Condvar }
//!        ├─→ MemoryChunk(20 MB)  ← spooler A, in memory
//!        ├─→ MemoryChunk(3 KB)   ← spooler B, shrunk after draining
//!        └─→ (released)          ← spooler C, spilled to disk
//! ```
//!
//! Chunks return their bytes to the budget when released or dropped, and
//! waiting allocations are woken up.

use crate::error::{Error, Result};
use crate::metrics::MEMORY_RESERVED;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Grants memory reservations out of a shared budget
pub trait MemoryManager: Send + Sync {
    /// Reserve between `min_bytes` and `max_bytes`
    ///
    /// Returns the largest grant available up to `max_bytes`. Fails with
    /// [`Error::ResourceExhausted`] if at least `min_bytes` cannot be granted.
    fn allocate(&self, min_bytes: usize, max_bytes: usize) -> Result<MemoryChunk>;

    /// Total size of the budget in bytes
    fn max_memory(&self) -> usize;

    /// Bytes not currently reserved (advisory)
    fn available_memory(&self) -> usize;
}

/// Gauge increments saturate; unbounded managers can grant up to `usize::MAX`
fn gauge_delta(bytes: usize) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

/// Shared state between a manager and the chunks it has handed out
struct Budget {
    max_memory: usize,
    used: Mutex<usize>,
    released: Condvar,
}

impl Budget {
    fn give_back(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        let mut used = self.used.lock();
        *used = used.saturating_sub(bytes);
        MEMORY_RESERVED.sub(gauge_delta(bytes));
        drop(used);
        self.released.notify_all();
    }
}

/// Process-wide memory manager backed by a fixed budget
///
/// Cheap to clone; clones share the same budget.
#[derive(Clone)]
pub struct GlobalMemoryManager {
    budget: Arc<Budget>,
    max_wait: Duration,
}

impl GlobalMemoryManager {
    /// Create a manager with a budget of `max_memory` bytes
    ///
    /// # Arguments
    /// * `max_memory` - Total bytes that may be reserved at once
    /// * `max_wait` - How long an allocation waits for other chunks to be
    ///   released before failing
    pub fn new(max_memory: usize, max_wait: Duration) -> Self {
        info!(max_memory, max_wait_ms = max_wait.as_millis() as u64, "Creating memory manager");
        Self {
            budget: Arc::new(Budget {
                max_memory,
                used: Mutex::new(0),
                released: Condvar::new(),
            }),
            max_wait,
        }
    }

    /// Create a manager that always grants the requested maximum
    pub fn unbounded() -> Self {
        Self::new(usize::MAX, Duration::ZERO)
    }

    /// Bytes currently reserved by live chunks
    pub fn used_memory(&self) -> usize {
        *self.budget.used.lock()
    }
}

impl MemoryManager for GlobalMemoryManager {
    fn allocate(&self, min_bytes: usize, max_bytes: usize) -> Result<MemoryChunk> {
        if min_bytes > max_bytes {
            return Err(Error::InvalidArgument(format!(
                "Minimum allocation {} exceeds maximum {}",
                min_bytes, max_bytes
            )));
        }

        let deadline = Instant::now() + self.max_wait;
        let mut used = self.budget.used.lock();
        loop {
            let available = self.budget.max_memory - *used;
            if available >= min_bytes {
                let granted = max_bytes.min(available);
                *used += granted;
                MEMORY_RESERVED.add(gauge_delta(granted));
                debug!(min_bytes, max_bytes, granted, "Allocated memory chunk");
                return Ok(MemoryChunk {
                    size: granted,
                    max_size: max_bytes,
                    budget: Arc::clone(&self.budget),
                    released: false,
                });
            }

            if self
                .budget
                .released
                .wait_until(&mut used, deadline)
                .timed_out()
            {
                let available = self.budget.max_memory - *used;
                if available >= min_bytes {
                    continue;
                }
                return Err(Error::ResourceExhausted {
                    requested: min_bytes,
                    available,
                });
            }
        }
    }

    fn max_memory(&self) -> usize {
        self.budget.max_memory
    }

    fn available_memory(&self) -> usize {
        self.budget.max_memory - *self.budget.used.lock()
    }
}

impl fmt::Debug for GlobalMemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalMemoryManager")
            .field("max_memory", &self.budget.max_memory)
            .field("used", &self.used_memory())
            .field("max_wait", &self.max_wait)
            .finish()
    }
}

/// A reservation of bytes from a [`MemoryManager`]
///
/// Owned by exactly one component at a time. Releasing is idempotent and also
/// happens on drop.
pub struct MemoryChunk {
    size: usize,
    max_size: usize,
    budget: Arc<Budget>,
    released: bool,
}

impl MemoryChunk {
    /// Number of bytes currently reserved (zero once released)
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the reservation has been returned to the budget
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Change the reserved size
    ///
    /// Shrinking always succeeds. Growing is bounded by the maximum requested
    /// at allocation time and by what the budget has left. No-op once released.
    pub fn resize(&mut self, new_size: usize) -> Result<()> {
        if self.released || new_size == self.size {
            return Ok(());
        }

        if new_size < self.size {
            self.budget.give_back(self.size - new_size);
            self.size = new_size;
            return Ok(());
        }

        if new_size > self.max_size {
            return Err(Error::InvalidArgument(format!(
                "Cannot grow chunk to {} bytes, allocated with a maximum of {}",
                new_size, self.max_size
            )));
        }

        let extra = new_size - self.size;
        let mut used = self.budget.used.lock();
        let available = self.budget.max_memory - *used;
        if extra > available {
            return Err(Error::ResourceExhausted {
                requested: extra,
                available,
            });
        }
        *used += extra;
        MEMORY_RESERVED.add(gauge_delta(extra));
        self.size = new_size;
        Ok(())
    }

    /// Return the reservation to the budget
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.budget.give_back(self.size);
        self.size = 0;
    }

    /// Alias for [`release`](Self::release)
    pub fn close(&mut self) {
        self.release();
    }
}

impl Drop for MemoryChunk {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for MemoryChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryChunk")
            .field("size", &self.size)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_gauge_delta_saturates() {
        assert_eq!(gauge_delta(0), 0);
        assert_eq!(gauge_delta(4096), 4096);
        assert_eq!(gauge_delta(usize::MAX), i64::MAX);
        assert!(gauge_delta(i64::MAX as usize + 1) > 0);
    }

    #[test]
    fn test_unbounded_huge_grant() -> Result<()> {
        let manager = GlobalMemoryManager::unbounded();
        let mut chunk = manager.allocate(0, usize::MAX)?;
        assert_eq!(chunk.size(), usize::MAX);
        chunk.release();
        assert_eq!(manager.used_memory(), 0);
        Ok(())
    }

    #[test]
    fn test_allocate_within_budget() -> Result<()> {
        let manager = GlobalMemoryManager::new(1000, Duration::ZERO);

        let chunk = manager.allocate(100, 400)?;
        assert_eq!(chunk.size(), 400);
        assert_eq!(manager.available_memory(), 600);

        // Only 600 left, so the grant is capped
        let chunk2 = manager.allocate(0, 800)?;
        assert_eq!(chunk2.size(), 600);
        assert_eq!(manager.available_memory(), 0);
        Ok(())
    }

    #[test]
    fn test_allocate_exhausted() -> Result<()> {
        let manager = GlobalMemoryManager::new(100, Duration::from_millis(10));
        let _held = manager.allocate(100, 100)?;

        match manager.allocate(1, 50) {
            Err(Error::ResourceExhausted {
                requested,
                available,
            }) => {
                assert_eq!(requested, 1);
                assert_eq!(available, 0);
            }
            other => panic!("Expected ResourceExhausted, got {:?}", other),
        }

        // Zero minimum still succeeds with an empty grant
        let empty = manager.allocate(0, 50)?;
        assert_eq!(empty.size(), 0);
        Ok(())
    }

    #[test]
    fn test_min_greater_than_max() {
        let manager = GlobalMemoryManager::unbounded();
        assert!(matches!(
            manager.allocate(10, 5),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_release_is_idempotent() -> Result<()> {
        let manager = GlobalMemoryManager::new(1000, Duration::ZERO);
        let mut chunk = manager.allocate(0, 300)?;

        chunk.release();
        assert!(chunk.is_released());
        assert_eq!(chunk.size(), 0);
        assert_eq!(manager.used_memory(), 0);

        chunk.close();
        chunk.resize(10)?;
        assert_eq!(chunk.size(), 0);
        assert_eq!(manager.used_memory(), 0);

        drop(chunk);
        assert_eq!(manager.used_memory(), 0);
        Ok(())
    }

    #[test]
    fn test_drop_releases() -> Result<()> {
        let manager = GlobalMemoryManager::new(1000, Duration::ZERO);
        {
            let _chunk = manager.allocate(0, 700)?;
            assert_eq!(manager.used_memory(), 700);
        }
        assert_eq!(manager.used_memory(), 0);
        Ok(())
    }

    #[test]
    fn test_resize() -> Result<()> {
        let manager = GlobalMemoryManager::new(1000, Duration::ZERO);
        let mut chunk = manager.allocate(0, 500)?;

        chunk.resize(120)?;
        assert_eq!(chunk.size(), 120);
        assert_eq!(manager.used_memory(), 120);

        chunk.resize(400)?;
        assert_eq!(chunk.size(), 400);
        assert_eq!(manager.used_memory(), 400);

        // Bounded by the maximum requested at allocation
        assert!(chunk.resize(501).is_err());
        assert_eq!(chunk.size(), 400);
        Ok(())
    }

    #[test]
    fn test_resize_grow_exhausted() -> Result<()> {
        let manager = GlobalMemoryManager::new(100, Duration::ZERO);
        let mut chunk = manager.allocate(0, 100)?;
        chunk.resize(10)?;
        let _other = manager.allocate(90, 90)?;

        assert!(matches!(
            chunk.resize(50),
            Err(Error::ResourceExhausted { .. })
        ));
        assert_eq!(chunk.size(), 10);
        Ok(())
    }

    #[test]
    fn test_waiting_allocation_wakes_on_release() -> Result<()> {
        let manager = GlobalMemoryManager::new(100, Duration::from_secs(5));
        let held = manager.allocate(100, 100)?;

        let waiter = {
            let manager = manager.clone();
            thread::spawn(move || manager.allocate(60, 60).map(|chunk| chunk.size()))
        };

        thread::sleep(Duration::from_millis(20));
        drop(held);

        let granted = waiter.join().expect("waiter thread panicked")?;
        assert_eq!(granted, 60);
        Ok(())
    }
}
