use crate::config::LimitsConfig;
use crate::error::{Error, Result};
use crate::types::ResourceClass;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

struct ClassPool {
    class: ResourceClass,
    ceiling: usize,
    semaphore: Arc<Semaphore>,
    in_use: AtomicUsize,
    peak: AtomicUsize,
    acquired_total: AtomicU64,
    released_total: AtomicU64,
}

/// Fixed-size permit pools, one per resource class
pub struct ResourcePool {
    classes: [Arc<ClassPool>; 3],
}

/// Point-in-time view of one class's pool
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PoolUsage {
    /// Resource class
    pub class: ResourceClass,
    /// Configured ceiling
    pub ceiling: usize,
    /// Permits currently held
    pub in_use: usize,
    /// Highest `in_use` ever observed
    pub peak: usize,
    /// Permits handed out since startup
    pub acquired_total: u64,
    /// Permits returned since startup
    pub released_total: u64,
}

/// A held resource-class permit; returned to the pool on drop
pub struct ResourcePermit {
    pool: Arc<ClassPool>,
    _permit: OwnedSemaphorePermit,
}

impl ResourcePermit {
    /// Class this permit belongs to
    pub fn class(&self) -> ResourceClass {
        self.pool.class
    }
}

impl std::fmt::Debug for ResourcePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePermit")
            .field("class", &self.pool.class)
            .finish()
    }
}

impl Drop for ResourcePermit {
    fn drop(&mut self) {
        // Counters drop before the semaphore permit is returned, so in_use never
        // reads above the ceiling.
        self.pool.in_use.fetch_sub(1, Ordering::SeqCst);
        self.pool.released_total.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(resource_class = %self.pool.class, "resource permit released");
    }
}

impl ResourcePool {
    /// Build pools sized from the configured ceilings
    pub fn new(limits: &LimitsConfig) -> Self {
        let make = |class: ResourceClass| {
            let ceiling = limits.ceiling(class);
            Arc::new(ClassPool {
                class,
                ceiling,
                semaphore: Arc::new(Semaphore::new(ceiling)),
                in_use: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                acquired_total: AtomicU64::new(0),
                released_total: AtomicU64::new(0),
            })
        };
        Self {
            classes: ResourceClass::ALL.map(make),
        }
    }

    fn pool(&self, class: ResourceClass) -> &Arc<ClassPool> {
        &self.classes[class.index()]
    }

    /// Wait for a permit of `class`
    ///
    /// Waiters are served roughly FIFO. Dropping the returned future before it
    /// completes gives up the place in line without consuming a permit.
    /// Fails with [`Error::ShuttingDown`] once the pool has been closed.
    pub async fn acquire(&self, class: ResourceClass) -> Result<ResourcePermit> {
        let pool = self.pool(class);
        let permit = Arc::clone(&pool.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::ShuttingDown)?;

        let now = pool.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        pool.peak.fetch_max(now, Ordering::SeqCst);
        pool.acquired_total.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(resource_class = %class, in_use = now, "resource permit acquired");

        Ok(ResourcePermit {
            pool: Arc::clone(pool),
            _permit: permit,
        })
    }

    /// Current usage of one class
    pub fn usage(&self, class: ResourceClass) -> PoolUsage {
        let pool = self.pool(class);
        PoolUsage {
            class,
            ceiling: pool.ceiling,
            in_use: pool.in_use.load(Ordering::SeqCst),
            peak: pool.peak.load(Ordering::SeqCst),
            acquired_total: pool.acquired_total.load(Ordering::SeqCst),
            released_total: pool.released_total.load(Ordering::SeqCst),
        }
    }

    /// Usage of every class
    pub fn usage_all(&self) -> Vec<PoolUsage> {
        ResourceClass::ALL.iter().map(|c| self.usage(*c)).collect()
    }

    /// Stop handing out permits; pending and future `acquire` calls fail
    pub fn close(&self) {
        for pool in &self.classes {
            pool.semaphore.close();
        }
    }
}
