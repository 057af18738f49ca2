use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use metrics::gauge;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::debug;

use crate::bail;
use crate::error::{ErrorKind, IpiResult};
use crate::metrics::IPI_POOL_WAITING;
use crate::native::QueryResults;

/// Snapshot of the pool occupancy.
///
/// While the pool is open `borrowed + resting == size` holds for every snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolCounts {
    pub borrowed: usize,
    pub resting: usize,
    pub size: usize,
}

#[derive(Debug)]
struct PoolEntries<R> {
    resting: Vec<R>,
    borrowed: usize,
    closed: bool,
}

#[derive(Debug)]
struct PoolInner<R> {
    entries: Mutex<PoolEntries<R>>,
    permits: Semaphore,
    size: usize,
}

/// Fixed-size pool of result objects, one borrowed per query.
///
/// Borrowers wait asynchronously when every entry is in use. Entries are released to the native
/// layer only when the pool is closed.
#[derive(Debug)]
pub struct ResultsPool<R> {
    inner: Arc<PoolInner<R>>,
}

impl<R> Clone for ResultsPool<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: QueryResults> ResultsPool<R> {
    /// Creates a pool holding `size` entries built by `factory`.
    pub fn new(size: usize, mut factory: impl FnMut() -> R) -> Self {
        let resting = (0..size).map(|_| factory()).collect();

        Self {
            inner: Arc::new(PoolInner {
                entries: Mutex::new(PoolEntries {
                    resting,
                    borrowed: 0,
                    closed: false,
                }),
                permits: Semaphore::new(size),
                size,
            }),
        }
    }

    /// Borrows an entry, waiting until one is returned if all are in use.
    ///
    /// Fails with [`ErrorKind::PoolClosed`] once the pool is closed.
    pub async fn acquire(&self) -> IpiResult<PooledResults<'_, R>> {
        let permit = match self.inner.permits.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                gauge!(IPI_POOL_WAITING).increment(1.0);
                let permit = self.inner.permits.acquire().await;
                gauge!(IPI_POOL_WAITING).decrement(1.0);

                match permit {
                    Ok(permit) => permit,
                    Err(_) => bail!(ErrorKind::PoolClosed, "Results pool is closed"),
                }
            }
        };

        let mut entries = self.inner.entries.lock();
        if entries.closed {
            bail!(ErrorKind::PoolClosed, "Results pool is closed");
        }

        let Some(results) = entries.resting.pop() else {
            bail!(
                ErrorKind::InvalidState,
                "Results pool has a free permit but no resting entry"
            );
        };
        entries.borrowed += 1;
        drop(entries);

        Ok(PooledResults {
            pool: self,
            results: Some(results),
            _permit: permit,
        })
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn counts(&self) -> PoolCounts {
        let entries = self.inner.entries.lock();
        PoolCounts {
            borrowed: entries.borrowed,
            resting: entries.resting.len(),
            size: self.inner.size,
        }
    }

    /// Closes the pool and releases every resting entry.
    ///
    /// Entries still borrowed are released when their borrower returns them. Returns the number of
    /// entries released by this call; closing twice releases nothing the second time.
    pub fn close(&self) -> usize {
        self.inner.permits.close();

        let mut entries = self.inner.entries.lock();
        entries.closed = true;
        let mut resting = std::mem::take(&mut entries.resting);
        let borrowed = entries.borrowed;
        drop(entries);

        for results in resting.iter_mut() {
            results.release();
        }

        debug!(
            released = resting.len(),
            still_borrowed = borrowed,
            "results pool closed"
        );

        resting.len()
    }

    fn give_back(&self, mut results: R) {
        let mut entries = self.inner.entries.lock();
        entries.borrowed -= 1;

        if entries.closed {
            drop(entries);
            results.release();
            return;
        }

        entries.resting.push(results);
    }
}

/// Entry borrowed from a [`ResultsPool`], returned when dropped.
pub struct PooledResults<'a, R: QueryResults> {
    pool: &'a ResultsPool<R>,
    results: Option<R>,
    // Dropped after the entry went back to the pool.
    _permit: SemaphorePermit<'a>,
}

impl<R: QueryResults> Deref for PooledResults<'_, R> {
    type Target = R;

    fn deref(&self) -> &R {
        self.results.as_ref().expect("entry is only taken on drop")
    }
}

impl<R: QueryResults> DerefMut for PooledResults<'_, R> {
    fn deref_mut(&mut self) -> &mut R {
        self.results.as_mut().expect("entry is only taken on drop")
    }
}

impl<R: QueryResults> Drop for PooledResults<'_, R> {
    fn drop(&mut self) {
        if let Some(results) = self.results.take() {
            self.pool.give_back(results);
        }
    }
}
