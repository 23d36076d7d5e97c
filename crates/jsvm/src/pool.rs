// ContextPool - Reference counted pool of execution contexts
//
// Each context owns a dedicated thread, so the pool bounds how many engine
// threads exist. Contexts are handed out round-robin and created lazily, one
// at a time, up to capacity.

use std::ops::Deref;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

use crate::config::{ConfigError, EngineFactory, PoolConfig};
use crate::context::ExecutionContext;
use crate::error::{ContextError, misuse};

// ─────────────────────────────────────────────────────────────────────────────
// Pool State
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct PoolCell {
    reference_count: isize,
    context: ExecutionContext,
}

#[derive(Debug)]
struct PoolState {
    cursor: usize,
    cells: Vec<Option<PoolCell>>,
    creating: bool,
    created: usize,
}

impl PoolState {
    /// Hand out the context under the cursor, if there is one.
    fn hit(&mut self) -> Option<ExecutionContext> {
        let cell = self.cells[self.cursor].as_mut()?;
        cell.reference_count += 1;
        let context = cell.context.clone();
        self.cursor = self.next_index();
        Some(context)
    }

    /// The next empty slot after the cursor, or one step forward when every
    /// slot is occupied.
    fn next_index(&self) -> usize {
        let capacity = self.cells.len();
        let mut index = self.cursor;
        while self.cells[index].is_some() {
            index = (index + 1) % capacity;
            if index == self.cursor {
                return (self.cursor + 1) % capacity;
            }
        }
        index
    }
}

/// Status of the context pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub capacity: usize,
    pub live: usize,
    pub contexts_created: usize,
    pub reference_counts: Vec<Option<isize>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Context Pool
// ─────────────────────────────────────────────────────────────────────────────

/// A fixed-capacity pool of running execution contexts.
///
/// Every [`acquire`](Self::acquire) takes a reference on the returned context
/// and every [`release`](Self::release) gives one back. Contexts are only
/// reclaimed by an explicit [`garbage_collect`](Self::garbage_collect), and all
/// live contexts are stopped when the pool is dropped.
pub struct ContextPool {
    factory: EngineFactory,
    state: Mutex<PoolState>,
    created: Notify,
}

impl ContextPool {
    /// Create a pool of `capacity` default contexts.
    ///
    /// # Panics
    ///
    /// If `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        Self::with_factory(capacity, EngineFactory::default())
    }

    /// Create a pool whose contexts build their engine with `factory`.
    ///
    /// # Panics
    ///
    /// If `capacity` is zero.
    pub fn with_factory(capacity: usize, factory: EngineFactory) -> Self {
        if capacity == 0 {
            misuse("ContextPool capacity must be at least 1");
        }

        tracing::info!("ContextPool created with capacity {}", capacity);

        Self {
            factory,
            state: Mutex::new(PoolState {
                cursor: 0,
                cells: (0..capacity).map(|_| None).collect(),
                creating: false,
                created: 0,
            }),
            created: Notify::new(),
        }
    }

    /// Create a pool from validated configuration.
    pub fn from_config(config: &PoolConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::with_factory(config.capacity, config.factory()))
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().cells.len()
    }

    /// Take a reference on the next context in round-robin order, starting a
    /// new one if its slot is empty.
    ///
    /// At most one context is being created at any time; concurrent callers
    /// wait for it and then re-check the slot.
    pub async fn acquire(&self) -> Result<ExecutionContext, ContextError> {
        loop {
            let notified = self.created.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let index = {
                let mut state = self.state.lock();
                if let Some(context) = state.hit() {
                    return Ok(context);
                }
                if state.creating {
                    None
                } else {
                    state.creating = true;
                    Some(state.cursor)
                }
            };

            let Some(index) = index else {
                notified.await;
                continue;
            };

            let _creating = CreationGuard { pool: self };
            let context = ExecutionContext::start(self.factory.clone()).await?;

            let mut state = self.state.lock();
            state.cells[index] = Some(PoolCell {
                reference_count: 1,
                context: context.clone(),
            });
            state.created += 1;
            state.cursor = state.next_index();
            tracing::debug!(context = %context.id(), slot = index, "Pool context created");
            return Ok(context);
        }
    }

    /// [`acquire`](Self::acquire) with a guard that releases on drop.
    pub async fn lease(&self) -> Result<ContextLease<'_>, ContextError> {
        let context = self.acquire().await?;
        Ok(ContextLease { pool: self, context })
    }

    /// Give back one reference on `context`. Never stops it.
    pub fn release(&self, context: &ExecutionContext) {
        let mut state = self.state.lock();
        for cell in state.cells.iter_mut().flatten() {
            if cell.context == *context {
                cell.reference_count -= 1;
            }
        }
    }

    /// Stop and forget every context nobody holds a reference on.
    ///
    /// Returns how many contexts were reclaimed.
    pub fn garbage_collect(&self) -> usize {
        let mut reclaimed = Vec::new();
        {
            let mut state = self.state.lock();
            for slot in state.cells.iter_mut() {
                if matches!(slot, Some(cell) if cell.reference_count <= 0) {
                    if let Some(cell) = slot.take() {
                        reclaimed.push(cell.context);
                    }
                }
            }
        }

        for context in &reclaimed {
            context.stop();
        }
        if !reclaimed.is_empty() {
            tracing::debug!("ContextPool reclaimed {} contexts", reclaimed.len());
        }
        reclaimed.len()
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        PoolStatus {
            capacity: state.cells.len(),
            live: state.cells.iter().flatten().count(),
            contexts_created: state.created,
            reference_counts: state
                .cells
                .iter()
                .map(|cell| cell.as_ref().map(|cell| cell.reference_count))
                .collect(),
        }
    }

    /// Stop every live context and empty the pool.
    pub fn shutdown(&self) {
        let contexts: Vec<ExecutionContext> = {
            let mut state = self.state.lock();
            state
                .cells
                .iter_mut()
                .filter_map(|cell| cell.take().map(|cell| cell.context))
                .collect()
        };
        for context in &contexts {
            context.stop();
        }
        tracing::info!("ContextPool shut down ({} contexts stopped)", contexts.len());
    }
}

impl Drop for ContextPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Clears the in-flight creation flag and wakes waiters, even if creation
/// failed or the acquiring task was dropped.
struct CreationGuard<'a> {
    pool: &'a ContextPool,
}

impl Drop for CreationGuard<'_> {
    fn drop(&mut self) {
        self.pool.state.lock().creating = false;
        self.pool.created.notify_waiters();
    }
}

/// A pool reference released when dropped.
pub struct ContextLease<'a> {
    pool: &'a ContextPool,
    context: ExecutionContext,
}

impl ContextLease<'_> {
    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }
}

impl Deref for ContextLease<'_> {
    type Target = ExecutionContext;

    fn deref(&self) -> &ExecutionContext {
        &self.context
    }
}

impl Drop for ContextLease<'_> {
    fn drop(&mut self) {
        self.pool.release(&self.context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    /// Decrements the live-thread count when its worker thread exits.
    struct LiveThread(Arc<AtomicUsize>);

    impl Drop for LiveThread {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    thread_local! {
        static LIVE_THREAD: RefCell<Option<LiveThread>> = const { RefCell::new(None) };
    }

    /// A factory whose engines count their worker threads and start slowly.
    fn counting_factory(live: Arc<AtomicUsize>) -> EngineFactory {
        EngineFactory::default().with_setup(move |_| {
            live.fetch_add(1, Ordering::SeqCst);
            LIVE_THREAD.with(|slot| *slot.borrow_mut() = Some(LiveThread(live.clone())));
            std::thread::sleep(Duration::from_millis(50));
            Ok(())
        })
    }

    async fn wait_for_live(live: &AtomicUsize, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while live.load(Ordering::SeqCst) != expected && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(live.load(Ordering::SeqCst), expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_capacity_one_shares_one_context() {
        let pool = Arc::new(ContextPool::new(1));

        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.acquire().await.unwrap() })
            })
            .collect();

        let mut engines = HashSet::new();
        for task in tasks {
            let context = task.await.unwrap();
            let engine = context.with_engine(|engine| engine.id()).await.unwrap();
            engines.insert(engine);
        }

        assert_eq!(engines.len(), 1);
        let status = pool.status();
        assert_eq!(status.contexts_created, 1);
        assert_eq!(status.reference_counts, vec![Some(100)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquires_never_exceed_capacity() {
        let pool = Arc::new(ContextPool::new(3));

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.acquire().await.unwrap() })
            })
            .collect();

        let mut contexts = HashSet::new();
        for task in tasks {
            contexts.insert(task.await.unwrap().id());
        }

        assert!(contexts.len() <= 3);
        assert!(pool.status().contexts_created <= 3);
    }

    #[tokio::test]
    async fn test_round_robin_wraps_around() {
        let pool = ContextPool::new(3);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        let d = pool.acquire().await.unwrap();

        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
        assert_eq!(a, d);
        assert_eq!(pool.status().contexts_created, 3);
        assert_eq!(
            pool.status().reference_counts,
            vec![Some(2), Some(1), Some(1)]
        );
    }

    #[tokio::test]
    async fn test_garbage_collect_after_release() {
        let pool = ContextPool::new(2);
        let context = pool.acquire().await.unwrap();

        pool.release(&context);
        assert!(context.is_running());
        assert_eq!(pool.garbage_collect(), 1);

        assert!(!context.is_running());
        assert_eq!(pool.status().live, 0);
    }

    #[tokio::test]
    async fn test_garbage_collect_keeps_referenced_contexts() {
        let pool = ContextPool::new(2);
        let context = pool.acquire().await.unwrap();

        assert_eq!(pool.garbage_collect(), 0);
        assert!(context.is_running());
        assert_eq!(pool.status().live, 1);
    }

    #[tokio::test]
    async fn test_reclaimed_slot_is_refilled() {
        let pool = ContextPool::new(1);
        let first = pool.acquire().await.unwrap();
        pool.release(&first);
        pool.garbage_collect();

        let second = pool.acquire().await.unwrap();
        assert_ne!(first, second);
        assert!(second.is_running());
        assert_eq!(pool.status().contexts_created, 2);
    }

    #[tokio::test]
    async fn test_lease_releases_on_drop() {
        let pool = ContextPool::new(1);
        {
            let lease = pool.lease().await.unwrap();
            assert!(lease.is_running());
            assert_eq!(pool.status().reference_counts, vec![Some(1)]);
        }
        assert_eq!(pool.status().reference_counts, vec![Some(0)]);
        assert_eq!(pool.garbage_collect(), 1);
    }

    #[tokio::test]
    async fn test_drop_stops_contexts() {
        let pool = ContextPool::new(2);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        drop(pool);
        assert!(!a.is_running());
        assert!(!b.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_acquires_leave_no_threads_behind() {
        let live = Arc::new(AtomicUsize::new(0));
        let pool = ContextPool::with_factory(1, counting_factory(live.clone()));

        for _ in 0..5 {
            let acquire = pool.acquire();
            tokio::pin!(acquire);
            assert!(futures::poll!(acquire.as_mut()).is_pending());
        }

        let context = pool.acquire().await.unwrap();
        wait_for_live(&live, 1).await;
        assert_eq!(pool.status().contexts_created, 1);
        assert_eq!(pool.status().reference_counts, vec![Some(1)]);

        drop(pool);
        assert!(!context.is_running());
        wait_for_live(&live, 0).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timed_out_acquire_does_not_fill_slot() {
        let live = Arc::new(AtomicUsize::new(0));
        let pool = ContextPool::with_factory(2, counting_factory(live.clone()));

        let timed_out = tokio::time::timeout(Duration::from_millis(5), pool.acquire()).await;
        assert!(timed_out.is_err());
        assert_eq!(pool.status().live, 0);
        wait_for_live(&live, 0).await;

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_ne!(a, b);
        wait_for_live(&live, 2).await;
    }

    #[tokio::test]
    async fn test_from_config() {
        let config = PoolConfig::from_toml_str("capacity = 2\nthread_name = \"pooled\"").unwrap();
        let pool = ContextPool::from_config(&config).unwrap();
        assert_eq!(pool.capacity(), 2);

        let bad = PoolConfig {
            capacity: 0,
            ..PoolConfig::default()
        };
        assert!(matches!(
            ContextPool::from_config(&bad),
            Err(ConfigError::InvalidCapacity)
        ));
    }

    #[test]
    #[should_panic(expected = "at least 1")]
    fn test_zero_capacity_is_misuse() {
        let _ = ContextPool::new(0);
    }

    #[test]
    fn test_next_index() {
        let context = ExecutionContext::new();
        let cell = || {
            Some(PoolCell {
                reference_count: 1,
                context: context.clone(),
            })
        };
        let mut state = PoolState {
            cursor: 0,
            cells: vec![cell(), None, cell()],
            creating: false,
            created: 0,
        };
        assert_eq!(state.next_index(), 1);

        state.cells[1] = cell();
        assert_eq!(state.next_index(), 1);

        state.cursor = 2;
        assert_eq!(state.next_index(), 0);
    }
}
