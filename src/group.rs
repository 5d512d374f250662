//! Completion tracking for promises.
//!
//! Every promise belongs to a [`PromiseGroup`]. The group counts promises that
//! were constructed but have not yet finished dispatching an observer, and lets
//! a caller block until that count drops to zero. A promise that settles with
//! nobody listening never leaves its group, so waiting on that group will not
//! return; [`PromiseGroup::wait_timeout`] exists to observe that case.
use std::{
    fmt, io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex, OnceLock, PoisonError,
    },
    thread,
    time::Duration,
};

use crate::{
    combinators,
    promise::{Promise, Resolver},
    PromiseResult,
};

const DEFAULT_NAME: &str = "promise";

static GLOBAL: OnceLock<PromiseGroup> = OnceLock::new();

/// A scoped completion tracker that promises are spawned into.
///
/// Cloning a group yields another handle to the same counter.
///
/// # Examples
///
/// ```
/// use promise_out::PromiseGroup;
/// use std::sync::mpsc::channel;
///
/// let group = PromiseGroup::new();
/// let (tx, rx) = channel();
/// group
///     .spawn(|resolver| resolver.resolve(21 * 2))
///     .then(move |value| tx.send(value).unwrap());
/// group.wait();
/// assert_eq!(rx.recv().unwrap(), 42);
/// ```
#[derive(Clone)]
pub struct PromiseGroup {
    inner: Arc<GroupInner>,
}

struct GroupInner {
    name: String,
    stack_size: Option<usize>,
    outstanding: Mutex<usize>,
    idle: Condvar,
    next_id: AtomicU64,
}

/// Builder for a [`PromiseGroup`].
///
/// ```
/// use promise_out::PromiseGroup;
///
/// let group = PromiseGroup::builder().name("fetch").stack_size(256 * 1024).build();
/// assert_eq!(group.name(), "fetch");
/// ```
#[derive(Debug, Clone)]
pub struct GroupBuilder {
    name: String,
    stack_size: Option<usize>,
}

impl GroupBuilder {
    pub fn new() -> Self {
        Self {
            name: DEFAULT_NAME.to_owned(),
            stack_size: None,
        }
    }

    /// Label used as the prefix of spawned thread names and in log fields.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Stack size in bytes for executor and observer threads.
    ///
    /// # Panics
    ///
    /// Panics if `bytes == 0`.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        assert!(bytes > 0, "stack_size must be > 0");
        self.stack_size = Some(bytes);
        self
    }

    pub fn build(self) -> PromiseGroup {
        PromiseGroup {
            inner: Arc::new(GroupInner {
                name: self.name,
                stack_size: self.stack_size,
                outstanding: Mutex::new(0),
                idle: Condvar::new(),
                next_id: AtomicU64::new(0),
            }),
        }
    }
}

impl Default for GroupBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PromiseGroup {
    /// Creates a group with the default configuration.
    pub fn new() -> Self {
        GroupBuilder::new().build()
    }

    pub fn builder() -> GroupBuilder {
        GroupBuilder::new()
    }

    /// The process-wide group used by [`Promise::new`], the free combinators
    /// and [`wait_for_promises`].
    pub fn global() -> &'static PromiseGroup {
        GLOBAL.get_or_init(PromiseGroup::new)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of promises that have not finished dispatching an observer.
    pub fn outstanding(&self) -> usize {
        *self.lock()
    }

    /// Constructs a promise tracked by this group and starts `executor` on its
    /// own thread.
    pub fn spawn<T, F>(&self, executor: F) -> Promise<T>
    where
        T: Send + 'static,
        F: FnOnce(Resolver<T>) + Send + 'static,
    {
        Promise::new_in(self, executor)
    }

    /// Blocks until every tracked promise has dispatched its observer.
    pub fn wait(&self) {
        let mut outstanding = self.lock();
        while *outstanding > 0 {
            outstanding = self
                .inner
                .idle
                .wait(outstanding)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`PromiseGroup::wait`] but gives up after `timeout`.
    ///
    /// Returns `true` when the group drained in time.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (outstanding, _) = self
            .inner
            .idle
            .wait_timeout_while(self.lock(), timeout, |outstanding| *outstanding > 0)
            .unwrap_or_else(PoisonError::into_inner);
        *outstanding == 0
    }

    /// See [`combinators::all`].
    pub fn all<T, I>(&self, promises: I) -> Promise<Vec<T>>
    where
        T: Send + 'static,
        I: IntoIterator<Item = Promise<T>>,
    {
        combinators::all_in(self, promises)
    }

    /// See [`combinators::race`].
    pub fn race<T, I>(&self, promises: I) -> Promise<T>
    where
        T: Send + 'static,
        I: IntoIterator<Item = Promise<T>>,
    {
        combinators::race_in(self, promises)
    }

    /// See [`combinators::all_settled`].
    pub fn all_settled<T, I>(&self, promises: I) -> Promise<Vec<PromiseResult<T>>>
    where
        T: Send + 'static,
        I: IntoIterator<Item = Promise<T>>,
    {
        combinators::all_settled_in(self, promises)
    }

    /// See [`combinators::any`].
    pub fn any<T, I>(&self, promises: I) -> Promise<T>
    where
        T: Send + 'static,
        I: IntoIterator<Item = Promise<T>>,
    {
        combinators::any_in(self, promises)
    }

    /// Registers a new promise and returns its id.
    pub(crate) fn enter(&self) -> u64 {
        *self.lock() += 1;
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Guard that releases one registration when dropped.
    pub(crate) fn completion(&self) -> Completion {
        Completion {
            group: self.clone(),
        }
    }

    pub(crate) fn spawn_thread<F>(&self, role: &str, work: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut builder = thread::Builder::new().name(format!("{}-{}", self.inner.name, role));
        if let Some(bytes) = self.inner.stack_size {
            builder = builder.stack_size(bytes);
        }
        builder.spawn(work).map(drop)
    }

    fn leave(&self) {
        let mut outstanding = self.lock();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.inner.idle.notify_all();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, usize> {
        self.inner
            .outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for PromiseGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PromiseGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseGroup")
            .field("name", &self.inner.name)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// Releases one registration from its group on drop, including during unwinding.
pub(crate) struct Completion {
    group: PromiseGroup,
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.group.leave();
    }
}

/// Blocks until every promise in the global group has dispatched its observer.
pub fn wait_for_promises() {
    PromiseGroup::global().wait();
}
