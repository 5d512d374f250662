use std::{
    fmt, mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{Error, PromiseGroup};

type OnFulfilled<T> = Box<dyn FnOnce(T) + Send>;
type OnRejected = Box<dyn FnOnce(Error) + Send>;
type OnFinally = Box<dyn FnOnce() + Send>;

/// Handle to the eventual outcome of an executor running on its own thread.
///
/// Observers are single slots: registering a second success observer replaces
/// the first. A settlement that happens while no matching observer is
/// registered is kept and handed, exactly once, to the next matching
/// registration or to a `finally`, whichever comes first. Once an observer has been dispatched, later `then`/`catch` calls are
/// ignored.
///
/// # Examples
///
/// ```
/// use promise_out::{Promise, PromiseGroup};
/// use std::sync::mpsc::channel;
///
/// let group = PromiseGroup::new();
/// let (tx, rx) = channel();
/// let tx2 = tx.clone();
/// group
///     .spawn::<u32, _>(|resolver| resolver.reject("something went wrong"))
///     .then(move |value| tx.send(format!("value {value}")).unwrap())
///     .catch(move |err| tx2.send(format!("error {err}")).unwrap());
/// group.wait();
/// assert_eq!(rx.recv().unwrap(), "error something went wrong");
/// ```
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

/// The settle side of a [`Promise`], handed to its executor.
///
/// Every method consumes the resolver, so a promise is settled at most once.
/// Dropping it unsettled rejects the promise with [`Error::ResolverDropped`].
pub struct Resolver<T: Send + 'static> {
    shared: Option<Arc<Shared<T>>>,
}

enum Settlement<T> {
    Fulfilled(T),
    Rejected(Error),
    Finished,
}

enum State<T> {
    Pending,
    /// Settled while nobody matching was listening.
    Settled(Settlement<T>),
    Dispatching,
    Done,
}

struct Shared<T> {
    id: u64,
    group: PromiseGroup,
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    state: State<T>,
    on_fulfilled: Option<OnFulfilled<T>>,
    on_rejected: Option<OnRejected>,
    on_finally: Option<OnFinally>,
}

impl<T> Inner<T> {
    /// Whether `settlement` can be dispatched with the observers present.
    fn accepts(&self, settlement: &Settlement<T>) -> bool {
        let matching = match settlement {
            Settlement::Fulfilled(_) => self.on_fulfilled.is_some(),
            Settlement::Rejected(_) => self.on_rejected.is_some(),
            Settlement::Finished => false,
        };
        matching || self.on_finally.is_some()
    }
}

impl<T: Send + 'static> Promise<T> {
    /// Constructs a promise in the global group and starts `executor` on a new
    /// thread. Returns immediately.
    pub fn new<F>(executor: F) -> Self
    where
        F: FnOnce(Resolver<T>) + Send + 'static,
    {
        Self::new_in(PromiseGroup::global(), executor)
    }

    pub(crate) fn new_in<F>(group: &PromiseGroup, executor: F) -> Self
    where
        F: FnOnce(Resolver<T>) + Send + 'static,
    {
        let id = group.enter();
        let shared = Arc::new(Shared {
            id,
            group: group.clone(),
            inner: Mutex::new(Inner {
                state: State::Pending,
                on_fulfilled: None,
                on_rejected: None,
                on_finally: None,
            }),
        });
        tracing::trace!(group = %group.name(), promise = id, "promise created");

        let resolver = Resolver {
            shared: Some(shared.clone()),
        };
        // On failure the closure is dropped with the resolver inside, which
        // rejects the promise.
        if let Err(err) = group.spawn_thread("exec", move || executor(resolver)) {
            tracing::warn!(group = %group.name(), promise = id, %err, "failed to spawn executor thread");
        }
        Promise { shared }
    }

    /// Installs the success observer, replacing any previous one.
    pub fn then<F>(&self, handler: F) -> Promise<T>
    where
        F: FnOnce(T) + Send + 'static,
    {
        let mut inner = self.shared.lock();
        if self.shared.is_closed(&inner, "then") {
            return self.clone();
        }
        let _replaced = inner.on_fulfilled.replace(Box::new(handler));
        self.shared.dispatch_retained(inner);
        self.clone()
    }

    /// Installs the failure observer, replacing any previous one.
    pub fn catch<F>(&self, handler: F) -> Promise<T>
    where
        F: FnOnce(Error) + Send + 'static,
    {
        let mut inner = self.shared.lock();
        if self.shared.is_closed(&inner, "catch") {
            return self.clone();
        }
        let _replaced = inner.on_rejected.replace(Box::new(handler));
        self.shared.dispatch_retained(inner);
        self.clone()
    }

    /// Installs the completion observer.
    ///
    /// It runs after whichever of the success or failure observer fires, or on
    /// its own when that observer is missing or the executor called
    /// [`Resolver::finish`]. Registration order relative to `then`/`catch`
    /// does not matter. Registered after the dispatch already completed, it
    /// runs right away on a new thread.
    pub fn finally<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.shared.lock();
        if let State::Done = inner.state {
            drop(inner);
            self.shared.run_late_finally(Box::new(handler));
            return;
        }
        let _replaced = inner.on_finally.replace(Box::new(handler));
        if matches!(inner.state, State::Dispatching) {
            drop(inner);
        } else {
            self.shared.dispatch_retained(inner);
        }
    }

    /// Whether the executor has settled this promise.
    pub fn is_settled(&self) -> bool {
        !matches!(self.shared.lock().state, State::Pending)
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.shared.lock().state {
            State::Pending => "pending",
            State::Settled(_) => "settled",
            State::Dispatching => "dispatching",
            State::Done => "done",
        };
        f.debug_struct("Promise")
            .field("id", &self.shared.id)
            .field("group", &self.shared.group.name())
            .field("state", &state)
            .finish()
    }
}

impl<T: Send + 'static> Resolver<T> {
    /// Fulfills the promise with `value`.
    pub fn resolve(mut self, value: T) {
        if let Some(shared) = self.shared.take() {
            shared.settle(Settlement::Fulfilled(value));
        }
    }

    /// Rejects the promise with `err`.
    pub fn reject(mut self, err: impl Into<Error>) {
        if let Some(shared) = self.shared.take() {
            shared.settle(Settlement::Rejected(err.into()));
        }
    }

    /// Signals completion without a value or error; only the `finally`
    /// observer runs.
    pub fn finish(mut self) {
        if let Some(shared) = self.shared.take() {
            shared.settle(Settlement::Finished);
        }
    }
}

impl<T: Send + 'static> Drop for Resolver<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            tracing::debug!(
                group = %shared.group.name(),
                promise = shared.id,
                "resolver dropped without settling"
            );
            shared.settle(Settlement::Rejected(Error::ResolverDropped));
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("promise", &self.shared.as_ref().map(|shared| shared.id))
            .finish()
    }
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a `then`/`catch` registration can no longer fire: the
    /// settlement was dispatched, or it carries no value or error.
    fn is_closed(&self, inner: &Inner<T>, observer: &str) -> bool {
        let closed = matches!(
            inner.state,
            State::Dispatching | State::Done | State::Settled(Settlement::Finished)
        );
        if closed {
            tracing::debug!(
                group = %self.group.name(),
                promise = self.id,
                observer,
                "registration ignored, promise already dispatched"
            );
        }
        closed
    }

    /// Runs a `finally` registered after the dispatch completed. It gets its
    /// own registration so waiters still see it.
    fn run_late_finally(&self, handler: OnFinally) {
        self.group.enter();
        let completion = self.group.completion();
        let spawned = self.group.spawn_thread("observer", move || {
            let _completion = completion;
            handler();
        });
        if let Err(err) = spawned {
            tracing::warn!(group = %self.group.name(), promise = self.id, %err, "failed to spawn observer thread");
        }
    }
}

impl<T: Send + 'static> Shared<T> {
    fn settle(self: &Arc<Self>, settlement: Settlement<T>) {
        let mut inner = self.lock();
        // Each resolver settles at most once and a promise has one resolver.
        debug_assert!(matches!(inner.state, State::Pending), "promise settled twice");
        if !matches!(inner.state, State::Pending) {
            return;
        }
        let mut released = (None, None);
        if let Settlement::Finished = settlement {
            // Neither observer can fire; what they hold is dropped once unlocked.
            released = (inner.on_fulfilled.take(), inner.on_rejected.take());
        }
        let ready = inner.accepts(&settlement);
        inner.state = State::Settled(settlement);
        if ready {
            self.dispatch(inner);
        } else {
            drop(inner);
            tracing::trace!(group = %self.group.name(), promise = self.id, "settled with no observer, retained");
        }
        drop(released);
    }

    /// Dispatches a retained settlement if the observers now accept it.
    fn dispatch_retained(self: &Arc<Self>, inner: MutexGuard<'_, Inner<T>>) {
        let ready = match &inner.state {
            State::Settled(settlement) => inner.accepts(settlement),
            _ => false,
        };
        if ready {
            self.dispatch(inner);
        }
    }

    /// Moves the settlement and its observers onto an observer thread. The
    /// group registration is released when that thread is done, or right away
    /// if it cannot be spawned.
    fn dispatch(self: &Arc<Self>, mut inner: MutexGuard<'_, Inner<T>>) {
        let settlement = match mem::replace(&mut inner.state, State::Dispatching) {
            State::Settled(settlement) => settlement,
            other => {
                inner.state = other;
                return;
            }
        };
        let on_fulfilled = inner.on_fulfilled.take();
        let on_rejected = inner.on_rejected.take();
        drop(inner);

        let completion = self.group.completion();
        let shared = self.clone();
        let spawned = self.group.spawn_thread("observer", move || {
            let _completion = completion;
            let _done = MarkDone {
                shared: shared.clone(),
            };
            // Rebound so the unused observer drops before the registration is released.
            let (on_fulfilled, on_rejected) = (on_fulfilled, on_rejected);
            match settlement {
                Settlement::Fulfilled(value) => {
                    if let Some(handler) = on_fulfilled {
                        handler(value);
                    }
                }
                Settlement::Rejected(err) => {
                    if let Some(handler) = on_rejected {
                        handler(err);
                    }
                }
                Settlement::Finished => {}
            }
            let on_finally = {
                let mut inner = shared.lock();
                inner.state = State::Done;
                inner.on_finally.take()
            };
            if let Some(handler) = on_finally {
                handler();
            }
            tracing::trace!(group = %shared.group.name(), promise = shared.id, "observers done");
        });
        if let Err(err) = spawned {
            tracing::warn!(group = %self.group.name(), promise = self.id, %err, "failed to spawn observer thread");
            self.lock().state = State::Done;
        }
    }
}

/// Moves a dispatched promise to `Done` even when an observer panics, so a
/// later `finally` still runs.
struct MarkDone<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Drop for MarkDone<T> {
    fn drop(&mut self) {
        self.shared.lock().state = State::Done;
    }
}

#[cfg(test)]
mod tests {
    use super::Promise;
    use crate::{Error, PromiseGroup};
    use std::{
        sync::mpsc::{channel, Receiver},
        thread,
        time::Duration,
    };

    const TIMEOUT: Duration = Duration::from_secs(5);
    const QUIET: Duration = Duration::from_millis(100);

    fn settled<T: Send + 'static>(promise: &Promise<T>) {
        while !promise.is_settled() {
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn gate() -> (std::sync::mpsc::Sender<()>, Receiver<()>) {
        channel()
    }

    #[test]
    fn test_resolve_reaches_then() {
        let group = PromiseGroup::new();
        let (tx, rx) = channel();
        group
            .spawn(|resolver| {
                thread::sleep(Duration::from_millis(20));
                resolver.resolve(String::from("🍓"));
            })
            .then(move |value| tx.send(value).unwrap());
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), "🍓");
        group.wait();
        assert_eq!(group.outstanding(), 0);
    }

    #[test]
    fn test_reject_reaches_catch_only() {
        let group = PromiseGroup::new();
        let (tx, rx) = channel();
        let tx2 = tx.clone();
        let (go, wait_go) = gate();
        group
            .spawn::<i32, _>(move |resolver| {
                wait_go.recv().unwrap();
                resolver.reject("reject!!");
            })
            .then(move |value| tx.send(format!("then {value}")).unwrap())
            .catch(move |err| tx2.send(format!("catch {err}")).unwrap());
        go.send(()).unwrap();
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), "catch reject!!");
        group.wait();
        assert!(rx.recv_timeout(QUIET).is_err());
    }

    #[test]
    fn test_then_after_resolve_delivers_once() {
        let group = PromiseGroup::new();
        let promise = group.spawn(|resolver| resolver.resolve(7));
        settled(&promise);
        assert_eq!(group.outstanding(), 1);

        let (tx, rx) = channel();
        let tx2 = tx.clone();
        promise.then(move |value| tx.send(value).unwrap());
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), 7);
        group.wait();

        // The settlement was consumed; a second observer is never called.
        promise.then(move |value| tx2.send(value).unwrap());
        assert!(rx.recv_timeout(QUIET).is_err());
        assert_eq!(group.outstanding(), 0);
    }

    #[test]
    fn test_last_registration_wins() {
        let group = PromiseGroup::new();
        let (tx, rx) = channel();
        let tx2 = tx.clone();
        let (go, wait_go) = gate();
        let promise = group.spawn(move |resolver| {
            wait_go.recv().unwrap();
            resolver.resolve(1);
        });
        promise.then(move |value| tx.send(("first", value)).unwrap());
        promise.then(move |value| tx2.send(("second", value)).unwrap());
        go.send(()).unwrap();
        group.wait();
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), ("second", 1));
        assert!(rx.recv_timeout(QUIET).is_err());
    }

    #[test]
    fn test_finally_runs_after_then_regardless_of_order() {
        let group = PromiseGroup::new();
        let (tx, rx) = channel();
        let tx2 = tx.clone();
        let (go, wait_go) = gate();
        let promise = group.spawn(move |resolver| {
            wait_go.recv().unwrap();
            resolver.resolve(3);
        });
        promise.finally(move || tx.send("finally").unwrap());
        promise.then(move |_| tx2.send("then").unwrap());
        go.send(()).unwrap();
        group.wait();
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), "then");
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), "finally");
    }

    #[test]
    fn test_finally_alone_observes_rejection() {
        let group = PromiseGroup::new();
        let (tx, rx) = channel();
        let (go, wait_go) = gate();
        let promise = group.spawn::<(), _>(move |resolver| {
            wait_go.recv().unwrap();
            resolver.reject("boom");
        });
        promise.finally(move || tx.send(()).unwrap());
        go.send(()).unwrap();
        rx.recv_timeout(TIMEOUT).unwrap();
        assert!(group.wait_timeout(TIMEOUT));
    }

    #[test]
    fn test_finally_alone_after_settlement() {
        let group = PromiseGroup::new();
        let (tx, rx) = channel();
        let promise = group.spawn::<(), _>(|resolver| resolver.reject("boom"));
        settled(&promise);
        promise.finally(move || tx.send(()).unwrap());
        rx.recv_timeout(TIMEOUT).unwrap();
        assert!(group.wait_timeout(TIMEOUT));

        // The settlement went to `finally`; a later `catch` never fires.
        let (tx, rx) = channel::<Error>();
        promise.catch(move |err| tx.send(err).unwrap());
        assert!(rx.recv_timeout(QUIET).is_err());
        assert_eq!(group.outstanding(), 0);
    }

    #[test]
    fn test_finally_after_panicking_observer_still_runs() {
        let group = PromiseGroup::new();
        let (tx, rx) = channel();
        let promise = group.spawn(|resolver| resolver.resolve(1));
        promise.then(|_| panic!("observer blew up"));
        group.wait();
        assert!(format!("{promise:?}").contains("done"));
        promise.finally(move || tx.send(()).unwrap());
        rx.recv_timeout(TIMEOUT).unwrap();
        group.wait();
    }

    #[test]
    fn test_finish_runs_only_finally() {
        let group = PromiseGroup::new();
        let (tx, rx) = channel();
        let (tx2, tx3) = (tx.clone(), tx.clone());
        let (go, wait_go) = gate();
        let promise = group.spawn::<i32, _>(move |resolver| {
            wait_go.recv().unwrap();
            resolver.finish();
        });
        promise
            .then(move |_| tx.send("then").unwrap())
            .catch(move |_| tx2.send("catch").unwrap())
            .finally(move || tx3.send("finally").unwrap());
        go.send(()).unwrap();
        group.wait();
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), "finally");
        assert!(rx.recv_timeout(QUIET).is_err());
    }

    #[test]
    fn test_finally_after_dispatch_still_runs() {
        let group = PromiseGroup::new();
        let (tx, rx) = channel();
        let promise = group.spawn(|resolver| resolver.resolve(()));
        promise.then(|_| {});
        group.wait();
        promise.finally(move || tx.send(()).unwrap());
        rx.recv_timeout(TIMEOUT).unwrap();
        group.wait();
    }

    #[test]
    fn test_dropped_resolver_rejects() {
        let group = PromiseGroup::new();
        let (tx, rx) = channel();
        group
            .spawn::<String, _>(|resolver| {
                // Ensure we move the resolver into this thread but we never
                // settle it.
                std::mem::drop(resolver);
            })
            .catch(move |err| tx.send(err).unwrap());
        assert!(matches!(rx.recv_timeout(TIMEOUT).unwrap(), Error::ResolverDropped));
        group.wait();
    }

    #[test]
    fn test_panicking_executor_rejects() {
        let group = PromiseGroup::new();
        let (tx, rx) = channel();
        let (go, wait_go) = gate();
        group
            .spawn::<u8, _>(move |_resolver| {
                wait_go.recv().unwrap();
                panic!("executor blew up");
            })
            .catch(move |err| tx.send(err.to_string()).unwrap());
        go.send(()).unwrap();
        assert_eq!(
            rx.recv_timeout(TIMEOUT).unwrap(),
            Error::ResolverDropped.to_string()
        );
        group.wait();
    }

    #[test]
    fn test_rejection_without_catch_keeps_group_busy() {
        let group = PromiseGroup::new();
        let promise = group.spawn::<i32, _>(|resolver| resolver.reject("nobody listens"));
        promise.then(|_| unreachable!("rejected promise fulfilled"));
        settled(&promise);
        assert!(!group.wait_timeout(QUIET));
        assert_eq!(group.outstanding(), 1);
    }

    #[test]
    fn test_debug_reports_state() {
        let group = PromiseGroup::builder().name("dbg").build();
        let (go, wait_go) = gate();
        let promise = group.spawn(move |resolver| {
            wait_go.recv().unwrap();
            resolver.resolve(0u8);
        });
        let rendered = format!("{promise:?}");
        assert!(rendered.contains("pending"));
        assert!(rendered.contains("dbg"));
        promise.then(|_| {});
        go.send(()).unwrap();
        group.wait();
    }
}
