//! Awaiting a promise from async code.
//!
//! [`Promise::outcome`] takes over the success and failure observers of a
//! promise and hands back a future that completes with whichever fires.
use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll, Waker},
};

use crate::{Error, Promise};

/// Future returned by [`Promise::outcome`].
///
/// # Examples
///
/// ```
/// use promise_out::PromiseGroup;
/// use futures::executor::block_on;
///
/// let group = PromiseGroup::new();
/// let outcome = group.spawn(|resolver| resolver.resolve("Hi")).outcome();
/// assert_eq!(block_on(outcome).unwrap(), "Hi");
/// ```
pub struct Outcome<T> {
    shared: Arc<Mutex<Inner<T>>>,
}

/// Fills the outcome; shared by the success and failure observers so only the
/// last one dropped taints it.
struct Completer<T> {
    shared: Arc<Mutex<Inner<T>>>,
}

#[derive(Debug)]
enum WakerState {
    Fresh,
    Tainted,
}

struct Inner<T> {
    value: Option<Result<T, Error>>,
    waker: Result<Waker, WakerState>,
}

fn lock<T>(shared: &Mutex<Inner<T>>) -> MutexGuard<'_, Inner<T>> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Send + 'static> Promise<T> {
    /// Replaces the success and failure observers with ones that complete the
    /// returned future.
    ///
    /// A promise that finishes without a value or error, or whose machinery is
    /// dropped unsettled, completes with [`Error::Unsettled`]. `finally`
    /// observers are unaffected.
    pub fn outcome(&self) -> Outcome<T> {
        let shared = Arc::new(Mutex::new(Inner {
            value: None,
            waker: Err(WakerState::Fresh),
        }));
        let on_fulfilled = Arc::new(Completer {
            shared: shared.clone(),
        });
        let on_rejected = on_fulfilled.clone();
        self.then(move |value| on_fulfilled.complete(Ok(value)))
            .catch(move |err| on_rejected.complete(Err(err)));
        Outcome { shared }
    }
}

impl<T> Completer<T> {
    fn complete(&self, value: Result<T, Error>) {
        let mut inner = lock(&self.shared);
        inner.value = Some(value);
        if let Ok(waker) = std::mem::replace(&mut inner.waker, Err(WakerState::Tainted)) {
            waker.wake()
        }
    }
}

impl<T> Drop for Completer<T> {
    /// If no observer completed the outcome, wake it with an error.
    fn drop(&mut self) {
        let mut inner = lock(&self.shared);
        if let Ok(waker) = std::mem::replace(&mut inner.waker, Err(WakerState::Tainted)) {
            waker.wake()
        }
    }
}

impl<T> Future for Outcome<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = lock(&self.shared);
        match inner.value.take() {
            Some(value) => Poll::Ready(value),
            None => match std::mem::replace(&mut inner.waker, Ok(cx.waker().clone())) {
                Err(WakerState::Tainted) => Poll::Ready(Err(Error::Unsettled)),
                _ => Poll::Pending,
            },
        }
    }
}

impl<T> fmt::Debug for Outcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock(&self.shared);
        f.debug_struct("Outcome")
            .field("ready", &inner.value.is_some())
            .field("waker", &inner.waker.as_ref().err())
            .finish()
    }
}
