//! Promises built from the settlement of other promises.
//!
//! Each combinator spawns an aggregate promise whose executor attaches `then`
//! and `catch` to every input. Because observers are single slots, this
//! replaces whatever the caller had registered on the inputs.
//!
//! The aggregate's [`Resolver`] lives in a state shared by the input
//! observers, under one lock owned by that combinator call. Taking the
//! resolver out of the state is what settles the aggregate, so later inputs
//! find nothing to settle. The lock is always released before the aggregate
//! is settled. If every input observer is dropped before the aggregate
//! condition is met (an input finished without a payload, or the caller
//! re-registered over the combinator's observers), the resolver goes with
//! them and the aggregate rejects with [`Error::ResolverDropped`].
use std::{
    mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{Error, Promise, PromiseGroup, Resolver};

/// Settlement of one input of [`all_settled`], kept at that input's index.
#[derive(Debug, Clone)]
pub enum PromiseResult<T> {
    Fulfilled(T),
    Rejected(Error),
}

impl<T> PromiseResult<T> {
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, PromiseResult::Fulfilled(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            PromiseResult::Fulfilled(value) => Some(value),
            PromiseResult::Rejected(_) => None,
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            PromiseResult::Fulfilled(_) => None,
            PromiseResult::Rejected(err) => Some(err),
        }
    }

    pub fn into_result(self) -> Result<T, Error> {
        match self {
            PromiseResult::Fulfilled(value) => Ok(value),
            PromiseResult::Rejected(err) => Err(err),
        }
    }
}

impl<T> From<PromiseResult<T>> for Result<T, Error> {
    fn from(result: PromiseResult<T>) -> Self {
        result.into_result()
    }
}

fn lock<S>(state: &Mutex<S>) -> MutexGuard<'_, S> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Index-ordered slots plus the count of slots still empty.
struct Slots<T, R: Send + 'static> {
    resolver: Option<Resolver<R>>,
    slots: Vec<Option<T>>,
    remaining: usize,
}

impl<T, R: Send + 'static> Slots<T, R> {
    fn new(resolver: Resolver<R>, len: usize) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Slots {
            resolver: Some(resolver),
            slots: (0..len).map(|_| None).collect(),
            remaining: len,
        }))
    }

    /// Fills `index`; once every slot is filled, hands back the resolver (if
    /// the aggregate is still unsettled) together with the ordered values.
    fn fill(&mut self, index: usize, value: T) -> Option<(Resolver<R>, Vec<T>)> {
        if self.slots[index].replace(value).is_none() {
            self.remaining -= 1;
        }
        if self.remaining > 0 {
            return None;
        }
        let resolver = self.resolver.take()?;
        let values = mem::take(&mut self.slots).into_iter().flatten().collect();
        Some((resolver, values))
    }
}

/// Fulfills with every input's value in input order, or rejects with the
/// first rejection observed.
///
/// With no inputs the aggregate fulfills with an empty vector.
pub fn all<T, I>(promises: I) -> Promise<Vec<T>>
where
    T: Send + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    all_in(PromiseGroup::global(), promises)
}

/// Settles like the first input to fulfill or reject.
///
/// With no inputs the aggregate rejects with [`Error::EmptyRace`].
pub fn race<T, I>(promises: I) -> Promise<T>
where
    T: Send + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    race_in(PromiseGroup::global(), promises)
}

/// Fulfills once every input has settled, with one [`PromiseResult`] per
/// input in input order. Never rejects.
pub fn all_settled<T, I>(promises: I) -> Promise<Vec<PromiseResult<T>>>
where
    T: Send + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    all_settled_in(PromiseGroup::global(), promises)
}

/// Fulfills with the first input to fulfill; rejects with
/// [`Error::Aggregate`] once every input has rejected.
///
/// With no inputs the aggregate rejects with [`Error::AllRejected`].
pub fn any<T, I>(promises: I) -> Promise<T>
where
    T: Send + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    any_in(PromiseGroup::global(), promises)
}

pub(crate) fn all_in<T, I>(group: &PromiseGroup, promises: I) -> Promise<Vec<T>>
where
    T: Send + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    let promises: Vec<_> = promises.into_iter().collect();
    group.spawn(move |resolver| {
        if promises.is_empty() {
            resolver.resolve(Vec::new());
            return;
        }

        let state = Slots::new(resolver, promises.len());
        for (index, promise) in promises.iter().enumerate() {
            let on_value = state.clone();
            let on_error = state.clone();
            promise
                .then(move |value| {
                    let filled = lock(&on_value).fill(index, value);
                    if let Some((resolver, values)) = filled {
                        resolver.resolve(values);
                    }
                })
                .catch(move |err| {
                    let resolver = lock(&on_error).resolver.take();
                    if let Some(resolver) = resolver {
                        tracing::debug!(input = index, %err, "all rejected");
                        resolver.reject(err);
                    }
                });
        }
    })
}

pub(crate) fn race_in<T, I>(group: &PromiseGroup, promises: I) -> Promise<T>
where
    T: Send + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    let promises: Vec<_> = promises.into_iter().collect();
    group.spawn(move |resolver| {
        if promises.is_empty() {
            resolver.reject(Error::EmptyRace);
            return;
        }

        let settled = Arc::new(Mutex::new(Some(resolver)));
        for (index, promise) in promises.iter().enumerate() {
            let on_value = settled.clone();
            let on_error = settled.clone();
            promise
                .then(move |value| {
                    let resolver = lock(&on_value).take();
                    if let Some(resolver) = resolver {
                        tracing::debug!(input = index, "race fulfilled");
                        resolver.resolve(value);
                    }
                })
                .catch(move |err| {
                    let resolver = lock(&on_error).take();
                    if let Some(resolver) = resolver {
                        tracing::debug!(input = index, %err, "race rejected");
                        resolver.reject(err);
                    }
                });
        }
    })
}

pub(crate) fn all_settled_in<T, I>(group: &PromiseGroup, promises: I) -> Promise<Vec<PromiseResult<T>>>
where
    T: Send + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    let promises: Vec<_> = promises.into_iter().collect();
    group.spawn(move |resolver| {
        if promises.is_empty() {
            resolver.resolve(Vec::new());
            return;
        }

        let state = Slots::new(resolver, promises.len());
        for (index, promise) in promises.iter().enumerate() {
            let on_value = state.clone();
            let on_error = state.clone();
            promise
                .then(move |value| {
                    let filled = lock(&on_value).fill(index, PromiseResult::Fulfilled(value));
                    if let Some((resolver, results)) = filled {
                        resolver.resolve(results);
                    }
                })
                .catch(move |err| {
                    let filled = lock(&on_error).fill(index, PromiseResult::Rejected(err));
                    if let Some((resolver, results)) = filled {
                        resolver.resolve(results);
                    }
                });
        }
    })
}

pub(crate) fn any_in<T, I>(group: &PromiseGroup, promises: I) -> Promise<T>
where
    T: Send + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    let promises: Vec<_> = promises.into_iter().collect();
    group.spawn(move |resolver| {
        if promises.is_empty() {
            resolver.reject(Error::AllRejected);
            return;
        }

        let state = Slots::new(resolver, promises.len());
        for (index, promise) in promises.iter().enumerate() {
            let on_value = state.clone();
            let on_error = state.clone();
            promise
                .then(move |value| {
                    let resolver = lock(&on_value).resolver.take();
                    if let Some(resolver) = resolver {
                        tracing::debug!(input = index, "any fulfilled");
                        resolver.resolve(value);
                    }
                })
                .catch(move |err| {
                    let filled = lock(&on_error).fill(index, err);
                    if let Some((resolver, errors)) = filled {
                        tracing::debug!(rejections = errors.len(), "any rejected by every input");
                        resolver.reject(Error::Aggregate(errors));
                    }
                });
        }
    })
}
