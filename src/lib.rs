//! Thread-backed promises.
//!
//! A [`Promise`] runs its executor on a fresh thread and reports the single
//! outcome to observers registered with [`Promise::then`],
//! [`Promise::catch`] and [`Promise::finally`]. Observers run on threads of
//! their own. [`all`], [`race`], [`all_settled`] and [`any`] compose several
//! promises into one.
//!
//! Promises are tracked by a [`PromiseGroup`] so a caller can block until all
//! observers have run. [`Promise::new`] and the free combinators use the
//! process-wide group that [`wait_for_promises`] waits on.
//!
//! # Examples
//!
//! ```
//! use promise_out::{all, wait_for_promises, Promise};
//! use std::sync::mpsc::channel;
//!
//! let (tx, rx) = channel();
//! let inputs = (1..=3).map(|n| Promise::new(move |resolver| resolver.resolve(n * 10)));
//! all(inputs).then(move |values| tx.send(values).unwrap());
//! wait_for_promises();
//! assert_eq!(rx.recv().unwrap(), vec![10, 20, 30]);
//! ```
//!
//! A rejection nobody catches keeps its group busy forever:
//!
//! ```
//! use promise_out::PromiseGroup;
//! use std::time::Duration;
//!
//! let group = PromiseGroup::new();
//! group.spawn::<(), _>(|resolver| resolver.reject("lost"));
//! assert!(!group.wait_timeout(Duration::from_millis(50)));
//! ```
pub mod combinators;
mod error;
mod group;
mod outcome;
mod promise;

pub use combinators::{all, all_settled, any, race, PromiseResult};
pub use error::{BoxError, Error};
pub use group::{wait_for_promises, GroupBuilder, PromiseGroup};
pub use outcome::Outcome;
pub use promise::{Promise, Resolver};
