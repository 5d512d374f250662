use std::{error::Error as StdError, io, sync::Arc};

/// Boxed form accepted from executors when rejecting.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Everything a failure observer can receive.
///
/// Executor reasons are carried verbatim inside [`Error::Rejected`]; the
/// remaining variants are produced by this crate. The type is `Clone` so a
/// combinator can hand the same reason to several result slots.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The executor rejected its promise with this reason.
    #[error("{0}")]
    Rejected(#[source] Arc<dyn StdError + Send + Sync + 'static>),
    /// `race` was called without any input.
    #[error("no promises to race")]
    EmptyRace,
    /// `any` was called without any input.
    #[error("all promises rejected")]
    AllRejected,
    /// Every input of `any` rejected; reasons are kept in input order.
    #[error("all promises rejected: [{}]", join(.0))]
    Aggregate(Vec<Error>),
    /// The executor dropped its resolver (returned or panicked) without settling.
    #[error("resolver dropped before the promise was settled")]
    ResolverDropped,
    /// An outcome was awaited on a promise that finished without a value or error.
    #[error("promise finished without a value")]
    Unsettled,
}

impl Error {
    /// Wraps an arbitrary executor reason.
    pub fn rejected(err: impl Into<BoxError>) -> Self {
        Error::Rejected(Arc::from(err.into()))
    }

    /// Builds a rejection from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Error::rejected(message.into())
    }

    /// Looks through a [`Error::Rejected`] for the executor's concrete error type.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            Error::Rejected(reason) => reason.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// The individual reasons of an aggregate rejection, empty for any other variant.
    pub fn reasons(&self) -> &[Error] {
        match self {
            Error::Aggregate(errors) => errors,
            _ => &[],
        }
    }
}

fn join(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<&str> for Error {
    fn from(message: &str) -> Self {
        Error::rejected(message)
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Error::rejected(message)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::rejected(err)
    }
}

impl From<BoxError> for Error {
    fn from(err: BoxError) -> Self {
        Error::Rejected(Arc::from(err))
    }
}
