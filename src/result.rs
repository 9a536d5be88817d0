use std::{
    error::Error as StdError,
    fmt::{self, Display},
    sync::Arc,
};

/// The top-level result type for list and cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// An Error type encapsulating the ways a read can fail, either because
/// the upstream source failed or because the caller asked for something
/// that cannot be served.
#[derive(Debug, Clone)]
pub enum Error {
    /// The upstream source failed to produce a page. Every caller that
    /// joined the failed fetch receives a clone of the same error.
    Upstream(Arc<dyn StdError + Send + Sync>),
    /// The caller passed an argument that cannot be served, such as an
    /// offset that resolves to a position before the start of the list.
    InvalidInput(String),
    /// The fragment being read has been absorbed into its predecessor
    /// and no longer holds any data. Lists resolve the read again from
    /// their head when they see this.
    Detached,
    /// An unexpected bug has happened. Please open an issue!
    ReportableBug(String),
}

impl Error {
    /// Wraps a source-side failure.
    pub fn upstream<E>(error: E) -> Error
    where
        E: StdError + Send + Sync + 'static,
    {
        Error::Upstream(Arc::new(error))
    }

    /// Returns `true` if this error came from the upstream source.
    pub fn is_upstream(&self) -> bool {
        matches!(self, Error::Upstream(_))
    }
}

impl Eq for Error {}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        use self::Error::*;

        match (self, other) {
            // two upstream errors are the same failure only if they are
            // the same shared allocation
            (Upstream(l), Upstream(r)) => Arc::ptr_eq(l, r),
            (InvalidInput(l), InvalidInput(r)) => l == r,
            (Detached, Detached) => true,
            (ReportableBug(l), ReportableBug(r)) => l == r,
            _ => false,
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Upstream(e) => Some(&**e),
            _ => None,
        }
    }
}

impl Display for Error {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> std::result::Result<(), fmt::Error> {
        use self::Error::*;

        match *self {
            Upstream(ref e) => write!(f, "Upstream fetch failed: {}", e),
            InvalidInput(ref why) => write!(f, "Invalid input: {}", why),
            Detached => write!(
                f,
                "Fragment was absorbed into its predecessor and \
                 can no longer be read"
            ),
            ReportableBug(ref e) => write!(
                f,
                "Unexpected bug has happened: {}. \
                 PLEASE REPORT THIS BUG!",
                e
            ),
        }
    }
}
