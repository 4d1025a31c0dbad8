#![forbid(unsafe_code)]
//! Identifiers, timestamps, predicate names and the crate-wide error type.

use std::fmt;

pub mod value;

pub use value::{Value, ValueType};

/// Logical timestamp handed out by the oracle. Start and commit timestamps
/// share one monotonically increasing space.
pub type Ts = u64;

/// Entity identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Uid(pub u64);

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for Uid {
    fn from(value: u64) -> Self {
        Uid(value)
    }
}

/// Width of the hex namespace qualifier in the textual form of an [`Attr`].
pub const NAMESPACE_QUALIFIER_LEN: usize = 16;

/// A predicate name scoped to a namespace.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Attr {
    namespace: u64,
    name: String,
}

impl Attr {
    /// Builds an attribute from its parts.
    pub fn new(namespace: u64, name: impl Into<String>) -> Self {
        Self {
            namespace,
            name: name.into(),
        }
    }

    /// Attribute in the root (zero) namespace.
    pub fn root(name: impl Into<String>) -> Self {
        Self::new(0, name)
    }

    /// Namespace the predicate belongs to.
    pub fn namespace(&self) -> u64 {
        self.namespace
    }

    /// Bare predicate name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Qualified textual form: sixteen hex digits of namespace followed by the name.
    pub fn qualified(&self) -> String {
        format!("{:016x}{}", self.namespace, self.name)
    }

    /// Parses the qualified textual form produced by [`Attr::qualified`].
    pub fn parse(qualified: &str) -> Result<Self> {
        if qualified.len() <= NAMESPACE_QUALIFIER_LEN
            || !qualified.is_char_boundary(NAMESPACE_QUALIFIER_LEN)
        {
            return Err(UmbraError::SchemaViolation(format!(
                "predicate [{qualified}] is missing a namespace qualifier or a name"
            )));
        }
        let (ns, name) = qualified.split_at(NAMESPACE_QUALIFIER_LEN);
        let namespace = u64::from_str_radix(ns, 16).map_err(|_| {
            UmbraError::SchemaViolation(format!(
                "predicate [{qualified}] has a malformed namespace qualifier"
            ))
        })?;
        Ok(Self::new(namespace, name))
    }
}

impl fmt::Display for Attr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace == 0 {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{:#x}-{}", self.namespace, self.name)
        }
    }
}

/// Errors surfaced by the storage core.
#[derive(thiserror::Error, Debug)]
pub enum UmbraError {
    /// Failure reported by the durable store.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed key or record found while reading the durable store.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an argument the engine cannot act on.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Mutation or schema disagrees with the predicate's descriptor.
    #[error("schema violation: {0}")]
    SchemaViolation(String),
    /// Write-write conflict detected at commit.
    #[error("transaction {start_ts} aborted due to a write conflict")]
    Conflict {
        /// Start timestamp of the losing transaction.
        start_ts: Ts,
    },
    /// Uniqueness directive violated.
    #[error("could not insert duplicate value [{value}] for predicate [{predicate}]")]
    DuplicateValue {
        /// Predicate carrying the `@unique` directive.
        predicate: String,
        /// Rendered value that collided.
        value: String,
    },
    /// Read timestamp fell below the garbage-collection watermark.
    #[error("read at {read_ts} is below the gc watermark {watermark}")]
    StaleRead {
        /// Requested read timestamp.
        read_ts: Ts,
        /// Oldest timestamp still readable.
        watermark: Ts,
    },
    /// Index rebuild failed; rerunning the rebuild is safe.
    #[error("index rebuild for [{attr}] failed: {source}")]
    Rebuild {
        /// Predicate being rebuilt.
        attr: String,
        /// Underlying failure.
        #[source]
        source: Box<UmbraError>,
    },
    /// Long-running operation observed its cancellation token.
    #[error("operation cancelled")]
    Cancelled,
    /// Transaction is unknown, committed or aborted.
    #[error("transaction {0} is not active")]
    TxnNotActive(Ts),
    /// Predicate is being reindexed and rejects mutations.
    #[error("predicate [{0}] is being reindexed")]
    PredicateBusy(String),
    /// Configuration could not be read or parsed.
    #[error("config: {0}")]
    Config(String),
}

impl UmbraError {
    /// Returns `true` when retrying from a fresh transaction may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UmbraError::Conflict { .. }
                | UmbraError::StaleRead { .. }
                | UmbraError::PredicateBusy(_)
                | UmbraError::Rebuild { .. }
        )
    }

    /// Returns `true` for transient store failures worth retrying in place.
    pub fn is_transient_io(&self) -> bool {
        matches!(self, UmbraError::Io(_))
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, UmbraError>;
