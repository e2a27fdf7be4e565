//! The key-value store seam: describing a table and replacing whole items.
use std::fmt;

use crate::mapper::AttributeMap;
use crate::schema::AttributeKind;

/// DynamoDB implementation of [`TableStore`].
pub(crate) mod dynamodb;

/// What the store reports about a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    pub table: String,
    /// Declared attributes, in the order the store reports them.
    pub attributes: Vec<(String, AttributeKind)>,
    pub key_attributes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    NotFound,
    /// Timeouts, throttling, unavailability. Worth another attempt.
    Transient,
    /// Validation, authorization and everything else that fails the same way every time.
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::NotFound, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Permanent, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind == StoreErrorKind::Transient
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for StoreError {}

/// Store client used by a single task. Implementations must not be shared across tasks.
#[trait_variant::make(TableStore: Send)]
#[allow(dead_code)]
pub trait LocalTableStore {
    /// Describes the table's attributes. One network call.
    async fn describe_table(&self, table: &str) -> Result<TableDescriptor, StoreError>;

    /// Writes the whole item, replacing any existing item with the same key. No conditional
    /// check is made, the last write wins.
    async fn put_item(&self, table: &str, item: &AttributeMap) -> Result<(), StoreError>;
}
