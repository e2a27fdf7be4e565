//! Turns a raw record payload into the attribute map written to the store.
//!
//! Payloads are comma delimited and matched positionally against the table schema. The field
//! count must equal the schema length exactly; partial or extra fields are rejected rather than
//! written truncated or misaligned. Every input yields exactly one [`MappingOutcome`].
use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;

use crate::message::RawRecord;
use crate::schema::{AttributeKind, TableSchema};

const DELIMITER: char = ',';

/// One attribute value, carried as the opaque string found in the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scalar {
    pub kind: AttributeKind,
    pub value: String,
}

impl Scalar {
    pub fn new(kind: AttributeKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

pub type AttributeMap = HashMap<String, Scalar>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    FieldCountMismatch { expected: usize, found: usize },
    /// The payload is not valid UTF-8.
    MalformedPayload(String),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::FieldCountMismatch { expected, found } => {
                write!(f, "field count mismatch: expected {expected}, found {found}")
            }
            Rejection::MalformedPayload(reason) => write!(f, "malformed payload: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingOutcome {
    Accepted(AttributeMap),
    Rejected { reason: Rejection, payload: Bytes },
}

/// Maps one record against the schema. Pure, no I/O.
pub fn map(record: &RawRecord, schema: &TableSchema) -> MappingOutcome {
    let payload = match std::str::from_utf8(&record.payload) {
        Ok(payload) => payload,
        Err(e) => {
            return MappingOutcome::Rejected {
                reason: Rejection::MalformedPayload(e.to_string()),
                payload: record.payload.clone(),
            };
        }
    };

    let fields = split_fields(payload);
    if fields.len() != schema.len() {
        return MappingOutcome::Rejected {
            reason: Rejection::FieldCountMismatch {
                expected: schema.len(),
                found: fields.len(),
            },
            payload: record.payload.clone(),
        };
    }

    let item = schema
        .attributes()
        .iter()
        .zip(fields)
        .map(|(spec, field)| (spec.name.clone(), Scalar::new(spec.kind, field)))
        .collect();
    MappingOutcome::Accepted(item)
}

/// Splits on the delimiter and drops trailing empty fields, so `"a,b,"` has two fields. An empty
/// payload is a single empty field.
fn split_fields(payload: &str) -> Vec<&str> {
    if payload.is_empty() {
        return vec![""];
    }
    let mut fields: Vec<&str> = payload.split(DELIMITER).collect();
    while fields.last().is_some_and(|field| field.is_empty()) {
        fields.pop();
    }
    fields
}
