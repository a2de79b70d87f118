//! Record validation and conflict resolution.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use bytes::Bytes;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Why a record was rejected.
pub enum ValidationError {
    #[error("record key is not of the form /namespace/path")]
    InvalidKey,

    #[error("no validator for namespace {0:?}")]
    UnknownNamespace(String),

    #[error("no values to select from")]
    NoValues,

    #[error("invalid record: {0}")]
    Invalid(String),
}

/// Decides which records may be stored, and which of several records for
/// the same key is the best one.
pub trait Validator: Send + Sync {
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<(), ValidationError>;

    /// Index of the best of `values`, which are all valid records for `key`.
    fn select(&self, key: &[u8], values: &[Bytes]) -> Result<usize, ValidationError>;
}

#[derive(Default, Clone)]
/// Dispatches to a [Validator] by the namespace of the key, `/<namespace>/...`.
///
/// Keys in a namespace without a registered validator are rejected.
pub struct NamespacedValidator {
    validators: HashMap<String, Arc<dyn Validator>>,
}

impl NamespacedValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder style [NamespacedValidator::insert].
    pub fn with(mut self, namespace: &str, validator: impl Validator + 'static) -> Self {
        self.insert(namespace, Arc::new(validator));
        self
    }

    /// Register `validator` for keys under `/<namespace>/`, replacing any previous one.
    pub fn insert(&mut self, namespace: &str, validator: Arc<dyn Validator>) {
        self.validators.insert(namespace.to_string(), validator);
    }

    fn validator_for(&self, key: &[u8]) -> Result<&Arc<dyn Validator>, ValidationError> {
        let namespace = split_key(key)?;

        self.validators
            .get(namespace)
            .ok_or_else(|| ValidationError::UnknownNamespace(namespace.to_string()))
    }
}

impl Validator for NamespacedValidator {
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<(), ValidationError> {
        self.validator_for(key)?.validate(key, value)
    }

    fn select(&self, key: &[u8], values: &[Bytes]) -> Result<usize, ValidationError> {
        if values.is_empty() {
            return Err(ValidationError::NoValues);
        }

        self.validator_for(key)?.select(key, values)
    }
}

impl Debug for NamespacedValidator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.validators.keys()).finish()
    }
}

/// The namespace of `/<namespace>/<path>`.
fn split_key(key: &[u8]) -> Result<&str, ValidationError> {
    let rest = key.strip_prefix(b"/").ok_or(ValidationError::InvalidKey)?;

    match rest.iter().position(|b| *b == b'/') {
        Some(end) if end > 0 => {
            std::str::from_utf8(&rest[..end]).map_err(|_| ValidationError::InvalidKey)
        }
        _ => Err(ValidationError::InvalidKey),
    }
}
