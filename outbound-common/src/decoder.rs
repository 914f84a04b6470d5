use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::metrics_consts::DOCUMENTS_DECODE_ERRORS;

/// A raw input that failed validation.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{reason}")]
pub struct DecodeError {
    /// Human readable reason, as produced by the validator.
    pub reason: String,
    /// The rejected input, serialized back to JSON for the audit trail.
    pub raw: String,
}

impl DecodeError {
    pub fn new(reason: impl Into<String>, raw: &Value) -> Self {
        Self {
            reason: reason.into(),
            raw: raw.to_string(),
        }
    }
}

/// Validates an untyped input against the schema of one document kind.
///
/// Implementations must be total: every failure is returned as a `DecodeError`.
pub trait Decoder<I>: Send + Sync {
    fn decode(&self, raw: &Value) -> Result<I, DecodeError>;
}

/// Result of decoding a batch. Both sides are kept: malformed inputs are reported
/// while the valid ones carry on through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded<I> {
    pub errors: Vec<DecodeError>,
    pub documents: Vec<I>,
}

impl<I> Default for Decoded<I> {
    fn default() -> Self {
        Self {
            errors: Vec::new(),
            documents: Vec::new(),
        }
    }
}

/// Decodes every input independently, preserving input order on each side.
pub fn decode_batch<I>(decoder: &dyn Decoder<I>, raws: &[Value]) -> Decoded<I> {
    let mut decoded = Decoded::default();

    for raw in raws {
        match decoder.decode(raw) {
            Ok(document) => decoded.documents.push(document),
            Err(error) => {
                debug!(reason = %error.reason, "rejected malformed document");
                decoded.errors.push(error);
            }
        }
    }

    if !decoded.errors.is_empty() {
        metrics::counter!(DOCUMENTS_DECODE_ERRORS).increment(decoded.errors.len() as u64);
    }

    decoded
}

type Validator<I> = Box<dyn Fn(&I) -> Result<(), String> + Send + Sync>;

/// Decoder for any `serde` document, with an optional extra validation step for
/// constraints the type system does not express (non-empty ids, known statuses...).
pub struct JsonDecoder<I> {
    validator: Option<Validator<I>>,
    _kind: PhantomData<fn() -> I>,
}

impl<I> JsonDecoder<I> {
    pub fn new() -> Self {
        Self {
            validator: None,
            _kind: PhantomData,
        }
    }

    pub fn with_validator<F>(validator: F) -> Self
    where
        F: Fn(&I) -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            validator: Some(Box::new(validator)),
            _kind: PhantomData,
        }
    }
}

impl<I> Default for JsonDecoder<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I> Decoder<I> for JsonDecoder<I>
where
    I: DeserializeOwned,
{
    fn decode(&self, raw: &Value) -> Result<I, DecodeError> {
        let document = I::deserialize(raw).map_err(|e| DecodeError::new(e.to_string(), raw))?;

        if let Some(validator) = &self.validator {
            validator(&document).map_err(|reason| DecodeError::new(reason, raw))?;
        }

        Ok(document)
    }
}
