use serde::{Deserialize, Serialize};
use serde_json::Value;

use outbound_common::decoder::JsonDecoder;
use outbound_common::enricher::Pseudonymizable;
use outbound_common::error::OutboundError;
use outbound_common::publisher::kafka::{BrokerMessage, MessageFormatter};

/// A change-stream record about a user, identified by their fiscal code.
///
/// Downstream consumers only see the pseudonymous `user_token`: the fiscal code
/// is what gets tokenized, and `OutboundFormatter` leaves it out of the message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeDocument {
    pub id: String,
    pub fiscal_code: String,
    pub status: String,
    #[serde(default)]
    pub test_account: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_token: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl Pseudonymizable for ChangeDocument {
    fn pii(&self) -> &str {
        &self.fiscal_code
    }

    fn with_token(mut self, token: String) -> Self {
        self.user_token = Some(token);
        self
    }
}

fn validate(document: &ChangeDocument) -> Result<(), String> {
    if document.id.trim().is_empty() {
        return Err("id must be a non-empty string".to_string());
    }
    if document.fiscal_code.trim().is_empty() {
        return Err("fiscal_code must be a non-empty string".to_string());
    }
    Ok(())
}

pub fn decoder() -> JsonDecoder<ChangeDocument> {
    JsonDecoder::with_validator(validate)
}

/// The published form of a `ChangeDocument`.
#[derive(Serialize)]
struct OutboundChange<'a> {
    id: &'a str,
    status: &'a str,
    test_account: bool,
    user_token: &'a str,
    data: &'a Value,
}

/// Formats tokenized documents for the outbound topic, keyed by `user_token`.
///
/// A document without a token is refused rather than published with its fiscal code.
#[derive(Clone, Copy, Debug, Default)]
pub struct OutboundFormatter;

impl MessageFormatter<ChangeDocument> for OutboundFormatter {
    fn format(&self, document: &ChangeDocument) -> Result<BrokerMessage, OutboundError> {
        let user_token = document
            .user_token
            .as_deref()
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| OutboundError::Format("user_token is missing".to_string()))?;

        let payload = serde_json::to_string(&OutboundChange {
            id: &document.id,
            status: &document.status,
            test_account: document.test_account,
            user_token,
            data: &document.data,
        })
        .map_err(|e| OutboundError::Format(e.to_string()))?;

        Ok(BrokerMessage {
            key: Some(user_token.to_string()),
            payload,
        })
    }
}

pub fn is_real_account(document: &ChangeDocument) -> bool {
    !document.test_account
}

/// Fallback messages are replayed through the whole pipeline later on, so they
/// must not carry a token that could be stale by then.
pub fn fallback_message(document: &ChangeDocument) -> Result<Value, serde_json::Error> {
    let mut message = serde_json::to_value(document)?;
    if let Value::Object(fields) = &mut message {
        fields.remove("user_token");
    }
    Ok(message)
}
