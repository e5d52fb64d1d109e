//! Deposit configuration and payment tags embedded in free-text notes.
//!
//! Jobs and payments carry a generic `notes` column. Deposit policy is stored
//! there as a JSON object such as `{"depositType":"percent","depositAmount":30}`,
//! and legacy payments mark themselves with `{"isDeposit":true}` or
//! `{"isDepositRefund":true}`. Decoding looks for the first embedded JSON object
//! that matches the expected shape; anything else in the text is left alone.
//! Unknown keys are ignored so newer writers do not break older readers.

use crate::errors::MetadataError;
use crate::schema::PaymentKind;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ops::Range;

/// How a job's deposit is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepositType {
    /// A fixed amount in minor currency units.
    Flat,
    /// A percentage of the job price.
    Percent,
}

/// Deposit policy decoded from a job's notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositMetadata {
    /// Flat amount or percentage.
    pub deposit_type: DepositType,
    /// Minor units for [`DepositType::Flat`], whole percent for [`DepositType::Percent`].
    pub deposit_amount: i64,
}

impl DepositMetadata {
    /// Build a validated deposit policy.
    pub fn new(deposit_type: DepositType, deposit_amount: i64) -> Result<Self, MetadataError> {
        if deposit_amount < 0 {
            return Err(MetadataError::NegativeAmount(deposit_amount));
        }
        Ok(Self {
            deposit_type,
            deposit_amount,
        })
    }

    /// Extract the deposit policy from a job's notes.
    ///
    /// Returns `None` when the notes are absent, carry no policy, or the policy
    /// is malformed. Never fails.
    pub fn decode(notes: Option<&str>) -> Option<Self> {
        let (metadata, _) = find_embedded::<Self>(notes?, |m| m.deposit_amount >= 0)?;
        Some(metadata)
    }

    /// Serialize to the compact JSON form stored in notes,
    /// `{"depositType":"percent","depositAmount":30}`.
    ///
    /// Keys keep this order; other readers still match on the text.
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Write this policy into `notes`, replacing any policy already there.
    pub fn embed(&self, notes: Option<&str>) -> serde_json::Result<String> {
        let encoded = self.encode()?;
        let remaining = notes.map(Self::strip).unwrap_or_default();
        let remaining = remaining.trim_end();
        if remaining.is_empty() {
            Ok(encoded)
        } else {
            Ok(format!("{remaining}\n{encoded}"))
        }
    }

    /// Remove every embedded deposit policy from `notes`.
    pub fn strip(notes: &str) -> String {
        let mut remaining = notes.to_string();
        while let Some((_, span)) = find_embedded::<Self>(&remaining, |_| true) {
            remaining.replace_range(span, "");
        }
        remaining
    }
}

/// Legacy payment marker found in a payment's notes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentTag {
    #[serde(default)]
    is_deposit: bool,
    #[serde(default)]
    is_deposit_refund: bool,
}

/// Decode the kind of payment from its notes.
///
/// A refund tag wins over a deposit tag. Untagged or unparseable notes mean
/// [`PaymentKind::Standard`].
pub fn payment_kind_from_notes(notes: Option<&str>) -> PaymentKind {
    let tag = notes
        .and_then(|notes| find_embedded::<PaymentTag>(notes, |t| t.is_deposit || t.is_deposit_refund))
        .map(|(tag, _)| tag)
        .unwrap_or_default();

    if tag.is_deposit_refund {
        PaymentKind::DepositRefund
    } else if tag.is_deposit {
        PaymentKind::Deposit
    } else {
        PaymentKind::Standard
    }
}

/// Encode a payment kind as the tag written into legacy notes.
///
/// Returns `None` for [`PaymentKind::Standard`], which carries no tag.
pub fn payment_tag(kind: PaymentKind) -> Option<String> {
    let tag = match kind {
        PaymentKind::Standard => return None,
        PaymentKind::Deposit => serde_json::json!({ "isDeposit": true }),
        PaymentKind::DepositRefund => serde_json::json!({ "isDepositRefund": true }),
    };
    Some(tag.to_string())
}

/// Find the first JSON object in `text` that deserializes into `T` and passes
/// `accept`, along with its byte span.
fn find_embedded<T: DeserializeOwned>(
    text: &str,
    accept: impl Fn(&T) -> bool,
) -> Option<(T, Range<usize>)> {
    for (start, _) in text.match_indices('{') {
        let Some(candidate) = text.get(start..) else {
            continue;
        };

        let mut stream = serde_json::Deserializer::from_str(candidate).into_iter::<Value>();
        let Some(Ok(value @ Value::Object(_))) = stream.next() else {
            continue;
        };
        let end = start + stream.byte_offset();

        if let Ok(decoded) = serde_json::from_value::<T>(value) {
            if accept(&decoded) {
                return Some((decoded, start..end));
            }
        }
    }
    None
}
