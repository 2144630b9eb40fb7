//! Input validation for caller-supplied keys
//!
//! Any field that reaches a datastore query passes through here first and is
//! treated as a primitive string afterwards. Queries are always composed from
//! explicit equality predicates, so the character-class checks below are the
//! second layer, not the only one.
//!
//! Newtypes keep their field private to force validation through `new()`,
//! following the same discipline as the wallet balance type.

use std::fmt;

use crate::error::PointsError;

/// Default cap for identifier-typed fields.
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Cap for free-form reason strings.
pub const MAX_REASON_LEN: usize = 256;

/// Characters that are significant to document-store query operators.
/// They never appear in legitimate identifiers, so their presence means the
/// input is trying to be something other than a plain string.
const OPERATOR_CHARS: [char; 3] = ['$', '.', '{'];

/// Validate an identifier-typed field (user id, model id, queue item id,
/// event id, feature type).
///
/// Rules: trim; non-empty; bounded length; alphanumerics, hyphen and
/// underscore only. Operator-significant characters are rejected before the
/// character-class check so the error names the actual problem.
pub fn validate_identifier(
    field: &'static str,
    value: &str,
    max_len: usize,
) -> Result<String, PointsError> {
    let value = value.trim();

    if value.is_empty() {
        return Err(PointsError::InvalidInput(format!(
            "{field} must be a non-empty string"
        )));
    }

    if value.len() > max_len {
        return Err(PointsError::InvalidInput(format!(
            "{field} exceeds maximum length {max_len}"
        )));
    }

    if value.chars().any(|c| OPERATOR_CHARS.contains(&c)) {
        return Err(PointsError::InvalidInput(format!(
            "{field} contains query-operator characters"
        )));
    }

    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(PointsError::InvalidInput(format!(
            "{field} must contain only alphanumerics, hyphen, underscore"
        )));
    }

    Ok(value.to_string())
}

/// Validate a free-form reason string: trimmed, non-empty, bounded,
/// no operator-significant characters.
pub fn validate_reason(value: &str) -> Result<String, PointsError> {
    let value = value.trim();

    if value.is_empty() {
        return Err(PointsError::InvalidInput(
            "reason must be a non-empty string".into(),
        ));
    }
    if value.len() > MAX_REASON_LEN {
        return Err(PointsError::InvalidInput(format!(
            "reason exceeds maximum length {MAX_REASON_LEN}"
        )));
    }
    if value.chars().any(|c| OPERATOR_CHARS.contains(&c)) {
        return Err(PointsError::InvalidInput(
            "reason contains query-operator characters".into(),
        ));
    }

    Ok(value.to_string())
}

/// Validate a positive amount. Zero and negative values are rejected for
/// holds, reservations, awards and deducts.
pub fn validate_positive_amount(field: &'static str, amount: i64) -> Result<u64, PointsError> {
    if amount <= 0 {
        return Err(PointsError::InvalidInput(format!(
            "{field} must be a positive integer, got {amount}"
        )));
    }
    Ok(amount as u64)
}

/// Pluggable key validator. The default accepts UUID v4; callers may
/// substitute stricter checks.
pub type KeyValidator = fn(&str) -> bool;

/// Validator for identifier-shaped keys (ingest event ids). Same rules as
/// `validate_identifier`.
pub fn is_safe_identifier(s: &str) -> bool {
    validate_identifier("key", s, MAX_IDENTIFIER_LEN).is_ok()
}

/// Default idempotency-key validator: UUID, version 4.
pub fn is_uuid_v4(s: &str) -> bool {
    match uuid::Uuid::parse_str(s) {
        Ok(u) => u.get_version_num() == 4,
        Err(_) => false,
    }
}

/// Validated idempotency key (UUID v4 by default).
///
/// Field is private; construction goes through `new()` or `with_validator()`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(key: &str) -> Result<Self, PointsError> {
        Self::with_validator(key, is_uuid_v4)
    }

    pub fn with_validator(key: &str, validator: KeyValidator) -> Result<Self, PointsError> {
        let key = key.trim();
        if key.is_empty() {
            return Err(PointsError::InvalidInput(
                "idempotency key must be a non-empty string".into(),
            ));
        }
        if key.len() > MAX_IDENTIFIER_LEN {
            return Err(PointsError::InvalidInput(format!(
                "idempotency key exceeds maximum length {MAX_IDENTIFIER_LEN}"
            )));
        }
        if !validator(key) {
            return Err(PointsError::InvalidInput(
                "idempotency key failed format validation".into(),
            ));
        }
        Ok(Self(key.to_string()))
    }

    /// Derive a suffixed key for one leg of a paired ledger write.
    pub fn derived(&self, suffix: &str) -> String {
        format!("{}_{}", self.0, suffix)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for IdempotencyKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_valid() {
        assert_eq!(
            validate_identifier("user_id", "user-123", MAX_IDENTIFIER_LEN).unwrap(),
            "user-123"
        );
        assert_eq!(
            validate_identifier("user_id", "  u_1  ", MAX_IDENTIFIER_LEN).unwrap(),
            "u_1"
        );
    }

    #[test]
    fn test_identifier_rejects_empty() {
        assert!(validate_identifier("user_id", "", MAX_IDENTIFIER_LEN).is_err());
        assert!(validate_identifier("user_id", "   ", MAX_IDENTIFIER_LEN).is_err());
    }

    #[test]
    fn test_identifier_rejects_operator_chars() {
        // The classic operator-injection shapes must die before any query.
        assert!(validate_identifier("event_id", "{$ne: null}", MAX_IDENTIFIER_LEN).is_err());
        assert!(validate_identifier("event_id", "$where", MAX_IDENTIFIER_LEN).is_err());
        assert!(validate_identifier("event_id", "a.b", MAX_IDENTIFIER_LEN).is_err());
    }

    #[test]
    fn test_identifier_rejects_bad_class() {
        assert!(validate_identifier("user_id", "user 1", MAX_IDENTIFIER_LEN).is_err());
        assert!(validate_identifier("user_id", "user!", MAX_IDENTIFIER_LEN).is_err());
        assert!(validate_identifier("user_id", "user\u{0}", MAX_IDENTIFIER_LEN).is_err());
    }

    #[test]
    fn test_identifier_length_cap() {
        let long = "a".repeat(MAX_IDENTIFIER_LEN + 1);
        assert!(validate_identifier("user_id", &long, MAX_IDENTIFIER_LEN).is_err());
        let ok = "a".repeat(MAX_IDENTIFIER_LEN);
        assert!(validate_identifier("user_id", &ok, MAX_IDENTIFIER_LEN).is_ok());
    }

    #[test]
    fn test_positive_amount() {
        assert_eq!(validate_positive_amount("amount", 100).unwrap(), 100);
        assert!(validate_positive_amount("amount", 0).is_err());
        assert!(validate_positive_amount("amount", -5).is_err());
    }

    #[test]
    fn test_idempotency_key_uuid_v4() {
        let key = uuid::Uuid::new_v4().to_string();
        let parsed = IdempotencyKey::new(&key).unwrap();
        assert_eq!(parsed.as_str(), key);

        // v1-shaped UUID rejected by the v4 validator
        assert!(IdempotencyKey::new("6ba7b810-9dad-11d1-80b4-00c04fd430c8").is_err());
        assert!(IdempotencyKey::new("not-a-uuid").is_err());
        assert!(IdempotencyKey::new("").is_err());
    }

    #[test]
    fn test_idempotency_key_custom_validator() {
        fn hex16(s: &str) -> bool {
            s.len() == 16 && s.chars().all(|c| c.is_ascii_hexdigit())
        }
        assert!(IdempotencyKey::with_validator("0123456789abcdef", hex16).is_ok());
        assert!(IdempotencyKey::with_validator("0123", hex16).is_err());
    }

    #[test]
    fn test_derived_keys() {
        let key = uuid::Uuid::new_v4().to_string();
        let k = IdempotencyKey::new(&key).unwrap();
        assert_eq!(k.derived("debit"), format!("{key}_debit"));
        assert_eq!(k.derived("credit"), format!("{key}_credit"));
    }

    #[test]
    fn test_reason() {
        assert!(validate_reason("slot_machine payout").is_ok());
        assert!(validate_reason("").is_err());
        assert!(validate_reason("$gt").is_err());
        assert!(validate_reason(&"r".repeat(MAX_REASON_LEN + 1)).is_err());
    }
}
