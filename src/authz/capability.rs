//! Capability tokens
//!
//! Short-lived HS256 tokens issued by the queue service, authorizing exactly
//! one wallet mutation. Single-purpose: a refund token cannot authorize a
//! settlement even when every other field matches. Signature verification is
//! constant-time inside the JWT library.

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::config::AuthzConfig;
use crate::core_types::Points;
use crate::error::PointsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityType {
    QueueSettlement,
    QueueRefund,
    QueuePartialSettlement,
}

impl CapabilityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityType::QueueSettlement => "queue_settlement",
            CapabilityType::QueueRefund => "queue_refund",
            CapabilityType::QueuePartialSettlement => "queue_partial_settlement",
        }
    }
}

impl std::fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Token payload. `amount` is set for settlement/refund; the partial
/// variant carries `refund_amount` + `settle_amount` instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityClaims {
    pub iss: String,
    pub sub: String,
    #[serde(rename = "type")]
    pub token_type: CapabilityType,
    pub queue_item_id: String,
    pub escrow_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<Points>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_amount: Option<Points>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settle_amount: Option<Points>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

/// Verifies (and, for the trusted side and tests, issues) capability
/// tokens under the shared queue-service secret.
pub struct QueueAuthorizer {
    secret: String,
    max_ttl_seconds: u64,
}

impl QueueAuthorizer {
    pub fn new(config: &AuthzConfig) -> Self {
        Self {
            secret: config.queue_secret.clone(),
            max_ttl_seconds: config.max_token_ttl_seconds,
        }
    }

    /// Issue a token. Exposed for the trusted queue side and tests.
    pub fn issue(&self, claims: &CapabilityClaims) -> Result<String, PointsError> {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| PointsError::Internal(format!("token encoding failed: {e}")))
    }

    /// Validate a token against the operation it is presented for.
    ///
    /// Checks, in order: signature; expiry (`exp` must be strictly in the
    /// future, zero leeway); bounded lifetime; token purpose; and exact
    /// match of `queue_item_id` and `escrow_id` against the request.
    pub fn validate(
        &self,
        token: &str,
        expected_type: CapabilityType,
        queue_item_id: &str,
        escrow_id: &str,
    ) -> Result<CapabilityClaims, PointsError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp"]);

        let data = decode::<CapabilityClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|e| PointsError::InvalidAuthorization(format!("token rejected: {e}")))?;
        let claims = data.claims;

        let now = Utc::now().timestamp();
        if claims.exp <= now {
            return Err(PointsError::InvalidAuthorization("token expired".into()));
        }
        if claims.exp - claims.iat > self.max_ttl_seconds as i64 {
            return Err(PointsError::InvalidAuthorization(
                "token lifetime exceeds maximum".into(),
            ));
        }
        if claims.token_type != expected_type {
            return Err(PointsError::InvalidAuthorization(format!(
                "token type {} does not authorize {}",
                claims.token_type, expected_type
            )));
        }
        if claims.queue_item_id != queue_item_id {
            return Err(PointsError::InvalidAuthorization(
                "queue item mismatch".into(),
            ));
        }
        if claims.escrow_id != escrow_id {
            return Err(PointsError::InvalidAuthorization("escrow mismatch".into()));
        }

        Ok(claims)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn authorizer() -> QueueAuthorizer {
        QueueAuthorizer::new(&AuthzConfig::default())
    }

    fn claims(token_type: CapabilityType, iat: i64, exp: i64) -> CapabilityClaims {
        CapabilityClaims {
            iss: "queue-service".into(),
            sub: "queue-worker-1".into(),
            token_type,
            queue_item_id: "q1".into(),
            escrow_id: "esc_1".into(),
            amount: Some(100),
            refund_amount: None,
            settle_amount: None,
            reason: None,
            iat,
            exp,
        }
    }

    #[test]
    fn test_valid_token_roundtrip() {
        let auth = authorizer();
        let now = Utc::now().timestamp();
        let token = auth
            .issue(&claims(CapabilityType::QueueSettlement, now, now + 60))
            .unwrap();

        let validated = auth
            .validate(&token, CapabilityType::QueueSettlement, "q1", "esc_1")
            .unwrap();
        assert_eq!(validated.amount, Some(100));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let auth = authorizer();
        let other = QueueAuthorizer::new(&AuthzConfig {
            queue_secret: "different-secret".into(),
            max_token_ttl_seconds: 300,
        });
        let now = Utc::now().timestamp();
        let token = other
            .issue(&claims(CapabilityType::QueueSettlement, now, now + 60))
            .unwrap();

        let err = auth
            .validate(&token, CapabilityType::QueueSettlement, "q1", "esc_1")
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_AUTHORIZATION");
    }

    #[test]
    fn test_single_purpose() {
        let auth = authorizer();
        let now = Utc::now().timestamp();
        let refund_token = auth
            .issue(&claims(CapabilityType::QueueRefund, now, now + 60))
            .unwrap();

        // a refund token cannot authorize a settlement
        let err = auth
            .validate(&refund_token, CapabilityType::QueueSettlement, "q1", "esc_1")
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_AUTHORIZATION");
    }

    #[test]
    fn test_scope_mismatch() {
        let auth = authorizer();
        let now = Utc::now().timestamp();
        let token = auth
            .issue(&claims(CapabilityType::QueueSettlement, now, now + 60))
            .unwrap();

        assert!(
            auth.validate(&token, CapabilityType::QueueSettlement, "q2", "esc_1")
                .is_err()
        );
        assert!(
            auth.validate(&token, CapabilityType::QueueSettlement, "q1", "esc_2")
                .is_err()
        );
    }

    #[test]
    fn test_expired_and_boundary() {
        let auth = authorizer();
        let now = Utc::now().timestamp();

        let expired = auth
            .issue(&claims(CapabilityType::QueueSettlement, now - 120, now - 60))
            .unwrap();
        assert!(
            auth.validate(&expired, CapabilityType::QueueSettlement, "q1", "esc_1")
                .is_err()
        );

        // exp == now is rejected
        let boundary = auth
            .issue(&claims(CapabilityType::QueueSettlement, now - 60, now))
            .unwrap();
        assert!(
            auth.validate(&boundary, CapabilityType::QueueSettlement, "q1", "esc_1")
                .is_err()
        );
    }

    #[test]
    fn test_overlong_lifetime_rejected() {
        let auth = authorizer();
        let now = Utc::now().timestamp();
        let token = auth
            .issue(&claims(CapabilityType::QueueSettlement, now, now + 3600))
            .unwrap();

        let err = auth
            .validate(&token, CapabilityType::QueueSettlement, "q1", "esc_1")
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_AUTHORIZATION");
    }

    #[test]
    fn test_garbage_token_rejected() {
        let auth = authorizer();
        assert!(
            auth.validate("not.a.jwt", CapabilityType::QueueSettlement, "q1", "esc_1")
                .is_err()
        );
    }
}
