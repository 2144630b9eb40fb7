//! Role-based checks for administrative operations
//!
//! The `admin` role subsumes every other role.

use serde::{Deserialize, Serialize};

use crate::error::PointsError;

pub const ADMIN_ROLE: &str = "admin";

/// Roles attached to an authenticated principal by the identity service.
/// The core only inspects role and subject.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RoleSet {
    pub subject: String,
    pub roles: Vec<String>,
}

impl RoleSet {
    pub fn new(subject: impl Into<String>, roles: &[&str]) -> Self {
        Self {
            subject: subject.into(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role || r == ADMIN_ROLE)
    }

    pub fn has_any_role(&self, roles: &[&str]) -> bool {
        roles.iter().any(|r| self.has_role(r))
    }

    /// Guard an administrative operation.
    pub fn require_any(&self, roles: &[&str]) -> Result<(), PointsError> {
        if self.has_any_role(roles) {
            Ok(())
        } else {
            Err(PointsError::Forbidden(roles.join("|")))
        }
    }
}
