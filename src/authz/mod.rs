//! Authorization: capability tokens and role checks
//!
//! Settlement-path mutations are gated by short-lived signed tokens issued
//! by the queue service; administrative operations are gated by role claims
//! from the identity service.

pub mod capability;
pub mod roles;

pub use capability::{CapabilityClaims, CapabilityType, QueueAuthorizer};
pub use roles::{ADMIN_ROLE, RoleSet};
