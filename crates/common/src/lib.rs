//! Identifiers shared by every crate in the workspace.

pub mod tenant;
pub mod types;

pub use tenant::{Tenant, TenantId, TenantParseError};
pub use types::TransactionId;
