//! Organization context for the Djombi dashboard.
//!
//! Loads the user's memberships (through a short-lived cache in the
//! credential store), tracks which one is current, and performs switches
//! and creation against the backend with the session's secondary token.

mod context;
mod error;
mod models;

pub use context::OrganizationContext;
pub use error::{OrganizationError, OrganizationResult};
pub use models::{NewOrganization, OrganizationMembership, OrganizationMetadata, Role};
