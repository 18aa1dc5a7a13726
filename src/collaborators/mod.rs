//! External collaborators consumed by the core
//!
//! - **Identity**: user profiles, emergency contacts, guardian links (read-only)
//! - **Object storage**: `put(bytes) -> storage_ref`, `get(storage_ref) -> bytes`
//! - **Authorities**: escalation alerts once an incident is handed off
//!
//! Each collaborator is a trait so the core never assumes a backend. Errors are
//! converted to [`crate::types::LifelineError`] at this boundary.

pub mod authority;
pub mod identity;
pub mod object_store;

pub use authority::{AuthorityAlert, AuthorityNotifier, LoggingAuthority};
pub use identity::{EmergencyContact, IdentityDirectory, InMemoryIdentity, UserProfile};
pub use object_store::{FsObjectStore, InMemoryObjectStore, ObjectStore, ObjectStoreError};
