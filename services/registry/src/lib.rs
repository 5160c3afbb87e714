//! # Artifact Registry
//!
//! A multi-tenant, license-gated registry speaking the
//! [OCI Distribution](https://github.com/opencontainers/distribution-spec)
//! pull and push protocol.
//!
//! Repositories are named `<tenant>/<artifact>`. Vendors (members of a
//! tenant) push and delete; their customers read whatever their unexpired
//! licenses cover. Every manifest pull is appended to an audit log which
//! vendors can query and export.
//!
//! ## Example
//!
//! ```no_run
//! use registry::{Database, RegistryBuilder, TokenAuthenticator};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let database = Database::connect("sqlite://registry.db").await?;
//! let storage = storage::MemoryDriver::new().into();
//! let registry = RegistryBuilder::new(database, storage)
//!     .authenticator(TokenAuthenticator::new())
//!     .build();
//!
//! // Serve with axum or any tower-compatible server
//! # Ok(())
//! # }
//! ```

mod api;
mod artifacts;
mod audit;
pub mod authz;
mod blob;
pub mod config;
mod error;
pub mod graph;
pub mod license;
mod manifest;
pub mod name;
pub mod oci;
pub mod principal;
pub mod router;
pub mod store;

pub use api::{RegistryBuilder, RegistryState};
pub use config::Config;
pub use error::{RegistryError, RegistryResult};
pub use principal::{Authenticator, Principal, TokenAuthenticator};
pub use store::Database;
