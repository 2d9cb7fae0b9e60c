//! Repository layer: resource lifecycle over the handler chain.
//!
//! # Responsibility
//! - Turn schema definitions into stored rows and live instances.
//! - Keep SQL for resources behind the resource handler contract.
//!
//! # Invariants
//! - Repository calls never open or commit transactions themselves.
//! - Errors are semantic (`RepoError`) with SQLite failures wrapped as
//!   backend errors.

pub mod cache;
pub mod context;
pub mod error;
pub mod resource_handler;
pub mod resource_repo;

pub use cache::{CacheStats, InstanceCache};
pub use context::LoadContext;
pub use error::{BackendError, RepoError, RepoResult};
pub use resource_handler::{ResourceHandler, ResourceHandlers};
pub use resource_repo::{NewResource, ResourceRepository, RevertReport};
