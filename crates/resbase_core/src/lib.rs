//! Persistence core of the resbase object repository.
//! Resource classes, typed attribute storage, live instances and runtime
//! schema evolution over SQLite.

pub mod config;
pub mod db;
pub mod evolution;
pub mod handler;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use config::{ConfigError, DatabaseLocation, RepositoryConfig};
pub use db::{open_db, open_db_in_memory, open_with_config, with_transaction, DbError, DbResult};
pub use evolution::{AttributeSpec, SchemaEvolution};
pub use handler::{AttributeError, AttributeHandler, AttributeHandlerRegistry, AttributeResult};
pub use logging::{default_log_level, init_logging, init_logging_from_config, logging_status};
pub use model::catalog::{AttributeTable, Schema, ROOT_CLASS};
pub use model::flags::AttributeFlags;
pub use model::ids::{AttributeId, ClassId, PermissionId, ResourceId, RoleId, SubjectId, ValueId};
pub use model::resource::{Resource, ResourceMeta};
pub use model::schema::{AttributeDefinition, ResourceClass, SchemaError, StorageKind};
pub use model::value::{AttributeValue, DateRange, Decimal, ParameterBag, RawValue};
pub use repo::{
    CacheStats, NewResource, RepoError, RepoResult, ResourceRepository, RevertReport,
};
pub use service::{ResourceService, SchemaService};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
