//! Attribute handlers: per-type persistence of single attribute values.
//!
//! # Responsibility
//! - Define the `AttributeHandler` contract used by resource handlers.
//! - Provide the built-in handlers and the registry that instantiates them.
//!
//! # Invariants
//! - String conversion and domain checks are total: they return a valid value
//!   or an `InvalidArgument` / `ConstraintViolation`, never a partial value.
//! - `retrieve`/`update`/`delete` on an unknown value id fail with
//!   `EntityNotFound`.
//! - A handler owning a preload cache keeps it coherent in the same call that
//!   writes the side-table row.

use crate::db::DbError;
use crate::model::flags::Conditions;
use crate::model::ids::{ResourceId, ValueId};
use crate::model::value::{AttributeValue, RawValue};
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use std::error::Error;
use std::fmt::{Display, Formatter};

mod domain;
mod list;
mod parameters;
mod preload;
mod range;
mod reference;
mod registry;
mod scalar;

pub use list::ResourceListHandler;
pub use parameters::{ParameterHandler, ParameterStore, SqliteParameterStore};
pub use range::DateRangeHandler;
pub use reference::{
    ClassResolver, EntityResolver, IdentityDirectory, MemoryIdentityDirectory, PrincipalKind,
    PrincipalResolver, ReferenceHandler, ReferenceKind, ResourceResolver,
};
pub use registry::{AttributeHandlerRegistry, HandlerContext, HandlerFactory};
pub use scalar::{
    BooleanCodec, BooleanHandler, DateCodec, DateHandler, DecimalCodec, DecimalHandler,
    IntegerCodec, IntegerHandler, LongCodec, LongHandler, ScalarCodec, ScalarHandler,
    StringCodec, StringHandler, TextCodec, TextHandler, MAX_STRING_CHARS,
};

pub type AttributeResult<T> = Result<T, AttributeError>;

/// Handler-level failure.
#[derive(Debug)]
pub enum AttributeError {
    /// A value id or referenced entity id does not resolve.
    EntityNotFound { entity: &'static str, id: i64 },
    InvalidArgument(String),
    UnsupportedOperation(String),
    /// Value outside the attribute's domain.
    ConstraintViolation(String),
    Db(DbError),
}

impl AttributeError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::UnsupportedOperation(message.into())
    }

    pub fn violation(message: impl Into<String>) -> Self {
        Self::ConstraintViolation(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::EntityNotFound { .. })
    }
}

impl Display for AttributeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EntityNotFound { entity, id } => write!(f, "{entity} #{id} not found"),
            Self::InvalidArgument(message) => write!(f, "invalid argument: {message}"),
            Self::UnsupportedOperation(message) => write!(f, "unsupported operation: {message}"),
            Self::ConstraintViolation(message) => write!(f, "constraint violation: {message}"),
            Self::Db(err) => write!(f, "{err}"),
        }
    }
}

impl Error for AttributeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for AttributeError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for AttributeError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Persistence strategy for one attribute type.
///
/// Off-row values live in the type's side table (`value_table()`) and are
/// addressed by `ValueId`. Types that support external strings may also be
/// stored inline in a class table column via `to_column`/`from_column`.
pub trait AttributeHandler: Send + Sync {
    /// Registry name of the attribute type (`boolean`, `resource_list`, ...).
    fn type_name(&self) -> &'static str;

    /// Side table holding values addressed by value id.
    fn value_table(&self) -> &'static str;

    /// Native column type used for inline storage.
    fn column_type(&self) -> &'static str;

    /// Table a foreign-key-like inline column references.
    fn foreign_table(&self) -> Option<&'static str> {
        None
    }

    /// Values are ids of other entities.
    fn is_foreign_key(&self) -> bool {
        self.foreign_table().is_some()
    }

    /// Value can be stored inline as a class table column.
    fn supports_external_string(&self) -> bool;

    /// Value is a mutable aggregate that may change in place.
    fn is_composite(&self) -> bool {
        false
    }

    /// `create` may normalize the value; callers re-read it afterwards.
    fn should_retrieve_after_create(&self) -> bool {
        false
    }

    fn supported_conditions(&self) -> Conditions;

    fn create(&self, conn: &Connection, value: &AttributeValue) -> AttributeResult<ValueId>;

    fn retrieve(&self, conn: &Connection, id: ValueId) -> AttributeResult<AttributeValue>;

    fn update(&self, conn: &Connection, id: ValueId, value: &AttributeValue) -> AttributeResult<()>;

    fn delete(&self, conn: &Connection, id: ValueId) -> AttributeResult<()>;

    /// Converts caller input into this type. `RawValue::Null` maps to `None`.
    fn to_attribute_value(
        &self,
        conn: &Connection,
        raw: RawValue,
    ) -> AttributeResult<Option<AttributeValue>>;

    fn to_external_string(&self, value: &AttributeValue) -> AttributeResult<String> {
        let _ = value;
        Err(AttributeError::unsupported(format!(
            "{} values have no external string form",
            self.type_name()
        )))
    }

    /// Column value for inline storage.
    fn to_column(&self, value: &AttributeValue) -> AttributeResult<SqlValue> {
        let _ = value;
        Err(AttributeError::unsupported(format!(
            "{} values cannot be stored inline",
            self.type_name()
        )))
    }

    /// Decodes a non-null inline column value.
    fn from_column(&self, value: SqlValue) -> AttributeResult<AttributeValue> {
        let _ = value;
        Err(AttributeError::unsupported(format!(
            "{} values cannot be stored inline",
            self.type_name()
        )))
    }

    /// Validates `domain` itself, and `value` against it when given.
    fn check_domain(
        &self,
        conn: &Connection,
        domain: &str,
        value: Option<&AttributeValue>,
    ) -> AttributeResult<()>;

    /// The cached value was mutated in place since it was last persisted.
    fn is_value_modified(&self, value: &AttributeValue) -> bool {
        let _ = value;
        false
    }

    fn contains_resource_references(&self) -> bool {
        false
    }

    fn resource_references(&self, value: &AttributeValue) -> Vec<ResourceId> {
        let _ = value;
        Vec::new()
    }

    /// Removes references to `targets` (all references when empty) from a
    /// composite value in place. Returns whether the value changed.
    fn clear_resource_references(
        &self,
        value: &mut AttributeValue,
        targets: &[ResourceId],
    ) -> bool {
        let _ = (value, targets);
        false
    }

    /// Scans the side table into memory. Returns the number of cached rows.
    fn activate(&self, conn: &Connection) -> AttributeResult<usize> {
        let _ = conn;
        Ok(0)
    }
}

/// Error for a value of the wrong shape handed to a handler.
pub(crate) fn wrong_type(expected: &str, value: &AttributeValue) -> AttributeError {
    AttributeError::invalid(format!(
        "expected {expected} value, got {}",
        value.kind_name()
    ))
}

/// Fails with `EntityNotFound` when a write touched no row.
pub(crate) fn expect_row(changed: usize, table: &'static str, id: ValueId) -> AttributeResult<()> {
    if changed == 0 {
        Err(AttributeError::EntityNotFound {
            entity: table,
            id: id.get(),
        })
    } else {
        Ok(())
    }
}

/// Rejects sentinel ids before they reach SQL.
pub(crate) fn require_stored(table: &'static str, id: ValueId) -> AttributeResult<()> {
    if id.is_stored() {
        Ok(())
    } else {
        Err(AttributeError::EntityNotFound {
            entity: table,
            id: id.get(),
        })
    }
}
