//! Resource-level error taxonomy.

use crate::db::DbError;
use crate::handler::AttributeError;
use crate::model::schema::SchemaError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type RepoResult<T> = Result<T, RepoError>;

/// Storage failure or broken internal invariant.
#[derive(Debug)]
pub enum BackendError {
    Db(DbError),
    /// An internally generated lookup did not resolve.
    Lookup(AttributeError),
    Invariant(String),
}

impl Display for BackendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::Lookup(err) => write!(f, "internal lookup failed: {err}"),
            Self::Invariant(message) => write!(f, "internal invariant broken: {message}"),
        }
    }
}

impl Error for BackendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Lookup(err) => Some(err),
            Self::Invariant(_) => None,
        }
    }
}

#[derive(Debug)]
pub enum RepoError {
    /// A REQUIRED attribute has no value.
    ValueRequired { class: String, attribute: String },
    /// A value lies outside its attribute's domain.
    ConstraintViolation { attribute: String, message: String },
    EntityNotFound { entity: &'static str, id: i64 },
    InvalidArgument(String),
    UnsupportedOperation(String),
    /// An attribute or instance was used with a class it does not belong to.
    ClassMismatch { expected: String, actual: String },
    Backend(BackendError),
}

impl RepoError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::UnsupportedOperation(message.into())
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Backend(BackendError::Invariant(message.into()))
    }

    /// Converts a handler error raised while working on `attribute`.
    pub fn attribute(attribute: &str, err: AttributeError) -> Self {
        match err {
            AttributeError::ConstraintViolation(message) => Self::ConstraintViolation {
                attribute: attribute.to_string(),
                message,
            },
            AttributeError::InvalidArgument(message) => {
                Self::InvalidArgument(format!("attribute `{attribute}`: {message}"))
            }
            other => other.into(),
        }
    }

    /// Converts a handler error from a lookup the caller did not ask for.
    pub fn internal(err: AttributeError) -> Self {
        match err {
            AttributeError::EntityNotFound { .. } => Self::Backend(BackendError::Lookup(err)),
            other => other.into(),
        }
    }

    /// Programming errors and storage failures.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ClassMismatch { .. } | Self::Backend(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::EntityNotFound { .. })
    }

    /// Stable code used in `error_code=` log fields.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ValueRequired { .. } => "value_required",
            Self::ConstraintViolation { .. } => "constraint_violation",
            Self::EntityNotFound { .. } => "entity_not_found",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::UnsupportedOperation(_) => "unsupported_operation",
            Self::ClassMismatch { .. } => "class_mismatch",
            Self::Backend(_) => "backend_failure",
        }
    }
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ValueRequired { class, attribute } => {
                write!(f, "value required for `{class}.{attribute}`")
            }
            Self::ConstraintViolation { attribute, message } if attribute.is_empty() => {
                write!(f, "constraint violation: {message}")
            }
            Self::ConstraintViolation { attribute, message } => {
                write!(f, "constraint violation on `{attribute}`: {message}")
            }
            Self::EntityNotFound { entity, id } => write!(f, "{entity} #{id} not found"),
            Self::InvalidArgument(message) => write!(f, "invalid argument: {message}"),
            Self::UnsupportedOperation(message) => write!(f, "unsupported operation: {message}"),
            Self::ClassMismatch { expected, actual } => {
                write!(f, "class mismatch: expected `{expected}`, got `{actual}`")
            }
            Self::Backend(err) => write!(f, "backend failure: {err}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Backend(err) => Some(err),
            _ => None,
        }
    }
}

impl From<AttributeError> for RepoError {
    fn from(value: AttributeError) -> Self {
        match value {
            AttributeError::EntityNotFound { entity, id } => Self::EntityNotFound { entity, id },
            AttributeError::InvalidArgument(message) => Self::InvalidArgument(message),
            AttributeError::UnsupportedOperation(message) => Self::UnsupportedOperation(message),
            AttributeError::ConstraintViolation(message) => Self::ConstraintViolation {
                attribute: String::new(),
                message,
            },
            AttributeError::Db(err) => Self::Backend(BackendError::Db(err)),
        }
    }
}

impl From<SchemaError> for RepoError {
    fn from(value: SchemaError) -> Self {
        match value {
            SchemaError::Db(err) => Self::Backend(BackendError::Db(err)),
            SchemaError::Attribute(err) => err.into(),
            SchemaError::InvalidDefinition(message) => Self::invariant(message),
            other => Self::InvalidArgument(other.to_string()),
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        match value {
            DbError::InvalidIdentifier(name) => {
                Self::InvalidArgument(format!("`{name}` is not a valid identifier"))
            }
            other => Self::Backend(BackendError::Db(other)),
        }
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Backend(BackendError::Db(DbError::Sqlite(value)))
    }
}
