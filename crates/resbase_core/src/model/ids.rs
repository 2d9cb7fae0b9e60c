//! Surrogate identifiers.
//!
//! All ids are SQLite integer keys wrapped in newtypes so signatures state
//! which table a number points into.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }
    };
}

id_type!(
    /// Row id in `resources`.
    ResourceId,
    "resource"
);
id_type!(
    /// Row id in `resource_classes`.
    ClassId,
    "class"
);
id_type!(
    /// Row id in `attribute_definitions`.
    AttributeId,
    "attribute"
);
id_type!(RoleId, "role");
id_type!(SubjectId, "subject");
id_type!(PermissionId, "permission");

/// Key of one stored attribute value.
///
/// `UNSET` means no value is linked, `INLINE` means the value lives in the
/// owning row itself; positive ids point into the attribute type's side table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueId(pub i64);

impl ValueId {
    pub const UNSET: ValueId = ValueId(-1);
    pub const INLINE: ValueId = ValueId(0);

    pub const fn get(self) -> i64 {
        self.0
    }

    pub const fn is_set(self) -> bool {
        self.0 >= 0
    }

    /// True for ids that point into a side table.
    pub const fn is_stored(self) -> bool {
        self.0 > 0
    }

    pub fn from_column(value: Option<i64>) -> Self {
        value.map_or(Self::UNSET, ValueId)
    }
}

impl Default for ValueId {
    fn default() -> Self {
        Self::UNSET
    }
}

impl Display for ValueId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::UNSET => write!(f, "value#unset"),
            Self::INLINE => write!(f, "value#inline"),
            Self(id) => write!(f, "value#{id}"),
        }
    }
}
