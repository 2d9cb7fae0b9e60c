//! Repository domain model.
//!
//! # Responsibility
//! - Define identifiers, attribute values and flags shared by all layers.
//! - Hold the resource-class schema (DAG + precomputed closures).
//! - Hold live resource instances and their attribute storage.
//!
//! # Invariants
//! - An attribute index is unique and stable inside every class closure that
//!   contains the attribute.
//! - A resource's attribute storage is sized from its class snapshot and is
//!   reallocated whenever the snapshot changes.

pub mod catalog;
pub mod flags;
pub mod ids;
pub mod resource;
pub mod schema;
pub mod storage;
pub mod value;
