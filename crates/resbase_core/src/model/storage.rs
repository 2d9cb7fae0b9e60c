//! Per-instance attribute storage.
//!
//! # Responsibility
//! - Hold cached values, value ids and modification bits, addressed by
//!   attribute index.
//! - Expose the slot interface resource handlers read and write through.
//!
//! # Invariants
//! - Storage is sized to the class's `max_attribute_index + 1`; indices
//!   outside that range read as empty and writes to them are dropped.
//! - `reset` discards everything; callers reload afterwards.

use crate::model::ids::{AttributeId, ValueId};
use crate::model::schema::AttributeDefinition;
use crate::model::value::AttributeValue;
use std::collections::HashMap;

const BITS: usize = u64::BITS as usize;

/// Array-backed value / value-id / modified-bit storage.
#[derive(Debug, Clone, Default)]
pub struct AttributeStorage {
    values: Vec<Option<AttributeValue>>,
    value_ids: Vec<ValueId>,
    modified: Vec<u64>,
}

impl AttributeStorage {
    pub fn with_slots(slots: usize) -> Self {
        Self {
            values: vec![None; slots],
            value_ids: vec![ValueId::UNSET; slots],
            modified: vec![0; slots.div_ceil(BITS)],
        }
    }

    /// Reallocates for `slots` slots, dropping all cached state.
    pub fn reset(&mut self, slots: usize) {
        *self = Self::with_slots(slots);
    }

    pub fn slots(&self) -> usize {
        self.values.len()
    }

    pub fn value(&self, index: usize) -> Option<&AttributeValue> {
        self.values.get(index).and_then(Option::as_ref)
    }

    pub fn value_mut(&mut self, index: usize) -> Option<&mut AttributeValue> {
        self.values.get_mut(index).and_then(Option::as_mut)
    }

    pub fn set_value(&mut self, index: usize, value: Option<AttributeValue>) {
        if let Some(slot) = self.values.get_mut(index) {
            *slot = value;
        }
    }

    pub fn take_value(&mut self, index: usize) -> Option<AttributeValue> {
        self.values.get_mut(index).and_then(Option::take)
    }

    pub fn value_id(&self, index: usize) -> ValueId {
        self.value_ids.get(index).copied().unwrap_or(ValueId::UNSET)
    }

    pub fn set_value_id(&mut self, index: usize, id: ValueId) {
        if let Some(slot) = self.value_ids.get_mut(index) {
            *slot = id;
        }
    }

    pub fn is_modified(&self, index: usize) -> bool {
        self.modified
            .get(index / BITS)
            .is_some_and(|word| word & (1 << (index % BITS)) != 0)
    }

    pub fn set_modified(&mut self, index: usize, modified: bool) {
        if index >= self.slots() {
            return;
        }
        if let Some(word) = self.modified.get_mut(index / BITS) {
            if modified {
                *word |= 1 << (index % BITS);
            } else {
                *word &= !(1 << (index % BITS));
            }
        }
    }

    /// Modified bit set, or a stored composite value changed in place.
    pub fn is_attribute_modified(&self, attribute: &AttributeDefinition) -> bool {
        if self.is_modified(attribute.index) {
            return true;
        }
        self.value(attribute.index).is_some_and(|value| {
            self.value_id(attribute.index).is_set() && attribute.handler().is_value_modified(value)
        })
    }

    pub fn any_modified(&self) -> bool {
        self.modified.iter().any(|word| *word != 0)
    }

    pub fn clear_modified(&mut self) {
        self.modified.iter_mut().for_each(|word| *word = 0);
    }
}

/// Slot access used by resource handlers while creating, loading and
/// persisting attributes.
pub trait AttributeSlots {
    /// Current value, `None` when unset or not loaded.
    fn value(&self, attribute: &AttributeDefinition) -> Option<AttributeValue>;

    fn value_id(&self, attribute: &AttributeDefinition) -> ValueId;

    fn set_value_id(&mut self, attribute: &AttributeDefinition, id: ValueId);

    /// Replaces the cached value after a handler normalized it on create.
    fn replace_value(&mut self, attribute: &AttributeDefinition, value: AttributeValue);
}

impl AttributeSlots for AttributeStorage {
    fn value(&self, attribute: &AttributeDefinition) -> Option<AttributeValue> {
        AttributeStorage::value(self, attribute.index).cloned()
    }

    fn value_id(&self, attribute: &AttributeDefinition) -> ValueId {
        AttributeStorage::value_id(self, attribute.index)
    }

    fn set_value_id(&mut self, attribute: &AttributeDefinition, id: ValueId) {
        AttributeStorage::set_value_id(self, attribute.index, id);
    }

    fn replace_value(&mut self, attribute: &AttributeDefinition, value: AttributeValue) {
        self.set_value(attribute.index, Some(value));
    }
}

/// Stand-in storage for bulk migration: every attribute reads as its
/// initial value (or unset) and assigned value ids are recorded.
#[derive(Debug, Default)]
pub struct NullAttributes {
    initial: HashMap<AttributeId, AttributeValue>,
    assigned: HashMap<AttributeId, ValueId>,
}

impl NullAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial(initial: HashMap<AttributeId, AttributeValue>) -> Self {
        Self {
            initial,
            assigned: HashMap::new(),
        }
    }

    /// Value ids handed out since the last `clear_assigned`.
    pub fn assigned(&self) -> &HashMap<AttributeId, ValueId> {
        &self.assigned
    }

    pub fn clear_assigned(&mut self) {
        self.assigned.clear();
    }
}

impl AttributeSlots for NullAttributes {
    fn value(&self, attribute: &AttributeDefinition) -> Option<AttributeValue> {
        self.initial.get(&attribute.id).cloned()
    }

    fn value_id(&self, attribute: &AttributeDefinition) -> ValueId {
        self.assigned
            .get(&attribute.id)
            .copied()
            .unwrap_or(ValueId::UNSET)
    }

    fn set_value_id(&mut self, attribute: &AttributeDefinition, id: ValueId) {
        self.assigned.insert(attribute.id, id);
    }

    fn replace_value(&mut self, _attribute: &AttributeDefinition, _value: AttributeValue) {}
}
