//! In-memory copy of an attribute side table, keyed by value id.

use crate::model::ids::ValueId;
use crate::model::value::AttributeValue;
use parking_lot::Mutex;

/// Preloaded values; inactive until `fill` is called.
///
/// Slots are filled at activation and by reads outside a transaction. Every
/// write invalidates its slot, so a rolled back write never leaves a stale
/// value behind.
#[derive(Debug, Default)]
pub(crate) struct PreloadCache {
    slots: Mutex<Option<Vec<Option<AttributeValue>>>>,
}

impl PreloadCache {
    pub(crate) fn fill(&self, rows: Vec<(i64, AttributeValue)>) -> usize {
        let size = rows
            .iter()
            .map(|(id, _)| usize::try_from(*id).unwrap_or(0))
            .max()
            .map_or(0, |max| max + 1);
        let mut slots = vec![None; size];
        let count = rows.len();
        for (id, value) in rows {
            if let Ok(index) = usize::try_from(id) {
                slots[index] = Some(value);
            }
        }
        *self.slots.lock() = Some(slots);
        count
    }

    pub(crate) fn is_active(&self) -> bool {
        self.slots.lock().is_some()
    }

    pub(crate) fn get(&self, id: ValueId) -> Option<AttributeValue> {
        let index = usize::try_from(id.get()).ok()?;
        self.slots
            .lock()
            .as_ref()
            .and_then(|slots| slots.get(index).cloned().flatten())
    }

    pub(crate) fn put(&self, id: ValueId, value: &AttributeValue) {
        let Ok(index) = usize::try_from(id.get()) else {
            return;
        };
        if let Some(slots) = self.slots.lock().as_mut() {
            if slots.len() <= index {
                slots.resize(index + 1, None);
            }
            slots[index] = Some(value.clone());
        }
    }

    pub(crate) fn invalidate(&self, id: ValueId) {
        let Ok(index) = usize::try_from(id.get()) else {
            return;
        };
        if let Some(slot) = self
            .slots
            .lock()
            .as_mut()
            .and_then(|slots| slots.get_mut(index))
        {
            *slot = None;
        }
    }
}
