use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

use crate::tags::structures::{quantize_half_up, Tag, TagValue};

/// Thread-safe in-memory tag store.
///
/// Stores tag metadata and current values under one mutex so readers never
/// observe a tag without a value entry. Critical sections are short and
/// never perform I/O; other modules (OPC UA bridge, poller, REST handlers)
/// go through the accessors below.
#[derive(Default)]
pub struct TagStore {
    inner: Mutex<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    tags: HashMap<String, Tag>,
    values: HashMap<String, TagValue>,
}

/// Partial metadata update, applied field-by-field by `update_tag`.
#[derive(Debug, Clone, Default)]
pub struct TagPatch {
    pub name: Option<String>,
    pub plc_id: Option<String>,
    pub address: Option<String>,
    pub data_type: Option<String>,
    pub group_id: Option<String>,
    pub description: Option<Option<String>>,
    pub enabled: Option<bool>,
    pub project_id: Option<Option<String>>,
    pub scale_mul: Option<f64>,
    pub scale_add: Option<f64>,
    pub writable: Option<bool>,
    pub client_visible: Option<Vec<String>>,
}

impl TagPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.plc_id.is_none()
            && self.address.is_none()
            && self.data_type.is_none()
            && self.group_id.is_none()
            && self.description.is_none()
            && self.enabled.is_none()
            && self.project_id.is_none()
            && self.scale_mul.is_none()
            && self.scale_add.is_none()
            && self.writable.is_none()
            && self.client_visible.is_none()
    }
}

impl TagStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tag. When no initial value is given the value entry is
    /// defaulted from the tag's data type.
    pub fn add_tag(&self, tag: Tag, initial_value: Option<TagValue>) {
        let mut inner = self.inner.lock().unwrap();
        let value = initial_value.unwrap_or_else(|| TagValue::default_for(&tag.data_type));
        inner.values.insert(tag.tag_id.clone(), value);
        inner.tags.insert(tag.tag_id.clone(), tag);
    }

    pub fn remove_tag(&self, tag_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.values.remove(tag_id);
        inner.tags.remove(tag_id).is_some()
    }

    /// Update metadata fields of an existing tag. Returns false when the
    /// tag does not exist.
    pub fn update_tag(&self, tag_id: &str, patch: TagPatch) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(tag) = inner.tags.get_mut(tag_id) else {
            return false;
        };
        if let Some(v) = patch.name {
            tag.name = v;
        }
        if let Some(v) = patch.plc_id {
            tag.plc_id = v;
        }
        if let Some(v) = patch.address {
            tag.address = v;
        }
        if let Some(v) = patch.data_type {
            tag.data_type = v;
        }
        if let Some(v) = patch.group_id {
            tag.group_id = v;
        }
        if let Some(v) = patch.description {
            tag.description = v;
        }
        if let Some(v) = patch.enabled {
            tag.enabled = v;
        }
        if let Some(v) = patch.project_id {
            tag.project_id = v;
        }
        if let Some(v) = patch.scale_mul {
            tag.scale_mul = v;
        }
        if let Some(v) = patch.scale_add {
            tag.scale_add = v;
        }
        if let Some(v) = patch.writable {
            tag.writable = v;
        }
        if let Some(v) = patch.client_visible {
            tag.client_visible = v;
        }
        true
    }

    /// Defensive copy of a tag's metadata.
    pub fn get_tag(&self, tag_id: &str) -> Option<Tag> {
        self.inner.lock().unwrap().tags.get(tag_id).cloned()
    }

    /// Raw stored value, without scaling or conversion. Callers decide how
    /// to serialize it (the single-tag endpoint preserves decimal text).
    pub fn get_raw_value(&self, tag_id: &str) -> Option<TagValue> {
        self.inner.lock().unwrap().values.get(tag_id).cloned()
    }

    /// Current value with the tag's scaling applied.
    ///
    /// Booleans (by value or by declared type) pass through untouched, as
    /// do values that do not convert to a decimal. Numeric values convert
    /// through their canonical string form and are scaled with decimal
    /// arithmetic; an explicit `decimals` quantizes half-up.
    pub fn get_value(&self, tag_id: &str) -> Option<TagValue> {
        let inner = self.inner.lock().unwrap();
        let raw = inner.values.get(tag_id)?.clone();
        let Some(tag) = inner.tags.get(tag_id) else {
            return Some(raw);
        };
        if matches!(raw, TagValue::Bool(_)) || tag.is_boolean() {
            return Some(raw);
        }
        let Some(num) = raw.as_decimal() else {
            return Some(raw);
        };
        if tag.scale_mul == 1.0 && tag.scale_add == 0.0 {
            let scaled = match tag.decimals {
                Some(dp) => quantize_half_up(num, dp),
                None => num,
            };
            return Some(TagValue::Decimal(scaled));
        }
        let mul = Decimal::from_str(&tag.scale_mul.to_string()).unwrap_or(Decimal::ONE);
        let add = Decimal::from_str(&tag.scale_add.to_string()).unwrap_or(Decimal::ZERO);
        let mut scaled = num * mul + add;
        if let Some(dp) = tag.decimals {
            scaled = quantize_half_up(scaled, dp);
        }
        Some(TagValue::Decimal(scaled))
    }

    /// Store a value. Unknown ids are accepted as a fallback so drivers can
    /// publish ahead of metadata registration.
    pub fn set_value(&self, tag_id: &str, value: TagValue) {
        let mut inner = self.inner.lock().unwrap();
        inner.values.insert(tag_id.to_string(), value);
    }

    /// Defensive copies of all tag metadata.
    pub fn list_tags(&self) -> Vec<Tag> {
        self.inner.lock().unwrap().tags.values().cloned().collect()
    }

    pub fn tag_ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().tags.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw values for every registered tag.
    pub fn snapshot(&self) -> Vec<(String, TagValue)> {
        let inner = self.inner.lock().unwrap();
        inner
            .tags
            .keys()
            .map(|tid| {
                let value = inner
                    .values
                    .get(tid)
                    .cloned()
                    .unwrap_or(TagValue::Float(0.0));
                (tid.clone(), value)
            })
            .collect()
    }

    pub fn clear_tags(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.tags.clear();
        inner.values.clear();
    }

    /// `(tag_id, address)` pairs the poll engine should read for one
    /// controller: enabled tags with a non-empty address.
    pub fn poll_targets(&self, plc_id: &str) -> Vec<(String, String)> {
        let inner = self.inner.lock().unwrap();
        inner
            .tags
            .values()
            .filter(|t| t.enabled && t.plc_id == plc_id && !t.address.is_empty())
            .map(|t| (t.tag_id.clone(), t.address.clone()))
            .collect()
    }

    /// Resolve a driver address to the scaled value of the tag configured
    /// for it. Used by the mock drivers so mock reads reflect the tags the
    /// REST API configured.
    pub fn value_by_address(&self, address: &str) -> Option<TagValue> {
        let tag_id = {
            let inner = self.inner.lock().unwrap();
            inner
                .tags
                .values()
                .find(|t| t.address == address)
                .map(|t| t.tag_id.clone())
        }?;
        self.get_value(&tag_id)
    }
}
