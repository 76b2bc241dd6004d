//! Annotated values flowing through the execution pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use super::{Value, ValueKind};

/// A [`Value`] extended with pipeline metadata: attachments (primary key
/// and friends), a cover map for covering-index answers, a parent scope
/// for nested-loop inner values, and the replica bit of the parallel
/// operator copy that produced it.
///
/// The parent scope makes this a layered object: field lookups that miss
/// the own value fall through to the parent, so an inner join value sees
/// the outer value's aliases without copying them.
#[derive(Debug, Clone, Default)]
pub struct AnnotatedValue {
    value: Value,
    parent: Option<Arc<AnnotatedValue>>,
    attachments: HashMap<String, Value>,
    covers: Option<HashMap<String, Value>>,
    bit: u8,
}

impl AnnotatedValue {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            parent: None,
            attachments: HashMap::new(),
            covers: None,
            bit: 0,
        }
    }

    /// A fresh empty object scoped over `parent`.
    pub fn scope(parent: Arc<AnnotatedValue>) -> Self {
        Self {
            value: Value::empty_object(),
            parent: Some(parent),
            attachments: HashMap::new(),
            covers: None,
            bit: 0,
        }
    }

    pub fn missing() -> Self {
        Self::new(Value::Missing)
    }

    /// A projected value scoped over the item it came from; attachments
    /// (notably the primary key) carry over.
    pub fn projected(parent: Arc<AnnotatedValue>, value: Value) -> Self {
        let attachments = parent.attachments.clone();
        Self {
            value,
            parent: Some(parent),
            attachments,
            covers: None,
            bit: 0,
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn parent(&self) -> Option<&Arc<AnnotatedValue>> {
        self.parent.as_ref()
    }

    pub fn set_parent(&mut self, parent: Arc<AnnotatedValue>) {
        self.parent = Some(parent);
    }

    /// Field lookup with scope fallthrough.
    pub fn field(&self, name: &str) -> (Value, bool) {
        let (v, present) = self.value.field(name);
        if present {
            return (v, true);
        }
        match &self.parent {
            Some(p) => p.field(name),
            None => (Value::Missing, false),
        }
    }

    pub fn set_field(&mut self, name: &str, value: Value) {
        if self.value.kind() != ValueKind::Object {
            self.value = Value::empty_object();
        }
        self.value.set_field(name, value);
    }

    pub fn attachment(&self, name: &str) -> Option<&Value> {
        self.attachments.get(name)
    }

    pub fn set_attachment(&mut self, name: &str, value: Value) {
        self.attachments.insert(name.to_string(), value);
    }

    /// Sets the `meta` attachment carrying the document's primary key.
    pub fn set_meta_id(&mut self, id: &str) {
        let mut meta = Value::empty_object();
        meta.set_field("id", Value::string(id));
        self.set_attachment("meta", meta);
    }

    /// The stable primary-key attachment, if any.
    pub fn meta_id(&self) -> Option<String> {
        let meta = self.attachments.get("meta")?;
        meta.field_ref("id")?.as_str().map(|s| s.to_string())
    }

    pub fn set_cover(&mut self, text: &str, value: Value) {
        self.covers
            .get_or_insert_with(HashMap::new)
            .insert(text.to_string(), value);
    }

    /// Cover lookup with scope fallthrough.
    pub fn cover(&self, text: &str) -> Option<&Value> {
        if let Some(covers) = &self.covers {
            if let Some(v) = covers.get(text) {
                return Some(v);
            }
        }
        self.parent.as_ref().and_then(|p| p.cover(text))
    }

    pub fn has_covers(&self) -> bool {
        self.covers.as_ref().map_or(false, |c| !c.is_empty())
    }

    pub fn bit(&self) -> u8 {
        self.bit
    }

    pub fn set_bit(&mut self, bit: u8) {
        self.bit = bit;
    }

    /// The own value flattened with every ancestor scope, nearest layer
    /// winning. Used when a downstream consumer needs a standalone object.
    pub fn flatten(&self) -> Value {
        match &self.parent {
            None => self.value.clone(),
            Some(p) => {
                let mut base = p.flatten();
                if let (Value::Object(own), Value::Object(_)) = (&self.value, &base) {
                    for (k, v) in own {
                        base.set_field(k, v.clone());
                    }
                    base
                } else {
                    self.value.clone()
                }
            }
        }
    }
}
