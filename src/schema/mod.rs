//! Per-predicate schema descriptors, validation and the shared schema state.

use std::collections::{HashMap, HashSet};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::storage::keys::{self, MAX_ATTR_NAME_LEN};
use crate::storage::{KvStore, StoredRecord, BIT_SCHEMA};
use crate::tok::TokenizerRegistry;
use crate::types::{Attr, Result, Ts, UmbraError, ValueType};

mod parse;

pub use parse::parse_schema;

/// Declared shape and directives of one predicate.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    /// Declared value type.
    pub value_type: ValueType,
    /// Whether an entity may hold several values.
    #[serde(default)]
    pub list: bool,
    /// Whether the `@index` directive is present.
    #[serde(default)]
    pub index: bool,
    /// Tokenizers named in `@index(...)`.
    #[serde(default)]
    pub tokenizers: Vec<String>,
    /// Maintain reverse edges.
    #[serde(default)]
    pub reverse: bool,
    /// Maintain the count index.
    #[serde(default)]
    pub count: bool,
    /// Reject duplicate values across entities.
    #[serde(default)]
    pub unique: bool,
    /// Register index keys as conflict keys.
    #[serde(default)]
    pub upsert: bool,
    /// Values may carry language tags.
    #[serde(default)]
    pub lang: bool,
}

impl Default for SchemaDescriptor {
    fn default() -> Self {
        Self::new(ValueType::Default)
    }
}

impl SchemaDescriptor {
    /// Descriptor of the given type without directives.
    pub fn new(value_type: ValueType) -> Self {
        Self {
            value_type,
            list: false,
            index: false,
            tokenizers: Vec::new(),
            reverse: false,
            count: false,
            unique: false,
            upsert: false,
            lang: false,
        }
    }

    /// Marks the predicate list-valued.
    pub fn list(mut self) -> Self {
        self.list = true;
        self
    }

    /// Adds `@index` with the named tokenizers.
    pub fn indexed<I, S>(mut self, tokenizers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.index = true;
        self.tokenizers = tokenizers.into_iter().map(Into::into).collect();
        self
    }

    /// Adds `@reverse`.
    pub fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }

    /// Adds `@count`.
    pub fn count(mut self) -> Self {
        self.count = true;
        self
    }

    /// Adds `@unique` and the `@upsert` it requires.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self.upsert = true;
        self
    }

    /// Adds `@upsert`.
    pub fn upsert(mut self) -> Self {
        self.upsert = true;
        self
    }

    /// Adds `@lang`.
    pub fn lang(mut self) -> Self {
        self.lang = true;
        self
    }

    /// Whether the predicate stores edges.
    pub fn is_uid(&self) -> bool {
        self.value_type == ValueType::Uid
    }

    /// Whether an entity holds at most one edge for this predicate.
    pub fn is_single_uid(&self) -> bool {
        self.is_uid() && !self.list
    }

    /// Whether reverse edge counts are maintained.
    pub fn counts_reverse(&self) -> bool {
        self.count && self.reverse
    }

    /// Checks the descriptor against the tokenizers known to `registry`.
    pub fn validate(&self, attr: &Attr, registry: &TokenizerRegistry) -> Result<()> {
        let violation = |msg: String| Err(UmbraError::SchemaViolation(msg));
        if attr.name().is_empty() {
            return violation("predicate name cannot be empty".into());
        }
        if attr.name().len() > MAX_ATTR_NAME_LEN {
            return violation(format!("predicate name [{attr}] is too long"));
        }
        if self.index && self.tokenizers.is_empty() {
            return violation(format!("@index on [{attr}] requires at least one tokenizer"));
        }
        if !self.index && !self.tokenizers.is_empty() {
            return violation(format!("tokenizers on [{attr}] require @index"));
        }
        let mut seen = HashSet::new();
        for name in &self.tokenizers {
            let tokenizer = registry.get(name).ok_or_else(|| {
                UmbraError::SchemaViolation(format!("invalid tokenizer [{name}] on [{attr}]"))
            })?;
            if !seen.insert(name.as_str()) {
                return violation(format!("duplicate tokenizer [{name}] on [{attr}]"));
            }
            let accepted = tokenizer.value_type() == self.value_type
                || (self.value_type == ValueType::Default
                    && tokenizer.value_type() == ValueType::String);
            if !accepted {
                return violation(format!(
                    "tokenizer [{name}] does not work with {} predicate [{attr}]",
                    self.value_type
                ));
            }
        }
        if self.reverse && !self.is_uid() {
            return violation(format!("cannot reverse non-uid predicate [{attr}]"));
        }
        if self.index && self.is_uid() {
            return violation(format!("cannot index uid predicate [{attr}]"));
        }
        if self.lang && !matches!(self.value_type, ValueType::String | ValueType::Default) {
            return violation(format!("@lang requires a string predicate, [{attr}] is not"));
        }
        if self.unique {
            if !self.upsert {
                return violation(format!("@unique on [{attr}] requires @upsert"));
            }
            let has = |name: &str| self.tokenizers.iter().any(|t| t == name);
            match self.value_type {
                ValueType::String | ValueType::Default if !(has("exact") || has("hash")) => {
                    return violation(format!(
                        "@unique on [{attr}] requires an exact or hash index"
                    ));
                }
                ValueType::Int if !has("int") => {
                    return violation(format!("@unique on [{attr}] requires an int index"));
                }
                ValueType::String | ValueType::Default | ValueType::Int => {}
                other => {
                    return violation(format!(
                        "@unique is not supported on {other} predicate [{attr}]"
                    ));
                }
            }
        }
        Ok(())
    }

    /// Tokenizer used to check and look up unique values.
    pub fn unique_tokenizer(&self) -> Option<&str> {
        ["exact", "int", "hash"]
            .into_iter()
            .find(|name| self.tokenizers.iter().any(|t| t == name))
    }
}

/// Live schema of every predicate plus the set being reindexed.
#[derive(Default)]
pub struct SchemaState {
    descriptors: RwLock<HashMap<Attr, SchemaDescriptor>>,
    rebuilding: Mutex<HashSet<Attr>>,
    rebuild_done: Condvar,
}

impl SchemaState {
    /// Empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every persisted descriptor visible at `at`.
    pub fn load(kv: &dyn KvStore, at: Ts) -> Result<Self> {
        let state = Self::new();
        let mut loaded = Vec::new();
        kv.scan(&keys::schema_prefix(), at, &mut |key, _, record| {
            let attr = match keys::ParsedKey::parse(key)? {
                keys::ParsedKey::Schema { attr } => attr,
                _ => return Err(UmbraError::Corruption("non-schema key under schema prefix")),
            };
            if !record.is_empty_marker() {
                loaded.push((attr, decode_descriptor(record)?));
            }
            Ok(std::ops::ControlFlow::Continue(()))
        })?;
        state.descriptors.write().extend(loaded);
        Ok(state)
    }

    /// Descriptor of `attr`, if declared.
    pub fn get(&self, attr: &Attr) -> Option<SchemaDescriptor> {
        self.descriptors.read().get(attr).cloned()
    }

    /// Installs `descriptor` for `attr`.
    pub fn set(&self, attr: Attr, descriptor: SchemaDescriptor) {
        self.descriptors.write().insert(attr, descriptor);
    }

    /// Every declared predicate.
    pub fn predicates(&self) -> Vec<Attr> {
        let mut attrs: Vec<Attr> = self.descriptors.read().keys().cloned().collect();
        attrs.sort();
        attrs
    }

    /// Marks `attr` as being reindexed, waiting for any rebuild already running on it.
    pub fn begin_rebuild(&self, attr: &Attr) {
        let mut rebuilding = self.rebuilding.lock();
        while rebuilding.contains(attr) {
            self.rebuild_done.wait(&mut rebuilding);
        }
        rebuilding.insert(attr.clone());
    }

    /// Clears the reindex mark of `attr` and wakes waiting schema changes.
    pub fn finish_rebuild(&self, attr: &Attr) {
        self.rebuilding.lock().remove(attr);
        self.rebuild_done.notify_all();
    }

    /// Whether `attr` is being reindexed.
    pub fn is_rebuilding(&self, attr: &Attr) -> bool {
        self.rebuilding.lock().contains(attr)
    }
}

/// Serializes a descriptor into a schema record.
pub fn encode_descriptor(descriptor: &SchemaDescriptor) -> Result<StoredRecord> {
    let value = serde_json::to_vec(descriptor)
        .map_err(|_| UmbraError::Invalid("schema descriptor failed to serialize"))?;
    Ok(StoredRecord {
        meta: BIT_SCHEMA,
        value,
    })
}

/// Parses a schema record.
pub fn decode_descriptor(record: &StoredRecord) -> Result<SchemaDescriptor> {
    if record.meta & BIT_SCHEMA == 0 {
        return Err(UmbraError::Corruption("schema key holds a non-schema record"));
    }
    serde_json::from_slice(&record.value)
        .map_err(|_| UmbraError::Corruption("schema record is not a valid descriptor"))
}
