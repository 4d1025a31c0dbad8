//! Tokenizer registry: deterministic value-to-token functions used by indexes.
//!
//! Every token starts with the identifier byte of the tokenizer that produced
//! it, so tokenizers sharing a predicate never collide.

use std::collections::HashMap;
use std::sync::Arc;

use smallvec::SmallVec;
use time::OffsetDateTime;
use xxhash_rust::xxh64::xxh64;

use crate::primitives::bytes::ord;
use crate::types::{Result, UmbraError, Value, ValueType};

pub mod lang;

use lang::PipelineCache;

/// Tokens produced for one value.
pub type Tokens = SmallVec<[Vec<u8>; 4]>;

/// Identifier bytes of the built-in tokenizers.
pub mod ids {
    /// Term tokenizer.
    pub const TERM: u8 = 0x01;
    /// Exact tokenizer.
    pub const EXACT: u8 = 0x02;
    /// Year tokenizer.
    pub const YEAR: u8 = 0x04;
    /// Integer tokenizer.
    pub const INT: u8 = 0x06;
    /// Float tokenizer.
    pub const FLOAT: u8 = 0x07;
    /// Full-text tokenizer.
    pub const FULLTEXT: u8 = 0x08;
    /// Boolean tokenizer.
    pub const BOOL: u8 = 0x09;
    /// Trigram tokenizer.
    pub const TRIGRAM: u8 = 0x0A;
    /// Hash tokenizer.
    pub const HASH: u8 = 0x0B;
    /// Month tokenizer.
    pub const MONTH: u8 = 0x41;
    /// Day tokenizer.
    pub const DAY: u8 = 0x42;
    /// Hour tokenizer.
    pub const HOUR: u8 = 0x43;
}

/// A deterministic function from a typed value to index tokens.
pub trait Tokenizer: Send + Sync {
    /// Name used in `@index(...)`.
    fn name(&self) -> &'static str;

    /// Type the value is converted to before tokenizing.
    fn value_type(&self) -> ValueType;

    /// Byte prefixed to every token.
    fn identifier(&self) -> u8;

    /// Whether token order matches value order.
    fn is_sortable(&self) -> bool {
        false
    }

    /// Whether distinct values may share a token.
    fn is_lossy(&self) -> bool {
        true
    }

    /// Raw tokens of `value`, which already has [`Tokenizer::value_type`].
    fn tokens(&self, value: &Value, lang: &str) -> Result<Vec<Vec<u8>>>;
}

/// Converts `value` to the tokenizer's type and returns prefixed, sorted,
/// de-duplicated tokens.
pub fn build_tokens(tokenizer: &dyn Tokenizer, value: &Value, lang: &str) -> Result<Tokens> {
    let converted = value.convert_to(tokenizer.value_type())?;
    let mut tokens: Tokens = tokenizer
        .tokens(&converted, lang)?
        .into_iter()
        .map(|raw| {
            let mut token = Vec::with_capacity(raw.len() + 1);
            token.push(tokenizer.identifier());
            token.extend_from_slice(&raw);
            token
        })
        .collect();
    tokens.sort_unstable();
    tokens.dedup();
    Ok(tokens)
}

/// Registry of tokenizers addressable by name.
pub struct TokenizerRegistry {
    by_name: HashMap<&'static str, Arc<dyn Tokenizer>>,
}

impl Default for TokenizerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl TokenizerRegistry {
    /// Registry without any tokenizer.
    pub fn empty() -> Self {
        Self {
            by_name: HashMap::new(),
        }
    }

    /// Registry holding every built-in tokenizer.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        let pipelines = Arc::new(PipelineCache::default());
        let builtins: Vec<Arc<dyn Tokenizer>> = vec![
            Arc::new(ExactTokenizer),
            Arc::new(HashTokenizer),
            Arc::new(TermTokenizer),
            Arc::new(FullTextTokenizer { pipelines }),
            Arc::new(TrigramTokenizer),
            Arc::new(IntTokenizer),
            Arc::new(FloatTokenizer),
            Arc::new(BoolTokenizer),
            Arc::new(DateTokenizer::Year),
            Arc::new(DateTokenizer::Month),
            Arc::new(DateTokenizer::Day),
            Arc::new(DateTokenizer::Hour),
        ];
        for tokenizer in builtins {
            registry.by_name.insert(tokenizer.name(), tokenizer);
        }
        registry
    }

    /// Adds a tokenizer; names and identifier bytes must be unused.
    pub fn register(&mut self, tokenizer: Arc<dyn Tokenizer>) -> Result<()> {
        if self.by_name.contains_key(tokenizer.name()) {
            return Err(UmbraError::Invalid("tokenizer name already registered"));
        }
        if self
            .by_name
            .values()
            .any(|t| t.identifier() == tokenizer.identifier())
        {
            return Err(UmbraError::Invalid("tokenizer identifier already registered"));
        }
        self.by_name.insert(tokenizer.name(), tokenizer);
        Ok(())
    }

    /// Looks up a tokenizer by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tokenizer>> {
        self.by_name.get(name).cloned()
    }

    /// Tokenizes `value` with the tokenizer called `name`.
    pub fn tokenize(&self, value: &Value, lang: &str, name: &str) -> Result<Tokens> {
        let tokenizer = self.get(name).ok_or_else(|| {
            UmbraError::SchemaViolation(format!("unknown tokenizer [{name}]"))
        })?;
        build_tokens(tokenizer.as_ref(), value, lang)
    }
}

fn text(value: &Value) -> Result<&str> {
    value
        .as_text()
        .ok_or(UmbraError::Invalid("tokenizer expects a string value"))
}

fn int_token(v: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(ord::SIGNED_INT_LEN);
    ord::put_signed_int(&mut out, v);
    out
}

struct ExactTokenizer;

impl Tokenizer for ExactTokenizer {
    fn name(&self) -> &'static str {
        "exact"
    }
    fn value_type(&self) -> ValueType {
        ValueType::String
    }
    fn identifier(&self) -> u8 {
        ids::EXACT
    }
    fn is_sortable(&self) -> bool {
        true
    }
    fn is_lossy(&self) -> bool {
        false
    }
    fn tokens(&self, value: &Value, _lang: &str) -> Result<Vec<Vec<u8>>> {
        Ok(vec![text(value)?.as_bytes().to_vec()])
    }
}

struct HashTokenizer;

impl Tokenizer for HashTokenizer {
    fn name(&self) -> &'static str {
        "hash"
    }
    fn value_type(&self) -> ValueType {
        ValueType::String
    }
    fn identifier(&self) -> u8 {
        ids::HASH
    }
    fn tokens(&self, value: &Value, _lang: &str) -> Result<Vec<Vec<u8>>> {
        Ok(vec![xxh64(text(value)?.as_bytes(), 0).to_be_bytes().to_vec()])
    }
}

struct TermTokenizer;

impl Tokenizer for TermTokenizer {
    fn name(&self) -> &'static str {
        "term"
    }
    fn value_type(&self) -> ValueType {
        ValueType::String
    }
    fn identifier(&self) -> u8 {
        ids::TERM
    }
    fn tokens(&self, value: &Value, _lang: &str) -> Result<Vec<Vec<u8>>> {
        Ok(lang::plain_terms(text(value)?)
            .into_iter()
            .map(String::into_bytes)
            .collect())
    }
}

struct FullTextTokenizer {
    pipelines: Arc<PipelineCache>,
}

impl Tokenizer for FullTextTokenizer {
    fn name(&self) -> &'static str {
        "fulltext"
    }
    fn value_type(&self) -> ValueType {
        ValueType::String
    }
    fn identifier(&self) -> u8 {
        ids::FULLTEXT
    }
    fn tokens(&self, value: &Value, lang: &str) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .pipelines
            .for_tag(lang)
            .terms(text(value)?)
            .into_iter()
            .map(String::into_bytes)
            .collect())
    }
}

struct TrigramTokenizer;

impl Tokenizer for TrigramTokenizer {
    fn name(&self) -> &'static str {
        "trigram"
    }
    fn value_type(&self) -> ValueType {
        ValueType::String
    }
    fn identifier(&self) -> u8 {
        ids::TRIGRAM
    }
    fn tokens(&self, value: &Value, _lang: &str) -> Result<Vec<Vec<u8>>> {
        let chars: Vec<char> = text(value)?.chars().collect();
        Ok(chars
            .windows(3)
            .map(|w| w.iter().collect::<String>().into_bytes())
            .collect())
    }
}

struct IntTokenizer;

impl Tokenizer for IntTokenizer {
    fn name(&self) -> &'static str {
        "int"
    }
    fn value_type(&self) -> ValueType {
        ValueType::Int
    }
    fn identifier(&self) -> u8 {
        ids::INT
    }
    fn is_sortable(&self) -> bool {
        true
    }
    fn is_lossy(&self) -> bool {
        false
    }
    fn tokens(&self, value: &Value, _lang: &str) -> Result<Vec<Vec<u8>>> {
        match value {
            Value::Int(v) => Ok(vec![int_token(*v)]),
            _ => Err(UmbraError::Invalid("int tokenizer expects an int value")),
        }
    }
}

/// Truncates to the integer part, so 10.43 and 10 share a token.
struct FloatTokenizer;

impl Tokenizer for FloatTokenizer {
    fn name(&self) -> &'static str {
        "float"
    }
    fn value_type(&self) -> ValueType {
        ValueType::Float
    }
    fn identifier(&self) -> u8 {
        ids::FLOAT
    }
    fn is_sortable(&self) -> bool {
        true
    }
    fn tokens(&self, value: &Value, _lang: &str) -> Result<Vec<Vec<u8>>> {
        match value {
            Value::Float(v) => Ok(vec![int_token(v.trunc() as i64)]),
            _ => Err(UmbraError::Invalid("float tokenizer expects a float value")),
        }
    }
}

struct BoolTokenizer;

impl Tokenizer for BoolTokenizer {
    fn name(&self) -> &'static str {
        "bool"
    }
    fn value_type(&self) -> ValueType {
        ValueType::Bool
    }
    fn identifier(&self) -> u8 {
        ids::BOOL
    }
    fn is_lossy(&self) -> bool {
        false
    }
    fn tokens(&self, value: &Value, _lang: &str) -> Result<Vec<Vec<u8>>> {
        match value {
            Value::Bool(v) => Ok(vec![int_token(i64::from(*v))]),
            _ => Err(UmbraError::Invalid("bool tokenizer expects a bool value")),
        }
    }
}

#[derive(Clone, Copy)]
enum DateTokenizer {
    Year,
    Month,
    Day,
    Hour,
}

impl DateTokenizer {
    fn parts(self, dt: OffsetDateTime) -> SmallVec<[u16; 4]> {
        // Clamped into u16 so tokens stay in calendar order; eq verifies values.
        let year = u16::try_from(dt.year().max(0)).unwrap_or(u16::MAX);
        let month = u16::from(u8::from(dt.month()));
        let day = u16::from(dt.day());
        let hour = u16::from(dt.hour());
        match self {
            DateTokenizer::Year => SmallVec::from_slice(&[year]),
            DateTokenizer::Month => SmallVec::from_slice(&[year, month]),
            DateTokenizer::Day => SmallVec::from_slice(&[year, month, day]),
            DateTokenizer::Hour => SmallVec::from_slice(&[year, month, day, hour]),
        }
    }
}

impl Tokenizer for DateTokenizer {
    fn name(&self) -> &'static str {
        match self {
            DateTokenizer::Year => "year",
            DateTokenizer::Month => "month",
            DateTokenizer::Day => "day",
            DateTokenizer::Hour => "hour",
        }
    }
    fn value_type(&self) -> ValueType {
        ValueType::DateTime
    }
    fn identifier(&self) -> u8 {
        match self {
            DateTokenizer::Year => ids::YEAR,
            DateTokenizer::Month => ids::MONTH,
            DateTokenizer::Day => ids::DAY,
            DateTokenizer::Hour => ids::HOUR,
        }
    }
    fn is_sortable(&self) -> bool {
        true
    }
    fn tokens(&self, value: &Value, _lang: &str) -> Result<Vec<Vec<u8>>> {
        match value {
            Value::DateTime(dt) => {
                let utc = dt.to_offset(time::UtcOffset::UTC);
                Ok(vec![self
                    .parts(utc)
                    .iter()
                    .flat_map(|part| part.to_be_bytes())
                    .collect()])
            }
            _ => Err(UmbraError::Invalid("date tokenizer expects a datetime value")),
        }
    }
}
