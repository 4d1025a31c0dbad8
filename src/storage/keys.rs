//! Byte-comparable key layout for data, index, reverse, count and schema records.
//!
//! Every key for a predicate starts with the same attribute prefix, so all of
//! its postings form one contiguous range:
//!
//! ```text
//! 0x00 | u16 name len | u64 namespace | name | kind | suffix
//! 0x01 | u16 name len | u64 namespace | name                (schema)
//! ```

use crate::primitives::bytes::ord;
use crate::types::{Attr, Result, Uid, UmbraError};

const DEFAULT_PREFIX: u8 = 0x00;
const SCHEMA_PREFIX: u8 = 0x01;

/// Longest predicate name representable in a key.
pub const MAX_ATTR_NAME_LEN: usize = u16::MAX as usize;

/// Record family stored under a predicate.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum KeyKind {
    /// Entity to value/edge postings.
    Data = 0x00,
    /// Token to entity postings.
    Index = 0x02,
    /// Target entity to source entity postings.
    Reverse = 0x04,
    /// Edge count to entity postings.
    Count = 0x08,
    /// Reverse edge count to entity postings.
    CountReverse = 0x0C,
}

impl KeyKind {
    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x00 => Ok(KeyKind::Data),
            0x02 => Ok(KeyKind::Index),
            0x04 => Ok(KeyKind::Reverse),
            0x08 => Ok(KeyKind::Count),
            0x0C => Ok(KeyKind::CountReverse),
            _ => Err(UmbraError::Corruption("unknown key kind byte")),
        }
    }
}

fn attr_bytes(prefix: u8, attr: &Attr, extra: usize) -> Vec<u8> {
    let name = attr.name().as_bytes();
    let mut key = Vec::with_capacity(1 + 2 + 8 + name.len() + extra);
    key.push(prefix);
    // Names longer than MAX_ATTR_NAME_LEN are rejected by schema validation.
    key.extend_from_slice(&(name.len() as u16).to_be_bytes());
    ord::put_u64_be(&mut key, attr.namespace());
    key.extend_from_slice(name);
    key
}

/// Prefix shared by every data/index/reverse/count key of `attr`.
pub fn predicate_prefix(attr: &Attr) -> Vec<u8> {
    attr_bytes(DEFAULT_PREFIX, attr, 0)
}

fn kind_prefix(attr: &Attr, kind: KeyKind, extra: usize) -> Vec<u8> {
    let mut key = attr_bytes(DEFAULT_PREFIX, attr, 1 + extra);
    key.push(kind as u8);
    key
}

/// Prefix of all data keys of `attr`.
pub fn data_prefix(attr: &Attr) -> Vec<u8> {
    kind_prefix(attr, KeyKind::Data, 0)
}

/// Prefix of all index keys of `attr`.
pub fn index_prefix(attr: &Attr) -> Vec<u8> {
    kind_prefix(attr, KeyKind::Index, 0)
}

/// Prefix of the index keys produced by one tokenizer.
pub fn tokenizer_prefix(attr: &Attr, tokenizer_id: u8) -> Vec<u8> {
    let mut key = kind_prefix(attr, KeyKind::Index, 1);
    key.push(tokenizer_id);
    key
}

/// Prefix of all reverse-edge keys of `attr`.
pub fn reverse_prefix(attr: &Attr) -> Vec<u8> {
    kind_prefix(attr, KeyKind::Reverse, 0)
}

/// Prefix of all count keys of `attr` in one direction.
pub fn count_prefix(attr: &Attr, reverse: bool) -> Vec<u8> {
    let kind = if reverse {
        KeyKind::CountReverse
    } else {
        KeyKind::Count
    };
    kind_prefix(attr, kind, 0)
}

/// Key holding the postings of `uid` for `attr`.
pub fn data_key(attr: &Attr, uid: Uid) -> Vec<u8> {
    let mut key = kind_prefix(attr, KeyKind::Data, 8);
    ord::put_u64_be(&mut key, uid.0);
    key
}

/// Key holding the entities indexed under `token`.
pub fn index_key(attr: &Attr, token: &[u8]) -> Vec<u8> {
    let mut key = kind_prefix(attr, KeyKind::Index, token.len());
    key.extend_from_slice(token);
    key
}

/// Key holding the sources of edges pointing at `target`.
pub fn reverse_key(attr: &Attr, target: Uid) -> Vec<u8> {
    let mut key = kind_prefix(attr, KeyKind::Reverse, 8);
    ord::put_u64_be(&mut key, target.0);
    key
}

/// Key holding the entities whose edge count equals `count`.
pub fn count_key(attr: &Attr, count: u32, reverse: bool) -> Vec<u8> {
    let mut key = count_prefix(attr, reverse);
    key.extend_from_slice(&count.to_be_bytes());
    key
}

/// Key holding the persisted schema descriptor of `attr`.
pub fn schema_key(attr: &Attr) -> Vec<u8> {
    attr_bytes(SCHEMA_PREFIX, attr, 0)
}

/// Prefix of every schema key.
pub fn schema_prefix() -> Vec<u8> {
    vec![SCHEMA_PREFIX]
}

/// Decoded form of a stored key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ParsedKey {
    /// Data key.
    Data {
        /// Predicate.
        attr: Attr,
        /// Entity.
        uid: Uid,
    },
    /// Index key.
    Index {
        /// Predicate.
        attr: Attr,
        /// Token including its tokenizer identifier byte.
        token: Vec<u8>,
    },
    /// Reverse-edge key.
    Reverse {
        /// Predicate.
        attr: Attr,
        /// Edge target.
        uid: Uid,
    },
    /// Count key.
    Count {
        /// Predicate.
        attr: Attr,
        /// Edge count.
        count: u32,
        /// Whether this counts reverse edges.
        reverse: bool,
    },
    /// Schema key.
    Schema {
        /// Predicate.
        attr: Attr,
    },
}

impl ParsedKey {
    /// Parses a key, failing with [`UmbraError::Corruption`] on malformed input.
    pub fn parse(key: &[u8]) -> Result<Self> {
        let (&prefix, rest) = key
            .split_first()
            .ok_or(UmbraError::Corruption("empty key"))?;
        if rest.len() < 10 {
            return Err(UmbraError::Corruption("key shorter than attribute header"));
        }
        let name_len = usize::from(u16::from_be_bytes([rest[0], rest[1]]));
        let namespace = ord::get_u64_be(&rest[2..])?;
        let name_end = 10 + name_len;
        let name = rest
            .get(10..name_end)
            .ok_or(UmbraError::Corruption("key attribute name truncated"))?;
        let name = std::str::from_utf8(name)
            .map_err(|_| UmbraError::Corruption("key attribute name is not UTF-8"))?;
        let attr = Attr::new(namespace, name);
        let tail = &rest[name_end..];
        match prefix {
            SCHEMA_PREFIX => {
                if !tail.is_empty() {
                    return Err(UmbraError::Corruption("schema key has trailing bytes"));
                }
                Ok(ParsedKey::Schema { attr })
            }
            DEFAULT_PREFIX => {
                let (&kind, suffix) = tail
                    .split_first()
                    .ok_or(UmbraError::Corruption("key kind byte missing"))?;
                match KeyKind::from_byte(kind)? {
                    KeyKind::Data => Ok(ParsedKey::Data {
                        attr,
                        uid: exact_uid(suffix)?,
                    }),
                    KeyKind::Reverse => Ok(ParsedKey::Reverse {
                        attr,
                        uid: exact_uid(suffix)?,
                    }),
                    KeyKind::Index => {
                        if suffix.is_empty() {
                            return Err(UmbraError::Corruption("index key has empty token"));
                        }
                        Ok(ParsedKey::Index {
                            attr,
                            token: suffix.to_vec(),
                        })
                    }
                    kind @ (KeyKind::Count | KeyKind::CountReverse) => {
                        let count: [u8; 4] = suffix
                            .try_into()
                            .map_err(|_| UmbraError::Corruption("count key suffix malformed"))?;
                        Ok(ParsedKey::Count {
                            attr,
                            count: u32::from_be_bytes(count),
                            reverse: kind == KeyKind::CountReverse,
                        })
                    }
                }
            }
            _ => Err(UmbraError::Corruption("unknown key prefix byte")),
        }
    }

    /// Predicate the key belongs to.
    pub fn attr(&self) -> &Attr {
        match self {
            ParsedKey::Data { attr, .. }
            | ParsedKey::Index { attr, .. }
            | ParsedKey::Reverse { attr, .. }
            | ParsedKey::Count { attr, .. }
            | ParsedKey::Schema { attr } => attr,
        }
    }
}

fn exact_uid(suffix: &[u8]) -> Result<Uid> {
    if suffix.len() != 8 {
        return Err(UmbraError::Corruption("uid key suffix must be 8 bytes"));
    }
    Ok(Uid(ord::get_u64_be(suffix)?))
}

/// Renders a key for logs.
pub fn display_key(key: &[u8]) -> String {
    match ParsedKey::parse(key) {
        Ok(ParsedKey::Data { attr, uid }) => format!("data/{attr}/{uid}"),
        Ok(ParsedKey::Index { attr, token }) => format!("index/{attr}/{}", hex::encode(token)),
        Ok(ParsedKey::Reverse { attr, uid }) => format!("reverse/{attr}/{uid}"),
        Ok(ParsedKey::Count {
            attr,
            count,
            reverse,
        }) => format!("count/{attr}/{count}/{}", if reverse { "rev" } else { "fwd" }),
        Ok(ParsedKey::Schema { attr }) => format!("schema/{attr}"),
        Err(_) => format!("raw/{}", hex::encode(key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_recovers_every_kind() {
        let attr = Attr::new(3, "friend");
        assert_eq!(
            ParsedKey::parse(&data_key(&attr, Uid(7))).unwrap(),
            ParsedKey::Data {
                attr: attr.clone(),
                uid: Uid(7)
            }
        );
        assert_eq!(
            ParsedKey::parse(&index_key(&attr, b"\x01abc")).unwrap(),
            ParsedKey::Index {
                attr: attr.clone(),
                token: b"\x01abc".to_vec()
            }
        );
        assert_eq!(
            ParsedKey::parse(&count_key(&attr, 2, true)).unwrap(),
            ParsedKey::Count {
                attr: attr.clone(),
                count: 2,
                reverse: true
            }
        );
        assert_eq!(
            ParsedKey::parse(&schema_key(&attr)).unwrap(),
            ParsedKey::Schema { attr }
        );
    }

    #[test]
    fn predicate_ranges_are_contiguous() {
        let attr = Attr::root("name");
        let other = Attr::root("name2");
        let prefix = predicate_prefix(&attr);
        assert!(data_key(&attr, Uid(u64::MAX)).starts_with(&prefix));
        assert!(index_key(&attr, b"\x02x").starts_with(&index_prefix(&attr)));
        assert!(index_key(&attr, b"\x02x").starts_with(&tokenizer_prefix(&attr, 0x02)));
        assert!(!data_key(&other, Uid(1)).starts_with(&prefix));
        assert!(data_key(&attr, Uid(1)) < data_key(&attr, Uid(2)));
        assert!(data_key(&attr, Uid(u64::MAX)) < index_key(&attr, b"\x01"));
    }

    #[test]
    fn malformed_keys_are_corruption() {
        let attr = Attr::root("age");
        let mut key = data_key(&attr, Uid(1));
        key.pop();
        assert!(matches!(
            ParsedKey::parse(&key),
            Err(UmbraError::Corruption(_))
        ));
        assert!(ParsedKey::parse(&[]).is_err());
        assert!(ParsedKey::parse(&index_prefix(&attr)).is_err());
    }
}
