//! Stored record encoding for posting lists.
//!
//! ```text
//! version u8 | varint count | postings... | crc32 (BE u32)
//! posting: op u8 | varint id | value tag u8 | len-prefixed payload
//!          | len-prefixed lang | len-prefixed facets
//! ```
//!
//! Payloads carry no timestamps; the store keys versions by timestamp.

use crate::primitives::bytes::buf::{put_len_prefixed, Cursor};
use crate::primitives::bytes::var;
use crate::types::{Result, UmbraError, Value};

use super::{Posting, PostingOp};

const RECORD_VERSION: u8 = 1;
const CRC_LEN: usize = 4;

/// Serializes postings into a stored record payload.
pub fn encode_postings(postings: &[Posting]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + postings.len() * 16);
    out.push(RECORD_VERSION);
    var::encode_u64(postings.len() as u64, &mut out);
    for posting in postings {
        out.push(posting.op.to_byte());
        var::encode_u64(posting.id, &mut out);
        let mut tagged = Vec::new();
        posting.value.encode_into(&mut tagged);
        out.push(tagged[0]);
        put_len_prefixed(&mut out, &tagged[1..]);
        put_len_prefixed(&mut out, posting.lang.as_bytes());
        put_len_prefixed(&mut out, &posting.facets);
    }
    let crc = crc32fast::hash(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    out
}

/// Parses a stored record payload, verifying its checksum.
pub fn decode_postings(bytes: &[u8]) -> Result<Vec<Posting>> {
    if bytes.len() < 1 + CRC_LEN {
        return Err(UmbraError::Corruption("posting record truncated"));
    }
    let (body, trailer) = bytes.split_at(bytes.len() - CRC_LEN);
    let stored = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    if crc32fast::hash(body) != stored {
        return Err(UmbraError::Corruption("posting record checksum mismatch"));
    }
    let mut cur = Cursor::new(body);
    if cur.u8()? != RECORD_VERSION {
        return Err(UmbraError::Corruption("unsupported posting record version"));
    }
    let count = usize::try_from(cur.varint()?)
        .map_err(|_| UmbraError::Corruption("posting count exceeds usize"))?;
    let mut postings = Vec::with_capacity(count.min(cur.remaining()));
    for _ in 0..count {
        let op = PostingOp::from_byte(cur.u8()?)
            .ok_or(UmbraError::Corruption("unknown posting op"))?;
        let id = cur.varint()?;
        let tag = cur.u8()?;
        let value = Value::decode(tag, cur.len_prefixed()?)?;
        let lang = std::str::from_utf8(cur.len_prefixed()?)
            .map_err(|_| UmbraError::Corruption("posting language tag is not UTF-8"))?
            .to_owned();
        let facets = cur.len_prefixed()?.to_vec();
        postings.push(Posting {
            id,
            value,
            lang,
            op,
            facets,
        });
    }
    if cur.remaining() != 0 {
        return Err(UmbraError::Corruption("trailing bytes after postings"));
    }
    Ok(postings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Uid;

    fn sample() -> Vec<Posting> {
        vec![
            Posting::uid(Uid(4), PostingOp::Set),
            Posting {
                id: 17,
                value: Value::String("héllo".into()),
                lang: "fr".into(),
                op: PostingOp::Del,
                facets: vec![1, 2, 3],
            },
        ]
    }

    #[test]
    fn decode_restores_encoded_postings() {
        let encoded = encode_postings(&sample());
        assert_eq!(decode_postings(&encoded).unwrap(), sample());
        assert!(decode_postings(&encode_postings(&[])).unwrap().is_empty());
    }

    #[test]
    fn identical_content_encodes_identically() {
        assert_eq!(encode_postings(&sample()), encode_postings(&sample()));
    }

    #[test]
    fn flipped_byte_is_corruption() {
        let mut encoded = encode_postings(&sample());
        encoded[3] ^= 0xff;
        assert!(matches!(
            decode_postings(&encoded),
            Err(UmbraError::Corruption(_))
        ));
        assert!(decode_postings(&[1]).is_err());
    }
}
