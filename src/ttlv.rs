//! TTLV Codec Module
//!
//! Implements the tag-type-length-value binary encoding used by the KMIP
//! subset: every item carries a 3-byte tag, a type byte, a 4-byte big-endian
//! length, then the value padded to 8-byte alignment where the type requires
//! it. Decoding any well-formed encoded item yields a structurally equal item.

use thiserror::Error;
use tracing::warn;

pub const TYPE_STRUCTURE: u8 = 0x01;
pub const TYPE_INTEGER: u8 = 0x02;
pub const TYPE_LONG_INTEGER: u8 = 0x03;
pub const TYPE_ENUMERATION: u8 = 0x05;
pub const TYPE_TEXT: u8 = 0x07;
pub const TYPE_BYTES: u8 = 0x08;
pub const TYPE_DATE_TIME: u8 = 0x09;

/// 3 bytes of tag, 1 byte of type, 4 bytes of length.
pub const LEN_HEADER: usize = 8;

/// Both server and client refuse to decode a structure larger than this
/// number. The number is big enough for all three operations supported by the
/// key service: create, get, and destroy.
pub const MAX_STRUCT_LEN: usize = 65536;

/// The tag of a TTLV item consists of three bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(pub [u8; 3]);

impl Tag {
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Any TTLV item. A structure's value is the sequence of its child items;
/// every other variant is a primitive.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    /// Length of value is the sum of encoded child lengths including padding.
    Structure { tag: Tag, items: Vec<Item> },
    /// Length of value is 4. Representation comes with 4 additional bytes of padding.
    Integer { tag: Tag, value: i32 },
    /// Length of value is 8.
    LongInteger { tag: Tag, value: i64 },
    /// Length of value is 4. Representation comes with 4 additional bytes of padding.
    Enumeration { tag: Tag, value: i32 },
    /// Seconds since the Unix epoch. Length of value is 8.
    DateTime { tag: Tag, timestamp: i64 },
    /// Length of value is the string length, representation is padded to 8 bytes.
    Text { tag: Tag, value: String },
    /// Length of value is the array length, representation is padded to 8 bytes.
    Bytes { tag: Tag, value: Vec<u8> },
}

#[derive(Debug, Error)]
pub enum TtlvError {
    #[error("malformed TTLV item: {0}")]
    Malformed(String),
    #[error("unknown TTLV type 0x{0:02x}")]
    UnknownType(u8),
}

/// Round input integer upward to be divisible by 8.
pub fn round_up_to_8(n: usize) -> usize {
    if n % 8 != 0 {
        n + 8 - (n % 8)
    } else {
        n
    }
}

impl Item {
    pub fn tag(&self) -> Tag {
        match self {
            Item::Structure { tag, .. }
            | Item::Integer { tag, .. }
            | Item::LongInteger { tag, .. }
            | Item::Enumeration { tag, .. }
            | Item::DateTime { tag, .. }
            | Item::Text { tag, .. }
            | Item::Bytes { tag, .. } => *tag,
        }
    }

    fn type_code(&self) -> u8 {
        match self {
            Item::Structure { .. } => TYPE_STRUCTURE,
            Item::Integer { .. } => TYPE_INTEGER,
            Item::LongInteger { .. } => TYPE_LONG_INTEGER,
            Item::Enumeration { .. } => TYPE_ENUMERATION,
            Item::DateTime { .. } => TYPE_DATE_TIME,
            Item::Text { .. } => TYPE_TEXT,
            Item::Bytes { .. } => TYPE_BYTES,
        }
    }

    /// Return the child items if this item is a structure.
    pub fn children(&self) -> Option<&[Item]> {
        match self {
            Item::Structure { items, .. } => Some(items),
            _ => None,
        }
    }

    /// Find the first child item carrying the given tag inside a structure.
    pub fn find(&self, tag: Tag) -> Option<&Item> {
        self.children()?.iter().find(|item| item.tag() == tag)
    }

    /// Find every child item carrying the given tag inside a structure.
    pub fn find_all(&self, tag: Tag) -> Vec<&Item> {
        match self.children() {
            Some(items) => items.iter().filter(|item| item.tag() == tag).collect(),
            None => Vec::new(),
        }
    }
}

/// Decode a wireshark hex dump of a network packet into a byte array by
/// dropping the offset column and the spacing. Handy for turning captured
/// conversations with appliances into test fixtures.
pub fn wireshark_dump_to_bytes(dump: &str) -> Vec<u8> {
    let mut hex_text = String::new();
    for line in dump.lines() {
        if line.len() < 7 {
            continue;
        }
        hex_text.push_str(&line[7..].replace(' ', ""));
    }
    match hex::decode(&hex_text) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("failed to decode hex string from dump - {}", err);
            Vec::new()
        }
    }
}

/// Generate a string describing an item in detail, for logging conversations
/// with misbehaving peers. If the item is a structure, the output descends
/// into the child items too.
pub fn describe(item: &Item, indent: usize) -> String {
    let mut out = String::new();
    out.push_str(&" ".repeat(indent));
    match item {
        Item::Structure { tag, items } => {
            out.push_str(&format!("TAG {} STRUCTURE\n", tag.hex()));
            for child in items {
                out.push_str(&describe(child, indent + 4));
            }
        }
        Item::Integer { tag, value } => {
            out.push_str(&format!("TAG {} INTEGER - {}\n", tag.hex(), value));
        }
        Item::LongInteger { tag, value } => {
            out.push_str(&format!("TAG {} LONG - {}\n", tag.hex(), value));
        }
        Item::Enumeration { tag, value } => {
            out.push_str(&format!("TAG {} ENUM - {}\n", tag.hex(), value));
        }
        Item::DateTime { tag, timestamp } => {
            out.push_str(&format!("TAG {} DATETIME - {}\n", tag.hex(), timestamp));
        }
        Item::Text { tag, value } => {
            out.push_str(&format!("TAG {} TEXT - {}\n", tag.hex(), value));
        }
        Item::Bytes { tag, value } => {
            out.push_str(&format!("TAG {} BYTES - {}\n", tag.hex(), hex::encode(value)));
        }
    }
    out
}

/// Encode any TTLV item into its binary representation.
pub fn encode(item: &Item) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    encode_into(item, &mut out);
    out
}

fn encode_into(item: &Item, out: &mut Vec<u8>) {
    out.extend_from_slice(&item.tag().0);
    out.push(item.type_code());
    match item {
        Item::Structure { items, .. } => {
            let mut body = Vec::with_capacity(64);
            for child in items {
                encode_into(child, &mut body);
            }
            // Structure length counts child padding.
            out.extend_from_slice(&(body.len() as i32).to_be_bytes());
            out.extend_from_slice(&body);
        }
        Item::Integer { value, .. } => {
            out.extend_from_slice(&4i32.to_be_bytes());
            out.extend_from_slice(&value.to_be_bytes());
            // An additional 4 bytes of padding not counted against length.
            out.extend_from_slice(&[0, 0, 0, 0]);
        }
        Item::Enumeration { value, .. } => {
            out.extend_from_slice(&4i32.to_be_bytes());
            out.extend_from_slice(&value.to_be_bytes());
            // An additional 4 bytes of padding not counted against length.
            out.extend_from_slice(&[0, 0, 0, 0]);
        }
        Item::LongInteger { value, .. } => {
            out.extend_from_slice(&8i32.to_be_bytes());
            out.extend_from_slice(&value.to_be_bytes());
        }
        Item::DateTime { timestamp, .. } => {
            out.extend_from_slice(&8i32.to_be_bytes());
            out.extend_from_slice(&timestamp.to_be_bytes());
        }
        Item::Text { value, .. } => {
            out.extend_from_slice(&(value.len() as i32).to_be_bytes());
            out.extend_from_slice(value.as_bytes());
            // Pad with zero bytes to line up with 8.
            out.resize(out.len() + round_up_to_8(value.len()) - value.len(), 0);
        }
        Item::Bytes { value, .. } => {
            out.extend_from_slice(&(value.len() as i32).to_be_bytes());
            out.extend_from_slice(value);
            out.resize(out.len() + round_up_to_8(value.len()) - value.len(), 0);
        }
    }
}

/// Decode tag, type, and declared value length (excluding padding) from the
/// first eight bytes of the input.
fn decode_header(buf: &[u8]) -> Result<(Tag, u8, usize), TtlvError> {
    if buf.len() < LEN_HEADER {
        return Err(TtlvError::Malformed(format!(
            "need {} header bytes but only {} remain",
            LEN_HEADER,
            buf.len()
        )));
    }
    let tag = Tag([buf[0], buf[1], buf[2]]);
    let typ = buf[3];
    let declared = i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if declared <= 0 {
        return Err(TtlvError::Malformed(format!(
            "length of type 0x{:02x} must be positive, but it is {}",
            typ, declared
        )));
    }
    Ok((tag, typ, declared as usize))
}

/// Decode one TTLV item from the start of the input. Oversize top-level
/// structures are refused outright.
pub fn decode(buf: &[u8]) -> Result<Item, TtlvError> {
    let (_, typ, declared) = decode_header(buf)?;
    if typ == TYPE_STRUCTURE && declared > MAX_STRUCT_LEN {
        return Err(TtlvError::Malformed(format!(
            "structure of {} bytes exceeds the {} byte limit",
            declared, MAX_STRUCT_LEN
        )));
    }
    let (item, _) = decode_any(buf)?;
    Ok(item)
}

/// Decode any TTLV item and return it along with the length of its value
/// representation (padding included, header excluded), which is how far a
/// reader must advance past the header to reach the next item.
fn decode_any(buf: &[u8]) -> Result<(Item, usize), TtlvError> {
    let (tag, typ, declared) = decode_header(buf)?;
    let body = &buf[LEN_HEADER..];
    let need = |n: usize| -> Result<(), TtlvError> {
        if body.len() < n {
            Err(TtlvError::Malformed(format!(
                "value of tag {} wants {} bytes but only {} remain",
                tag.hex(),
                n,
                body.len()
            )))
        } else {
            Ok(())
        }
    };
    match typ {
        TYPE_INTEGER => {
            need(4)?;
            let value = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
            // Declared length is 4 but the representation occupies 8 bytes.
            Ok((Item::Integer { tag, value }, 8))
        }
        TYPE_ENUMERATION => {
            need(4)?;
            let value = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
            Ok((Item::Enumeration { tag, value }, 8))
        }
        TYPE_LONG_INTEGER => {
            need(8)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&body[..8]);
            Ok((Item::LongInteger { tag, value: i64::from_be_bytes(raw) }, 8))
        }
        TYPE_DATE_TIME => {
            need(8)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&body[..8]);
            Ok((Item::DateTime { tag, timestamp: i64::from_be_bytes(raw) }, 8))
        }
        TYPE_TEXT => {
            need(declared)?;
            let value = String::from_utf8(body[..declared].to_vec()).map_err(|_| {
                TtlvError::Malformed(format!("tag {} text value is not UTF-8", tag.hex()))
            })?;
            Ok((Item::Text { tag, value }, round_up_to_8(declared)))
        }
        TYPE_BYTES => {
            need(declared)?;
            let value = body[..declared].to_vec();
            Ok((Item::Bytes { tag, value }, round_up_to_8(declared)))
        }
        TYPE_STRUCTURE => {
            need(declared)?;
            let mut remaining = &body[..declared];
            let mut items = Vec::with_capacity(4);
            loop {
                let (item, value_len) = decode_any(remaining)?;
                items.push(item);
                // Advance past the decoded header plus the item's representation.
                let advance = LEN_HEADER + value_len;
                if advance >= remaining.len() {
                    break;
                }
                remaining = &remaining[advance..];
            }
            Ok((Item::Structure { tag, items }, declared))
        }
        other => Err(TtlvError::UnknownType(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T1: Tag = Tag([0x42, 0x00, 0x01]);
    const T2: Tag = Tag([0x42, 0x00, 0x02]);
    const T3: Tag = Tag([0x42, 0x00, 0x03]);

    #[test]
    fn test_round_up_to_8() {
        assert_eq!(round_up_to_8(1), 8);
        assert_eq!(round_up_to_8(8), 8);
        assert_eq!(round_up_to_8(9), 16);
        assert_eq!(round_up_to_8(0), 0);
    }

    #[test]
    fn test_primitive_representation() {
        // Integer: declared length 4, value occupies 8 bytes with zero padding.
        let encoded = encode(&Item::Integer { tag: T1, value: 8 });
        assert_eq!(
            encoded,
            vec![0x42, 0x00, 0x01, 0x02, 0, 0, 0, 4, 0, 0, 0, 8, 0, 0, 0, 0]
        );
        // Enumeration follows the same padding rule.
        let encoded = encode(&Item::Enumeration { tag: T1, value: 255 });
        assert_eq!(encoded.len(), LEN_HEADER + 8);
        assert_eq!(&encoded[4..8], &[0, 0, 0, 4]);
        assert_eq!(&encoded[12..16], &[0, 0, 0, 0]);
        // LongInteger occupies exactly 8 value bytes.
        let encoded = encode(&Item::LongInteger { tag: T1, value: -1 });
        assert_eq!(encoded.len(), LEN_HEADER + 8);
        assert_eq!(&encoded[4..8], &[0, 0, 0, 8]);
    }

    #[test]
    fn test_text_padding_law() {
        // Declared length is the true string length, representation rounds up to 8.
        let encoded = encode(&Item::Text {
            tag: T1,
            value: "abc".to_string(),
        });
        assert_eq!(&encoded[4..8], &[0, 0, 0, 3]);
        assert_eq!(encoded.len(), LEN_HEADER + 8);
        assert_eq!(&encoded[11..16], &[0, 0, 0, 0, 0]);
        // A string of exactly 8 bytes needs no padding.
        let encoded = encode(&Item::Text {
            tag: T1,
            value: "12345678".to_string(),
        });
        assert_eq!(encoded.len(), LEN_HEADER + 8);
    }

    fn sample_structure() -> Item {
        Item::Structure {
            tag: T1,
            items: vec![
                Item::Integer { tag: T2, value: 256 },
                Item::Enumeration { tag: T2, value: 1 },
                Item::LongInteger {
                    tag: T2,
                    value: 1234567890123,
                },
                Item::DateTime {
                    tag: T2,
                    timestamp: 1490000000,
                },
                Item::Text {
                    tag: T2,
                    value: "cryptctl-abc".to_string(),
                },
                Item::Bytes {
                    tag: T2,
                    value: vec![1, 2, 3, 4, 5],
                },
                Item::Structure {
                    tag: T3,
                    items: vec![Item::Text {
                        tag: T2,
                        value: "nested".to_string(),
                    }],
                },
            ],
        }
    }

    #[test]
    fn test_round_trip() {
        let original = sample_structure();
        let encoded = encode(&original);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, original);
        // Re-encoding the decoded item must reproduce the input bytes exactly.
        assert_eq!(encode(&decoded), encoded);
    }

    #[test]
    fn test_structure_length_counts_padding() {
        let item = Item::Structure {
            tag: T1,
            items: vec![Item::Text {
                tag: T2,
                value: "abc".to_string(),
            }],
        };
        let encoded = encode(&item);
        // Child representation is 8 header + 8 padded value bytes.
        assert_eq!(&encoded[4..8], &[0, 0, 0, 16]);
    }

    #[test]
    fn test_decode_rejects_truncated_input() {
        let encoded = encode(&sample_structure());
        for cut in [1, 7, 9, encoded.len() - 3] {
            match decode(&encoded[..cut]) {
                Err(TtlvError::Malformed(_)) => {}
                other => panic!("truncation at {} yielded {:?}", cut, other),
            }
        }
    }

    #[test]
    fn test_decode_rejects_non_positive_length() {
        let mut encoded = encode(&Item::Integer { tag: T1, value: 1 });
        encoded[4..8].copy_from_slice(&0i32.to_be_bytes());
        assert!(matches!(decode(&encoded), Err(TtlvError::Malformed(_))));
        encoded[4..8].copy_from_slice(&(-4i32).to_be_bytes());
        assert!(matches!(decode(&encoded), Err(TtlvError::Malformed(_))));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let mut encoded = encode(&Item::Integer { tag: T1, value: 1 });
        encoded[3] = 0x0e;
        assert!(matches!(decode(&encoded), Err(TtlvError::UnknownType(0x0e))));
    }

    #[test]
    fn test_decode_rejects_oversize_structure() {
        let mut buf = vec![0x42, 0x00, 0x01, TYPE_STRUCTURE];
        buf.extend_from_slice(&((MAX_STRUCT_LEN as i32) + 1).to_be_bytes());
        assert!(matches!(decode(&buf), Err(TtlvError::Malformed(_))));
    }

    #[test]
    fn test_wireshark_dump_to_bytes() {
        let dump = "\
0000   42 00 23 01 00 00 00 38 42 00 24 05 00 00 00 04
0010   00 00 00 01 00 00 00 00 42 00 25 01 00 00 00 20
0020   42 00 99 07 00 00 00 04 75 73 65 72 00 00 00 00
0030   42 00 a1 07 00 00 00 04 70 61 73 73 00 00 00 00";
        let bytes = wireshark_dump_to_bytes(dump);
        assert_eq!(bytes.len(), 64);
        // The captured structure decodes and re-encodes without loss.
        let item = decode(&bytes).unwrap();
        assert_eq!(encode(&item), bytes);
        assert_eq!(item.tag(), Tag([0x42, 0x00, 0x23]));
        // Garbage dumps degrade to an empty array.
        assert!(wireshark_dump_to_bytes("0000   zz zz").is_empty());
    }

    #[test]
    fn test_describe_descends_into_structures() {
        let dump = describe(&sample_structure(), 0);
        assert!(dump.starts_with("TAG 420001 STRUCTURE\n"));
        assert!(dump.contains("    TAG 420002 INTEGER - 256\n"));
        assert!(dump.contains("    TAG 420002 TEXT - cryptctl-abc\n"));
        assert!(dump.contains("        TAG 420002 TEXT - nested\n"));
        assert!(dump.contains("TAG 420002 BYTES - 0102030405\n"));
    }

    #[test]
    fn test_find_in_structure() {
        let item = sample_structure();
        assert!(item.find(T3).is_some());
        assert_eq!(item.find_all(T2).len(), 6);
        assert!(item.find(Tag([9, 9, 9])).is_none());
        assert!(Item::Integer { tag: T1, value: 0 }.find(T1).is_none());
    }
}
