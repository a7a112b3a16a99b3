//! KMIP Message Module
//!
//! A small catalogue of KMIP 1.2 structures sufficient for the three
//! operations the key service performs: Create, Get, and Destroy of AES-256
//! symmetric keys. Each message type converts to and from a TTLV item tree;
//! encoding a decoded message reproduces the input bytes exactly.

use crate::ttlv::{self, Item, Tag};
use std::io::Read;
use thiserror::Error;

pub const TAG_REQUEST_MESSAGE: Tag = Tag([0x42, 0x00, 0x78]);
pub const TAG_REQUEST_HEADER: Tag = Tag([0x42, 0x00, 0x77]);
pub const TAG_PROTOCOL_VERSION: Tag = Tag([0x42, 0x00, 0x69]);
pub const TAG_PROTOCOL_VERSION_MAJOR: Tag = Tag([0x42, 0x00, 0x6a]);
pub const TAG_PROTOCOL_VERSION_MINOR: Tag = Tag([0x42, 0x00, 0x6b]);
pub const TAG_AUTHENTICATION: Tag = Tag([0x42, 0x00, 0x0c]);
pub const TAG_CREDENTIAL: Tag = Tag([0x42, 0x00, 0x23]);
pub const TAG_CREDENTIAL_TYPE: Tag = Tag([0x42, 0x00, 0x24]);
pub const TAG_CREDENTIAL_VALUE: Tag = Tag([0x42, 0x00, 0x25]);
pub const TAG_USERNAME: Tag = Tag([0x42, 0x00, 0x99]);
pub const TAG_PASSWORD: Tag = Tag([0x42, 0x00, 0xa1]);
pub const TAG_BATCH_COUNT: Tag = Tag([0x42, 0x00, 0x0d]);
pub const TAG_BATCH_ITEM: Tag = Tag([0x42, 0x00, 0x0f]);
pub const TAG_OPERATION: Tag = Tag([0x42, 0x00, 0x5c]);
pub const TAG_REQUEST_PAYLOAD: Tag = Tag([0x42, 0x00, 0x79]);
pub const TAG_OBJECT_TYPE: Tag = Tag([0x42, 0x00, 0x57]);
pub const TAG_TEMPLATE_ATTRIBUTE: Tag = Tag([0x42, 0x00, 0x91]);
pub const TAG_ATTRIBUTE: Tag = Tag([0x42, 0x00, 0x08]);
pub const TAG_ATTRIBUTE_NAME: Tag = Tag([0x42, 0x00, 0x0a]);
pub const TAG_ATTRIBUTE_VALUE: Tag = Tag([0x42, 0x00, 0x0b]);
pub const TAG_NAME_TYPE: Tag = Tag([0x42, 0x00, 0x54]);
pub const TAG_NAME_VALUE: Tag = Tag([0x42, 0x00, 0x55]);
pub const TAG_RESPONSE_MESSAGE: Tag = Tag([0x42, 0x00, 0x7b]);
pub const TAG_RESPONSE_HEADER: Tag = Tag([0x42, 0x00, 0x7a]);
pub const TAG_TIMESTAMP: Tag = Tag([0x42, 0x00, 0x92]);
pub const TAG_RESULT_STATUS: Tag = Tag([0x42, 0x00, 0x7f]);
pub const TAG_RESULT_REASON: Tag = Tag([0x42, 0x00, 0x7e]);
pub const TAG_RESULT_MESSAGE: Tag = Tag([0x42, 0x00, 0x7d]);
pub const TAG_RESPONSE_PAYLOAD: Tag = Tag([0x42, 0x00, 0x7c]);
pub const TAG_UNIQUE_ID: Tag = Tag([0x42, 0x00, 0x94]);
pub const TAG_SYMMETRIC_KEY: Tag = Tag([0x42, 0x00, 0x8f]);
pub const TAG_KEY_BLOCK: Tag = Tag([0x42, 0x00, 0x40]);
pub const TAG_FORMAT_TYPE: Tag = Tag([0x42, 0x00, 0x42]);
pub const TAG_KEY_VALUE: Tag = Tag([0x42, 0x00, 0x45]);
pub const TAG_KEY_MATERIAL: Tag = Tag([0x42, 0x00, 0x43]);
pub const TAG_CRYPTO_ALGORITHM: Tag = Tag([0x42, 0x00, 0x28]);
pub const TAG_CRYPTO_LEN: Tag = Tag([0x42, 0x00, 0x2a]);

pub const PROTOCOL_VERSION_MAJOR: i32 = 1;
pub const PROTOCOL_VERSION_MINOR: i32 = 2;
pub const CREDENTIAL_TYPE_USERNAME_PASSWORD: i32 = 1;

pub const OP_CREATE: i32 = 1;
pub const OP_GET: i32 = 10;
pub const OP_DESTROY: i32 = 20;

pub const OBJECT_TYPE_SYMMETRIC_KEY: i32 = 2;
pub const NAME_TYPE_TEXT: i32 = 1;
pub const KEY_FORMAT_RAW: i32 = 1;
pub const CRYPTO_ALGO_AES: i32 = 3;
pub const MASK_CRYPTO_USAGE_ENCRYPT: i32 = 4;
pub const MASK_CRYPTO_USAGE_DECRYPT: i32 = 8;

pub const RESULT_STATUS_SUCCESS: i32 = 0;
pub const RESULT_STATUS_FAILED: i32 = 1;
pub const RESULT_REASON_NOT_FOUND: i32 = 1;

pub const ATTR_NAME_CRYPTO_ALG: &str = "Cryptographic Algorithm";
pub const ATTR_NAME_CRYPTO_LEN: &str = "Cryptographic Length";
pub const ATTR_NAME_CRYPTO_USAGE_MASK: &str = "Cryptographic Usage Mask";
pub const ATTR_NAME_KEY_NAME: &str = "Name";

/// The only kind of AES encryption key the key service creates and serves.
pub const AES_KEY_SIZE_BITS: i32 = 256;

#[derive(Debug, Error)]
pub enum KmipError {
    #[error("malformed KMIP message: {0}")]
    Malformed(String),
    #[error(transparent)]
    Ttlv(#[from] ttlv::TtlvError),
}

fn malformed(what: impl Into<String>) -> KmipError {
    KmipError::Malformed(what.into())
}

// ============================================================================
// Item tree helpers
// ============================================================================

/// Match the item against the expected structure tag, then find the child
/// carrying the requested tag.
fn find_item<'a>(item: &'a Item, struct_tag: Tag, child_tag: Tag) -> Result<&'a Item, KmipError> {
    if item.tag() != struct_tag {
        return Err(malformed(format!(
            "was expecting structure tag {}, but got {} instead",
            struct_tag.hex(),
            item.tag().hex()
        )));
    }
    item.find(child_tag).ok_or_else(|| {
        malformed(format!(
            "cannot find an item with tag {} in structure {}",
            child_tag.hex(),
            struct_tag.hex()
        ))
    })
}

fn text_of(item: &Item) -> Result<&str, KmipError> {
    match item {
        Item::Text { value, .. } => Ok(value),
        other => Err(malformed(format!("tag {} is not a text item", other.tag().hex()))),
    }
}

fn int_of(item: &Item) -> Result<i32, KmipError> {
    match item {
        Item::Integer { value, .. } => Ok(*value),
        other => Err(malformed(format!("tag {} is not an integer item", other.tag().hex()))),
    }
}

fn enum_of(item: &Item) -> Result<i32, KmipError> {
    match item {
        Item::Enumeration { value, .. } => Ok(*value),
        other => Err(malformed(format!(
            "tag {} is not an enumeration item",
            other.tag().hex()
        ))),
    }
}

fn bytes_of(item: &Item) -> Result<&[u8], KmipError> {
    match item {
        Item::Bytes { value, .. } => Ok(value),
        other => Err(malformed(format!("tag {} is not a byte item", other.tag().hex()))),
    }
}

fn date_time_of(item: &Item) -> Result<i64, KmipError> {
    match item {
        Item::DateTime { timestamp, .. } => Ok(*timestamp),
        other => Err(malformed(format!(
            "tag {} is not a date-time item",
            other.tag().hex()
        ))),
    }
}

// ============================================================================
// Shared headers
// ============================================================================

/// Request header carrying the protocol version and username-password
/// credentials. Batch count is always one.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHeader {
    pub version_major: i32,
    pub version_minor: i32,
    pub username: String,
    pub password: String,
}

impl RequestHeader {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            version_major: PROTOCOL_VERSION_MAJOR,
            version_minor: PROTOCOL_VERSION_MINOR,
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    fn to_item(&self) -> Item {
        Item::Structure {
            tag: TAG_REQUEST_HEADER,
            items: vec![
                Item::Structure {
                    tag: TAG_PROTOCOL_VERSION,
                    items: vec![
                        Item::Integer { tag: TAG_PROTOCOL_VERSION_MAJOR, value: self.version_major },
                        Item::Integer { tag: TAG_PROTOCOL_VERSION_MINOR, value: self.version_minor },
                    ],
                },
                Item::Structure {
                    tag: TAG_AUTHENTICATION,
                    items: vec![Item::Structure {
                        tag: TAG_CREDENTIAL,
                        items: vec![
                            Item::Enumeration {
                                tag: TAG_CREDENTIAL_TYPE,
                                value: CREDENTIAL_TYPE_USERNAME_PASSWORD,
                            },
                            Item::Structure {
                                tag: TAG_CREDENTIAL_VALUE,
                                items: vec![
                                    Item::Text { tag: TAG_USERNAME, value: self.username.clone() },
                                    Item::Text { tag: TAG_PASSWORD, value: self.password.clone() },
                                ],
                            },
                        ],
                    }],
                },
                Item::Integer { tag: TAG_BATCH_COUNT, value: 1 },
            ],
        }
    }

    fn from_item(item: &Item) -> Result<Self, KmipError> {
        let version = find_item(item, TAG_REQUEST_HEADER, TAG_PROTOCOL_VERSION)?;
        let major = int_of(find_item(version, TAG_PROTOCOL_VERSION, TAG_PROTOCOL_VERSION_MAJOR)?)?;
        let minor = int_of(find_item(version, TAG_PROTOCOL_VERSION, TAG_PROTOCOL_VERSION_MINOR)?)?;
        let batch = int_of(find_item(item, TAG_REQUEST_HEADER, TAG_BATCH_COUNT)?)?;
        if batch != 1 {
            return Err(malformed(format!(
                "was expecting exactly 1 batch item, but received {} instead",
                batch
            )));
        }
        let auth = find_item(item, TAG_REQUEST_HEADER, TAG_AUTHENTICATION)?;
        let credential = find_item(auth, TAG_AUTHENTICATION, TAG_CREDENTIAL)?;
        let value = find_item(credential, TAG_CREDENTIAL, TAG_CREDENTIAL_VALUE)?;
        let username = text_of(find_item(value, TAG_CREDENTIAL_VALUE, TAG_USERNAME)?)?.to_string();
        let password = text_of(find_item(value, TAG_CREDENTIAL_VALUE, TAG_PASSWORD)?)?.to_string();
        Ok(Self { version_major: major, version_minor: minor, username, password })
    }
}

/// Response header carrying the protocol version and response timestamp.
/// Batch count is always one.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHeader {
    pub version_major: i32,
    pub version_minor: i32,
    pub timestamp: i64,
}

impl ResponseHeader {
    pub fn new(timestamp: i64) -> Self {
        Self {
            version_major: PROTOCOL_VERSION_MAJOR,
            version_minor: PROTOCOL_VERSION_MINOR,
            timestamp,
        }
    }

    fn to_item(&self) -> Item {
        Item::Structure {
            tag: TAG_RESPONSE_HEADER,
            items: vec![
                Item::Structure {
                    tag: TAG_PROTOCOL_VERSION,
                    items: vec![
                        Item::Integer { tag: TAG_PROTOCOL_VERSION_MAJOR, value: self.version_major },
                        Item::Integer { tag: TAG_PROTOCOL_VERSION_MINOR, value: self.version_minor },
                    ],
                },
                Item::DateTime { tag: TAG_TIMESTAMP, timestamp: self.timestamp },
                Item::Integer { tag: TAG_BATCH_COUNT, value: 1 },
            ],
        }
    }

    fn from_item(item: &Item) -> Result<Self, KmipError> {
        let version = find_item(item, TAG_RESPONSE_HEADER, TAG_PROTOCOL_VERSION)?;
        let major = int_of(find_item(version, TAG_PROTOCOL_VERSION, TAG_PROTOCOL_VERSION_MAJOR)?)?;
        let minor = int_of(find_item(version, TAG_PROTOCOL_VERSION, TAG_PROTOCOL_VERSION_MINOR)?)?;
        let timestamp = date_time_of(find_item(item, TAG_RESPONSE_HEADER, TAG_TIMESTAMP)?)?;
        let batch = int_of(find_item(item, TAG_RESPONSE_HEADER, TAG_BATCH_COUNT)?)?;
        if batch != 1 {
            return Err(malformed(format!(
                "was expecting exactly 1 batch item, but received {} instead",
                batch
            )));
        }
        Ok(Self { version_major: major, version_minor: minor, timestamp })
    }
}

/// Outcome of a response batch item. Reason and message are only present on
/// failure.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    pub status: i32,
    pub reason: Option<i32>,
    pub message: Option<String>,
}

impl BatchResult {
    pub fn success() -> Self {
        Self { status: RESULT_STATUS_SUCCESS, reason: None, message: None }
    }

    pub fn not_found() -> Self {
        Self {
            status: RESULT_STATUS_FAILED,
            reason: Some(RESULT_REASON_NOT_FOUND),
            message: Some("cannot find a key with matching sequence number".to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RESULT_STATUS_SUCCESS
    }

    pub fn is_not_found(&self) -> bool {
        !self.is_success() && self.reason == Some(RESULT_REASON_NOT_FOUND)
    }

    fn from_batch_item(batch_item: &Item) -> Result<Self, KmipError> {
        let status = enum_of(find_item(batch_item, TAG_BATCH_ITEM, TAG_RESULT_STATUS)?)?;
        let reason = match batch_item.find(TAG_RESULT_REASON) {
            Some(item) => Some(enum_of(item)?),
            None => None,
        };
        let message = match batch_item.find(TAG_RESULT_MESSAGE) {
            Some(item) => Some(text_of(item)?.to_string()),
            None => None,
        };
        Ok(Self { status, reason, message })
    }
}

/// Assemble a response batch item: a successful one carries the payload, a
/// failed one carries the result reason and message instead.
fn response_batch_item(operation: i32, result: &BatchResult, payload: Option<Item>) -> Item {
    let mut items = vec![
        Item::Enumeration { tag: TAG_OPERATION, value: operation },
        Item::Enumeration { tag: TAG_RESULT_STATUS, value: result.status },
    ];
    if result.is_success() {
        if let Some(payload) = payload {
            items.push(payload);
        }
    } else {
        items.push(Item::Enumeration {
            tag: TAG_RESULT_REASON,
            value: result.reason.unwrap_or(0),
        });
        items.push(Item::Text {
            tag: TAG_RESULT_MESSAGE,
            value: result.message.clone().unwrap_or_default(),
        });
    }
    Item::Structure { tag: TAG_BATCH_ITEM, items }
}

/// Fetch the single batch item of a message and verify its operation value.
fn checked_batch_item(message: &Item, message_tag: Tag, operation: i32) -> Result<&Item, KmipError> {
    let batch_item = find_item(message, message_tag, TAG_BATCH_ITEM)?;
    let found_op = enum_of(find_item(batch_item, TAG_BATCH_ITEM, TAG_OPERATION)?)?;
    if found_op != operation {
        return Err(malformed(format!(
            "was expecting operation {}, but message carries {}",
            operation, found_op
        )));
    }
    Ok(batch_item)
}

// ============================================================================
// Create
// ============================================================================

/// Ask the key service to create a symmetric key under the given name. The
/// escrow service only ever asks for AES-256 with encrypt and decrypt usage;
/// the attributes stay explicit so the embedded service can refuse anything
/// else.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateRequest {
    pub header: RequestHeader,
    pub key_name: String,
    pub algorithm: i32,
    pub key_bits: i32,
    pub usage_mask: i32,
}

impl CreateRequest {
    /// A request for the one kind of key the escrow service uses.
    pub fn new_aes256(header: RequestHeader, key_name: &str) -> Self {
        Self {
            header,
            key_name: key_name.to_string(),
            algorithm: CRYPTO_ALGO_AES,
            key_bits: AES_KEY_SIZE_BITS,
            usage_mask: MASK_CRYPTO_USAGE_ENCRYPT | MASK_CRYPTO_USAGE_DECRYPT,
        }
    }

    pub fn to_item(&self) -> Item {
        let attribute = |name: &str, value: Item| Item::Structure {
            tag: TAG_ATTRIBUTE,
            items: vec![
                Item::Text { tag: TAG_ATTRIBUTE_NAME, value: name.to_string() },
                value,
            ],
        };
        let payload = Item::Structure {
            tag: TAG_REQUEST_PAYLOAD,
            items: vec![
                Item::Enumeration { tag: TAG_OBJECT_TYPE, value: OBJECT_TYPE_SYMMETRIC_KEY },
                Item::Structure {
                    tag: TAG_TEMPLATE_ATTRIBUTE,
                    items: vec![
                        attribute(
                            ATTR_NAME_CRYPTO_ALG,
                            Item::Enumeration { tag: TAG_ATTRIBUTE_VALUE, value: self.algorithm },
                        ),
                        attribute(
                            ATTR_NAME_CRYPTO_LEN,
                            Item::Integer { tag: TAG_ATTRIBUTE_VALUE, value: self.key_bits },
                        ),
                        attribute(
                            ATTR_NAME_CRYPTO_USAGE_MASK,
                            Item::Integer { tag: TAG_ATTRIBUTE_VALUE, value: self.usage_mask },
                        ),
                        attribute(
                            ATTR_NAME_KEY_NAME,
                            Item::Structure {
                                tag: TAG_ATTRIBUTE_VALUE,
                                items: vec![
                                    Item::Text { tag: TAG_NAME_VALUE, value: self.key_name.clone() },
                                    Item::Enumeration { tag: TAG_NAME_TYPE, value: NAME_TYPE_TEXT },
                                ],
                            },
                        ),
                    ],
                },
            ],
        };
        Item::Structure {
            tag: TAG_REQUEST_MESSAGE,
            items: vec![
                self.header.to_item(),
                Item::Structure {
                    tag: TAG_BATCH_ITEM,
                    items: vec![
                        Item::Enumeration { tag: TAG_OPERATION, value: OP_CREATE },
                        payload,
                    ],
                },
            ],
        }
    }

    pub fn from_item(item: &Item) -> Result<Self, KmipError> {
        let header =
            RequestHeader::from_item(find_item(item, TAG_REQUEST_MESSAGE, TAG_REQUEST_HEADER)?)?;
        let batch_item = checked_batch_item(item, TAG_REQUEST_MESSAGE, OP_CREATE)?;
        let payload = find_item(batch_item, TAG_BATCH_ITEM, TAG_REQUEST_PAYLOAD)?;
        // Presence of object type and template attribute distinguishes a
        // create payload from the other two request shapes.
        enum_of(find_item(payload, TAG_REQUEST_PAYLOAD, TAG_OBJECT_TYPE)?)?;
        let template = find_item(payload, TAG_REQUEST_PAYLOAD, TAG_TEMPLATE_ATTRIBUTE)?;
        let mut key_name = String::new();
        let mut algorithm = 0;
        let mut key_bits = 0;
        let mut usage_mask = 0;
        for attr in template.find_all(TAG_ATTRIBUTE) {
            let name = text_of(find_item(attr, TAG_ATTRIBUTE, TAG_ATTRIBUTE_NAME)?)?;
            let value = find_item(attr, TAG_ATTRIBUTE, TAG_ATTRIBUTE_VALUE)?;
            match name {
                ATTR_NAME_KEY_NAME => {
                    key_name =
                        text_of(find_item(value, TAG_ATTRIBUTE_VALUE, TAG_NAME_VALUE)?)?.to_string();
                }
                ATTR_NAME_CRYPTO_ALG => algorithm = enum_of(value)?,
                ATTR_NAME_CRYPTO_LEN => key_bits = int_of(value)?,
                ATTR_NAME_CRYPTO_USAGE_MASK => usage_mask = int_of(value)?,
                _ => {}
            }
        }
        if key_name.is_empty() {
            return Err(malformed("create request carries no Name attribute"));
        }
        Ok(Self { header, key_name, algorithm, key_bits, usage_mask })
    }
}

/// Response to a create request carrying the id assigned to the new key.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateResponse {
    pub header: ResponseHeader,
    pub result: BatchResult,
    pub unique_id: String,
}

impl CreateResponse {
    pub fn to_item(&self) -> Item {
        let payload = Item::Structure {
            tag: TAG_RESPONSE_PAYLOAD,
            items: vec![
                Item::Enumeration { tag: TAG_OBJECT_TYPE, value: OBJECT_TYPE_SYMMETRIC_KEY },
                Item::Text { tag: TAG_UNIQUE_ID, value: self.unique_id.clone() },
            ],
        };
        Item::Structure {
            tag: TAG_RESPONSE_MESSAGE,
            items: vec![
                self.header.to_item(),
                response_batch_item(OP_CREATE, &self.result, Some(payload)),
            ],
        }
    }

    pub fn from_item(item: &Item) -> Result<Self, KmipError> {
        let header =
            ResponseHeader::from_item(find_item(item, TAG_RESPONSE_MESSAGE, TAG_RESPONSE_HEADER)?)?;
        let batch_item = checked_batch_item(item, TAG_RESPONSE_MESSAGE, OP_CREATE)?;
        let result = BatchResult::from_batch_item(batch_item)?;
        let mut unique_id = String::new();
        if result.is_success() {
            let payload = find_item(batch_item, TAG_BATCH_ITEM, TAG_RESPONSE_PAYLOAD)?;
            unique_id = text_of(find_item(payload, TAG_RESPONSE_PAYLOAD, TAG_UNIQUE_ID)?)?.to_string();
        }
        Ok(Self { header, result, unique_id })
    }
}

// ============================================================================
// Get
// ============================================================================

/// Ask the key service for the key bytes stored under an id.
#[derive(Debug, Clone, PartialEq)]
pub struct GetRequest {
    pub header: RequestHeader,
    pub unique_id: String,
}

impl GetRequest {
    pub fn to_item(&self) -> Item {
        Item::Structure {
            tag: TAG_REQUEST_MESSAGE,
            items: vec![
                self.header.to_item(),
                Item::Structure {
                    tag: TAG_BATCH_ITEM,
                    items: vec![
                        Item::Enumeration { tag: TAG_OPERATION, value: OP_GET },
                        Item::Structure {
                            tag: TAG_REQUEST_PAYLOAD,
                            items: vec![Item::Text {
                                tag: TAG_UNIQUE_ID,
                                value: self.unique_id.clone(),
                            }],
                        },
                    ],
                },
            ],
        }
    }

    pub fn from_item(item: &Item) -> Result<Self, KmipError> {
        let header =
            RequestHeader::from_item(find_item(item, TAG_REQUEST_MESSAGE, TAG_REQUEST_HEADER)?)?;
        let batch_item = checked_batch_item(item, TAG_REQUEST_MESSAGE, OP_GET)?;
        let payload = find_item(batch_item, TAG_BATCH_ITEM, TAG_REQUEST_PAYLOAD)?;
        let unique_id = text_of(find_item(payload, TAG_REQUEST_PAYLOAD, TAG_UNIQUE_ID)?)?.to_string();
        Ok(Self { header, unique_id })
    }
}

/// Response to a get request. A successful one carries the raw AES key bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct GetResponse {
    pub header: ResponseHeader,
    pub result: BatchResult,
    pub unique_id: String,
    pub key: Vec<u8>,
}

impl GetResponse {
    pub fn to_item(&self) -> Item {
        let payload = Item::Structure {
            tag: TAG_RESPONSE_PAYLOAD,
            items: vec![
                Item::Enumeration { tag: TAG_OBJECT_TYPE, value: OBJECT_TYPE_SYMMETRIC_KEY },
                Item::Text { tag: TAG_UNIQUE_ID, value: self.unique_id.clone() },
                Item::Structure {
                    tag: TAG_SYMMETRIC_KEY,
                    items: vec![Item::Structure {
                        tag: TAG_KEY_BLOCK,
                        items: vec![
                            Item::Enumeration { tag: TAG_FORMAT_TYPE, value: KEY_FORMAT_RAW },
                            Item::Structure {
                                tag: TAG_KEY_VALUE,
                                items: vec![Item::Bytes {
                                    tag: TAG_KEY_MATERIAL,
                                    value: self.key.clone(),
                                }],
                            },
                            Item::Enumeration { tag: TAG_CRYPTO_ALGORITHM, value: CRYPTO_ALGO_AES },
                            Item::Integer {
                                tag: TAG_CRYPTO_LEN,
                                value: (self.key.len() * 8) as i32,
                            },
                        ],
                    }],
                },
            ],
        };
        Item::Structure {
            tag: TAG_RESPONSE_MESSAGE,
            items: vec![
                self.header.to_item(),
                response_batch_item(OP_GET, &self.result, Some(payload)),
            ],
        }
    }

    pub fn from_item(item: &Item) -> Result<Self, KmipError> {
        let header =
            ResponseHeader::from_item(find_item(item, TAG_RESPONSE_MESSAGE, TAG_RESPONSE_HEADER)?)?;
        let batch_item = checked_batch_item(item, TAG_RESPONSE_MESSAGE, OP_GET)?;
        let result = BatchResult::from_batch_item(batch_item)?;
        let mut unique_id = String::new();
        let mut key = Vec::new();
        if result.is_success() {
            let payload = find_item(batch_item, TAG_BATCH_ITEM, TAG_RESPONSE_PAYLOAD)?;
            unique_id = text_of(find_item(payload, TAG_RESPONSE_PAYLOAD, TAG_UNIQUE_ID)?)?.to_string();
            let sym = find_item(payload, TAG_RESPONSE_PAYLOAD, TAG_SYMMETRIC_KEY)?;
            let block = find_item(sym, TAG_SYMMETRIC_KEY, TAG_KEY_BLOCK)?;
            let value = find_item(block, TAG_KEY_BLOCK, TAG_KEY_VALUE)?;
            key = bytes_of(find_item(value, TAG_KEY_VALUE, TAG_KEY_MATERIAL)?)?.to_vec();
        }
        Ok(Self { header, result, unique_id, key })
    }
}

// ============================================================================
// Destroy
// ============================================================================

/// Ask the key service to destroy the key stored under an id.
#[derive(Debug, Clone, PartialEq)]
pub struct DestroyRequest {
    pub header: RequestHeader,
    pub unique_id: String,
}

impl DestroyRequest {
    pub fn to_item(&self) -> Item {
        Item::Structure {
            tag: TAG_REQUEST_MESSAGE,
            items: vec![
                self.header.to_item(),
                Item::Structure {
                    tag: TAG_BATCH_ITEM,
                    items: vec![
                        Item::Enumeration { tag: TAG_OPERATION, value: OP_DESTROY },
                        Item::Structure {
                            tag: TAG_REQUEST_PAYLOAD,
                            items: vec![Item::Text {
                                tag: TAG_UNIQUE_ID,
                                value: self.unique_id.clone(),
                            }],
                        },
                    ],
                },
            ],
        }
    }

    pub fn from_item(item: &Item) -> Result<Self, KmipError> {
        let header =
            RequestHeader::from_item(find_item(item, TAG_REQUEST_MESSAGE, TAG_REQUEST_HEADER)?)?;
        let batch_item = checked_batch_item(item, TAG_REQUEST_MESSAGE, OP_DESTROY)?;
        let payload = find_item(batch_item, TAG_BATCH_ITEM, TAG_REQUEST_PAYLOAD)?;
        let unique_id = text_of(find_item(payload, TAG_REQUEST_PAYLOAD, TAG_UNIQUE_ID)?)?.to_string();
        Ok(Self { header, unique_id })
    }
}

/// Response to a destroy request, echoing the id of the destroyed key.
#[derive(Debug, Clone, PartialEq)]
pub struct DestroyResponse {
    pub header: ResponseHeader,
    pub result: BatchResult,
    pub unique_id: String,
}

impl DestroyResponse {
    pub fn to_item(&self) -> Item {
        let payload = Item::Structure {
            tag: TAG_RESPONSE_PAYLOAD,
            items: vec![Item::Text { tag: TAG_UNIQUE_ID, value: self.unique_id.clone() }],
        };
        Item::Structure {
            tag: TAG_RESPONSE_MESSAGE,
            items: vec![
                self.header.to_item(),
                response_batch_item(OP_DESTROY, &self.result, Some(payload)),
            ],
        }
    }

    pub fn from_item(item: &Item) -> Result<Self, KmipError> {
        let header =
            ResponseHeader::from_item(find_item(item, TAG_RESPONSE_MESSAGE, TAG_RESPONSE_HEADER)?)?;
        let batch_item = checked_batch_item(item, TAG_RESPONSE_MESSAGE, OP_DESTROY)?;
        let result = BatchResult::from_batch_item(batch_item)?;
        let mut unique_id = String::new();
        if result.is_success() {
            let payload = find_item(batch_item, TAG_BATCH_ITEM, TAG_RESPONSE_PAYLOAD)?;
            unique_id = text_of(find_item(payload, TAG_RESPONSE_PAYLOAD, TAG_UNIQUE_ID)?)?.to_string();
        }
        Ok(Self { header, result, unique_id })
    }
}

// ============================================================================
// Framed reading
// ============================================================================

/// Read one entire TTLV structure from the stream: the 8-byte header first,
/// then exactly as many value bytes as the header declares, subject to the
/// structure size limit.
pub fn read_full_ttlv(reader: &mut impl Read) -> Result<Item, KmipError> {
    let mut header = [0u8; ttlv::LEN_HEADER];
    reader
        .read_exact(&mut header)
        .map_err(|err| malformed(format!("failed to read TTLV header - {}", err)))?;
    let declared = i32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if declared < 1 || declared as usize > ttlv::MAX_STRUCT_LEN {
        return Err(malformed(format!("refusing structure of declared length {}", declared)));
    }
    let mut value = vec![0u8; declared as usize];
    reader
        .read_exact(&mut value)
        .map_err(|err| malformed(format!("failed to read TTLV value - {}", err)))?;
    let mut full = Vec::with_capacity(ttlv::LEN_HEADER + value.len());
    full.extend_from_slice(&header);
    full.extend_from_slice(&value);
    Ok(ttlv::decode(&full)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ttlv::encode;

    fn header() -> RequestHeader {
        RequestHeader::new("user", "pass")
    }

    #[test]
    fn test_create_request_round_trip() {
        let request = CreateRequest::new_aes256(header(), "cryptctl-abc");
        let encoded = encode(&request.to_item());
        // The message leads with the request-message tag and structure type.
        assert_eq!(&encoded[..4], &[0x42, 0x00, 0x78, 0x01]);
        let decoded_item = ttlv::decode(&encoded).unwrap();
        let decoded = CreateRequest::from_item(&decoded_item).unwrap();
        assert_eq!(decoded, request);
        // Byte-exact round trip through the typed structure.
        assert_eq!(encode(&decoded.to_item()), encoded);
    }

    #[test]
    fn test_create_request_attributes_on_wire() {
        let request = CreateRequest::new_aes256(header(), "cryptctl-abc");
        let item = request.to_item();
        let batch = item.find(TAG_BATCH_ITEM).unwrap();
        let payload = batch.find(TAG_REQUEST_PAYLOAD).unwrap();
        let template = payload.find(TAG_TEMPLATE_ATTRIBUTE).unwrap();
        let attrs = template.find_all(TAG_ATTRIBUTE);
        assert_eq!(attrs.len(), 4);
        // Usage mask covers encrypt and decrypt.
        let mask_attr = attrs
            .iter()
            .find(|attr| {
                matches!(attr.find(TAG_ATTRIBUTE_NAME),
                    Some(Item::Text { value, .. }) if value == ATTR_NAME_CRYPTO_USAGE_MASK)
            })
            .unwrap();
        assert_eq!(
            mask_attr.find(TAG_ATTRIBUTE_VALUE),
            Some(&Item::Integer { tag: TAG_ATTRIBUTE_VALUE, value: 12 })
        );
    }

    #[test]
    fn test_get_round_trip() {
        let request = GetRequest { header: header(), unique_id: "7".to_string() };
        let encoded = encode(&request.to_item());
        let decoded = GetRequest::from_item(&ttlv::decode(&encoded).unwrap()).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(encode(&decoded.to_item()), encoded);

        let response = GetResponse {
            header: ResponseHeader::new(1490000000),
            result: BatchResult::success(),
            unique_id: "7".to_string(),
            key: vec![0xa5; 32],
        };
        let encoded = encode(&response.to_item());
        let decoded = GetResponse::from_item(&ttlv::decode(&encoded).unwrap()).unwrap();
        assert_eq!(decoded, response);
        assert_eq!(encode(&decoded.to_item()), encoded);
    }

    #[test]
    fn test_get_response_failure_round_trip() {
        let response = GetResponse {
            header: ResponseHeader::new(1490000000),
            result: BatchResult::not_found(),
            unique_id: String::new(),
            key: Vec::new(),
        };
        let encoded = encode(&response.to_item());
        let decoded = GetResponse::from_item(&ttlv::decode(&encoded).unwrap()).unwrap();
        assert!(decoded.result.is_not_found());
        assert!(decoded.key.is_empty());
        assert_eq!(encode(&decoded.to_item()), encoded);
    }

    #[test]
    fn test_destroy_round_trip() {
        let request = DestroyRequest { header: header(), unique_id: "3".to_string() };
        let encoded = encode(&request.to_item());
        let decoded = DestroyRequest::from_item(&ttlv::decode(&encoded).unwrap()).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(encode(&decoded.to_item()), encoded);
    }

    #[test]
    fn test_request_shapes_do_not_cross_decode() {
        let create = CreateRequest::new_aes256(header(), "cryptctl-x");
        let create_item = create.to_item();
        assert!(GetRequest::from_item(&create_item).is_err());
        assert!(DestroyRequest::from_item(&create_item).is_err());

        let get = GetRequest { header: header(), unique_id: "1".to_string() };
        let get_item = get.to_item();
        assert!(CreateRequest::from_item(&get_item).is_err());
        // Get and destroy share a payload shape; the operation value keeps
        // them apart.
        assert!(DestroyRequest::from_item(&get_item).is_err());
    }

    // A hand-assembled credential structure: enumeration type 1 plus the
    // username "user" and password "pass", as captured on the wire.
    const CREDENTIAL_FIXTURE: &str = "4200230100000038\
                                      4200240500000004\
                                      0000000100000000\
                                      4200250100000020\
                                      4200990700000004\
                                      7573657200000000\
                                      4200a10700000004\
                                      7061737300000000";

    #[test]
    fn test_credential_wire_fixture() {
        let wire = hex::decode(CREDENTIAL_FIXTURE).unwrap();
        let item = ttlv::decode(&wire).unwrap();
        // The decoded tree re-encodes to the identical bytes.
        assert_eq!(encode(&item), wire);
        // The pieces land where the catalogue expects them.
        assert_eq!(item.tag(), TAG_CREDENTIAL);
        let value = item.find(TAG_CREDENTIAL_VALUE).unwrap();
        assert_eq!(
            value.find(TAG_USERNAME),
            Some(&Item::Text { tag: TAG_USERNAME, value: "user".to_string() })
        );
        assert_eq!(
            value.find(TAG_PASSWORD),
            Some(&Item::Text { tag: TAG_PASSWORD, value: "pass".to_string() })
        );
        assert_eq!(
            item.find(TAG_CREDENTIAL_TYPE),
            Some(&Item::Enumeration {
                tag: TAG_CREDENTIAL_TYPE,
                value: CREDENTIAL_TYPE_USERNAME_PASSWORD
            })
        );
    }

    #[test]
    fn test_request_header_matches_credential_layout() {
        // The header builder produces the same credential encoding as the
        // captured fixture.
        let header_item = header().to_item();
        let auth = header_item.find(TAG_AUTHENTICATION).unwrap();
        let credential = auth.find(TAG_CREDENTIAL).unwrap();
        assert_eq!(encode(credential), hex::decode(CREDENTIAL_FIXTURE).unwrap());
    }

    #[test]
    fn test_read_full_ttlv_enforces_size_limit() {
        let mut oversized = vec![0x42, 0x00, 0x78, 0x01];
        oversized.extend_from_slice(&(ttlv::MAX_STRUCT_LEN as i32 + 1).to_be_bytes());
        oversized.resize(oversized.len() + 16, 0);
        let mut reader = oversized.as_slice();
        assert!(read_full_ttlv(&mut reader).is_err());
    }

    #[test]
    fn test_read_full_ttlv_round_trip() {
        let request = GetRequest { header: header(), unique_id: "42".to_string() };
        let encoded = encode(&request.to_item());
        let mut reader = encoded.as_slice();
        let item = read_full_ttlv(&mut reader).unwrap();
        assert_eq!(GetRequest::from_item(&item).unwrap(), request);
    }
}
