//! Jupyter wire format.
//!
//! A message on the wire is a multipart frame list:
//!
//! ```text
//! [identities..., "<IDS|MSG>", signature, header, parent_header, metadata, content, buffers...]
//! ```
//!
//! The signature is the lowercase hex HMAC-SHA256 of the four JSON frames, keyed by the connection key. An
//! empty key disables signing.

use bytes::Bytes;
use hmac::{Hmac, Mac};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha256;
use thiserror::Error;

pub const DELIMITER: &[u8] = b"<IDS|MSG>";
pub const PROTOCOL_VERSION: &str = "5.3";
const USERNAME: &str = "nbgolden";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, Diagnostic)]
pub enum WireError {
    #[error("message has no `<IDS|MSG>` delimiter")]
    #[diagnostic(code(nbgolden::wire::delimiter))]
    MissingDelimiter,

    #[error("message is truncated: expected 5 frames after the delimiter, got {0}")]
    #[diagnostic(code(nbgolden::wire::truncated))]
    Truncated(usize),

    #[error("cannot send a message with no frames")]
    #[diagnostic(code(nbgolden::wire::empty))]
    Empty,

    #[error("message signature does not match")]
    #[diagnostic(code(nbgolden::wire::signature))]
    BadSignature,

    #[error("invalid message {frame}: {source}")]
    #[diagnostic(code(nbgolden::wire::json))]
    Json {
        frame: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    pub session: String,
    pub username: String,
    pub date: String,
    pub msg_type: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub identities: Vec<Bytes>,
    pub header: Header,
    pub parent_header: Value,
    pub metadata: Value,
    pub content: Value,
    pub buffers: Vec<Bytes>,
}

impl Message {
    pub fn new(msg_type: &str, session: &str, content: Value) -> Self {
        Self {
            identities: Vec::new(),
            header: Header {
                msg_id: uuid::Uuid::new_v4().to_string(),
                session: session.to_string(),
                username: USERNAME.to_string(),
                date: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
                msg_type: msg_type.to_string(),
                version: PROTOCOL_VERSION.to_string(),
            },
            parent_header: Value::Object(Map::new()),
            metadata: Value::Object(Map::new()),
            content,
            buffers: Vec::new(),
        }
    }

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    /// `msg_id` of the request this message answers, if any.
    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.get("msg_id").and_then(Value::as_str)
    }

    pub fn is_reply_to(&self, msg_id: &str) -> bool {
        self.parent_msg_id() == Some(msg_id)
    }
}

/// HMAC signer for one connection key.
#[derive(Clone)]
pub struct Signer {
    mac: Option<HmacSha256>,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer").field("enabled", &self.mac.is_some()).finish()
    }
}

impl Signer {
    pub fn new(key: &str) -> Self {
        let mac = if key.is_empty() {
            None
        } else {
            HmacSha256::new_from_slice(key.as_bytes()).ok()
        };
        Self { mac }
    }

    fn digest(&self, parts: &[&[u8]]) -> Option<HmacSha256> {
        let mut mac = self.mac.clone()?;
        for part in parts {
            mac.update(part);
        }
        Some(mac)
    }

    pub fn sign(&self, parts: &[&[u8]]) -> String {
        match self.digest(parts) {
            Some(mac) => hex::encode(mac.finalize().into_bytes()),
            None => String::new(),
        }
    }

    pub fn verify(&self, signature: &[u8], parts: &[&[u8]]) -> bool {
        match self.digest(parts) {
            Some(mac) => hex::decode(signature).is_ok_and(|raw| mac.verify_slice(&raw).is_ok()),
            None => true,
        }
    }
}

/// Serialize and sign `msg` into wire frames.
pub fn encode(msg: &Message, signer: &Signer) -> Result<Vec<Bytes>, WireError> {
    let header = to_frame("header", &msg.header)?;
    let parent = to_frame("parent_header", &msg.parent_header)?;
    let metadata = to_frame("metadata", &msg.metadata)?;
    let content = to_frame("content", &msg.content)?;
    let signature = signer.sign(&[&header, &parent, &metadata, &content]);

    let mut frames = msg.identities.clone();
    frames.push(Bytes::from_static(DELIMITER));
    frames.push(Bytes::from(signature));
    frames.extend([header, parent, metadata, content].map(Bytes::from));
    frames.extend(msg.buffers.iter().cloned());
    Ok(frames)
}

/// Verify and parse wire frames.
pub fn decode(frames: Vec<Bytes>, signer: &Signer) -> Result<Message, WireError> {
    let split = frames
        .iter()
        .position(|frame| frame.as_ref() == DELIMITER)
        .ok_or(WireError::MissingDelimiter)?;
    let mut frames = frames;
    let mut rest = frames.split_off(split + 1);
    frames.pop();
    let identities = frames;

    if rest.len() < 5 {
        return Err(WireError::Truncated(rest.len()));
    }
    let buffers = rest.split_off(5);
    let [signature, header, parent, metadata, content]: [Bytes; 5] =
        rest.try_into().map_err(|v: Vec<Bytes>| WireError::Truncated(v.len()))?;

    if !signer.verify(&signature, &[&header, &parent, &metadata, &content]) {
        return Err(WireError::BadSignature);
    }

    Ok(Message {
        identities,
        header: from_frame("header", &header)?,
        parent_header: from_frame("parent_header", &parent)?,
        metadata: from_frame("metadata", &metadata)?,
        content: from_frame("content", &content)?,
        buffers,
    })
}

fn to_frame<T: Serialize>(frame: &'static str, value: &T) -> Result<Vec<u8>, WireError> {
    serde_json::to_vec(value).map_err(|source| WireError::Json { frame, source })
}

fn from_frame<T: for<'de> Deserialize<'de>>(frame: &'static str, bytes: &[u8]) -> Result<T, WireError> {
    serde_json::from_slice(bytes).map_err(|source| WireError::Json { frame, source })
}
