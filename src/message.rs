//! Message envelope.
//!
//! Every frame header is a compact text envelope:
//! ```text
//! @id=<decimal int>@command=<token>[@<key>=<value>]*[@request=true]
//! ```
//! `@` and `=` are metacharacters and may not appear in the command or in any
//! option key or value. Option order on the wire is irrelevant; options are
//! held sorted so emitted headers are deterministic.
//!
//! # Example
//!
//! ```
//! use kernelwire::Message;
//!
//! let msg = Message::new(7, "getTable")?
//!     .with_option("chunk", "3")?
//!     .into_request();
//!
//! assert_eq!(msg.header(), "@id=7@command=getTable@chunk=3@request=true");
//!
//! let parsed = Message::parse(&msg.header(), None)?;
//! assert_eq!(parsed, msg);
//! # Ok::<(), kernelwire::ChannelError>(())
//! ```

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

use crate::error::{ChannelError, Result};
use crate::protocol::Frame;

/// Message id. Unique only per sender.
pub type MessageId = i32;

/// Command of the universal acknowledgement message.
pub const SUCCESS_COMMAND: &str = "success";

const FIELD_SEPARATOR: char = '@';
const KEY_VALUE_SEPARATOR: char = '=';

const ID_KEY: &str = "id";
const COMMAND_KEY: &str = "command";
const REQUEST_KEY: &str = "request";

/// A parsed or locally built message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: MessageId,
    command: String,
    is_request: bool,
    options: BTreeMap<String, String>,
    payload: Option<Bytes>,
}

impl Message {
    /// Create a plain (non-request) message without payload.
    ///
    /// # Errors
    ///
    /// Fails if the command is empty or contains `@` or `=`.
    pub fn new(id: MessageId, command: impl Into<String>) -> Result<Self> {
        let command = command.into();
        if command.is_empty() {
            return Err(ChannelError::InvalidMessage(
                "Command must not be empty".to_string(),
            ));
        }
        check_token("command", &command)?;

        Ok(Self {
            id,
            command,
            is_request: false,
            options: BTreeMap::new(),
            payload: None,
        })
    }

    /// Create a `success` acknowledgement for the given id.
    pub fn success(id: MessageId) -> Self {
        Self {
            id,
            command: SUCCESS_COMMAND.to_string(),
            is_request: false,
            options: BTreeMap::new(),
            payload: None,
        }
    }

    /// Attach a payload. An empty payload is stored as absent.
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into()).filter(|p| !p.is_empty());
        self
    }

    /// Attach an optional payload.
    pub fn with_optional_payload(mut self, payload: Option<Bytes>) -> Self {
        self.payload = payload.filter(|p| !p.is_empty());
        self
    }

    /// Mark the message as a request that obligates exactly one response.
    pub fn into_request(mut self) -> Self {
        self.is_request = true;
        self
    }

    /// Add a free-form option.
    ///
    /// # Errors
    ///
    /// Fails on an empty or reserved key (`id`, `command`, `request`) or if
    /// the key or value contains `@` or `=`.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let key = key.into();
        let value = value.into();

        if key.is_empty() {
            return Err(ChannelError::InvalidMessage(
                "Option key must not be empty".to_string(),
            ));
        }
        if is_reserved(&key) {
            return Err(ChannelError::InvalidMessage(format!(
                "Option key '{}' is reserved",
                key
            )));
        }
        check_token("option key", &key)?;
        check_token("option value", &value)?;

        self.options.insert(key, value);
        Ok(self)
    }

    /// Message id.
    #[inline]
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Command string.
    #[inline]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Check if this message obligates a response.
    #[inline]
    pub fn is_request(&self) -> bool {
        self.is_request
    }

    /// Check if this is a `success` acknowledgement.
    #[inline]
    pub fn is_success(&self) -> bool {
        self.command == SUCCESS_COMMAND
    }

    /// Free-form options (excluding id, command and request flag).
    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    /// Look up a single option.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Payload bytes, if any.
    #[inline]
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    /// Payload bytes, or an empty buffer when absent.
    pub fn payload_or_empty(&self) -> Bytes {
        self.payload.clone().unwrap_or_default()
    }

    /// Serialize the envelope to header text.
    pub fn header(&self) -> String {
        let mut header = format!("@{}={}@{}={}", ID_KEY, self.id, COMMAND_KEY, self.command);
        for (key, value) in &self.options {
            header.push(FIELD_SEPARATOR);
            header.push_str(key);
            header.push(KEY_VALUE_SEPARATOR);
            header.push_str(value);
        }
        if self.is_request {
            header.push_str("@request=true");
        }
        header
    }

    /// Parse header text and attach the payload.
    ///
    /// Empty fields are skipped. `request` counts as set when its value is
    /// `true` (any case) or `1`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::InvalidMessage`] for a field without `=`, an
    /// empty or duplicate key, a forbidden metacharacter, a non-integer id,
    /// or a missing id or command. The stream should be treated as
    /// desynchronized.
    pub fn parse(header: &str, payload: Option<Bytes>) -> Result<Self> {
        let mut id = None;
        let mut command = None;
        let mut is_request = false;
        let mut options = BTreeMap::new();
        let mut seen_request = false;

        for field in header.split(FIELD_SEPARATOR).filter(|f| !f.is_empty()) {
            let (key, value) = field.split_once(KEY_VALUE_SEPARATOR).ok_or_else(|| {
                ChannelError::InvalidMessage(format!("Field '{}' has no '=' in header: {}", field, header))
            })?;

            if key.is_empty() {
                return Err(ChannelError::InvalidMessage(format!(
                    "Empty key in header: {}",
                    header
                )));
            }
            check_token("value", value)?;

            let duplicate = match key {
                ID_KEY => {
                    let parsed = value.parse::<MessageId>().map_err(|_| {
                        ChannelError::InvalidMessage(format!("Invalid id '{}' in header: {}", value, header))
                    })?;
                    id.replace(parsed).is_some()
                }
                COMMAND_KEY => command.replace(value.to_string()).is_some(),
                REQUEST_KEY => {
                    is_request = value.eq_ignore_ascii_case("true") || value == "1";
                    std::mem::replace(&mut seen_request, true)
                }
                _ => options.insert(key.to_string(), value.to_string()).is_some(),
            };

            if duplicate {
                return Err(ChannelError::InvalidMessage(format!(
                    "Duplicate key '{}' in header: {}",
                    key, header
                )));
            }
        }

        let id = id.ok_or_else(|| {
            ChannelError::InvalidMessage(format!("No id specified for message: {}", header))
        })?;
        let command = command.filter(|c| !c.is_empty()).ok_or_else(|| {
            ChannelError::InvalidMessage(format!("No command specified for message: {}", header))
        })?;

        Ok(Self {
            id,
            command,
            is_request,
            options,
            payload: payload.filter(|p| !p.is_empty()),
        })
    }

    /// Parse a frame read off the wire.
    pub fn from_frame(frame: Frame) -> Result<Self> {
        let header = frame.header_str()?;
        Self::parse(header, frame.payload.clone())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} payload bytes)", self.header(), self.payload.as_ref().map_or(0, Bytes::len))
    }
}

fn is_reserved(key: &str) -> bool {
    matches!(key, ID_KEY | COMMAND_KEY | REQUEST_KEY)
}

fn check_token(what: &str, token: &str) -> Result<()> {
    if token.contains([FIELD_SEPARATOR, KEY_VALUE_SEPARATOR]) {
        return Err(ChannelError::InvalidMessage(format!(
            "Forbidden character (@ or =) in {}: '{}'",
            what, token
        )));
    }
    Ok(())
}
