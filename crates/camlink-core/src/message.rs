//! Radio message format.
//!
//! Pairing traffic is plain tagged text, small enough for one link-layer
//! frame:
//!
//!   MAC:<canonical address>        announce / announce reply
//!   CONFIG:<ssid>,<password>       credential handoff (master → slave)
//!   OK_CONFIG                      handoff acknowledgment (slave → master)
//!
//! Anything else is carried as generic text and only logged by receivers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::NodeIdentity;

pub const ANNOUNCE_TAG: &str = "MAC:";
pub const CONFIG_TAG: &str = "CONFIG:";
pub const CONFIG_ACK: &str = "OK_CONFIG";

/// Separator between ssid and password in a CONFIG message.
pub const CREDENTIAL_DELIMITER: char = ',';

/// Maximum payload of one link-layer frame.
pub const MAX_RADIO_PAYLOAD: usize = 250;

// ── Credentials ───────────────────────────────────────────────────────────────

/// WiFi credentials handed from master to slave.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSet {
    pub ssid: String,
    pub password: String,
}

impl CredentialSet {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("ssid", &self.ssid)
            .field("password", &"[HIDDEN]")
            .finish()
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// Discriminant used by the dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Announce,
    Config,
    ConfigAck,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioMessage {
    /// Sender's identity, claimed in the payload.
    Announce(NodeIdentity),
    Config(CredentialSet),
    ConfigAck,
    Text(String),
}

impl RadioMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            RadioMessage::Announce(_) => MessageKind::Announce,
            RadioMessage::Config(_) => MessageKind::Config,
            RadioMessage::ConfigAck => MessageKind::ConfigAck,
            RadioMessage::Text(_) => MessageKind::Text,
        }
    }

    /// Encode to the text wire form. Fails if the result does not fit in
    /// one radio frame.
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let text = match self {
            RadioMessage::Announce(id) => format!("{ANNOUNCE_TAG}{id}"),
            RadioMessage::Config(creds) => {
                if creds.ssid.contains(CREDENTIAL_DELIMITER) {
                    return Err(MessageError::DelimiterInSsid);
                }
                format!(
                    "{CONFIG_TAG}{}{CREDENTIAL_DELIMITER}{}",
                    creds.ssid, creds.password
                )
            }
            RadioMessage::ConfigAck => CONFIG_ACK.to_string(),
            RadioMessage::Text(text) => text.clone(),
        };
        if text.is_empty() {
            return Err(MessageError::Empty);
        }
        if text.len() > MAX_RADIO_PAYLOAD {
            return Err(MessageError::TooLong(text.len()));
        }
        Ok(text.into_bytes())
    }

    /// Parse one received radio payload.
    pub fn parse(payload: &[u8]) -> Result<Self, MessageError> {
        if payload.is_empty() {
            return Err(MessageError::Empty);
        }
        if payload.len() > MAX_RADIO_PAYLOAD {
            return Err(MessageError::TooLong(payload.len()));
        }
        let text = std::str::from_utf8(payload).map_err(|_| MessageError::NotUtf8)?;
        // Senders written in C may include the terminating NUL.
        let text = text.trim_end_matches('\0');

        if let Some(addr) = text.strip_prefix(ANNOUNCE_TAG) {
            let id = addr
                .parse()
                .map_err(|_| MessageError::BadAnnounce(addr.to_string()))?;
            return Ok(RadioMessage::Announce(id));
        }

        if let Some(body) = text.strip_prefix(CONFIG_TAG) {
            let (ssid, password) = body
                .split_once(CREDENTIAL_DELIMITER)
                .ok_or(MessageError::MissingDelimiter)?;
            if ssid.is_empty() {
                return Err(MessageError::EmptySsid);
            }
            return Ok(RadioMessage::Config(CredentialSet::new(ssid, password)));
        }

        if text == CONFIG_ACK {
            return Ok(RadioMessage::ConfigAck);
        }

        Ok(RadioMessage::Text(text.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("empty radio payload")]
    Empty,
    #[error("radio payload of {0} bytes exceeds {}", MAX_RADIO_PAYLOAD)]
    TooLong(usize),
    #[error("radio payload is not valid UTF-8")]
    NotUtf8,
    #[error("announce carries a malformed address: {0:?}")]
    BadAnnounce(String),
    #[error("CONFIG payload has no '{}' delimiter", CREDENTIAL_DELIMITER)]
    MissingDelimiter,
    #[error("CONFIG payload has an empty ssid")]
    EmptySsid,
    #[error("ssid contains the credential delimiter")]
    DelimiterInSsid,
}
