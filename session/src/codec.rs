//! Session cookie codec.
//!
//! Turns a [`SessionState`] into the opaque bytes stored in the client
//! cookie and back. Confidentiality comes from the injected [`Cipher`].
//!
//! # Formats
//!
//! - [`CookieFormat::Compact`] (default): a colon-delimited plaintext
//!   carrying only identity, expiry and groups. Tokens are never written, so
//!   they do not survive a round trip.
//!
//!   ```text
//!   identity                                   (identity-only, no access token)
//!   identity::<expires unix seconds>::g1,g2    (full, always five fields)
//!   ```
//!
//! - [`CookieFormat::Rich`]: the whole session as a MessagePack map with
//!   short keys, optionally LZ4-frame compressed in 64 KiB blocks.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use gatekeeper_session::cipher::AesGcmCipher;
//! use gatekeeper_session::codec::{CookieFormat, SessionCodec};
//! use gatekeeper_session::session::SessionState;
//!
//! let cipher = Arc::new(AesGcmCipher::from_secret("0123456789abcdefghijklmnopqrstuv").unwrap());
//! let codec = SessionCodec::new(cipher, CookieFormat::Compact);
//!
//! let mut session = SessionState::default();
//! session.email = "user@example.com".to_string();
//!
//! let cookie = codec.encode(&session, false).unwrap();
//! let decoded = codec.decode(&cookie, false).unwrap();
//! assert_eq!(decoded.email, "user@example.com");
//! assert_eq!(decoded.user, "user");
//! ```

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use lz4_flex::frame::{BlockSize, FrameDecoder, FrameEncoder, FrameInfo};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cipher::{Cipher, CryptoError};
use crate::clock::Clock;
use crate::session::SessionState;

/// Number of fields in a full compact cookie.
const COMPACT_FIELDS: usize = 5;

/// Field delimiter of the compact plaintext.
const FIELD_SEPARATOR: char = ':';

/// Group delimiter inside the compact groups field.
const GROUP_SEPARATOR: &str = ",";

/// Errors raised while encoding or decoding a session cookie.
///
/// Every variant is terminal for the cookie: the caller should discard it
/// and send the user back through login.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The cookie plaintext is malformed.
    #[error("invalid session cookie: {0}")]
    Decode(String),

    /// The cookie could not be sealed or opened.
    #[error("session cookie crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The session could not be serialized.
    #[error("failed to encode session: {0}")]
    Encode(String),
}

/// Wire format for session cookies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CookieFormat {
    /// Identity, expiry and groups only.
    ///
    /// `:` delimits fields and `,` delimits groups, with no escaping. An
    /// identity containing `:`, or a group containing `:` or `,`, cannot be
    /// written and fails to encode; use [`CookieFormat::Rich`] for such
    /// sessions.
    #[default]
    Compact,
    /// Full MessagePack session.
    Rich,
}

impl FromStr for CookieFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "rich" => Ok(Self::Rich),
            other => Err(format!("expected 'compact' or 'rich', got '{other}'")),
        }
    }
}

impl fmt::Display for CookieFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compact => f.write_str("compact"),
            Self::Rich => f.write_str("rich"),
        }
    }
}

/// Encodes and decodes session cookies under one cipher and format.
#[derive(Clone)]
pub struct SessionCodec {
    cipher: Arc<dyn Cipher>,
    format: CookieFormat,
    clock: Clock,
}

impl SessionCodec {
    /// Creates a codec. A cipher is mandatory.
    pub fn new(cipher: Arc<dyn Cipher>, format: CookieFormat) -> Self {
        Self {
            cipher,
            format,
            clock: Clock::system(),
        }
    }

    /// Sets the clock attached to decoded sessions.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// The configured format.
    pub fn format(&self) -> CookieFormat {
        self.format
    }

    /// Encodes `session` into cookie bytes.
    ///
    /// `compress` only applies to [`CookieFormat::Rich`]; the compact format
    /// ignores it.
    ///
    /// # Errors
    ///
    /// [`CodecError::Encode`] if the rich payload cannot be built or a
    /// compact field contains a delimiter, [`CodecError::Crypto`] if the
    /// cipher fails.
    pub fn encode(&self, session: &SessionState, compress: bool) -> Result<Vec<u8>, CodecError> {
        let plaintext = match self.format {
            CookieFormat::Compact => compact_plaintext(session)?.into_bytes(),
            CookieFormat::Rich => rich_payload(session, compress)?,
        };

        let sealed = self.cipher.encrypt(&plaintext)?;
        debug!(
            format = %self.format,
            compress = compress && self.format == CookieFormat::Rich,
            bytes = sealed.len(),
            "Encoded session cookie"
        );
        Ok(sealed)
    }

    /// Decodes cookie bytes produced by [`SessionCodec::encode`].
    ///
    /// `compressed` must match the flag used at encode time for the rich
    /// format; the compact format ignores it.
    ///
    /// # Errors
    ///
    /// [`CodecError::Crypto`] when decryption fails and
    /// [`CodecError::Decode`] when the plaintext is malformed.
    pub fn decode(&self, data: &[u8], compressed: bool) -> Result<SessionState, CodecError> {
        let plaintext = self.cipher.decrypt(data)?;

        let session = match self.format {
            CookieFormat::Compact => parse_compact(&plaintext)?,
            CookieFormat::Rich => parse_rich(&plaintext, compressed)?,
        };

        Ok(session.with_clock(self.clock.clone()))
    }

    /// Encodes `session` as an unpadded base64url cookie value.
    pub fn encode_cookie_value(
        &self,
        session: &SessionState,
        compress: bool,
    ) -> Result<String, CodecError> {
        Ok(URL_SAFE_NO_PAD.encode(self.encode(session, compress)?))
    }

    /// Decodes an unpadded base64url cookie value.
    pub fn decode_cookie_value(
        &self,
        value: &str,
        compressed: bool,
    ) -> Result<SessionState, CodecError> {
        let data = URL_SAFE_NO_PAD
            .decode(value.trim())
            .map_err(|e| CodecError::Decode(format!("cookie value is not base64url: {e}")))?;
        self.decode(&data, compressed)
    }
}

impl fmt::Debug for SessionCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCodec")
            .field("format", &self.format)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

/// Builds the compact plaintext.
///
/// Without an access token only the identity is written. Otherwise the five
/// field layout is used with both token slots left blank. Values that would
/// read back as different fields are rejected.
fn compact_plaintext(session: &SessionState) -> Result<String, CodecError> {
    let identity = session.user_or_email();
    if identity.contains(FIELD_SEPARATOR) {
        return Err(CodecError::Encode(format!(
            "compact identity cannot contain '{FIELD_SEPARATOR}'"
        )));
    }
    if session.access_token.is_empty() {
        return Ok(identity.to_string());
    }

    if session
        .groups
        .iter()
        .any(|group| group.contains(FIELD_SEPARATOR) || group.contains(GROUP_SEPARATOR))
    {
        return Err(CodecError::Encode(format!(
            "compact group names cannot contain '{FIELD_SEPARATOR}' or '{GROUP_SEPARATOR}'"
        )));
    }

    let expires = session
        .expires_on
        .map(|at| at.timestamp().to_string())
        .unwrap_or_default();
    let groups = session.groups.join(GROUP_SEPARATOR);

    Ok(format!(
        "{identity}{FIELD_SEPARATOR}{FIELD_SEPARATOR}{expires}{FIELD_SEPARATOR}{FIELD_SEPARATOR}{groups}"
    ))
}

fn parse_compact(plaintext: &[u8]) -> Result<SessionState, CodecError> {
    let text = std::str::from_utf8(plaintext)
        .map_err(|_| CodecError::Decode("plaintext is not valid UTF-8".to_string()))?;

    let chunks: Vec<&str> = text.split(FIELD_SEPARATOR).collect();
    let mut session = SessionState::default();

    if chunks.len() == 1 {
        session.set_identity(chunks[0]);
        return Ok(session);
    }

    if chunks.len() != COMPACT_FIELDS {
        return Err(CodecError::Decode(format!(
            "invalid number of fields (got {} expected {COMPACT_FIELDS})",
            chunks.len()
        )));
    }

    session.set_identity(chunks[0]);
    session.access_token = chunks[1].to_string();
    session.expires_on = parse_expiry(chunks[2]);
    session.refresh_token = chunks[3].to_string();
    if !chunks[4].is_empty() {
        session.groups = chunks[4].split(GROUP_SEPARATOR).map(str::to_string).collect();
    }

    Ok(session)
}

/// Parses the expiry field.
///
/// An empty field means no expiry was set. Anything else that is not a
/// number of seconds falls back to the Unix epoch rather than failing.
fn parse_expiry(field: &str) -> Option<DateTime<Utc>> {
    if field.is_empty() {
        return None;
    }

    let epoch = DateTime::from_timestamp(0, 0);
    match field.parse::<i64>() {
        Ok(secs) => DateTime::from_timestamp(secs, 0).or(epoch),
        Err(_) => {
            warn!(field_len = field.len(), "Non-numeric cookie expiry, using epoch");
            epoch
        }
    }
}

fn rich_payload(session: &SessionState, compress: bool) -> Result<Vec<u8>, CodecError> {
    let packed = rmp_serde::to_vec_named(session)
        .map_err(|e| CodecError::Encode(format!("error marshalling session to msgpack: {e}")))?;

    if !compress {
        return Ok(packed);
    }

    let info = FrameInfo::new().block_size(BlockSize::Max64KB);
    let mut encoder = FrameEncoder::with_frame_info(info, Vec::new());
    encoder
        .write_all(&packed)
        .map_err(|e| CodecError::Encode(format!("error writing lz4 frame: {e}")))?;
    encoder
        .finish()
        .map_err(|e| CodecError::Encode(format!("error closing lz4 frame: {e}")))
}

fn parse_rich(plaintext: &[u8], compressed: bool) -> Result<SessionState, CodecError> {
    let packed = if compressed {
        let mut decoder = FrameDecoder::new(plaintext);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decode(format!("error reading lz4 frame: {e}")))?;
        out
    } else {
        plaintext.to_vec()
    };

    rmp_serde::from_slice(&packed)
        .map_err(|e| CodecError::Decode(format!("error unmarshalling session: {e}")))
}
