//! Postgres startup-phase protocol codec.
//!
//! Only the messages the proxy has to understand are modeled here: the
//! startup packet family (StartupMessage, SSLRequest, CancelRequest), the
//! framing of backend replies so BackendKeyData can be picked out of the
//! stream, and the ErrorResponse the proxy sends on its own behalf.
//! Everything else passes through as opaque bytes.

use std::fmt;

use bytes::BufMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use zerocopy::{big_endian, FromBytes, Immutable, IntoBytes};

pub type ErrorCode = [u8; 5];

/// SQLSTATE class 08 (connection exception). Every error the proxy reports
/// on its own behalf uses this code.
pub const SQLSTATE_CONNECTION_EXCEPTION: ErrorCode = *b"08000";

/// Hard cap on the startup packet, matching the backend's own limit.
pub const MAX_STARTUP_PACKET_LENGTH: i32 = 8096;

/// Reply byte for a declined SSLRequest.
pub const SSL_DECLINED: u8 = b'N';

/// Tag of the BackendKeyData message.
pub const BACKEND_KEY_DATA: u8 = b'K';

#[derive(Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable)]
#[repr(C)]
pub struct ProtocolVersion(big_endian::U32);

impl ProtocolVersion {
    /// Protocol 3.0, the only version spoken end to end.
    pub const V3: Self = Self::new(196608);
    /// Magic code of the pre-startup SSLRequest packet.
    pub const SSL_REQUEST: Self = Self::new(80877103);
    /// Magic code of the out-of-band CancelRequest packet.
    pub const CANCEL_REQUEST: Self = Self::new(80877102);

    const fn new(code: u32) -> Self {
        Self(big_endian::U32::new(code))
    }

    pub const fn code(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Debug for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("socket read error: {0}")]
    Io(#[from] std::io::Error),

    #[error("startup packet length {0} out of bounds")]
    StartupLength(i32),

    #[error("CancelRequest length {0}, expected exactly 16")]
    CancelLength(i32),

    #[error("startup parameters: missing null terminator")]
    MissingNullTerminator,

    #[error("startup parameters: invalid utf-8")]
    InvalidUtf8,

    #[error("unsupported protocol version {0}")]
    UnsupportedProtocol(u32),

    #[error("backend message length {0} out of bounds")]
    MessageLength(i32),

    #[error("BackendKeyData body has the wrong size")]
    MalformedBackendKey,
}

impl ProtocolError {
    /// Text surfaced to the client in the ErrorResponse before closing.
    pub fn client_message(&self) -> &'static str {
        match self {
            ProtocolError::Io(_) => "Socket read error",
            ProtocolError::StartupLength(_) => "Startup packet size invalid",
            ProtocolError::CancelLength(_)
            | ProtocolError::MissingNullTerminator
            | ProtocolError::InvalidUtf8 => "Malformed startup packet",
            ProtocolError::UnsupportedProtocol(_) => "Unsupported protocol version",
            ProtocolError::MessageLength(_) | ProtocolError::MalformedBackendKey => {
                "Backend network error"
            }
        }
    }
}

/// Key identifying a backend session for query cancellation, as carried by
/// BackendKeyData and CancelRequest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable)]
#[repr(C)]
pub struct BackendKey {
    process_id: big_endian::I32,
    secret_key: big_endian::I32,
}

impl BackendKey {
    pub fn new(process_id: i32, secret_key: i32) -> Self {
        Self {
            process_id: big_endian::I32::new(process_id),
            secret_key: big_endian::I32::new(secret_key),
        }
    }

    pub fn process_id(&self) -> i32 {
        self.process_id.get()
    }

    pub fn secret_key(&self) -> i32 {
        self.secret_key.get()
    }
}

impl fmt::Debug for BackendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendKey")
            .field("process_id", &self.process_id())
            .field("secret_key", &self.secret_key())
            .finish()
    }
}

impl fmt::Display for BackendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:x}", self.process_id(), self.secret_key())
    }
}

/// Startup parameters as sent by the client: a key/value map that remembers
/// first-insertion order so the replayed packet lists parameters the way the
/// client did. Duplicate keys collapse to the last value seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupParameters {
    pairs: Vec<(String, String)>,
}

impl StartupParameters {
    /// Parse the startup packet body following the protocol version: a
    /// sequence of NUL-terminated key/value strings closed by an empty key.
    pub fn parse(mut body: &[u8]) -> Result<Self, ProtocolError> {
        let mut params = StartupParameters::default();
        loop {
            let Some(nul) = body.iter().position(|&b| b == 0) else {
                return Err(ProtocolError::MissingNullTerminator);
            };
            if nul == 0 {
                break;
            }
            let key = std::str::from_utf8(&body[..nul]).map_err(|_| ProtocolError::InvalidUtf8)?;
            body = &body[nul + 1..];

            let Some(nul) = body.iter().position(|&b| b == 0) else {
                return Err(ProtocolError::MissingNullTerminator);
            };
            let value =
                std::str::from_utf8(&body[..nul]).map_err(|_| ProtocolError::InvalidUtf8)?;
            body = &body[nul + 1..];

            params.insert(key, value);
        }
        Ok(params)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Set a parameter, replacing the value in place if the key exists.
    pub fn insert(&mut self, name: &str, value: &str) {
        match self.pairs.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value.to_owned(),
            None => self.pairs.push((name.to_owned(), value.to_owned())),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Serialize a complete v3.0 startup packet: length (including itself),
    /// protocol version, key/value pairs, final NUL.
    pub fn to_startup_packet(&self) -> Vec<u8> {
        let body_len: usize = self
            .pairs
            .iter()
            .map(|(k, v)| k.len() + v.len() + 2)
            .sum::<usize>()
            + 5;

        let mut packet = Vec::with_capacity(body_len + 4);
        packet.put_i32(body_len as i32 + 4);
        packet.put_u32(ProtocolVersion::V3.code());
        for (key, value) in &self.pairs {
            packet.put_slice(key.as_bytes());
            packet.put_u8(0);
            packet.put_slice(value.as_bytes());
            packet.put_u8(0);
        }
        packet.put_u8(0);
        packet
    }
}

#[derive(Debug)]
pub enum FeStartupPacket {
    SslRequest,
    CancelRequest(BackendKey),
    StartupMessage(StartupParameters),
}

/// Read the type from the stream using zerocopy.
/// Not cancel safe.
macro_rules! read {
    ($s:expr => $t:ty) => {{
        let mut buf = [0; size_of::<$t>()];
        $s.read_exact(&mut buf).await?;
        let res: $t = zerocopy::transmute!(buf);
        res
    }};
}

/// Read one startup-phase packet off the wire.
///
/// Length and version checks happen before any body is consumed, so a
/// hostile length can never trigger a large allocation.
pub async fn read_startup<S>(stream: &mut S) -> Result<FeStartupPacket, ProtocolError>
where
    S: AsyncRead + Unpin,
{
    #[derive(Clone, Copy, FromBytes)]
    #[repr(C)]
    struct StartupHeader {
        len: big_endian::I32,
        version: ProtocolVersion,
    }

    let StartupHeader { len, version } = read!(stream => StartupHeader);
    let len = len.get();
    if !(8..=MAX_STARTUP_PACKET_LENGTH).contains(&len) {
        return Err(ProtocolError::StartupLength(len));
    }

    match version {
        ProtocolVersion::SSL_REQUEST => {
            if len != 8 {
                return Err(ProtocolError::StartupLength(len));
            }
            Ok(FeStartupPacket::SslRequest)
        }
        ProtocolVersion::CANCEL_REQUEST => {
            if len != 16 {
                return Err(ProtocolError::CancelLength(len));
            }
            Ok(FeStartupPacket::CancelRequest(read!(stream => BackendKey)))
        }
        ProtocolVersion::V3 => {
            let mut body = vec![0; len as usize - 8];
            stream.read_exact(&mut body).await?;
            Ok(FeStartupPacket::StartupMessage(StartupParameters::parse(
                &body,
            )?))
        }
        other => Err(ProtocolError::UnsupportedProtocol(other.code())),
    }
}

/// Read one framed backend message: tag byte, then a length that counts
/// itself but not the tag. Returns the tag and the body.
pub async fn read_message<'a, S>(
    stream: &mut S,
    buf: &'a mut Vec<u8>,
    max: i32,
) -> Result<(u8, &'a mut [u8]), ProtocolError>
where
    S: AsyncRead + Unpin,
{
    #[derive(Clone, Copy, FromBytes)]
    #[repr(C)]
    struct Header {
        tag: u8,
        len: big_endian::I32,
    }

    let Header { tag, len } = read!(stream => Header);
    let len = len.get();
    if !(4..=max).contains(&len) {
        return Err(ProtocolError::MessageLength(len));
    }

    buf.resize(len as usize - 4, 0);
    stream.read_exact(buf).await?;
    Ok((tag, buf))
}

/// Frame a tagged message the backend way: tag byte, then a big-endian
/// length backfilled once the body closure has run.
pub fn write_framed(buf: &mut Vec<u8>, tag: u8, body: impl FnOnce(&mut Vec<u8>)) {
    buf.push(tag);
    let start = buf.len();
    buf.extend_from_slice(&[0, 0, 0, 0]);
    body(buf);
    let len = (buf.len() - start) as u32;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

/// Build an ErrorResponse with severity ERROR and the given SQLSTATE.
pub fn error_response(msg: &str, code: ErrorCode) -> Vec<u8> {
    let mut buf = Vec::with_capacity(18 + msg.len());
    write_framed(&mut buf, b'E', |buf| {
        // severity
        buf.put_slice(b"SERROR\0");

        buf.put_u8(b'C'); // SQLSTATE error code
        buf.put_slice(&code);
        buf.put_u8(0);

        buf.put_u8(b'M'); // the message
        buf.put_slice(msg.as_bytes());
        buf.put_u8(0);

        buf.put_u8(0); // terminator
    });
    buf
}

/// Reconstruct the 16-byte CancelRequest packet for replay to a backend.
pub fn cancel_request_packet(key: BackendKey) -> [u8; 16] {
    #[derive(IntoBytes, Immutable)]
    #[repr(C)]
    struct CancelRequestPacket {
        len: big_endian::I32,
        code: ProtocolVersion,
        key: BackendKey,
    }

    zerocopy::transmute!(CancelRequestPacket {
        len: big_endian::I32::new(16),
        code: ProtocolVersion::CANCEL_REQUEST,
        key,
    })
}
