//! Client-facing startup state machine.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::pqproto::{
    read_startup, BackendKey, FeStartupPacket, ProtocolError, ProtocolVersion, StartupParameters,
    SSL_DECLINED,
};

pub(crate) enum HandshakeData {
    /// A v3.0 session to route and tunnel.
    Startup(StartupParameters),
    /// An out-of-band cancellation to relay.
    Cancel(BackendKey),
}

/// Run the startup exchange up to the point where the connection's intent
/// is known.
///
/// TLS is never offered: an SSLRequest gets the single-byte `'N'` refusal,
/// after which the client is expected to repeat its startup packet in the
/// clear. A client may try that only once.
pub(crate) async fn handshake<S>(stream: &mut S) -> Result<HandshakeData, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut tried_ssl = false;

    loop {
        match read_startup(stream).await? {
            FeStartupPacket::SslRequest if !tried_ssl => {
                tried_ssl = true;
                stream.write_all(&[SSL_DECLINED]).await?;
                stream.flush().await?;
            }
            FeStartupPacket::SslRequest => {
                return Err(ProtocolError::UnsupportedProtocol(
                    ProtocolVersion::SSL_REQUEST.code(),
                ));
            }
            FeStartupPacket::CancelRequest(key) => return Ok(HandshakeData::Cancel(key)),
            FeStartupPacket::StartupMessage(params) => return Ok(HandshakeData::Startup(params)),
        }
    }
}
