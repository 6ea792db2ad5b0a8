//! Post-startup byte relay.
//!
//! After the rewritten startup packet has been replayed, the backend's
//! replies are forwarded frame by frame until BackendKeyData has passed
//! through; from then on both directions are plain copies. The whole
//! session lives inside one task, so returning from [`run`] tears down
//! both sockets and, through the registry guard, the cancellation key.

use std::pin::pin;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};
use zerocopy::FromBytes;

use crate::oracle::BackendId;
use crate::pqproto::{
    read_message, BackendKey, ProtocolError, BACKEND_KEY_DATA, MAX_STARTUP_PACKET_LENGTH,
};
use crate::registry::RegistryHandle;

pub(crate) async fn run<C, B>(
    client: C,
    backend: B,
    registry: &RegistryHandle,
    backend_id: BackendId,
) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    // The client may have to answer authentication challenges while we wait
    // for BackendKeyData, so client->backend bytes must already be flowing.
    let mut client_to_backend = pin!(tokio::io::copy(&mut client_read, &mut backend_write));

    let key = tokio::select! {
        sniffed = sniff_backend_key(&mut backend_read, &mut client_write) => match sniffed {
            Ok(key) => key,
            Err(err) => {
                // The client has already seen everything the backend had to
                // say, typically an authentication failure.
                debug!(%err, "backend closed during startup relay");
                return Ok(());
            }
        },
        copied = &mut client_to_backend => {
            debug!(?copied, "client closed during startup relay");
            return Ok(());
        }
    };

    let _registered = registry.register(key, backend_id);
    info!(%key, "session established");

    let backend_to_client = tokio::io::copy(&mut backend_read, &mut client_write);
    tokio::select! {
        copied = &mut client_to_backend => log_copy("client->backend", copied),
        copied = backend_to_client => log_copy("backend->client", copied),
    }

    Ok(())
}

fn log_copy(direction: &str, result: std::io::Result<u64>) {
    match result {
        Ok(bytes) => info!(direction, bytes, "tunnel closed"),
        // The transport itself carries the failure to the peer.
        Err(err) => info!(direction, %err, "tunnel closed"),
    }
}

/// Forward backend messages to the client one frame at a time, capturing
/// the key out of the BackendKeyData message as it passes through.
async fn sniff_backend_key<R, W>(backend: &mut R, client: &mut W) -> Result<BackendKey, ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    loop {
        let (tag, frame) = read_message(backend, &mut buf, MAX_STARTUP_PACKET_LENGTH).await?;
        client.write_u8(tag).await?;
        client.write_i32(frame.len() as i32 + 4).await?;
        client.write_all(frame).await?;
        client.flush().await?;

        if tag == BACKEND_KEY_DATA {
            return BackendKey::read_from_bytes(frame)
                .map_err(|_| ProtocolError::MalformedBackendKey);
        }
    }
}
