//! Per-connection proxy logic: handshake, routing, and relay.

pub(crate) mod handshake;
mod passthrough;
#[cfg(test)]
mod tests;

use std::time::Duration;

use anyhow::{bail, Context};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::dsn;
use crate::oracle::OracleHandle;
use crate::pqproto::{
    cancel_request_packet, error_response, BackendKey, StartupParameters,
    SQLSTATE_CONNECTION_EXCEPTION,
};
use crate::registry::RegistryHandle;
use self::handshake::{handshake, HandshakeData};

/// Allotted time from accept to the end of startup parameter parsing.
/// A tunneled session has no deadline.
const STARTUP_DEADLINE: Duration = Duration::from_secs(60);

const REPLICA_SUFFIX: &str = "_replica";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RouteIntent {
    Writer,
    Reader,
}

/// Drive one accepted client connection to completion. Both sockets and
/// any registered cancellation key are released on every exit path.
pub async fn handle_client<S>(
    oracle: &OracleHandle,
    registry: &RegistryHandle,
    mut client: S,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let data = match timeout(STARTUP_DEADLINE, handshake(&mut client)).await {
        Ok(Ok(data)) => data,
        Ok(Err(err)) => {
            send_error(&mut client, err.client_message()).await;
            return Err(err).context("startup failed");
        }
        Err(_) => bail!("client did not complete startup within {STARTUP_DEADLINE:?}"),
    };

    match data {
        HandshakeData::Cancel(key) => relay_cancel(registry, key).await,
        HandshakeData::Startup(params) => run_session(oracle, registry, client, params).await,
    }
}

/// Relay a CancelRequest to the backend owning the addressed session.
/// The issuer never gets a reply, success or not.
async fn relay_cancel(registry: &RegistryHandle, key: BackendKey) -> anyhow::Result<()> {
    let Some(backend) = registry.lookup(key).await else {
        info!(%key, "no session matches the cancel key");
        return Ok(());
    };

    info!(%key, %backend, "relaying CancelRequest");
    let target = dsn::dial_target(&backend).context("resolving backend dsn")?;
    let mut stream = target
        .connect()
        .await
        .with_context(|| format!("dialing {backend}"))?;
    stream.write_all(&cancel_request_packet(key)).await?;
    Ok(())
}

async fn run_session<S>(
    oracle: &OracleHandle,
    registry: &RegistryHandle,
    mut client: S,
    mut params: StartupParameters,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(intent) = route_intent(&mut params) else {
        send_error(&mut client, "Missing database or user parameter").await;
        bail!("expected database or user parameter, neither found");
    };

    let backend = match intent {
        RouteIntent::Writer => oracle.request_writer().await,
        RouteIntent::Reader => oracle.request_reader().await,
    };
    let Some(backend) = backend else {
        send_error(&mut client, "Unable to find satisfactory backend server").await;
        bail!("no {intent:?} backend available");
    };
    info!(%backend, ?intent, "backend selected");

    let target = match dsn::dial_target(&backend) {
        Ok(target) => target,
        Err(err) => {
            send_error(&mut client, "Unable to connect to backend server").await;
            return Err(err).context("resolving backend dsn");
        }
    };
    let mut upstream = match target.connect().await {
        Ok(stream) => stream,
        Err(err) => {
            send_error(&mut client, "Unable to connect to backend server").await;
            return Err(err).with_context(|| format!("dialing {backend}"));
        }
    };

    if let Err(err) = upstream.write_all(&params.to_startup_packet()).await {
        send_error(&mut client, "Backend network error").await;
        return Err(err).context("replaying startup packet");
    }

    passthrough::run(client, upstream, registry, backend).await
}

/// Decide writer vs reader from the startup parameters and strip the
/// routing suffix, leaving the packet the backend should actually see.
/// Returns None when neither "database" nor "user" is present.
pub(crate) fn route_intent(params: &mut StartupParameters) -> Option<RouteIntent> {
    let name = params
        .get("database")
        .or_else(|| params.get("user"))?
        .to_owned();

    if let Some(stripped) = name.strip_suffix(REPLICA_SUFFIX) {
        // The rewrite always targets "database", even when the routing name
        // came from "user".
        info!(from = %name, to = %stripped, "rewriting database name");
        params.insert("database", stripped);
        Some(RouteIntent::Reader)
    } else {
        Some(RouteIntent::Writer)
    }
}

/// Best effort; the connection is being torn down anyway.
async fn send_error<S: AsyncWrite + Unpin>(stream: &mut S, msg: &str) {
    let response = error_response(msg, SQLSTATE_CONNECTION_EXCEPTION);
    if let Err(err) = stream.write_all(&response).await {
        debug!(%err, "could not deliver the error response");
        return;
    }
    let _ = stream.flush().await;
}
