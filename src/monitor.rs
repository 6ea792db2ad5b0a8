//! Backend health probes.
//!
//! One task per configured backend. Each tick opens a fresh Postgres
//! session, asks `SELECT pg_is_in_recovery()` and classifies the backend as
//! master, replica, or unavailable. Only transitions are pushed to the
//! oracle; a backend that keeps answering the same way stays quiet.

use std::pin::pin;
use std::time::Duration;

use futures::TryStreamExt;
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;
use tracing::{debug, info};

use crate::oracle::{BackendId, BackendStatus, OracleHandle, StatusEvent};

/// Probe `backend` forever, reporting status transitions to the oracle.
///
/// `probe_dsn` is the backend DSN with the probe credentials prepended; all
/// probe errors are local and only ever delay the next classification to
/// the following tick.
#[tracing::instrument(skip_all, fields(backend = %backend))]
pub async fn monitor_backend(
    backend: BackendId,
    probe_dsn: String,
    interval: Duration,
    oracle: OracleHandle,
) {
    let mut first = true;
    let mut last = BackendStatus::Unknown;

    loop {
        if !first {
            tokio::time::sleep(interval).await;
        }
        first = false;

        let status = probe_once(&probe_dsn).await;
        if transition(&mut last, status) {
            info!(?status, "backend status changed");
            oracle
                .update(StatusEvent {
                    backend: backend.clone(),
                    status,
                })
                .await;
        }
    }
}

/// Record `next` and report whether it differs from the previous status.
fn transition(last: &mut BackendStatus, next: BackendStatus) -> bool {
    if *last == next {
        return false;
    }
    *last = next;
    true
}

async fn probe_once(probe_dsn: &str) -> BackendStatus {
    let (client, connection) = match tokio_postgres::connect(probe_dsn, NoTls).await {
        Ok(session) => session,
        Err(err) => {
            info!(%err, "connection open failed");
            return BackendStatus::Down;
        }
    };

    // The connection future owns the socket; it finishes once the client
    // is dropped at the end of this probe.
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            debug!(%err, "probe connection ended with error");
        }
    });

    let rows = match client
        .query_raw(
            "SELECT pg_is_in_recovery()",
            std::iter::empty::<&dyn ToSql>(),
        )
        .await
    {
        Ok(rows) => rows,
        Err(err) => {
            info!(%err, "probe query failed");
            return BackendStatus::Down;
        }
    };

    let mut rows = pin!(rows);
    let mut in_recovery = false;
    loop {
        match rows.try_next().await {
            Ok(Some(row)) => match row.try_get::<_, bool>(0) {
                Ok(flag) => in_recovery = flag,
                Err(err) => {
                    info!(%err, "probe row decode failed");
                    return BackendStatus::Broken;
                }
            },
            Ok(None) => break,
            Err(err) => {
                info!(%err, "probe row stream failed");
                return BackendStatus::Broken;
            }
        }
    }

    if in_recovery {
        BackendStatus::Replica
    } else {
        BackendStatus::Master
    }
}
