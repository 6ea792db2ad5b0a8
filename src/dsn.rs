//! Backend DSN resolution.
//!
//! A backend is identified by a libpq-style connection string, a
//! space-separated sequence of `key=value` options. Only the dial target is
//! computed here; everything else in the DSN is the business of whoever
//! opens a real Postgres session through it.
//!
//! Option precedence, low to high: built-in defaults, libpq environment
//! variables, the DSN itself.

use std::collections::HashMap;
use std::path::PathBuf;

use thiserror::Error;

use crate::stream::BackendStream;

#[derive(Debug, Error)]
pub enum DsnError {
    #[error("invalid option: {0:?}")]
    InvalidOption(String),
}

/// Where to dial for a given backend DSN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialTarget {
    Tcp(String),
    Unix(PathBuf),
}

impl DialTarget {
    pub async fn connect(&self) -> std::io::Result<BackendStream> {
        match self {
            DialTarget::Tcp(addr) => {
                let socket = tokio::net::TcpStream::connect(addr).await?;
                socket.set_nodelay(true)?;
                Ok(BackendStream::Tcp(socket))
            }
            #[cfg(unix)]
            DialTarget::Unix(path) => {
                Ok(BackendStream::Unix(tokio::net::UnixStream::connect(path).await?))
            }
            #[cfg(not(unix))]
            DialTarget::Unix(_) => Err(std::io::Error::other(
                "unix domain sockets are not supported on this platform",
            )),
        }
    }
}

/// Resolve a backend DSN against the process environment.
pub fn dial_target(dsn: &str) -> Result<DialTarget, DsnError> {
    resolve(dsn, std::env::vars())
}

fn resolve(
    dsn: &str,
    env: impl Iterator<Item = (String, String)>,
) -> Result<DialTarget, DsnError> {
    let mut opts = HashMap::new();
    opts.insert("host".to_owned(), "localhost".to_owned());
    opts.insert("port".to_owned(), "5432".to_owned());

    for (var, value) in env {
        if let Some(name) = libpq_env_option(&var) {
            opts.insert(name.to_owned(), value);
        }
    }

    parse_opts(dsn, &mut opts)?;

    let host = &opts["host"];
    let port = &opts["port"];
    if host.starts_with('/') {
        Ok(DialTarget::Unix(
            PathBuf::from(host).join(format!(".s.PGSQL.{port}")),
        ))
    } else {
        Ok(DialTarget::Tcp(format!("{host}:{port}")))
    }
}

/// Environment variables recognized by libpq, mapped to the option they set.
fn libpq_env_option(var: &str) -> Option<&'static str> {
    Some(match var {
        "PGHOST" => "host",
        "PGHOSTADDR" => "hostaddr",
        "PGPORT" => "port",
        "PGDATABASE" => "dbname",
        "PGUSER" => "user",
        "PGPASSWORD" => "password",
        "PGOPTIONS" => "options",
        "PGAPPNAME" => "application_name",
        "PGSSLMODE" => "sslmode",
        "PGREQUIRESSL" => "requiressl",
        "PGSSLCERT" => "sslcert",
        "PGSSLKEY" => "sslkey",
        "PGSSLROOTCERT" => "sslrootcert",
        "PGSSLCRL" => "sslcrl",
        "PGREQUIREPEER" => "requirepeer",
        "PGKRBSRVNAME" => "krbsrvname",
        "PGGSSLIB" => "gsslib",
        "PGCONNECT_TIMEOUT" => "connect_timeout",
        "PGCLIENTENCODING" => "client_encoding",
        _ => return None,
    })
}

fn parse_opts(dsn: &str, opts: &mut HashMap<String, String>) -> Result<(), DsnError> {
    let dsn = dsn.trim();
    if dsn.is_empty() {
        return Ok(());
    }

    for option in dsn.split(' ') {
        let mut parts = option.split('=');
        match (parts.next(), parts.next()) {
            (Some(key), Some(value)) => {
                opts.insert(key.to_owned(), value.to_owned());
            }
            _ => return Err(DsnError::InvalidOption(option.to_owned())),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env() -> impl Iterator<Item = (String, String)> {
        std::iter::empty()
    }

    fn env<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Iterator<Item = (String, String)> + 'a {
        vars.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
    }

    #[test]
    fn defaults_apply() {
        assert_eq!(
            resolve("", no_env()).unwrap(),
            DialTarget::Tcp("localhost:5432".to_owned())
        );
    }

    #[test]
    fn dsn_overrides_defaults() {
        assert_eq!(
            resolve("host=10.0.0.1 port=5433", no_env()).unwrap(),
            DialTarget::Tcp("10.0.0.1:5433".to_owned())
        );
    }

    #[test]
    fn environment_overrides_defaults() {
        assert_eq!(
            resolve("", env(&[("PGHOST", "db.internal"), ("PGPORT", "6432")])).unwrap(),
            DialTarget::Tcp("db.internal:6432".to_owned())
        );
    }

    #[test]
    fn dsn_overrides_environment() {
        assert_eq!(
            resolve("host=explicit", env(&[("PGHOST", "from-env")])).unwrap(),
            DialTarget::Tcp("explicit:5432".to_owned())
        );
    }

    #[test]
    fn unrecognized_environment_is_ignored() {
        assert_eq!(
            resolve("", env(&[("PGSERVICE", "nope"), ("HOME", "/root")])).unwrap(),
            DialTarget::Tcp("localhost:5432".to_owned())
        );
    }

    #[test]
    fn absolute_host_is_a_unix_socket() {
        assert_eq!(
            resolve("host=/var/run/postgresql port=5433", no_env()).unwrap(),
            DialTarget::Unix(PathBuf::from("/var/run/postgresql/.s.PGSQL.5433"))
        );
    }

    #[test]
    fn option_without_value_is_rejected() {
        assert!(matches!(
            resolve("host", no_env()),
            Err(DsnError::InvalidOption(_))
        ));
    }
}
