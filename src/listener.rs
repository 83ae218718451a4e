// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tokio_util::either::Either;

/// Network location a transport binds to. TCP hosts are kept as given after
/// normalization so that hostnames resolve at bind time.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Endpoint::Tcp { port, .. } => Some(*port),
            Endpoint::Unix(_) => None,
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::tcp(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } if host.contains(':') => write!(f, "[{host}]:{port}"),
            Endpoint::Tcp { host, port } => write!(f, "{host}:{port}"),
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Error)]
#[error("unable to bind to {endpoint}: {source}")]
pub struct BindError {
    pub endpoint: Endpoint,
    #[source]
    pub source: io::Error,
}

/// A socket that is both bound and listening, ready to accept() connections.
#[derive(Debug)]
pub struct Listener {
    inner: ListenerInner,
}

#[derive(Debug)]
enum ListenerInner {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// Connection stream accepted by the HTTP transport.
pub type Connection = Either<TcpStream, UnixStream>;

/// Listener converted into a stream of connections for tonic.
pub enum Incoming {
    Tcp(TcpListenerStream),
    Unix(UnixListenerStream),
}

impl Listener {
    pub async fn bind(endpoint: &Endpoint) -> Result<Self, BindError> {
        let bind_err = |source| BindError {
            endpoint: endpoint.clone(),
            source,
        };

        let inner = match endpoint {
            Endpoint::Tcp { host, port } => {
                let l = TcpListener::bind((host.as_str(), *port))
                    .await
                    .map_err(bind_err)?;
                ListenerInner::Tcp(l)
            }
            Endpoint::Unix(path) => {
                remove_stale_socket(path).map_err(bind_err)?;
                ListenerInner::Unix(UnixListener::bind(path).map_err(bind_err)?)
            }
        };

        Ok(Self { inner })
    }

    /// Address the kernel assigned, which differs from the configured one
    /// when port 0 was requested.
    pub fn bound_endpoint(&self) -> io::Result<Endpoint> {
        match &self.inner {
            ListenerInner::Tcp(l) => Ok(l.local_addr()?.into()),
            ListenerInner::Unix(l) => {
                let addr = l.local_addr()?;
                match addr.as_pathname() {
                    Some(path) => Ok(Endpoint::Unix(path.to_path_buf())),
                    None => Err(io::Error::new(
                        io::ErrorKind::AddrNotAvailable,
                        "unix listener is not bound to a path",
                    )),
                }
            }
        }
    }

    pub async fn accept(&self) -> io::Result<(Connection, Option<SocketAddr>)> {
        match &self.inner {
            ListenerInner::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                Ok((Either::Left(stream), Some(peer)))
            }
            ListenerInner::Unix(l) => {
                let (stream, _) = l.accept().await?;
                Ok((Either::Right(stream), None))
            }
        }
    }

    pub fn into_incoming(self) -> Incoming {
        match self.inner {
            ListenerInner::Tcp(l) => Incoming::Tcp(TcpListenerStream::new(l)),
            ListenerInner::Unix(l) => Incoming::Unix(UnixListenerStream::new(l)),
        }
    }
}

// Only sockets are removed, any other file at the path is left for bind to report.
fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => std::fs::remove_file(path),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
