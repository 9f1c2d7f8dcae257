//! Socket transport.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::{client::Endpoint, error::Result};

/// Any bidirectional byte stream QMP can run over.
pub trait AsyncQmpStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> AsyncQmpStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// A connected QMP stream, Unix or TCP.
pub type QmpStream = Box<dyn AsyncQmpStream>;

/// Open a stream to `endpoint`.
pub async fn connect(endpoint: Endpoint) -> Result<QmpStream> {
    match endpoint {
        #[cfg(unix)]
        Endpoint::Unix { path } => {
            let stream = tokio::net::UnixStream::connect(&path).await?;
            Ok(Box::new(stream))
        }
        #[cfg(not(unix))]
        Endpoint::Unix { .. } => Err(crate::error::Error::protocol(
            "unix sockets are not supported on this platform",
        )),
        Endpoint::Tcp { host, port } => {
            let stream = tokio::net::TcpStream::connect((host.as_str(), port)).await?;
            // Commands are small and latency bound.
            if let Err(_e) = stream.set_nodelay(true) {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %_e, "could not disable Nagle on QMP socket");
            }
            Ok(Box::new(stream))
        }
    }
}
