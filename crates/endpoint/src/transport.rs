//! Byte relay between an accepted connection and its destination

use crate::common::{Result, TunnelError, error::is_connection_closed_kind};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument};

/// Any bidirectional byte stream a handler can relay
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Type-erased stream handed to a [`TransportHandler`]
pub type BoxedStream = Box<dyn AsyncStream>;

/// Consumes one decrypted connection
#[async_trait]
pub trait TransportHandler: Send + Sync + 'static {
    /// Relay `stream` until either side is done
    async fn handle(&self, stream: BoxedStream) -> Result<()>;
}

/// Builds the handler for one destination address
pub type HandlerFactory = Arc<dyn Fn(&str) -> Arc<dyn TransportHandler> + Send + Sync>;

/// Tuning for [`DstTransportHandler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySettings {
    /// Per-direction idle limit; a direction with no data for this long ends the relay
    pub idle_timeout: Duration,
    /// Limit on establishing the destination connection
    pub connect_timeout: Duration,
    /// Buffer for destination to client bytes
    pub outbound_buffer: usize,
    /// Buffer for client to destination bytes
    pub inbound_buffer: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            outbound_buffer: 32 * 1024,
            inbound_buffer: 32 * 1024,
        }
    }
}

/// Relays each connection to a fixed TCP destination
#[derive(Debug, Clone)]
pub struct DstTransportHandler {
    destination: String,
    settings: RelaySettings,
}

impl DstTransportHandler {
    pub fn new(destination: impl Into<String>, settings: RelaySettings) -> Self {
        Self {
            destination: destination.into(),
            settings,
        }
    }

    /// Factory producing one handler per destination with shared settings
    pub fn factory(settings: RelaySettings) -> HandlerFactory {
        Arc::new(move |destination: &str| {
            Arc::new(Self::new(destination, settings)) as Arc<dyn TransportHandler>
        })
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    async fn connect(&self) -> Result<TcpStream> {
        let stream = timeout(
            self.settings.connect_timeout,
            TcpStream::connect(&self.destination),
        )
        .await
        .map_err(|_| TunnelError::Timeout(format!("connect to {}", self.destination)))?
        .map_err(|e| TunnelError::connect(&self.destination, e))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl TransportHandler for DstTransportHandler {
    #[instrument(name = "relay", skip_all, fields(dst = %self.destination))]
    async fn handle(&self, stream: BoxedStream) -> Result<()> {
        let upstream = self.connect().await?;
        debug!("connected to destination");

        let (client_read, client_write) = tokio::io::split(stream);
        let (dst_read, dst_write) = upstream.into_split();

        let (sent, received) = tokio::try_join!(
            copy_half(
                client_read,
                dst_write,
                self.settings.inbound_buffer,
                self.settings.idle_timeout
            ),
            copy_half(
                dst_read,
                client_write,
                self.settings.outbound_buffer,
                self.settings.idle_timeout
            ),
        )?;

        debug!(sent, received, "relay finished");
        Ok(())
    }
}

/// Copy `reader` into `writer` until EOF, then shut the writer down
///
/// Each read must complete within `idle`. A peer hanging up mid-copy counts
/// as a normal end of stream.
pub async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    buffer: usize,
    idle: Duration,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer.max(1)];
    let mut total = 0u64;

    loop {
        let n = match timeout(idle, reader.read(&mut buf)).await {
            Err(_) => return Err(TunnelError::Timeout(format!("idle for {idle:?}"))),
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) if is_connection_closed_kind(e.kind()) => break,
            Ok(Err(e)) => return Err(e.into()),
        };

        if let Err(e) = writer.write_all(&buf[..n]).await {
            if is_connection_closed_kind(e.kind()) {
                return Ok(total);
            }
            return Err(e.into());
        }
        total += n as u64;
    }

    match writer.shutdown().await {
        Err(e)
            if !is_connection_closed_kind(e.kind())
                && e.kind() != std::io::ErrorKind::NotConnected =>
        {
            Err(e.into())
        }
        _ => Ok(total),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_relay_echo() {
        let dst = echo_server().await;
        let handler = DstTransportHandler::new(dst, RelaySettings::default());
        let (mut client, server) = tokio::io::duplex(1024);

        let task = tokio::spawn(async move { handler.handle(Box::new(server)).await });

        client.write_all(b"hello relay").await.unwrap();
        client.shutdown().await.unwrap();
        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();

        assert_eq!(echoed, b"hello relay");
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_names_destination() {
        // Bind then drop so the port is very likely closed
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let handler = DstTransportHandler::new(addr.clone(), RelaySettings::default());
        let (_client, server) = tokio::io::duplex(64);

        let err = handler.handle(Box::new(server)).await.unwrap_err();
        assert!(matches!(err, TunnelError::Connect { ref dst, .. } if *dst == addr), "{err}");
    }

    #[tokio::test]
    async fn test_copy_half_idle_timeout() {
        let (_writer, reader) = tokio::io::duplex(64);
        let err = copy_half(reader, tokio::io::sink(), 16, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_copy_half_small_buffer() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let (out_w, mut out_r) = tokio::io::duplex(64);

        writer.write_all(b"0123456789").await.unwrap();
        drop(writer);

        let copied = copy_half(reader, out_w, 3, Duration::from_secs(1)).await.unwrap();
        let mut buf = Vec::new();
        out_r.read_to_end(&mut buf).await.unwrap();
        assert_eq!(copied, 10);
        assert_eq!(buf, b"0123456789");
    }
}
