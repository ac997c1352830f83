//--------------------------------------------------------------------------------------------------------------------------------------------------
// Module transport
// Ordered byte stream to an ECU, no framing assumed

use async_trait::async_trait;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Byte stream to one ECU
#[async_trait]
pub trait Transport: Send {
    /// Write all bytes in order
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;

    /// Read exactly buf.len() bytes
    async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()>;

    async fn close(&mut self) -> std::io::Result<()>;
}

/// Opens transports by host and port
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> std::io::Result<Box<dyn Transport>>;
}

//--------------------------------------------------------------------------------------------------------------------------------------------------
// StreamTransport

/// Transport over any tokio byte stream
pub struct StreamTransport<S> {
    stream: S,
}

impl<S> StreamTransport<S> {
    pub fn new(stream: S) -> StreamTransport<S> {
        StreamTransport { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(buf).await?;
        self.stream.flush().await
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        self.stream.read_exact(buf).await?;
        Ok(())
    }

    async fn close(&mut self) -> std::io::Result<()> {
        self.stream.shutdown().await
    }
}

//--------------------------------------------------------------------------------------------------------------------------------------------------
// TcpConnector

/// XCP on TCP
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> std::io::Result<Box<dyn Transport>> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        debug!("TCP connected to {}:{}, local addr {:?}", host, port, stream.local_addr());
        Ok(Box::new(StreamTransport::new(stream)))
    }
}
