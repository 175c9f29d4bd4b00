//! Buffered backend stream: plain TCP or TLS after SSLRequest upgrade.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_native_tls::TlsStream;

use crate::error::{Error, Result};
use crate::protocol::codec;
use crate::state::FrameBuf;

const READ_CHUNK: usize = 8 * 1024;

enum Io {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// One backend socket plus the unparsed-byte buffer. Socket reads append
/// here; the codec pulls complete frames out, reporting "need more data"
/// on partial frames so a message boundary never has to align with a read.
pub struct Stream {
    io: Io,
    rbuf: Vec<u8>,
}

impl Stream {
    /// Wrap a freshly connected TCP socket.
    pub fn tcp(stream: TcpStream) -> Self {
        Self {
            io: Io::Tcp(stream),
            rbuf: Vec::with_capacity(READ_CHUNK),
        }
    }

    /// Upgrade to TLS after the server accepted the SSLRequest.
    ///
    /// Only valid before any protocol message has been buffered.
    pub async fn upgrade_to_tls(self, host: &str) -> Result<Self> {
        if !self.rbuf.is_empty() {
            return Err(Error::Protocol(
                "buffered cleartext bytes before TLS handshake".into(),
            ));
        }
        let tcp = match self.io {
            Io::Tcp(tcp) => tcp,
            Io::Tls(_) => return Err(Error::Protocol("connection is already TLS".into())),
        };

        let connector = native_tls::TlsConnector::builder().build()?;
        let connector = tokio_native_tls::TlsConnector::from(connector);
        let tls = connector.connect(host, tcp).await?;

        Ok(Self {
            io: Io::Tls(Box::new(tls)),
            rbuf: Vec::with_capacity(READ_CHUNK),
        })
    }

    /// Read the next complete message frame into `frame`.
    pub async fn read_frame(&mut self, frame: &mut FrameBuf) -> Result<()> {
        loop {
            if let Some((decoded, consumed)) = codec::decode_frame(&self.rbuf)? {
                frame.type_byte = decoded.type_byte;
                frame.payload.clear();
                frame.payload.extend_from_slice(decoded.payload);
                self.rbuf.drain(..consumed);
                return Ok(());
            }
            self.fill().await?;
        }
    }

    /// Read a single raw byte (SSL negotiation response).
    pub async fn read_byte(&mut self) -> Result<u8> {
        if self.rbuf.is_empty() {
            self.fill().await?;
        }
        let byte = self.rbuf[0];
        self.rbuf.drain(..1);
        Ok(byte)
    }

    /// Write all bytes and flush.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match &mut self.io {
            Io::Tcp(s) => {
                s.write_all(buf).await?;
                s.flush().await?;
            }
            Io::Tls(s) => {
                s.write_all(buf).await?;
                s.flush().await?;
            }
        }
        Ok(())
    }

    async fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = match &mut self.io {
            Io::Tcp(s) => s.read(&mut chunk).await?,
            Io::Tls(s) => s.read(&mut chunk).await?,
        };
        if n == 0 {
            // EOF mid-conversation: the backend went away.
            return Err(Error::ConnectionBroken);
        }
        self.rbuf.extend_from_slice(&chunk[..n]);
        Ok(())
    }
}
