use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{
    rustls::{ProtocolVersion, ServerConnection, SupportedCipherSuite},
    server::TlsStream,
    TlsAcceptor,
};

const BUFFER_SIZE: usize = 8192;

/// Negotiated TLS parameters, reported after a successful upgrade.
#[derive(Debug)]
pub struct TlsInfo {
    version: Option<ProtocolVersion>,
    ciphers: Option<SupportedCipherSuite>,
}

impl TlsInfo {
    fn of(conn: &ServerConnection) -> Self {
        Self {
            version: conn.protocol_version(),
            ciphers: conn.negotiated_cipher_suite(),
        }
    }

    pub fn proto(&self) -> String {
        self.version
            .and_then(|version| version.as_str())
            .unwrap_or("unknown")
            .to_string()
    }

    pub fn cipher(&self) -> String {
        self.ciphers
            .and_then(|ciphers| ciphers.suite().as_str())
            .unwrap_or("unknown")
            .to_string()
    }
}

/// The session transport: a plain stream, or the same stream wrapped in TLS
/// after a STARTTLS upgrade. Reads go through an internal buffer so the line
/// codec does not issue one syscall per byte.
pub enum Connection<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    Plain {
        stream: Stream,
        read_buf: Vec<u8>,
        read_pos: usize,
        read_len: usize,
    },
    Tls {
        stream: Box<TlsStream<Stream>>,
        read_buf: Vec<u8>,
        read_pos: usize,
        read_len: usize,
    },
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Connection<Stream> {
    pub fn plain(stream: Stream) -> Self {
        Self::Plain {
            stream,
            read_buf: Vec::new(),
            read_pos: 0,
            read_len: 0,
        }
    }

    /// Write a single response line, terminated with CRLF, and flush it.
    pub(crate) async fn send<S: core::fmt::Display + Send + Sync>(
        &mut self,
        response: &S,
    ) -> io::Result<()> {
        let line = format!("{response}\r\n");

        match self {
            Self::Plain { stream, .. } => {
                stream.write_all(line.as_bytes()).await?;
                stream.flush().await
            }
            Self::Tls { stream, .. } => {
                stream.write_all(line.as_bytes()).await?;
                stream.flush().await
            }
        }
    }

    /// Read one line: every byte up to and including the first `\n`.
    ///
    /// End of stream surfaces as `UnexpectedEof`, even mid-line.
    pub(crate) async fn read_line(&mut self) -> io::Result<Vec<u8>> {
        let mut line = Vec::new();

        loop {
            let (read_buf, read_pos, read_len) = self.buffer_mut();

            if *read_pos < *read_len {
                if let Some(idx) = read_buf[*read_pos..*read_len]
                    .iter()
                    .position(|&b| b == b'\n')
                {
                    let end = *read_pos + idx + 1;
                    line.extend_from_slice(&read_buf[*read_pos..end]);
                    *read_pos = end;
                    return Ok(line);
                }

                line.extend_from_slice(&read_buf[*read_pos..*read_len]);
                *read_pos = *read_len;
            }

            if self.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed",
                ));
            }
        }
    }

    /// Drop any bytes already read off the wire but not yet consumed.
    pub(crate) fn discard_buffered(&mut self) {
        let (_, read_pos, read_len) = self.buffer_mut();
        *read_pos = 0;
        *read_len = 0;
    }

    /// Perform the server side of a STARTTLS handshake in place.
    ///
    /// On success the transport and its read buffer are replaced wholesale;
    /// plaintext bytes buffered before the handshake never cross into the TLS
    /// stream (RFC 3207). On failure the plain stream is handed back so the
    /// session can still report the 403 before closing.
    pub(crate) async fn upgrade(
        self,
        acceptor: &TlsAcceptor,
    ) -> Result<(Self, TlsInfo), (io::Error, Self)> {
        match self {
            Self::Plain { stream, .. } => match acceptor.accept(stream).into_fallible().await {
                Ok(stream) => {
                    let info = TlsInfo::of(stream.get_ref().1);

                    Ok((
                        Self::Tls {
                            stream: Box::new(stream),
                            read_buf: Vec::new(),
                            read_pos: 0,
                            read_len: 0,
                        },
                        info,
                    ))
                }
                Err((err, stream)) => Err((err, Self::plain(stream))),
            },
            tls @ Self::Tls { .. } => Err((
                io::Error::new(io::ErrorKind::InvalidInput, "TLS already active"),
                tls,
            )),
        }
    }

    fn buffer_mut(&mut self) -> (&mut Vec<u8>, &mut usize, &mut usize) {
        match self {
            Self::Plain {
                read_buf,
                read_pos,
                read_len,
                ..
            }
            | Self::Tls {
                read_buf,
                read_pos,
                read_len,
                ..
            } => (read_buf, read_pos, read_len),
        }
    }

    async fn fill(&mut self) -> io::Result<usize> {
        match self {
            Self::Plain {
                stream,
                read_buf,
                read_pos,
                read_len,
            } => {
                if read_buf.is_empty() {
                    read_buf.resize(BUFFER_SIZE, 0);
                }

                let bytes_read = stream.read(read_buf).await?;
                *read_pos = 0;
                *read_len = bytes_read;
                Ok(bytes_read)
            }
            Self::Tls {
                stream,
                read_buf,
                read_pos,
                read_len,
            } => {
                if read_buf.is_empty() {
                    read_buf.resize(BUFFER_SIZE, 0);
                }

                let bytes_read = stream.read(read_buf).await?;
                *read_pos = 0;
                *read_len = bytes_read;
                Ok(bytes_read)
            }
        }
    }
}
