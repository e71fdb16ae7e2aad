//! Buffered PDU reader over a tokio stream.
//!
//! Accumulates bytes until the RPC header announces a complete
//! fragment, then hands it out as one frame.

use std::io;

use bytes::{Bytes, BytesMut};
use ironkms_pdu::rpc;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;

pub(crate) struct Framed {
    stream: TcpStream,
    buf: BytesMut,
}

impl Framed {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    /// Reads one complete PDU.
    ///
    /// Returns `None` on a clean EOF at a frame boundary; EOF in the
    /// middle of a frame is an error.
    pub(crate) async fn read_frame(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            match rpc::find_frame_size(&self.buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))? {
                Some(length) => {
                    if self.buf.len() >= length {
                        return Ok(Some(self.buf.split_to(length).freeze()));
                    }
                    self.buf.reserve(length - self.buf.len());
                }
                None => {}
            }

            let read = self.stream.read_buf(&mut self.buf).await?;
            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "EOF inside a PDU"));
            }
        }
    }

    pub(crate) async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.stream.write_all(buf).await?;
        self.stream.flush().await
    }
}
