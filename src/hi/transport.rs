use bytes::BytesMut;
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use std::io;

/// A connection's byte stream, split so one task can read and write at once.
pub(crate) struct Transport<T> {
    pub reader: ReadHalf<T>,
    pub writer: WriteHalf<T>,
}

impl<T: AsyncRead + AsyncWrite> Transport<T> {
    pub fn new(io: T) -> Transport<T> {
        let (reader, writer) = split(io);
        Transport { reader, writer }
    }

    /// Writes out everything in `buf`, leaving it empty.
    pub async fn flush_all(&mut self, buf: &mut BytesMut) -> io::Result<()> {
        self.writer.write_all_buf(buf).await?;
        self.writer.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}
