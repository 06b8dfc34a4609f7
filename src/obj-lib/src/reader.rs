use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

use crate::{ObjectInfo, ObjectReader};

/// How much of the source is pulled per poll while teeing.
const TEE_READ_CHUNK: usize = 64 * 1024;

/// A streaming object read: the payload reader plus the object's info.
pub struct GetObjectReader {
    pub object_info: ObjectInfo,
    reader: ObjectReader,
}

impl std::fmt::Debug for GetObjectReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetObjectReader")
            .field("object_info", &self.object_info)
            .finish_non_exhaustive()
    }
}

impl GetObjectReader {
    pub fn new(reader: ObjectReader, object_info: ObjectInfo) -> Self {
        Self {
            object_info,
            reader,
        }
    }

    pub fn into_inner(self) -> (ObjectReader, ObjectInfo) {
        (self.reader, self.object_info)
    }
}

impl AsyncRead for GetObjectReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.get_mut().reader.as_mut().poll_read(cx, buf)
    }
}

/// Caps an already-positioned reader at `size` bytes.
pub struct LimitReader {
    reader: ObjectReader,
    size: u64,
    read: u64,
}

impl LimitReader {
    pub fn from_reader(reader: ObjectReader, size: u64) -> Self {
        Self {
            reader,
            size,
            read: 0,
        }
    }
}

impl AsyncRead for LimitReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.read >= this.size {
            return Poll::Ready(Ok(()));
        }

        let remaining = (this.size - this.read) as usize;
        let max_to_read = buf.remaining().min(remaining);
        if max_to_read == 0 {
            return Poll::Ready(Ok(()));
        }

        let mut limited = ReadBuf::new(&mut buf.initialize_unfilled()[..max_to_read]);
        match this.reader.as_mut().poll_read(cx, &mut limited) {
            Poll::Ready(Ok(())) => {
                let filled = limited.filled().len();
                buf.advance(filled);
                this.read += filled as u64;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Serves a source stream to its caller while pushing every byte into a
/// bounded pipe whose other end feeds the cache fill.
///
/// Bytes are flushed into the pipe *before* they are handed to the caller,
/// so everything the caller has seen is already on its way to the cache
/// writer. If the pipe's consumer goes away the next read fails, which is
/// how a cache-side error reaches the client; conversely a dropped
/// `TeeCacheReader` closes the pipe and aborts the fill. A slow cache
/// writer only throttles the caller once the pipe buffer is full.
pub struct TeeCacheReader {
    src: ObjectReader,
    pipe: DuplexStream,
    buffer: Vec<u8>,
    flush_pos: usize,
    serve_pos: usize,
    src_done: bool,
}

impl TeeCacheReader {
    /// Returns the tee plus the read end to hand to the cache writer.
    pub fn new(src: ObjectReader, pipe_capacity: usize) -> (Self, DuplexStream) {
        let (near, far) = tokio::io::duplex(pipe_capacity);
        (
            Self {
                src,
                pipe: near,
                buffer: Vec::new(),
                flush_pos: 0,
                serve_pos: 0,
                src_done: false,
            },
            far,
        )
    }
}

impl AsyncRead for TeeCacheReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            // flush the current chunk into the pipe before serving it
            while this.flush_pos < this.buffer.len() {
                match Pin::new(&mut this.pipe).poll_write(cx, &this.buffer[this.flush_pos..]) {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "cache fill pipe closed",
                        )))
                    }
                    Poll::Ready(Ok(n)) => this.flush_pos += n,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }

            if this.serve_pos < this.buffer.len() {
                let n = buf.remaining().min(this.buffer.len() - this.serve_pos);
                buf.put_slice(&this.buffer[this.serve_pos..this.serve_pos + n]);
                this.serve_pos += n;
                if this.serve_pos == this.buffer.len() {
                    this.buffer.clear();
                    this.flush_pos = 0;
                    this.serve_pos = 0;
                }
                return Poll::Ready(Ok(()));
            }

            if this.src_done {
                return match Pin::new(&mut this.pipe).poll_shutdown(cx) {
                    Poll::Ready(_) => Poll::Ready(Ok(())),
                    Poll::Pending => Poll::Pending,
                };
            }

            this.buffer.resize(TEE_READ_CHUNK, 0);
            let mut chunk = ReadBuf::new(&mut this.buffer[..]);
            match this.src.as_mut().poll_read(cx, &mut chunk) {
                Poll::Ready(Ok(())) => {
                    let n = chunk.filled().len();
                    this.buffer.truncate(n);
                    this.flush_pos = 0;
                    this.serve_pos = 0;
                    if n == 0 {
                        this.src_done = true;
                    }
                }
                Poll::Ready(Err(e)) => {
                    this.buffer.clear();
                    return Poll::Ready(Err(e));
                }
                Poll::Pending => {
                    this.buffer.clear();
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pattern_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_limit_reader_caps_stream() {
        let data = pattern_bytes(1000);
        let reader: ObjectReader = Box::pin(Cursor::new(data.clone()));
        let mut limited = LimitReader::from_reader(reader, 100);
        let mut out = Vec::new();
        limited.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, &data[..100]);
    }

    #[tokio::test]
    async fn test_tee_reader_duplicates_stream() {
        let data = pattern_bytes(300 * 1024);
        let src: ObjectReader = Box::pin(Cursor::new(data.clone()));
        let (mut tee, mut pipe) = TeeCacheReader::new(src, 64 * 1024);

        let sink = tokio::spawn(async move {
            let mut out = Vec::new();
            pipe.read_to_end(&mut out).await.unwrap();
            out
        });

        let mut client = Vec::new();
        tee.read_to_end(&mut client).await.unwrap();
        assert_eq!(client, data);

        let cached = sink.await.unwrap();
        assert_eq!(cached, data);
    }

    #[tokio::test]
    async fn test_tee_reader_zero_byte_stream() {
        let src: ObjectReader = Box::pin(Cursor::new(Vec::new()));
        let (mut tee, mut pipe) = TeeCacheReader::new(src, 1024);

        let sink = tokio::spawn(async move {
            let mut out = Vec::new();
            pipe.read_to_end(&mut out).await.unwrap();
            out
        });

        let mut client = Vec::new();
        tee.read_to_end(&mut client).await.unwrap();
        assert!(client.is_empty());
        assert!(sink.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tee_reader_fails_when_consumer_gone() {
        let data = pattern_bytes(256 * 1024);
        let src: ObjectReader = Box::pin(Cursor::new(data));
        // pipe smaller than the stream, so the tee must block on the pipe
        let (mut tee, pipe) = TeeCacheReader::new(src, 4 * 1024);
        drop(pipe);

        let mut client = Vec::new();
        let err = tee.read_to_end(&mut client).await.unwrap_err();
        assert!(
            err.kind() == std::io::ErrorKind::BrokenPipe
                || err.kind() == std::io::ErrorKind::WriteZero
        );
    }

    #[tokio::test]
    async fn test_tee_reader_drop_closes_pipe() {
        let data = pattern_bytes(8 * 1024);
        let src: ObjectReader = Box::pin(Cursor::new(data.clone()));
        let (mut tee, mut pipe) = TeeCacheReader::new(src, 64 * 1024);

        // client reads everything then goes away without polling EOF
        let mut client = vec![0u8; data.len()];
        tee.read_exact(&mut client).await.unwrap();
        drop(tee);

        // the fill side still receives every byte the client saw
        let mut out = Vec::new();
        pipe.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);

        let _ = pipe.shutdown().await;
    }
}
