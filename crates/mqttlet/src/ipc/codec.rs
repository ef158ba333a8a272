//! Line framing for worker communication.
//!
//! The worker speaks newline-delimited JSON over its standard streams. Pipe reads
//! arrive in arbitrary chunks, so a read is never assumed to be a record: the codec
//! keeps the unterminated tail in the read buffer and only yields a line once its
//! terminator has been seen. At end-of-stream a non-empty tail is yielded as a final
//! line.

use std::io;

use tokio::io::AsyncRead;
use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, FramedRead};

/// Lazy sequence of complete, trimmed lines read from a byte stream.
pub type FrameReader<R> = FramedRead<R, LineCodec>;

/// Wrap a byte stream (worker stdout/stderr, a socket, a test duplex) in a [`FrameReader`].
pub fn frame_reader<R: AsyncRead>(reader: R) -> FrameReader<R> {
    FramedRead::new(reader, LineCodec::new())
}

/// Codec that splits on `\n` and trims trailing whitespace (including `\r`).
///
/// Invalid UTF-8 is replaced rather than rejected: a single bad line must not
/// terminate the whole stream.
#[derive(Debug, Default, Clone)]
pub struct LineCodec {
    /// Bytes of the buffered tail already scanned for a terminator.
    next_index: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self { next_index: 0 }
    }

    fn take_line(&mut self, src: &mut BytesMut, len: usize, consume: usize) -> String {
        let raw = src.split_to(len);
        src.advance(consume);
        self.next_index = 0;
        String::from_utf8_lossy(&raw).trim_end().to_string()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src[self.next_index..].iter().position(|b| *b == b'\n') {
            Some(offset) => {
                let newline = self.next_index + offset;
                Ok(Some(self.take_line(src, newline, 1)))
            }
            None => {
                self.next_index = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            return Ok(None);
        }
        tracing::trace!(
            pending_bytes = src.len(),
            "Flushing unterminated tail at end of stream"
        );
        let len = src.len();
        Ok(Some(self.take_line(src, len, 0)))
    }
}

impl<T: AsRef<str>> Encoder<T> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = item.as_ref();
        if line.contains('\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "embedded newline would split the record",
            ));
        }
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
