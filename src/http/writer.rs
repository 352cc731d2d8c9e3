//! Response body framing writers.
//!
//! Layers, innermost first: raw output → chunked (optional) → buffering →
//! gzip (optional). Every layer is a synchronous `Write` over memory; the
//! connection moves the raw output to the socket after each write.

use std::io::{self, Write};

use flate2::write::GzEncoder;
use flate2::Compression;

/// Bytes buffered before the coalescer hands them to the next layer.
pub const BUFFER_THRESHOLD: usize = 4096;

/// Gzip compression level.
pub const GZIP_LEVEL: u32 = 6;

/// A framing layer.
pub trait BodyWrite: Write {
    /// Flush pending data, emit any trailer and close inner layers.
    fn close(&mut self) -> io::Result<()>;

    /// The innermost layer.
    fn raw_mut(&mut self) -> &mut RawWriter;
}

/// Collects framed output and counts it.
#[derive(Debug, Default)]
pub struct RawWriter {
    out: Vec<u8>,
    total: u64,
}

impl RawWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output produced since the last call.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }

    /// Total bytes produced.
    pub fn total(&self) -> u64 {
        self.total
    }
}

impl Write for RawWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.out.extend_from_slice(buf);
        self.total += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BodyWrite for RawWriter {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn raw_mut(&mut self) -> &mut RawWriter {
        self
    }
}

/// HTTP/1.1 chunked transfer coding.
#[derive(Debug)]
pub struct ChunkedWriter<W> {
    inner: W,
}

impl<W: BodyWrite> ChunkedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: BodyWrite> Write for ChunkedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        write!(self.inner, "{:x}\r\n", buf.len())?;
        self.inner.write_all(buf)?;
        self.inner.write_all(b"\r\n")?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: BodyWrite> BodyWrite for ChunkedWriter<W> {
    fn close(&mut self) -> io::Result<()> {
        self.inner.write_all(b"0\r\n\r\n")?;
        self.inner.close()
    }

    fn raw_mut(&mut self) -> &mut RawWriter {
        self.inner.raw_mut()
    }
}

/// Coalesces small writes.
#[derive(Debug)]
pub struct BufferedWriter<W> {
    inner: W,
    buf: Vec<u8>,
    threshold: usize,
}

impl<W: BodyWrite> BufferedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self::with_threshold(inner, BUFFER_THRESHOLD)
    }

    pub fn with_threshold(inner: W, threshold: usize) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(threshold),
            threshold,
        }
    }

    fn flush_buf(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            self.inner.write_all(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }
}

impl<W: BodyWrite> Write for BufferedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        if self.buf.len() >= self.threshold {
            self.flush_buf()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buf()?;
        self.inner.flush()
    }
}

impl<W: BodyWrite> BodyWrite for BufferedWriter<W> {
    fn close(&mut self) -> io::Result<()> {
        self.flush_buf()?;
        self.inner.close()
    }

    fn raw_mut(&mut self) -> &mut RawWriter {
        self.inner.raw_mut()
    }
}

/// Gzip content coding.
pub struct GzipWriter<W: Write> {
    encoder: GzEncoder<W>,
}

impl<W: BodyWrite> GzipWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            encoder: GzEncoder::new(inner, Compression::new(GZIP_LEVEL)),
        }
    }
}

impl<W: BodyWrite> Write for GzipWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.encoder.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush()
    }
}

impl<W: BodyWrite> BodyWrite for GzipWriter<W> {
    fn close(&mut self) -> io::Result<()> {
        self.encoder.try_finish()?;
        self.encoder.get_mut().close()
    }

    fn raw_mut(&mut self) -> &mut RawWriter {
        self.encoder.get_mut().raw_mut()
    }
}

/// The writer stack for one response, fixed when the headers are sent.
pub enum WriterChain {
    Identity(BufferedWriter<RawWriter>),
    Chunked(BufferedWriter<ChunkedWriter<RawWriter>>),
    Gzip(GzipWriter<BufferedWriter<RawWriter>>),
    GzipChunked(GzipWriter<BufferedWriter<ChunkedWriter<RawWriter>>>),
}

impl WriterChain {
    pub fn new(chunked: bool, gzip: bool) -> Self {
        match (chunked, gzip) {
            (false, false) => Self::Identity(BufferedWriter::new(RawWriter::new())),
            (true, false) => Self::Chunked(BufferedWriter::new(ChunkedWriter::new(RawWriter::new()))),
            (false, true) => Self::Gzip(GzipWriter::new(BufferedWriter::new(RawWriter::new()))),
            (true, true) => Self::GzipChunked(GzipWriter::new(BufferedWriter::new(ChunkedWriter::new(
                RawWriter::new(),
            )))),
        }
    }

    fn layer(&mut self) -> &mut dyn BodyWrite {
        match self {
            Self::Identity(w) => w,
            Self::Chunked(w) => w,
            Self::Gzip(w) => w,
            Self::GzipChunked(w) => w,
        }
    }

    pub fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.layer().write_all(data)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.layer().flush()
    }

    pub fn close(&mut self) -> io::Result<()> {
        self.layer().close()
    }

    /// Framed bytes ready for the socket.
    pub fn take_output(&mut self) -> Vec<u8> {
        self.layer().raw_mut().take_output()
    }

    /// Framed bytes produced so far.
    pub fn bytes_out(&mut self) -> u64 {
        self.layer().raw_mut().total()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    /// Minimal chunked decoder for checking the encoder's output.
    fn dechunk(mut data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let line_end = data.windows(2).position(|w| w == b"\r\n").unwrap();
            let size = usize::from_str_radix(std::str::from_utf8(&data[..line_end]).unwrap(), 16).unwrap();
            data = &data[line_end + 2..];
            if size == 0 {
                assert_eq!(data, b"\r\n");
                return out;
            }
            out.extend_from_slice(&data[..size]);
            assert_eq!(&data[size..size + 2], b"\r\n");
            data = &data[size + 2..];
        }
    }

    fn run(chain: &mut WriterChain, writes: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for w in writes {
            chain.write_all(w).unwrap();
            out.extend(chain.take_output());
        }
        chain.close().unwrap();
        out.extend(chain.take_output());
        out
    }

    #[test]
    fn chunked_round_trip() {
        let big = vec![b'x'; 10_000];
        let writes: [&[u8]; 4] = [b"hello ", b"", b"world", &big];
        let mut chain = WriterChain::new(true, false);
        let out = run(&mut chain, &writes);
        let mut expected = b"hello world".to_vec();
        expected.extend_from_slice(&big);
        assert_eq!(dechunk(&out), expected);
        assert_eq!(chain.bytes_out(), out.len() as u64);
    }

    #[test]
    fn chunked_writer_skips_empty_writes() {
        let mut writer = ChunkedWriter::new(RawWriter::new());
        writer.write_all(b"").unwrap();
        writer.write_all(b"abc").unwrap();
        writer.close().unwrap();
        assert_eq!(writer.raw_mut().take_output(), b"3\r\nabc\r\n0\r\n\r\n");
    }

    #[test]
    fn buffering_coalesces_small_writes() {
        let mut writer = BufferedWriter::with_threshold(ChunkedWriter::new(RawWriter::new()), 8);
        writer.write_all(b"ab").unwrap();
        writer.write_all(b"cd").unwrap();
        assert!(writer.raw_mut().take_output().is_empty());
        writer.write_all(b"efgh").unwrap();
        assert_eq!(writer.raw_mut().take_output(), b"8\r\nabcdefgh\r\n");
    }

    #[test]
    fn identity_passes_bytes_through() {
        let mut chain = WriterChain::new(false, false);
        assert_eq!(run(&mut chain, &[b"plain", b" body"]), b"plain body");
    }

    #[test]
    fn gzip_chunked_decodes() {
        let body = "compress me ".repeat(500);
        let mut chain = WriterChain::new(true, true);
        let out = run(&mut chain, &[body.as_bytes()]);
        let compressed = dechunk(&out);
        assert!(compressed.len() < body.len());

        let mut decoded = String::new();
        flate2::read::GzDecoder::new(&compressed[..])
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, body);
    }
}
