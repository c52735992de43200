use std::io::{self, Read, Write};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};

/// A byte-level compression codec.
///
/// `content_encoding` is the tag stored alongside objects written with this
/// codec, and is how a reader decides whether a body needs decoding.
pub trait Codec: Send + Sync {
    fn content_encoding(&self) -> &'static str;

    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> io::Result<Vec<u8>>;
}

pub const GZIP_ENCODING: &str = "gzip";

#[derive(Debug, Clone, Copy)]
pub struct GzipCodec {
    level: Compression,
}

impl GzipCodec {
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }
}

impl Default for GzipCodec {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl Codec for GzipCodec {
    fn content_encoding(&self) -> &'static str {
        GZIP_ENCODING
    }

    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), self.level);
        encoder.write_all(data)?;
        encoder.finish()
    }

    fn decompress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }
}
