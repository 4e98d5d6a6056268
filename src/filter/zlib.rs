use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use super::block::{BlockCodec, MAX_BLOCK_LEN};
use super::{FilterDescription, ZLIB_FILTER_ID};
use crate::errors::{Error, ErrorCode};

static DESCRIPTION: FilterDescription = FilterDescription {
    name: "zlib",
    id: ZLIB_FILTER_ID,
    critical: true,
};

/// zlib compression of whole blocks
#[derive(Debug, Clone, Copy)]
pub struct ZlibCodec {
    level: Compression,
}

impl Default for ZlibCodec {
    fn default() -> Self {
        ZlibCodec {
            level: Compression::default(),
        }
    }
}

impl ZlibCodec {
    /// compression level 0..=9
    pub fn new(level: u32) -> Self {
        ZlibCodec {
            level: Compression::new(level),
        }
    }
}

impl BlockCodec for ZlibCodec {
    fn description(&self) -> &'static FilterDescription {
        &DESCRIPTION
    }

    fn seal(&mut self, clear: &[u8]) -> Result<Vec<u8>, Error> {
        let deflate = |e: std::io::Error| Error::filter(ErrorCode::ZLIB_DEFLATE, e.to_string());
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(clear.len() / 2 + 16), self.level);
        encoder.write_all(clear).map_err(deflate)?;
        encoder.finish().map_err(deflate)
    }

    fn open(&mut self, block: &[u8]) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(block.len() * 2);
        ZlibDecoder::new(block)
            .take(MAX_BLOCK_LEN as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| Error::filter(ErrorCode::ZLIB_INFLATE, e.to_string()))?;
        if out.len() > MAX_BLOCK_LEN {
            return Err(Error::filter(
                ErrorCode::ZLIB_INFLATE,
                "inflated block exceeds the size limit",
            ));
        }
        Ok(out)
    }
}
