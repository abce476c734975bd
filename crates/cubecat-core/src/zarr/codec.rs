//! Chunk compression codecs.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::dataset::Compressor;
use crate::error::{Error, Result};

const DEFAULT_ZLIB_LEVEL: u32 = 1;

/// Compress raw chunk bytes with the configured codec.
pub fn compress(data: &[u8], compressor: Option<&Compressor>) -> Result<Vec<u8>> {
    let Some(compressor) = compressor else {
        return Ok(data.to_vec());
    };
    match compressor.id() {
        "zlib" => {
            let level = compressor.level().unwrap_or(DEFAULT_ZLIB_LEVEL);
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level));
            encoder
                .write_all(data)
                .and_then(|_| encoder.finish())
                .map_err(|e| Error::internal(format!("zlib compression failed: {e}")))
        }
        other => Err(Error::config(format!("unsupported compressor {other:?}"))),
    }
}

/// Decompress chunk bytes; `expected_len` is the raw chunk byte count.
pub fn decompress(
    data: &[u8],
    compressor: Option<&Compressor>,
    expected_len: usize,
) -> Result<Vec<u8>> {
    let Some(compressor) = compressor else {
        return Ok(data.to_vec());
    };
    match compressor.id() {
        "zlib" => {
            let mut out = Vec::with_capacity(expected_len);
            ZlibDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| Error::internal(format!("zlib decompression failed: {e}")))?;
            Ok(out)
        }
        other => Err(Error::config(format!("unsupported compressor {other:?}"))),
    }
}
