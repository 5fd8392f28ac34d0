use std::io::Cursor;

use async_compression::Level;
use async_compression::tokio::bufread::ZstdDecoder;
use async_compression::tokio::write::ZstdEncoder;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};

/// Bodies are compressed once at write time but decompressed on every hit,
/// so ratio wins over encode speed.
const COMPRESSION_LEVEL: i32 = 19;

#[derive(Debug, Error)]
#[error("zstd codec failure: {0}")]
pub struct CodecError(#[from] std::io::Error);

/// A lazy reader over the decompressed bytes of a stored body.
pub type BodyReader = ZstdDecoder<BufReader<Cursor<Vec<u8>>>>;

pub async fn compress(body: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = ZstdEncoder::with_quality(Vec::new(), Level::Precise(COMPRESSION_LEVEL));
    encoder.write_all(body).await?;
    encoder.shutdown().await?;
    Ok(encoder.into_inner())
}

/// Streams the decompressed body without materializing it. Reads fail with
/// an I/O error if the input is not valid zstd data, which for self-produced
/// records signals corruption.
pub fn decompress_reader(compressed: Vec<u8>) -> BodyReader {
    ZstdDecoder::new(BufReader::new(Cursor::new(compressed)))
}

pub async fn decompress(compressed: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = decompress_reader(compressed.to_vec());
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).await?;
    Ok(out)
}

/// Hex digest of the uncompressed body, stored on the record for integrity
/// checks and future dedup use.
pub fn content_hash(body: &[u8]) -> String {
    blake3::hash(body).to_hex().to_string()
}
