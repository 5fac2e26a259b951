//! Compression negotiation and OP_COMPRESSED framing (`spec.md` §4.2/§6).
//! The server advertises a list of supported compressors in its `hello`
//! reply; the client picks the first entry of its own `compressors` option
//! that the server also lists, then wraps/unwraps a single compressed
//! payload per message.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    #[cfg(feature = "compression")]
    Zstd,
    #[cfg(feature = "compression-zlib")]
    Zlib,
    #[cfg(feature = "compression-snappy")]
    Snappy,
}

impl Compressor {
    pub fn id(self) -> u8 {
        match self {
            #[cfg(feature = "compression")]
            Compressor::Zstd => 3,
            #[cfg(feature = "compression-zlib")]
            Compressor::Zlib => 2,
            #[cfg(feature = "compression-snappy")]
            Compressor::Snappy => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            #[cfg(feature = "compression")]
            Compressor::Zstd => "zstd",
            #[cfg(feature = "compression-zlib")]
            Compressor::Zlib => "zlib",
            #[cfg(feature = "compression-snappy")]
            Compressor::Snappy => "snappy",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            #[cfg(feature = "compression")]
            "zstd" => Some(Compressor::Zstd),
            #[cfg(feature = "compression-zlib")]
            "zlib" => Some(Compressor::Zlib),
            #[cfg(feature = "compression-snappy")]
            "snappy" => Some(Compressor::Snappy),
            _ => None,
        }
    }

    /// Wraps an already-framed OP_MSG body into an OP_COMPRESSED payload:
    /// `originalOpcode:i32 | uncompressedSize:i32 | compressorId:u8 | compressedMessage`.
    pub fn wrap(self, message_body: &[u8], original_opcode: i32) -> Result<Vec<u8>> {
        let compressed = self.compress(message_body)?;
        let mut out = Vec::with_capacity(9 + compressed.len());
        out.extend_from_slice(&original_opcode.to_le_bytes());
        out.extend_from_slice(&(message_body.len() as i32).to_le_bytes());
        out.push(self.id());
        out.extend_from_slice(&compressed);
        Ok(out)
    }

    fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            #[cfg(feature = "compression")]
            Compressor::Zstd => zstd::stream::encode_all(data, 0)
                .map_err(|e| Error::Network(e)),
            #[cfg(feature = "compression-zlib")]
            Compressor::Zlib => {
                use std::io::Write;
                let mut encoder =
                    flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data).map_err(Error::Network)?;
                encoder.finish().map_err(Error::Network)
            }
            #[cfg(feature = "compression-snappy")]
            Compressor::Snappy => {
                let mut encoder = snap::raw::Encoder::new();
                encoder
                    .compress_vec(data)
                    .map_err(|e| Error::InvalidArgument(e.to_string()))
            }
        }
    }
}

/// Picks the first of `client_preference` (in order) that `server_supported`
/// (names as advertised in `hello`'s `compression` array) also lists.
pub fn negotiate_compressor(
    client_preference: &[String],
    server_supported: &[String],
) -> Option<Compressor> {
    client_preference
        .iter()
        .find(|name| server_supported.iter().any(|s| s == *name))
        .and_then(|name| Compressor::from_name(name))
}

/// Unwraps an OP_COMPRESSED payload back into the inner OP_MSG message body
/// (flagBits + sections).
pub fn unwrap(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() < 9 {
        return Err(Error::Network(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "OP_COMPRESSED header truncated",
        )));
    }
    let uncompressed_size = i32::from_le_bytes(payload[4..8].try_into().unwrap());
    let compressor_id = payload[8];
    let compressed = &payload[9..];

    match compressor_id {
        #[cfg(feature = "compression")]
        3 => zstd::stream::decode_all(compressed).map_err(Error::Network),
        #[cfg(feature = "compression-zlib")]
        2 => {
            use std::io::Read;
            let mut decoder = flate2::read::ZlibDecoder::new(compressed);
            let mut out = Vec::with_capacity(uncompressed_size.max(0) as usize);
            decoder.read_to_end(&mut out).map_err(Error::Network)?;
            Ok(out)
        }
        #[cfg(feature = "compression-snappy")]
        1 => {
            let mut decoder = snap::raw::Decoder::new();
            decoder
                .decompress_vec(compressed)
                .map_err(|e| Error::InvalidArgument(e.to_string()))
        }
        other => Err(Error::Network(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unsupported compressor id {other}"),
        ))),
    }
}
