#[cfg(feature = "zlib-compression")]
use std::convert::TryInto;
use std::str::FromStr;

use crate::error::{Error, ErrorKind, Result};

#[cfg(feature = "zlib-compression")]
use flate2::{
    write::{ZlibDecoder, ZlibEncoder},
    Compression,
};
#[cfg(feature = "zlib-compression")]
use std::io::Write;

/// The identifiers assigned to each compression algorithm by the wire protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CompressorId {
    Noop = 0,
    Snappy = 1,
    Zlib = 2,
    Zstd = 3,
}

impl CompressorId {
    pub(crate) fn from_u8(id: u8) -> Result<Self> {
        match id {
            0 => Ok(CompressorId::Noop),
            1 => Ok(CompressorId::Snappy),
            2 => Ok(CompressorId::Zlib),
            3 => Ok(CompressorId::Zstd),
            other => Err(Error::invalid_response(format!(
                "invalid compressor id: {}",
                other
            ))),
        }
    }
}

/// Enum representing supported compressor algorithms.
/// Used for compressing and decompressing messages sent to and read from the server.
/// For compressors that take a `level`, use `None` to indicate the default level.
/// Higher `level` indicates more compression (and slower).
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
#[allow(dead_code)]
pub enum Compressor {
    /// Zstd compressor. Requires the `zstd-compression` feature flag.
    #[cfg(feature = "zstd-compression")]
    Zstd {
        /// The compression level to use.
        level: Option<i32>,
    },

    /// Zlib compressor. Requires the `zlib-compression` feature flag.
    #[cfg(feature = "zlib-compression")]
    Zlib {
        /// The compression level to use.
        level: Option<i32>,
    },

    /// Snappy compressor. Requires the `snappy-compression` feature flag.
    #[cfg(feature = "snappy-compression")]
    Snappy,
}

impl FromStr for Compressor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            #[cfg(feature = "zstd-compression")]
            "zstd" => Ok(Compressor::Zstd { level: None }),
            #[cfg(feature = "zlib-compression")]
            "zlib" => Ok(Compressor::Zlib { level: None }),
            #[cfg(feature = "snappy-compression")]
            "snappy" => Ok(Compressor::Snappy),
            other => Err(ErrorKind::InvalidArgument {
                message: format!("unsupported compressor: {}", other),
            }
            .into()),
        }
    }
}

impl Compressor {
    pub(crate) fn name(&self) -> &'static str {
        match *self {
            #[cfg(feature = "zstd-compression")]
            Compressor::Zstd { .. } => "zstd",
            #[cfg(feature = "zlib-compression")]
            Compressor::Zlib { .. } => "zlib",
            #[cfg(feature = "snappy-compression")]
            Compressor::Snappy => "snappy",
        }
    }

    pub(crate) fn id(&self) -> CompressorId {
        match *self {
            #[cfg(feature = "zstd-compression")]
            Compressor::Zstd { .. } => CompressorId::Zstd,
            #[cfg(feature = "zlib-compression")]
            Compressor::Zlib { .. } => CompressorId::Zlib,
            #[cfg(feature = "snappy-compression")]
            Compressor::Snappy => CompressorId::Snappy,
        }
    }

    pub(crate) fn compress(&self, section_bytes: &[u8]) -> Result<Vec<u8>> {
        match *self {
            #[cfg(feature = "zstd-compression")]
            Compressor::Zstd { level } => {
                zstd::encode_all(section_bytes, level.unwrap_or(zstd::DEFAULT_COMPRESSION_LEVEL))
                    .map_err(|e| {
                        ErrorKind::Internal {
                            message: format!("an error occurred compressing a message: {}", e),
                        }
                        .into()
                    })
            }
            #[cfg(feature = "zlib-compression")]
            Compressor::Zlib { level } => {
                let level = match level {
                    Some(level) => Compression::new(level.try_into().map_err(|e| {
                        Error::invalid_argument(format!("invalid zlib level: {}", e))
                    })?),
                    None => Compression::default(),
                };
                let mut encoder = ZlibEncoder::new(Vec::new(), level);
                encoder.write_all(section_bytes).and_then(|_| encoder.finish()).map_err(|e| {
                    ErrorKind::Internal {
                        message: format!("an error occurred compressing a message: {}", e),
                    }
                    .into()
                })
            }
            #[cfg(feature = "snappy-compression")]
            Compressor::Snappy => {
                let mut encoder = snap::raw::Encoder::new();
                encoder.compress_vec(section_bytes).map_err(|e| {
                    ErrorKind::Internal {
                        message: format!("an error occurred compressing a message: {}", e),
                    }
                    .into()
                })
            }
        }
    }
}

/// Decompresses the payload of an OP_COMPRESSED message, validating the advertised
/// uncompressed length.
pub(crate) fn decompress(
    compressor_id: CompressorId,
    uncompressed_size: i32,
    source: &[u8],
) -> Result<Vec<u8>> {
    let decompressed = match compressor_id {
        CompressorId::Noop => source.to_vec(),
        #[cfg(feature = "zstd-compression")]
        CompressorId::Zstd => zstd::decode_all(source).map_err(|e| {
            Error::invalid_response(format!("failed to decompress zstd message: {}", e))
        })?,
        #[cfg(feature = "zlib-compression")]
        CompressorId::Zlib => {
            let mut decoder = ZlibDecoder::new(Vec::new());
            decoder
                .write_all(source)
                .and_then(|_| decoder.finish())
                .map_err(|e| {
                    Error::invalid_response(format!("failed to decompress zlib message: {}", e))
                })?
        }
        #[cfg(feature = "snappy-compression")]
        CompressorId::Snappy => {
            let mut decoder = snap::raw::Decoder::new();
            decoder.decompress_vec(source).map_err(|e| {
                Error::invalid_response(format!("failed to decompress snappy message: {}", e))
            })?
        }
        #[allow(unreachable_patterns)]
        other => {
            return Err(Error::invalid_response(format!(
                "server sent a reply compressed with {:?}, but the matching compression feature \
                 is not enabled",
                other
            )))
        }
    };

    if decompressed.len() != uncompressed_size as usize {
        return Err(Error::invalid_response(format!(
            "decompressed message length {} does not match the advertised length {}",
            decompressed.len(),
            uncompressed_size
        )));
    }

    Ok(decompressed)
}
