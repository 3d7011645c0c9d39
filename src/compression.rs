//! compression framing for archives
//!
//! each mode fixes the blob path suffix and the stream wrappers used on both
//! upload and download, so an archiver never mixes modes.

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// archive compression mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    #[default]
    Gzip,
    Lz4,
}

impl CompressionMode {
    /// blob path suffix, without the leading dot
    pub fn suffix(&self) -> &'static str {
        match self {
            CompressionMode::Gzip => "tgz",
            CompressionMode::Lz4 => "tar.lz4",
        }
    }

    /// wrap a sink with the compressor for this mode
    pub fn encoder<W: Write>(&self, inner: W) -> Encoder<W> {
        match self {
            CompressionMode::Gzip => Encoder::Gzip(GzEncoder::new(inner, Compression::default())),
            CompressionMode::Lz4 => Encoder::Lz4(FrameEncoder::new(inner)),
        }
    }

    /// wrap a source with the decompressor for this mode
    pub fn decoder<'a, R: Read + 'a>(&self, inner: R) -> Box<dyn Read + 'a> {
        match self {
            // gzip streams may be concatenated members
            CompressionMode::Gzip => Box::new(MultiGzDecoder::new(inner)),
            CompressionMode::Lz4 => Box::new(FrameDecoder::new(inner)),
        }
    }
}

impl fmt::Display for CompressionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionMode::Gzip => write!(f, "gzip"),
            CompressionMode::Lz4 => write!(f, "lz4"),
        }
    }
}

impl FromStr for CompressionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gzip" | "gz" | "tgz" => Ok(CompressionMode::Gzip),
            "lz4" => Ok(CompressionMode::Lz4),
            _ => Err(Error::InvalidCompression(s.to_string())),
        }
    }
}

/// compressing writer; `finish` must be called to write the trailer
pub enum Encoder<W: Write> {
    Gzip(GzEncoder<W>),
    Lz4(FrameEncoder<W>),
}

impl<W: Write> Encoder<W> {
    /// flush the compression trailer and return the inner sink
    pub fn finish(self) -> io::Result<W> {
        match self {
            Encoder::Gzip(enc) => enc.finish(),
            Encoder::Lz4(enc) => enc.finish().map_err(io::Error::from),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::Gzip(enc) => enc.write(buf),
            Encoder::Lz4(enc) => enc.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::Gzip(enc) => enc.flush(),
            Encoder::Lz4(enc) => enc.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compress(mode: CompressionMode, data: &[u8]) -> Vec<u8> {
        let mut enc = mode.encoder(Vec::new());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn test_suffixes() {
        assert_eq!(CompressionMode::Gzip.suffix(), "tgz");
        assert_eq!(CompressionMode::Lz4.suffix(), "tar.lz4");
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!("gzip".parse::<CompressionMode>().unwrap(), CompressionMode::Gzip);
        assert_eq!("LZ4".parse::<CompressionMode>().unwrap(), CompressionMode::Lz4);
        assert!(matches!(
            "zstd".parse::<CompressionMode>(),
            Err(Error::InvalidCompression(_))
        ));
    }

    #[test]
    fn test_framing_is_mode_specific() {
        let gz = compress(CompressionMode::Gzip, b"payload");
        let lz = compress(CompressionMode::Lz4, b"payload");

        // gzip magic vs lz4 frame magic (little endian 0x184D2204)
        assert_eq!(&gz[..2], &[0x1f, 0x8b]);
        assert_eq!(&lz[..4], &[0x04, 0x22, 0x4d, 0x18]);

        let mut out = Vec::new();
        CompressionMode::Lz4
            .decoder(&lz[..])
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, b"payload");
    }

    #[test]
    fn test_wrong_mode_fails_to_decode() {
        let gz = compress(CompressionMode::Gzip, b"payload");
        let mut out = Vec::new();
        assert!(CompressionMode::Lz4
            .decoder(&gz[..])
            .read_to_end(&mut out)
            .is_err());
    }

    #[test]
    fn test_serde_lowercase() {
        #[derive(Serialize, Deserialize)]
        struct Wrap {
            mode: CompressionMode,
        }
        let s = toml::to_string(&Wrap {
            mode: CompressionMode::Lz4,
        })
        .unwrap();
        assert_eq!(s.trim(), "mode = \"lz4\"");
    }
}
