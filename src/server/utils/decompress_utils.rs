use std::io::Read;

use tracing::{debug, warn};

/// Body encodings the proxy knows how to undo
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyEncoding {
    Gzip,
    Brotli,
    Zstd,
    Deflate,
}

impl BodyEncoding {
    /// parse a Content-Encoding header value, `identity` and unknown tokens are None
    pub fn from_header(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(Self::Gzip),
            "br" => Some(Self::Brotli),
            "zstd" => Some(Self::Zstd),
            "deflate" => Some(Self::Deflate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Brotli => "br",
            Self::Zstd => "zstd",
            Self::Deflate => "deflate",
        }
    }
}

/// Outcome of a decompression attempt. `decoded` tells the caller whether the
/// bytes are the decoded body or the untouched input (so it knows whether to
/// keep the upstream content-encoding header and whether caching is safe).
#[derive(Debug)]
pub struct DecodeOutcome {
    pub bytes: Vec<u8>,
    pub decoded: bool,
    pub encoding_used: Option<BodyEncoding>,
}

impl DecodeOutcome {
    fn passthrough(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            decoded: false,
            encoding_used: None,
        }
    }

    fn identity(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            decoded: true,
            encoding_used: None,
        }
    }
}

/// sniff the two encodings that have reliable magic bytes
pub fn detect_encoding(data: &[u8]) -> Option<BodyEncoding> {
    if data.starts_with(&[0x1F, 0x8B]) {
        Some(BodyEncoding::Gzip)
    } else if data.starts_with(&[0x28, 0xB5, 0x2F, 0xFD]) {
        Some(BodyEncoding::Zstd)
    } else {
        None
    }
}

fn decode_gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn decode_deflate(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = flate2::read::DeflateDecoder::new(data);
    let mut out = Vec::new();
    match decoder.read_to_end(&mut out) {
        Ok(_) => Ok(out),
        Err(raw_err) => {
            // plenty of servers send zlib-wrapped streams under "deflate"
            let mut decoder = flate2::read::ZlibDecoder::new(data);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).map_err(|_| raw_err)?;
            Ok(out)
        }
    }
}

fn decode_brotli(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = brotli::Decompressor::new(data, 4096);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn decode_zstd(data: &[u8]) -> std::io::Result<Vec<u8>> {
    zstd::decode_all(data)
}

fn decode_one(data: &[u8], encoding: BodyEncoding) -> std::io::Result<Vec<u8>> {
    match encoding {
        BodyEncoding::Gzip => decode_gzip(data),
        BodyEncoding::Brotli => decode_brotli(data),
        BodyEncoding::Zstd => decode_zstd(data),
        BodyEncoding::Deflate => decode_deflate(data),
    }
}

// fallback order when the declared codec lied
const FALLBACK_ORDER: [BodyEncoding; 4] = [
    BodyEncoding::Zstd,
    BodyEncoding::Gzip,
    BodyEncoding::Brotli,
    BodyEncoding::Deflate,
];

/// Decompress a body. With a declared encoding, that codec is tried first and
/// every other codec once on failure. Without one, gzip/zstd are sniffed by
/// magic, then brotli and deflate are attempted blind (neither has a reliable
/// magic). A body nothing can decode comes back untouched with
/// `decoded = false`; failure here is never fatal.
pub fn decompress(data: &[u8], declared: Option<BodyEncoding>) -> DecodeOutcome {
    if data.is_empty() {
        return DecodeOutcome::identity(Vec::new());
    }

    let first = match declared.or_else(|| detect_encoding(data)) {
        Some(encoding) => encoding,
        None => {
            // no header, no magic: brotli then deflate, otherwise assume plain
            for encoding in [BodyEncoding::Brotli, BodyEncoding::Deflate] {
                if let Ok(bytes) = decode_one(data, encoding) {
                    if !bytes.is_empty() {
                        debug!("auto-detected {} body", encoding.as_str());
                        return DecodeOutcome {
                            bytes,
                            decoded: true,
                            encoding_used: Some(encoding),
                        };
                    }
                }
            }
            return DecodeOutcome::identity(data.to_vec());
        }
    };

    match decode_one(data, first) {
        Ok(bytes) => DecodeOutcome {
            bytes,
            decoded: true,
            encoding_used: Some(first),
        },
        Err(e) => {
            warn!(
                "declared {} decode failed ({}), trying remaining codecs",
                first.as_str(),
                e
            );
            for encoding in FALLBACK_ORDER {
                if encoding == first {
                    continue;
                }
                if let Ok(bytes) = decode_one(data, encoding) {
                    if bytes.is_empty() {
                        continue;
                    }
                    debug!(
                        "body declared {} actually decoded as {}",
                        first.as_str(),
                        encoding.as_str()
                    );
                    return DecodeOutcome {
                        bytes,
                        decoded: true,
                        encoding_used: Some(encoding),
                    };
                }
            }
            warn!("no codec could decode body, passing original bytes through");
            DecodeOutcome::passthrough(data.to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn round_trips_every_codec() {
        let input = b"#EXTM3U\n#EXT-X-VERSION:3\nsegment-001.ts\n".repeat(20);

        let mut deflated = Vec::new();
        let mut enc =
            flate2::write::DeflateEncoder::new(&mut deflated, flate2::Compression::default());
        enc.write_all(&input).unwrap();
        enc.finish().unwrap();

        let mut brotlied = Vec::new();
        {
            let mut enc = brotli::CompressorWriter::new(&mut brotlied, 4096, 5, 22);
            enc.write_all(&input).unwrap();
        }

        let cases = [
            (gzip(&input), BodyEncoding::Gzip),
            (zstd::encode_all(&input[..], 3).unwrap(), BodyEncoding::Zstd),
            (deflated, BodyEncoding::Deflate),
            (brotlied, BodyEncoding::Brotli),
        ];

        for (encoded, encoding) in cases {
            let outcome = decompress(&encoded, Some(encoding));
            assert!(outcome.decoded, "{:?} should decode", encoding);
            assert_eq!(outcome.bytes, input);
        }
    }

    #[test]
    fn auto_detects_gzip_and_zstd_by_magic() {
        let input = b"hello hls world".repeat(100);

        let outcome = decompress(&gzip(&input), None);
        assert!(outcome.decoded);
        assert_eq!(outcome.bytes, input);
        assert_eq!(outcome.encoding_used, Some(BodyEncoding::Gzip));

        let outcome = decompress(&zstd::encode_all(&input[..], 3).unwrap(), None);
        assert!(outcome.decoded);
        assert_eq!(outcome.bytes, input);
        assert_eq!(outcome.encoding_used, Some(BodyEncoding::Zstd));
    }

    #[test]
    fn wrong_declared_codec_falls_back() {
        let input = b"#EXTM3U\nchunk-9.ts\n".repeat(50);
        let encoded = gzip(&input);

        // upstream said zstd, body is gzip
        let outcome = decompress(&encoded, Some(BodyEncoding::Zstd));
        assert!(outcome.decoded);
        assert_eq!(outcome.bytes, input);
        assert_eq!(outcome.encoding_used, Some(BodyEncoding::Gzip));
    }

    #[test]
    fn undecodable_bytes_pass_through() {
        let garbage: Vec<u8> = (0..64u8).map(|b| b.wrapping_mul(37)).collect();
        let outcome = decompress(&garbage, Some(BodyEncoding::Gzip));
        assert!(!outcome.decoded);
        assert_eq!(outcome.bytes, garbage);
    }

    #[test]
    fn header_parsing_covers_aliases() {
        assert_eq!(BodyEncoding::from_header("GZIP"), Some(BodyEncoding::Gzip));
        assert_eq!(BodyEncoding::from_header("br"), Some(BodyEncoding::Brotli));
        assert_eq!(BodyEncoding::from_header("identity"), None);
        assert_eq!(BodyEncoding::from_header("compress"), None);
    }
}
