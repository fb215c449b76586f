//! Session text encodings.
//!
//! Maps the server-reported `client_encoding` name to a local codec through
//! a closed lookup table. Unknown names and `SQL_ASCII` fall back to strict
//! ASCII; names the server supports but for which no local codec exists
//! (such as `EUC_TW`) are rejected with `NotSupported` when used.

use encoding_rs::Encoding;

use crate::error::{Error, Result};

/// A resolved local codec for the session encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Strict 7-bit ASCII.
    Ascii,
    /// UTF-8, validated on decode.
    Utf8,
    /// Any other supported encoding, via `encoding_rs`.
    Other(&'static Encoding),
}

impl Codec {
    /// Name of the local codec.
    pub fn name(&self) -> &'static str {
        match self {
            Codec::Ascii => "ascii",
            Codec::Utf8 => "utf-8",
            Codec::Other(enc) => enc.name(),
        }
    }

    /// Decode server bytes into a string.
    pub fn decode(&self, bytes: &[u8]) -> Result<String> {
        match self {
            Codec::Ascii => {
                if bytes.is_ascii() {
                    Ok(String::from_utf8_lossy(bytes).into_owned())
                } else {
                    Err(Error::NotSupported(
                        "non-ascii data in an ascii session".into(),
                    ))
                }
            }
            Codec::Utf8 => match simdutf8::basic::from_utf8(bytes) {
                Ok(s) => Ok(s.to_owned()),
                Err(_) => Err(Error::Operational(
                    "invalid byte sequence for encoding UTF8".into(),
                )),
            },
            Codec::Other(enc) => {
                let (decoded, had_errors) = enc.decode_without_bom_handling(bytes);
                if had_errors {
                    Err(Error::Operational(format!(
                        "invalid byte sequence for encoding {}",
                        enc.name()
                    )))
                } else {
                    Ok(decoded.into_owned())
                }
            }
        }
    }

    /// Encode a string into server bytes.
    pub fn encode(&self, s: &str) -> Result<Vec<u8>> {
        match self {
            Codec::Ascii => {
                if s.is_ascii() {
                    Ok(s.as_bytes().to_vec())
                } else {
                    Err(Error::NotSupported(
                        "non-ascii data in an ascii session".into(),
                    ))
                }
            }
            Codec::Utf8 => Ok(s.as_bytes().to_vec()),
            Codec::Other(enc) => {
                let (encoded, _, had_unmappable) = enc.encode(s);
                if had_unmappable {
                    Err(Error::NotSupported(format!(
                        "data not representable in encoding {}",
                        enc.name()
                    )))
                } else {
                    Ok(encoded.into_owned())
                }
            }
        }
    }
}

/// Resolve a server encoding name to a local codec.
///
/// The table is closed: postgres encodings with no local counterpart are
/// rejected, anything else falls back to strict ASCII.
pub(crate) fn codec_for(pgenc: &str) -> Result<Codec> {
    use encoding_rs::*;

    let name = pgenc.to_ascii_uppercase();
    let codec = match name.as_str() {
        "UTF8" => Codec::Utf8,
        "SQL_ASCII" => Codec::Ascii,
        // windows-1252 and windows-1254 are the WHATWG supersets of the
        // postgres LATIN1 and LATIN5 charsets.
        "LATIN1" | "WIN1252" => Codec::Other(WINDOWS_1252),
        "LATIN2" => Codec::Other(ISO_8859_2),
        "LATIN3" => Codec::Other(ISO_8859_3),
        "LATIN4" => Codec::Other(ISO_8859_4),
        "LATIN5" => Codec::Other(WINDOWS_1254),
        "LATIN7" => Codec::Other(ISO_8859_13),
        "LATIN9" => Codec::Other(ISO_8859_15),
        "ISO_8859_5" => Codec::Other(ISO_8859_5),
        "ISO_8859_6" => Codec::Other(ISO_8859_6),
        "ISO_8859_7" => Codec::Other(ISO_8859_7),
        "ISO_8859_8" => Codec::Other(ISO_8859_8),
        "WIN1250" => Codec::Other(WINDOWS_1250),
        "WIN1251" => Codec::Other(WINDOWS_1251),
        "WIN1253" => Codec::Other(WINDOWS_1253),
        "WIN1254" => Codec::Other(WINDOWS_1254),
        "WIN1255" => Codec::Other(WINDOWS_1255),
        "WIN1256" => Codec::Other(WINDOWS_1256),
        "WIN1257" => Codec::Other(WINDOWS_1257),
        "WIN1258" => Codec::Other(WINDOWS_1258),
        "WIN866" => Codec::Other(IBM866),
        "KOI8R" => Codec::Other(KOI8_R),
        "KOI8U" => Codec::Other(KOI8_U),
        "EUC_JP" => Codec::Other(EUC_JP),
        "EUC_KR" => Codec::Other(EUC_KR),
        "SJIS" => Codec::Other(SHIFT_JIS),
        "BIG5" => Codec::Other(BIG5),
        "GBK" => Codec::Other(GBK),
        "GB18030" => Codec::Other(GB18030),
        // Encodings the server speaks but we have no local codec for.
        "EUC_TW" | "EUC_JIS_2004" | "SHIFT_JIS_2004" | "MULE_INTERNAL" | "LATIN6" | "LATIN8"
        | "LATIN10" => {
            return Err(Error::NotSupported(format!(
                "no local codec for client_encoding {name}"
            )));
        }
        _ => Codec::Ascii,
    };
    Ok(codec)
}
