//! Message body codec applied uniformly to every data frame of a link.

use crate::config::LinkConfig;
use crate::{MeshError, Result};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Compression applied to serialized envelopes before they hit the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    None,
    Deflate,
}

impl Codec {
    pub fn encode(&self, text: &str) -> Result<Vec<u8>> {
        match self {
            Codec::None => Ok(text.as_bytes().to_vec()),
            Codec::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(text.as_bytes())?;
                Ok(encoder.finish()?)
            }
        }
    }

    /// Decode a frame body back to text. Non-UTF-8 output is an error, as
    /// is a body inflating past the maximum frame size.
    pub fn decode(&self, body: &[u8]) -> Result<String> {
        self.decode_within(body, LinkConfig::MAX_FRAME_SIZE)
    }

    fn decode_within(&self, body: &[u8], limit: usize) -> Result<String> {
        let bytes = match self {
            Codec::None => body.to_vec(),
            Codec::Deflate => {
                let mut out = Vec::new();
                DeflateDecoder::new(body)
                    .take(limit as u64 + 1)
                    .read_to_end(&mut out)
                    .map_err(|e| MeshError::Codec {
                        message: format!("inflate failed: {}", e),
                    })?;
                if out.len() > limit {
                    return Err(MeshError::Codec {
                        message: format!("inflated body exceeds {} bytes", limit),
                    });
                }
                out
            }
        };
        String::from_utf8(bytes).map_err(|_| MeshError::Codec {
            message: "frame body is not valid UTF-8".to_string(),
        })
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Codec::None => write!(f, "none"),
            Codec::Deflate => write!(f, "deflate"),
        }
    }
}
