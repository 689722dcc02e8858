//! Request encoding and response decoding per batch shape
//!
//! A [`Codec`] turns a typed request into exactly one request line and turns
//! the response line(s) back into a typed value. Decoding never falls back
//! to a default: anything that does not match the expected shape is a
//! [`ProtocolError`].

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::batch::BatchShape;
use crate::types::{MetadataQuery, MetadataRecord};

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Request contains a line break: {0:?}")]
    EmbeddedNewline(String),
    #[error("Failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Malformed JSON response {line:?}: {source}")]
    Json {
        line: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Malformed key/value pair {pair:?} in response {line:?}")]
    MalformedPair { line: String, pair: String },
    #[error("Expected {expected} response line(s), got {got}")]
    MissingLines { expected: usize, got: usize },
}

/// Encoding/decoding rules for one batch shape.
pub trait Codec {
    type Request: ?Sized;
    type Response;

    /// Shape of the batch commands this codec speaks.
    const SHAPE: BatchShape;

    /// Encode a request as one line, without the trailing newline.
    fn encode(&self, request: &Self::Request) -> Result<String, ProtocolError>;

    /// Number of response lines one request produces.
    fn response_lines(&self, _request: &Self::Request) -> usize {
        1
    }

    fn decode(&self, lines: &[String]) -> Result<Self::Response, ProtocolError>;
}

fn single_line(line: &str) -> Result<(), ProtocolError> {
    if line.contains(['\n', '\r']) {
        return Err(ProtocolError::EmbeddedNewline(line.to_string()));
    }
    Ok(())
}

fn first(lines: &[String], expected: usize) -> Result<&str, ProtocolError> {
    lines
        .first()
        .map(String::as_str)
        .ok_or(ProtocolError::MissingLines {
            expected,
            got: lines.len(),
        })
}

/// One argument in, one trimmed line out.
///
/// Used by `lookupkey`, `calckey` and `contentlocation`; an empty response
/// means "nothing found" and is left for the caller to interpret.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawCodec;

impl Codec for RawCodec {
    type Request = str;
    type Response = String;
    const SHAPE: BatchShape = BatchShape::Raw;

    fn encode(&self, request: &str) -> Result<String, ProtocolError> {
        single_line(request)?;
        Ok(request.to_string())
    }

    fn decode(&self, lines: &[String]) -> Result<String, ProtocolError> {
        Ok(first(lines, 1)?.trim().to_string())
    }
}

/// Serde-backed JSON line codec.
///
/// `Q` is serialized to one compact JSON line, the response line is
/// deserialized as `R`. A `null` response only decodes if `R` accepts it
/// (e.g. `Option<T>`).
pub struct JsonCodec<Q, R> {
    _types: PhantomData<fn(&Q) -> R>,
}

impl<Q, R> JsonCodec<Q, R> {
    pub fn new() -> Self {
        Self {
            _types: PhantomData,
        }
    }
}

impl<Q, R> Default for JsonCodec<Q, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Q, R> std::fmt::Debug for JsonCodec<Q, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("JsonCodec")
    }
}

impl<Q: Serialize, R: DeserializeOwned> Codec for JsonCodec<Q, R> {
    type Request = Q;
    type Response = R;
    const SHAPE: BatchShape = BatchShape::Json;

    fn encode(&self, request: &Q) -> Result<String, ProtocolError> {
        // serde_json escapes control characters, so the line is always single
        serde_json::to_string(request).map_err(ProtocolError::Encode)
    }

    fn decode(&self, lines: &[String]) -> Result<R, ProtocolError> {
        let line = first(lines, 1)?;
        serde_json::from_str(line).map_err(|source| ProtocolError::Json {
            line: line.to_string(),
            source,
        })
    }
}

/// Codec for `metadata --batch --json`.
pub type MetadataCodec = JsonCodec<MetadataQuery, MetadataRecord>;

/// One argument in, one line of delimited `name=value` pairs out.
///
/// Pairs keep the order the tool printed them in. A value may itself
/// contain the key/value separator; only the first one splits.
#[derive(Debug, Clone, Copy)]
pub struct KeyValueCodec {
    pair_separator: char,
    kv_separator: char,
}

impl KeyValueCodec {
    pub fn new(pair_separator: char, kv_separator: char) -> Self {
        Self {
            pair_separator,
            kv_separator,
        }
    }
}

impl Default for KeyValueCodec {
    /// Tab-separated `name=value` pairs.
    fn default() -> Self {
        Self::new('\t', '=')
    }
}

impl Codec for KeyValueCodec {
    type Request = str;
    type Response = Vec<(String, String)>;
    const SHAPE: BatchShape = BatchShape::KeyValue;

    fn encode(&self, request: &str) -> Result<String, ProtocolError> {
        single_line(request)?;
        Ok(request.to_string())
    }

    fn decode(&self, lines: &[String]) -> Result<Vec<(String, String)>, ProtocolError> {
        let line = first(lines, 1)?;
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }

        trimmed
            .split(self.pair_separator)
            .map(|pair| {
                pair.split_once(self.kv_separator)
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .filter(|(k, _)| !k.is_empty())
                    .ok_or_else(|| ProtocolError::MalformedPair {
                        line: line.to_string(),
                        pair: pair.to_string(),
                    })
            })
            .collect()
    }
}
