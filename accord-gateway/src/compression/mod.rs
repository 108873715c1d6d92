//! Facade over transport compression.
//!
//! The connection either runs uncompressed, in which case every frame is a
//! complete JSON text, or as a single zlib stream spanning the connection's
//! lifetime, in which case frames are buffered until the stream's sync
//! flush sentinel and inflated into one text. Either way the rest of the
//! crate only sees "feed bytes, maybe get a JSON text back".

mod inflater;

use inflater::Inflater;
use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
};

/// Transport compression negotiated with the gateway.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompressionKind {
    /// Frames are plain JSON texts.
    None,
    /// Frames are chunks of one zlib stream per connection.
    ZlibStream,
}

/// Decompressing an inbound frame failed.
#[derive(Debug)]
pub struct CompressionError {
    pub(crate) kind: CompressionErrorType,
    pub(crate) source: Option<Box<dyn Error + Send + Sync>>,
}

impl CompressionError {
    /// Immutable reference to the type of error that occurred.
    pub const fn kind(&self) -> &CompressionErrorType {
        &self.kind
    }
}

impl Display for CompressionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self.kind {
            CompressionErrorType::Decompressing => f.write_str("a frame could not be decompressed"),
            CompressionErrorType::NotUtf8 => f.write_str("the decompressed payload isn't UTF-8"),
        }
    }
}

impl Error for CompressionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| &**source as &(dyn Error + 'static))
    }
}

/// Type of [`CompressionError`] that occurred.
#[derive(Debug)]
#[non_exhaustive]
pub enum CompressionErrorType {
    /// The zlib stream rejected the frame's data.
    Decompressing,
    /// The payload decoded to bytes that aren't valid UTF-8.
    NotUtf8,
}

/// Streaming decompressor of inbound frames.
#[derive(Debug)]
pub struct Decompressor {
    inflater: Option<Inflater>,
}

impl Decompressor {
    pub(crate) fn new(kind: CompressionKind, shard: [u64; 2]) -> Self {
        Self {
            inflater: matches!(kind, CompressionKind::ZlibStream).then(|| Inflater::new(shard)),
        }
    }

    /// Compression mode the decompressor runs in.
    pub fn kind(&self) -> CompressionKind {
        if self.inflater.is_some() {
            CompressionKind::ZlibStream
        } else {
            CompressionKind::None
        }
    }

    /// Feed one inbound frame, returning a complete JSON text if the frame
    /// finished a message.
    pub(crate) fn decompress(&mut self, frame: &[u8]) -> Result<Option<String>, CompressionError> {
        let Some(inflater) = self.inflater.as_mut() else {
            let text = std::str::from_utf8(frame).map_err(|source| CompressionError {
                kind: CompressionErrorType::NotUtf8,
                source: Some(Box::new(source)),
            })?;

            return Ok(Some(text.to_owned()));
        };

        inflater.extend(frame);

        match inflater.msg() {
            Ok(Some(bytes)) => {
                let text = std::str::from_utf8(bytes)
                    .map(ToOwned::to_owned)
                    .map_err(|source| CompressionError {
                        kind: CompressionErrorType::NotUtf8,
                        source: Some(Box::new(source)),
                    });

                // the accumulator must survive partial messages; only a
                // completed message resets it
                inflater.clear();

                text.map(Some)
            }
            Ok(None) => Ok(None),
            Err(source) => Err(CompressionError {
                kind: CompressionErrorType::Decompressing,
                source: Some(Box::new(source)),
            }),
        }
    }

    /// Reset to a fresh stream state. Must be called between connections.
    pub(crate) fn reset(&mut self) {
        if let Some(inflater) = self.inflater.as_mut() {
            inflater.reset();
        }
    }

    /// Release the buffers for good.
    pub(crate) fn shutdown(&mut self) {
        self.inflater = None;
    }
}

/// Append the compression query parameter to a gateway URL when enabled.
pub(crate) fn add_url_feature(url: &mut String, kind: CompressionKind) {
    if kind == CompressionKind::ZlibStream {
        url.push_str("&compress=zlib-stream");
    }
}

#[cfg(test)]
mod tests {
    use super::{CompressionErrorType, CompressionKind, Decompressor};
    use flate2::{Compress, Compression, FlushCompress};
    use static_assertions::assert_impl_all;
    use std::fmt::Debug;

    assert_impl_all!(Decompressor: Debug, Send, Sync);
    assert_impl_all!(CompressionKind: Clone, Copy, Debug, Eq, PartialEq, Send, Sync);

    fn deflate(compress: &mut Compress, text: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(text.len() + 64);
        compress
            .compress_vec(text.as_bytes(), &mut out, FlushCompress::Sync)
            .unwrap();

        out
    }

    #[test]
    fn plain_mode_passes_text_through() {
        let mut decompressor = Decompressor::new(CompressionKind::None, [0, 1]);

        assert_eq!(CompressionKind::None, decompressor.kind());
        assert_eq!(
            Some(r#"{"op":11}"#.to_owned()),
            decompressor.decompress(br#"{"op":11}"#).unwrap(),
        );
    }

    #[test]
    fn zlib_stream_reassembles_messages() {
        let mut compress = Compress::new(Compression::default(), true);
        let mut decompressor = Decompressor::new(CompressionKind::ZlibStream, [0, 1]);

        let first = deflate(&mut compress, r#"{"op":10,"d":{"heartbeat_interval":41250}}"#);

        // split one message across three frames; the accumulator must
        // survive every partial frame and only the last completes it
        let (head, rest) = first.split_at(first.len() / 3);
        let (middle, tail) = rest.split_at(rest.len() / 2);
        assert_eq!(None, decompressor.decompress(head).unwrap());
        assert_eq!(None, decompressor.decompress(middle).unwrap());
        assert_eq!(
            Some(r#"{"op":10,"d":{"heartbeat_interval":41250}}"#.to_owned()),
            decompressor.decompress(tail).unwrap(),
        );

        // the stream keeps working for the next message
        let second = deflate(&mut compress, r#"{"op":11}"#);
        assert_eq!(
            Some(r#"{"op":11}"#.to_owned()),
            decompressor.decompress(&second).unwrap(),
        );
    }

    #[test]
    fn malformed_stream_errors() {
        let mut decompressor = Decompressor::new(CompressionKind::ZlibStream, [0, 1]);

        let error = decompressor
            .decompress(&[0x12, 0x34, 0x00, 0x00, 0xff, 0xff])
            .unwrap_err();

        assert!(matches!(
            error.kind(),
            CompressionErrorType::Decompressing
        ));
    }

    #[test]
    fn url_feature() {
        let mut url = String::from("wss://gateway.example/?encoding=json&v=6");
        super::add_url_feature(&mut url, CompressionKind::None);
        assert!(!url.contains("compress"));

        super::add_url_feature(&mut url, CompressionKind::ZlibStream);
        assert!(url.ends_with("&compress=zlib-stream"));
    }
}
