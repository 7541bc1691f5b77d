//! Stream construction options

use serde::{Deserialize, Serialize};

use crate::error::StreamError;

/// Default watermark for both readable and writable streams
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;

/// Options accepted by `Readable::new` and `Writable::new`
///
/// Deserializes from JSON such as `{"high_water_mark": 65536}`. The
/// camel-case spellings `highWaterMark` and `objectMode` are accepted too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamOptions {
    /// Buffered byte count at which the stream reports backpressure
    #[serde(alias = "highWaterMark")]
    pub high_water_mark: usize,

    /// Buffer logical values instead of bytes. Not supported; kept so that
    /// configurations carrying the flag are rejected explicitly.
    #[serde(alias = "objectMode")]
    pub object_mode: bool,
}

impl StreamOptions {
    #[must_use]
    pub fn new() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            object_mode: false,
        }
    }

    #[must_use]
    pub fn with_high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = high_water_mark;
        self
    }

    #[must_use]
    pub fn with_object_mode(mut self, object_mode: bool) -> Self {
        self.object_mode = object_mode;
        self
    }

    /// Check the options before a stream is built
    ///
    /// # Errors
    ///
    /// Returns `InvalidOptions` if the watermark is zero or object mode is
    /// requested.
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.high_water_mark == 0 {
            return Err(StreamError::InvalidOptions(
                "high_water_mark must be positive".to_string(),
            ));
        }
        if self.object_mode {
            return Err(StreamError::InvalidOptions(
                "object mode is not supported".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse and validate options from a JSON document
    ///
    /// # Errors
    ///
    /// Returns `InvalidOptions` if the JSON is malformed or fails `validate()`.
    pub fn from_json_reader(reader: impl std::io::Read) -> Result<Self, StreamError> {
        let options: Self = serde_json::from_reader(reader)
            .map_err(|e| StreamError::InvalidOptions(format!("failed to parse options: {e}")))?;
        options.validate()?;
        Ok(options)
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::new()
    }
}
