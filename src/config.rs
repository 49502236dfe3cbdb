//! Stream configuration.
//!
//! Every stream is configured by an explicit struct passed at construction;
//! there is no process-wide default that callers can mutate. All configs
//! implement `Default`, offer builder-style setters and derive serde traits
//! so an embedding application can load them from its own config files.
//!
//! # Defaults
//!
//! - Binary mode high-water mark: 64 KiB
//! - Object mode high-water mark: 16 items
//! - Auto-destroy after end/finish: on
//! - Half-open duplexes: allowed

use serde::{Deserialize, Serialize};

use crate::chunk::Encoding;

/// Default high-water mark for binary streams, in bytes.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024;

/// Default high-water mark for object streams, in items.
pub const DEFAULT_OBJECT_HIGH_WATER_MARK: usize = 16;

/// Largest high-water mark a `read(n)` may raise the mark to (1 GiB).
pub const MAX_HIGH_WATER_MARK: usize = 1 << 30;

/// Size accounting mode of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Sizes are byte lengths; payloads are normalized to bytes.
    #[default]
    Binary,
    /// Every chunk counts as one item; payloads are kept as-is.
    Object,
}

impl Mode {
    /// Default high-water mark for this mode.
    #[inline]
    pub fn default_high_water_mark(self) -> usize {
        match self {
            Mode::Binary => DEFAULT_HIGH_WATER_MARK,
            Mode::Object => DEFAULT_OBJECT_HIGH_WATER_MARK,
        }
    }
}

/// Configuration of a readable stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadableConfig {
    /// Overrides the mode default high-water mark.
    pub high_water_mark: Option<usize>,
    /// Count items instead of bytes.
    pub object_mode: bool,
    /// Encoding applied to text payloads without their own tag.
    pub encoding: Option<Encoding>,
    /// Destroy the stream once the end notification was emitted.
    pub auto_destroy: bool,
    /// Merge adjacent binary chunks in the buffer.
    pub coalesce_chunks: bool,
}

impl Default for ReadableConfig {
    fn default() -> Self {
        Self {
            high_water_mark: None,
            object_mode: false,
            encoding: None,
            auto_destroy: true,
            coalesce_chunks: false,
        }
    }
}

impl ReadableConfig {
    /// Object mode configuration.
    pub fn objects() -> Self {
        Self::default().object_mode(true)
    }

    /// Set the high-water mark.
    pub fn high_water_mark(mut self, hwm: usize) -> Self {
        self.high_water_mark = Some(hwm);
        self
    }

    /// Switch object mode on or off.
    pub fn object_mode(mut self, enabled: bool) -> Self {
        self.object_mode = enabled;
        self
    }

    /// Set the default text encoding.
    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    /// Enable or disable auto-destroy.
    pub fn auto_destroy(mut self, enabled: bool) -> Self {
        self.auto_destroy = enabled;
        self
    }

    /// Enable or disable chunk coalescing.
    pub fn coalesce_chunks(mut self, enabled: bool) -> Self {
        self.coalesce_chunks = enabled;
        self
    }

    /// Resolved size accounting mode.
    #[inline]
    pub fn mode(&self) -> Mode {
        if self.object_mode {
            Mode::Object
        } else {
            Mode::Binary
        }
    }

    /// Resolved high-water mark.
    #[inline]
    pub fn effective_high_water_mark(&self) -> usize {
        self.high_water_mark
            .unwrap_or_else(|| self.mode().default_high_water_mark())
    }
}

/// Configuration of a writable stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WritableConfig {
    /// Overrides the mode default high-water mark.
    pub high_water_mark: Option<usize>,
    /// Count items instead of bytes.
    pub object_mode: bool,
    /// Encoding applied to text payloads without their own tag.
    pub encoding: Option<Encoding>,
    /// Destroy the stream once it finished.
    pub auto_destroy: bool,
    /// Batch queued chunks into one dispatch in manual mode.
    pub writev: bool,
}

impl Default for WritableConfig {
    fn default() -> Self {
        Self {
            high_water_mark: None,
            object_mode: false,
            encoding: None,
            auto_destroy: true,
            writev: false,
        }
    }
}

impl WritableConfig {
    /// Object mode configuration.
    pub fn objects() -> Self {
        Self::default().object_mode(true)
    }

    /// Set the high-water mark.
    pub fn high_water_mark(mut self, hwm: usize) -> Self {
        self.high_water_mark = Some(hwm);
        self
    }

    /// Switch object mode on or off.
    pub fn object_mode(mut self, enabled: bool) -> Self {
        self.object_mode = enabled;
        self
    }

    /// Set the default text encoding.
    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    /// Enable or disable auto-destroy.
    pub fn auto_destroy(mut self, enabled: bool) -> Self {
        self.auto_destroy = enabled;
        self
    }

    /// Enable or disable batched dispatch in manual mode.
    pub fn writev(mut self, enabled: bool) -> Self {
        self.writev = enabled;
        self
    }

    /// Resolved size accounting mode.
    #[inline]
    pub fn mode(&self) -> Mode {
        if self.object_mode {
            Mode::Object
        } else {
            Mode::Binary
        }
    }

    /// Resolved high-water mark.
    #[inline]
    pub fn effective_high_water_mark(&self) -> usize {
        self.high_water_mark
            .unwrap_or_else(|| self.mode().default_high_water_mark())
    }
}

/// Configuration of a duplex or transform stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DuplexConfig {
    /// Readable side.
    pub readable: ReadableConfig,
    /// Writable side.
    pub writable: WritableConfig,
    /// Keep one side open after the other one ended.
    pub allow_half_open: bool,
    /// Destroy the duplex once both sides completed.
    pub auto_destroy: bool,
}

impl Default for DuplexConfig {
    fn default() -> Self {
        Self {
            readable: ReadableConfig::default(),
            writable: WritableConfig::default(),
            allow_half_open: true,
            auto_destroy: true,
        }
    }
}

impl DuplexConfig {
    /// Both sides in object mode.
    pub fn objects() -> Self {
        Self {
            readable: ReadableConfig::objects(),
            writable: WritableConfig::objects(),
            ..Self::default()
        }
    }

    /// Replace the readable side configuration.
    pub fn readable(mut self, config: ReadableConfig) -> Self {
        self.readable = config;
        self
    }

    /// Replace the writable side configuration.
    pub fn writable(mut self, config: WritableConfig) -> Self {
        self.writable = config;
        self
    }

    /// Allow or forbid half-open operation.
    pub fn allow_half_open(mut self, allowed: bool) -> Self {
        self.allow_half_open = allowed;
        self
    }

    /// Enable or disable auto-destroy.
    pub fn auto_destroy(mut self, enabled: bool) -> Self {
        self.auto_destroy = enabled;
        self
    }
}

/// Options of a single pipe link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeOptions {
    /// Call `end()` on the sink when the source ends.
    pub ends_sink_on_source_end: bool,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self {
            ends_sink_on_source_end: true,
        }
    }
}

impl PipeOptions {
    /// Leave the sink open when the source ends.
    pub fn keep_open() -> Self {
        Self {
            ends_sink_on_source_end: false,
        }
    }
}
