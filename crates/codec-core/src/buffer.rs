//! Buffer-queue protocol shared by decoders and encoders.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Per-buffer flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const NONE: Self = Self(0);
    pub const KEY_FRAME: Self = Self(1);
    pub const CODEC_CONFIG: Self = Self(1 << 1);
    pub const END_OF_STREAM: Self = Self(1 << 2);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for BufferFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for BufferFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for BufferFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::KEY_FRAME) {
            names.push("KEY_FRAME");
        }
        if self.contains(Self::CODEC_CONFIG) {
            names.push("CODEC_CONFIG");
        }
        if self.contains(Self::END_OF_STREAM) {
            names.push("END_OF_STREAM");
        }
        if names.is_empty() {
            write!(f, "BufferFlags(NONE)")
        } else {
            write!(f, "BufferFlags({})", names.join(" | "))
        }
    }
}

/// Metadata of a dequeued output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferInfo {
    pub offset: usize,
    pub size: usize,
    pub presentation_time_us: i64,
    pub flags: BufferFlags,
}

impl BufferInfo {
    pub fn is_end_of_stream(&self) -> bool {
        self.flags.contains(BufferFlags::END_OF_STREAM)
    }

    pub fn is_codec_config(&self) -> bool {
        self.flags.contains(BufferFlags::CODEC_CONFIG)
    }
}

/// Result of polling a codec's output queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// Nothing ready within the timeout.
    TryAgainLater,
    /// The output format is now known; query it before the next buffer.
    FormatChanged,
    /// A buffer is ready and must be released by index.
    Buffer { index: usize, info: BufferInfo },
}
