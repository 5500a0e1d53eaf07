//! Decoded picture container.

use duocam_common::{DuocamError, DuocamResult};

/// An RGBA8 picture, rows stored top to bottom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub pts_us: i64,
    pub data: Vec<u8>,
}

impl VideoFrame {
    pub fn new(width: u32, height: u32, pts_us: i64, data: Vec<u8>) -> DuocamResult<Self> {
        let expected = Self::byte_len(width, height);
        if data.len() != expected {
            return Err(DuocamError::codec(format!(
                "frame {width}x{height} needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pts_us,
            data,
        })
    }

    /// A frame where every pixel has the same colour.
    pub fn filled(width: u32, height: u32, pts_us: i64, rgba: [u8; 4]) -> Self {
        let data = rgba
            .iter()
            .copied()
            .cycle()
            .take(Self::byte_len(width, height))
            .collect();
        Self {
            width,
            height,
            pts_us,
            data,
        }
    }

    pub fn byte_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 4
    }

    pub fn stride(&self) -> usize {
        self.width as usize * 4
    }

    /// Pixel at `(x, y)` where `y = 0` is the top row.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = y as usize * self.stride() + x as usize * 4;
        [
            self.data[i],
            self.data[i + 1],
            self.data[i + 2],
            self.data[i + 3],
        ]
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        let i = y as usize * self.stride() + x as usize * 4;
        self.data[i..i + 4].copy_from_slice(&rgba);
    }
}
