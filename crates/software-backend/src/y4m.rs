//! YUV4MPEG2 reading and writing.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use duocam_codec_core::VideoFrame;
use duocam_common::{DuocamError, DuocamResult};

use crate::yuv;

pub const MAGIC: &str = "YUV4MPEG2";
const MAX_HEADER_LEN: usize = 4096;

/// Stream header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Y4mHeader {
    pub width: u32,
    pub height: u32,
    pub fps_num: u32,
    pub fps_den: u32,
    pub colorspace: String,
}

impl Y4mHeader {
    pub fn new(width: u32, height: u32, fps_num: u32, fps_den: u32) -> Self {
        Self {
            width,
            height,
            fps_num,
            fps_den,
            colorspace: "420jpeg".to_string(),
        }
    }

    /// Header with a rational approximation of `fps`.
    pub fn with_frame_rate(width: u32, height: u32, fps: f64) -> Self {
        let (num, den) = if fps.fract() == 0.0 {
            (fps as u32, 1)
        } else {
            ((fps * 1001.0).round() as u32, 1001)
        };
        Self::new(width, height, num.max(1), den)
    }

    pub fn frame_rate(&self) -> f64 {
        self.fps_num as f64 / self.fps_den.max(1) as f64
    }

    pub fn frame_len(&self) -> usize {
        yuv::i420_len(self.width, self.height)
    }

    /// Presentation time of frame `index`.
    pub fn pts_us(&self, index: u64) -> i64 {
        (index as i128 * 1_000_000 * self.fps_den as i128 / self.fps_num.max(1) as i128) as i64
    }

    pub fn parse(line: &str) -> DuocamResult<Self> {
        let mut fields = line.trim_end().split(' ');
        if fields.next() != Some(MAGIC) {
            return Err(DuocamError::demux("not a YUV4MPEG2 stream"));
        }
        let (mut width, mut height) = (None, None);
        let (mut fps_num, mut fps_den) = (30, 1);
        let mut colorspace = "420jpeg".to_string();
        for field in fields.filter(|f| !f.is_empty()) {
            let mut chars = field.chars();
            let tag = chars.next().unwrap_or(' ');
            let value = chars.as_str();
            match tag {
                'W' => width = value.parse().ok(),
                'H' => height = value.parse().ok(),
                'F' => {
                    let (n, d) = value
                        .split_once(':')
                        .ok_or_else(|| DuocamError::demux(format!("bad frame rate '{value}'")))?;
                    fps_num = n
                        .parse()
                        .map_err(|_| DuocamError::demux(format!("bad frame rate '{value}'")))?;
                    fps_den = d
                        .parse()
                        .map_err(|_| DuocamError::demux(format!("bad frame rate '{value}'")))?;
                }
                'C' => colorspace = value.to_string(),
                // Interlacing, aspect ratio and extensions do not affect decoding.
                'I' | 'A' | 'X' => {}
                other => {
                    return Err(DuocamError::demux(format!(
                        "unknown YUV4MPEG2 header tag '{other}'"
                    )))
                }
            }
        }
        let (Some(width), Some(height)) = (width, height) else {
            return Err(DuocamError::demux("YUV4MPEG2 header lacks W/H"));
        };
        if width == 0 || height == 0 || fps_num == 0 || fps_den == 0 {
            return Err(DuocamError::demux("YUV4MPEG2 header has zero size or rate"));
        }
        if !colorspace.starts_with("420") {
            return Err(DuocamError::demux(format!(
                "unsupported YUV4MPEG2 colorspace C{colorspace}"
            )));
        }
        Ok(Self {
            width,
            height,
            fps_num,
            fps_den,
            colorspace,
        })
    }

    pub fn to_line(&self) -> String {
        format!(
            "{MAGIC} W{} H{} F{}:{} Ip A1:1 C{}\n",
            self.width, self.height, self.fps_num, self.fps_den, self.colorspace
        )
    }
}

/// Random-access reader over an indexed Y4M file.
#[derive(Debug)]
pub struct Y4mReader {
    file: BufReader<File>,
    header: Y4mHeader,
    frame_offsets: Vec<u64>,
}

fn read_line_limited(reader: &mut impl BufRead, buf: &mut Vec<u8>) -> DuocamResult<usize> {
    buf.clear();
    let n = reader
        .by_ref()
        .take(MAX_HEADER_LEN as u64)
        .read_until(b'\n', buf)?;
    if n > 0 && buf.last() != Some(&b'\n') && n >= MAX_HEADER_LEN {
        return Err(DuocamError::demux("YUV4MPEG2 header line too long"));
    }
    Ok(n)
}

impl Y4mReader {
    pub fn open(path: &Path) -> DuocamResult<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut file = BufReader::new(file);

        let mut line = Vec::new();
        read_line_limited(&mut file, &mut line)?;
        let header = Y4mHeader::parse(&String::from_utf8_lossy(&line))?;
        let frame_len = header.frame_len() as u64;

        let mut frame_offsets = Vec::new();
        let mut offset = line.len() as u64;
        loop {
            let n = read_line_limited(&mut file, &mut line)?;
            if n == 0 {
                break;
            }
            if !line.starts_with(b"FRAME") {
                return Err(DuocamError::demux(format!(
                    "expected FRAME marker at byte {offset}"
                )));
            }
            let data_offset = offset + n as u64;
            if data_offset + frame_len > file_len {
                tracing::warn!(
                    path = %path.display(),
                    frame = frame_offsets.len(),
                    "truncated final Y4M frame ignored"
                );
                break;
            }
            frame_offsets.push(data_offset);
            file.seek_relative(frame_len as i64)?;
            offset = data_offset + frame_len;
        }

        Ok(Self {
            file,
            header,
            frame_offsets,
        })
    }

    pub fn header(&self) -> &Y4mHeader {
        &self.header
    }

    pub fn frame_count(&self) -> usize {
        self.frame_offsets.len()
    }

    pub fn duration_us(&self) -> i64 {
        self.header.pts_us(self.frame_count() as u64)
    }

    /// Read the planar data of frame `index` into `buf`.
    pub fn read_frame(&mut self, index: usize, buf: &mut Vec<u8>) -> DuocamResult<()> {
        let offset = *self
            .frame_offsets
            .get(index)
            .ok_or_else(|| DuocamError::demux(format!("frame {index} out of range")))?;
        buf.resize(self.header.frame_len(), 0);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }
}

/// Sequential Y4M writer.
#[derive(Debug)]
pub struct Y4mWriter {
    file: BufWriter<File>,
    header: Y4mHeader,
    frames: u64,
}

impl Y4mWriter {
    pub fn create(path: &Path, header: Y4mHeader) -> DuocamResult<Self> {
        let mut file = BufWriter::new(File::create(path)?);
        file.write_all(header.to_line().as_bytes())?;
        Ok(Self {
            file,
            header,
            frames: 0,
        })
    }

    /// Wrap an already-open file; the header is written immediately.
    pub fn from_file(file: File, header: Y4mHeader) -> DuocamResult<Self> {
        let mut file = BufWriter::new(file);
        file.write_all(header.to_line().as_bytes())?;
        Ok(Self {
            file,
            header,
            frames: 0,
        })
    }

    pub fn header(&self) -> &Y4mHeader {
        &self.header
    }

    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    pub fn write_frame(&mut self, planar: &[u8]) -> DuocamResult<()> {
        if planar.len() != self.header.frame_len() {
            return Err(DuocamError::muxer(format!(
                "Y4M frame needs {} bytes, got {}",
                self.header.frame_len(),
                planar.len()
            )));
        }
        self.file.write_all(b"FRAME\n")?;
        self.file.write_all(planar)?;
        self.frames += 1;
        Ok(())
    }

    pub fn write_rgba(&mut self, frame: &VideoFrame) -> DuocamResult<()> {
        let planar = yuv::rgba_to_i420(frame.width, frame.height, &frame.data);
        self.write_frame(&planar)
    }

    pub fn flush(&mut self) -> DuocamResult<()> {
        self.file.flush()?;
        Ok(())
    }

    pub fn finish(mut self) -> DuocamResult<u64> {
        self.flush()?;
        Ok(self.frames)
    }
}

/// Write RGBA frames as a Y4M clip.
pub fn write_clip(
    path: &Path,
    width: u32,
    height: u32,
    fps: u32,
    frames: impl IntoIterator<Item = VideoFrame>,
) -> DuocamResult<u64> {
    let mut writer = Y4mWriter::create(path, Y4mHeader::new(width, height, fps, 1))?;
    for frame in frames {
        writer.write_rgba(&frame)?;
    }
    writer.finish()
}

/// Decode every frame of a Y4M file to RGBA.
pub fn read_clip(path: &Path) -> DuocamResult<(Y4mHeader, Vec<VideoFrame>)> {
    let mut reader = Y4mReader::open(path)?;
    let header = reader.header().clone();
    let mut planar = Vec::new();
    let mut frames = Vec::with_capacity(reader.frame_count());
    for i in 0..reader.frame_count() {
        reader.read_frame(i, &mut planar)?;
        frames.push(VideoFrame::new(
            header.width,
            header.height,
            header.pts_us(i as u64),
            yuv::i420_to_rgba(header.width, header.height, &planar),
        )?);
    }
    Ok((header, frames))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_parse() {
        let header = Y4mHeader::parse("YUV4MPEG2 W640 H360 F30000:1001 It A1:1 C420mpeg2 XYSCSS=420MPEG2\n")
            .unwrap();
        assert_eq!((header.width, header.height), (640, 360));
        assert!((header.frame_rate() - 29.97).abs() < 0.01);
        assert_eq!(header.colorspace, "420mpeg2");
        assert_eq!(header.pts_us(30_000), 1_001_000_000);
    }

    #[test]
    fn test_header_rejects_bad_input() {
        assert!(Y4mHeader::parse("RIFF....").is_err());
        assert!(Y4mHeader::parse("YUV4MPEG2 W640 F30:1").is_err());
        assert!(Y4mHeader::parse("YUV4MPEG2 W2 H2 C444").is_err());
        assert!(Y4mHeader::parse("YUV4MPEG2 W2 H2 F0:1").is_err());
    }

    #[test]
    fn test_fractional_rate_header() {
        let header = Y4mHeader::with_frame_rate(2, 2, 29.97);
        assert_eq!((header.fps_num, header.fps_den), (30000, 1001));
        let header = Y4mHeader::with_frame_rate(2, 2, 30.0);
        assert_eq!((header.fps_num, header.fps_den), (30, 1));
    }

    #[test]
    fn test_clip_write_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.y4m");
        let frames = (0..5).map(|i| VideoFrame::filled(4, 2, 0, [i * 40, 0, 0, 255]));
        assert_eq!(write_clip(&path, 4, 2, 30, frames).unwrap(), 5);

        let reader = Y4mReader::open(&path).unwrap();
        assert_eq!(reader.frame_count(), 5);
        assert_eq!(reader.duration_us(), 166_666);

        let (header, decoded) = read_clip(&path).unwrap();
        assert_eq!(header.width, 4);
        assert_eq!(decoded.len(), 5);
        assert!((decoded[4].pixel(0, 0)[0] as i32 - 160).abs() <= 2);
        assert_eq!(decoded[1].pts_us, 33_333);
    }

    #[test]
    fn test_truncated_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cut.y4m");
        let frames = (0..3).map(|_| VideoFrame::filled(2, 2, 0, [0, 0, 0, 255]));
        write_clip(&path, 2, 2, 30, frames).unwrap();
        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 2).unwrap();
        assert_eq!(Y4mReader::open(&path).unwrap().frame_count(), 2);
    }
}
