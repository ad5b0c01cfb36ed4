// crates/core/src/pipeline/ramp.rs
//! Luminance-ramp frames and a plain-text encoder.
//!
//! Enough of a transform to drive the pipeline end to end without the real
//! renderer: each gray pixel maps to one character of a ramp, dark to light.

use std::io::Write;
use std::path::PathBuf;

use charart_types::Artifact;

use super::{FrameEncoder, FrameWork, UnitReporter};
use crate::error::FrameError;

pub const DEFAULT_RAMP: &str = "@%#*+=-:. ";

/// Separator between frames in the encoded text file.
pub const FRAME_SEPARATOR: &str = "\n\u{000C}\n";

/// One 8-bit grayscale frame.
#[derive(Debug, Clone, PartialEq)]
pub struct GrayFrame {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

impl GrayFrame {
    pub fn new(width: usize, height: usize, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Uniform frame, mostly for tests.
    pub fn filled(width: usize, height: usize, value: u8) -> Self {
        Self::new(width, height, vec![value; width * height])
    }
}

pub struct RampFrames {
    frames: Vec<GrayFrame>,
    ramp: Vec<char>,
}

impl RampFrames {
    pub fn new(frames: Vec<GrayFrame>) -> Self {
        Self::with_ramp(frames, DEFAULT_RAMP)
    }

    pub fn with_ramp(frames: Vec<GrayFrame>, ramp: &str) -> Self {
        let ramp: Vec<char> = ramp.chars().collect();
        Self {
            frames,
            ramp: if ramp.is_empty() {
                DEFAULT_RAMP.chars().collect()
            } else {
                ramp
            },
        }
    }

    fn glyph(&self, luma: u8) -> char {
        let idx = usize::from(luma) * (self.ramp.len() - 1) / 255;
        self.ramp[idx]
    }
}

impl FrameWork for RampFrames {
    type Frame = GrayFrame;
    type Text = Vec<String>;
    type Rendered = String;

    fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn decode(&self, index: usize) -> Result<GrayFrame, FrameError> {
        let frame = self
            .frames
            .get(index)
            .ok_or_else(|| FrameError::Decode(format!("no frame at index {index}")))?;
        let expected = frame
            .width
            .checked_mul(frame.height)
            .ok_or_else(|| FrameError::Decode(format!("frame {index}: dimensions overflow")))?;
        if frame.pixels.len() != expected {
            return Err(FrameError::Decode(format!(
                "frame {index}: expected {expected} pixels, got {}",
                frame.pixels.len()
            )));
        }
        Ok(frame.clone())
    }

    fn to_text(&self, frame: &GrayFrame, units: &mut UnitReporter) -> Result<Vec<String>, FrameError> {
        let total = frame.pixels.len() as u64;
        let mut lines = Vec::with_capacity(frame.height);
        if frame.width == 0 {
            return Ok(lines);
        }
        for (row, chunk) in frame.pixels.chunks(frame.width).enumerate() {
            units.check_cancelled()?;
            lines.push(chunk.iter().map(|&p| self.glyph(p)).collect());
            units.report(((row + 1) * frame.width) as u64, total);
        }
        Ok(lines)
    }

    fn render(&self, text: &Vec<String>, units: &mut UnitReporter) -> Result<String, FrameError> {
        let total: u64 = text.iter().map(|l| l.chars().count() as u64).sum();
        let mut out = String::with_capacity(total as usize + text.len());
        let mut done = 0u64;
        for line in text {
            units.check_cancelled()?;
            out.push_str(line);
            out.push('\n');
            done += line.chars().count() as u64;
            units.report(done, total);
        }
        Ok(out)
    }
}

/// Writes frames, in order, to one text file.
pub struct TextFileEncoder {
    path: PathBuf,
}

impl TextFileEncoder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl FrameEncoder<String> for TextFileEncoder {
    fn encode(self, frames: Vec<String>) -> Result<Artifact, FrameError> {
        let mut file = std::fs::File::create(&self.path)
            .map_err(|e| FrameError::Encode(format!("{}: {e}", self.path.display())))?;
        for (i, frame) in frames.iter().enumerate() {
            if i > 0 {
                file.write_all(FRAME_SEPARATOR.as_bytes())
                    .map_err(|e| FrameError::Encode(e.to_string()))?;
            }
            file.write_all(frame.as_bytes())
                .map_err(|e| FrameError::Encode(e.to_string()))?;
        }
        file.flush().map_err(|e| FrameError::Encode(e.to_string()))?;
        Ok(Artifact::new(self.path.display().to_string(), "text/plain")
            .with_message(format!("{} frames encoded", frames.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dark_and_light_ends_of_ramp() {
        let work = RampFrames::new(vec![GrayFrame::new(2, 1, vec![0, 255])]);
        let frame = work.decode(0).unwrap();
        let text = work.to_text(&frame, &mut UnitReporter::detached()).unwrap();
        assert_eq!(text, vec!["@ ".to_string()]);
    }

    #[test]
    fn test_decode_rejects_short_frame() {
        let work = RampFrames::new(vec![GrayFrame::new(3, 3, vec![0; 4])]);
        assert!(matches!(work.decode(0), Err(FrameError::Decode(_))));
        assert!(matches!(work.decode(7), Err(FrameError::Decode(_))));
    }

    #[test]
    fn test_decode_rejects_overflowing_dimensions() {
        let work = RampFrames::new(vec![GrayFrame::new(usize::MAX, 3, vec![0; 3])]);
        assert!(matches!(work.decode(0), Err(FrameError::Decode(msg)) if msg.contains("overflow")));
    }

    #[test]
    fn test_render_joins_lines() {
        let work = RampFrames::new(vec![GrayFrame::filled(3, 2, 0)]);
        let frame = work.decode(0).unwrap();
        let mut units = UnitReporter::detached();
        let text = work.to_text(&frame, &mut units).unwrap();
        let rendered = work.render(&text, &mut units).unwrap();
        assert_eq!(rendered, "@@@\n@@@\n");
    }

    #[test]
    fn test_text_encoder_writes_frames_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let artifact = TextFileEncoder::new(&path)
            .encode(vec!["a\n".into(), "b\n".into()])
            .unwrap();
        assert_eq!(artifact.content_type, "text/plain");
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, format!("a\n{FRAME_SEPARATOR}b\n"));
    }
}
