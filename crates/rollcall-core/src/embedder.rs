//! Seam to the external face embedder.
//!
//! Detection and embedding extraction live outside this crate. The core
//! only sees frames going in and `(bbox, embedding)` pairs coming out. The
//! bundled implementation consumes a JSON-lines feed that an external
//! embedder process has already filled in, one frame per line:
//!
//! ```text
//! {"index": 1, "captured_at": "2026-01-05T08:00:00Z", "faces": [{"bbox": {...}, "embedding": [...]}]}
//! ```

use crate::types::DetectedFace;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("embedding extraction failed: {0}")]
    ExtractionFailed(String),
    #[error("malformed feed line {line}: {reason}")]
    Feed { line: usize, reason: String },
    #[error("feed read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Extracts zero or more faces (bounding box + embedding) from a frame.
pub trait Embedder {
    type Frame;

    fn extract(&mut self, frame: &Self::Frame) -> Result<Vec<DetectedFace>, EmbedderError>;
}

/// A frame whose faces were already extracted upstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub faces: Vec<DetectedFace>,
}

/// Passes through the faces carried by a [`FeedFrame`].
#[derive(Debug, Default, Clone, Copy)]
pub struct PrecomputedEmbedder;

impl Embedder for PrecomputedEmbedder {
    type Frame = FeedFrame;

    fn extract(&mut self, frame: &FeedFrame) -> Result<Vec<DetectedFace>, EmbedderError> {
        Ok(frame.faces.clone())
    }
}

/// Iterator over a JSON-lines frame feed. Blank lines are skipped; a
/// malformed line yields an error item and iteration continues.
pub struct FeedReader<R> {
    reader: R,
    line_no: usize,
    buf: String,
}

impl<R: BufRead> FeedReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line_no: 0,
            buf: String::new(),
        }
    }
}

impl<R: BufRead> Iterator for FeedReader<R> {
    type Item = Result<FeedFrame, EmbedderError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(EmbedderError::Io(e))),
            }
            self.line_no += 1;

            let line = self.buf.trim();
            if line.is_empty() {
                continue;
            }
            return Some(serde_json::from_str(line).map_err(|e| EmbedderError::Feed {
                line: self.line_no,
                reason: e.to_string(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_feed_reader_parses_frames() {
        let feed = concat!(
            r#"{"index": 1, "faces": [{"embedding": [0.1, 0.2]}]}"#,
            "\n\n",
            r#"{"faces": []}"#,
            "\n",
        );
        let frames: Vec<_> = FeedReader::new(Cursor::new(feed)).collect();
        assert_eq!(frames.len(), 2);

        let first = frames[0].as_ref().unwrap();
        assert_eq!(first.index, Some(1));
        assert_eq!(first.faces[0].embedding.values, vec![0.1, 0.2]);
        assert!(frames[1].as_ref().unwrap().faces.is_empty());
    }

    #[test]
    fn test_feed_reader_reports_bad_line_and_continues() {
        let feed = "{\"faces\": []}\nnot json\n{\"faces\": []}\n";
        let frames: Vec<_> = FeedReader::new(Cursor::new(feed)).collect();
        assert_eq!(frames.len(), 3);
        assert!(matches!(frames[1], Err(EmbedderError::Feed { line: 2, .. })));
        assert!(frames[2].is_ok());
    }

    #[test]
    fn test_precomputed_embedder_passes_faces_through() {
        let frame: FeedFrame = serde_json::from_str(
            r#"{"faces": [{"bbox": {"x": 1, "y": 2, "width": 30, "height": 40}, "embedding": [1.0]}]}"#,
        )
        .unwrap();
        let faces = PrecomputedEmbedder.extract(&frame).unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].bbox.as_ref().map(|b| b.width), Some(30.0));
    }
}
