//! Audio transcode collaborator
//!
//! Announcements arrive as arbitrary audio files; the RTP session wants
//! raw 8 kHz mono A-law. Transcoding is CPU work done by an external
//! encoder process, behind a trait so tests can feed canned bytes.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::process::Command;
use tracing::{debug, warn};

use dialcast_rtp_core::g711::ALAW_SILENCE;
use dialcast_rtp_core::{FRAME_SIZE, PTIME_MS};

use crate::{Error, Result};

/// Produces raw 8 kHz mono A-law bytes from an audio file
#[async_trait]
pub trait AudioTranscoder: Send + Sync {
    async fn transcode(&self, path: &Path) -> Result<Bytes>;
}

/// Transcoder backed by an external ffmpeg-compatible encoder process
pub struct ProcessTranscoder {
    program: String,
}

impl ProcessTranscoder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for ProcessTranscoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

#[async_trait]
impl AudioTranscoder for ProcessTranscoder {
    async fn transcode(&self, path: &Path) -> Result<Bytes> {
        debug!("transcoding {} via {}", path.display(), self.program);
        let output = Command::new(&self.program)
            .args(["-hide_banner", "-loglevel", "error", "-i"])
            .arg(path)
            .args(["-ar", "8000", "-ac", "1", "-f", "alaw", "pipe:1"])
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .stdout(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                "{} exited with {} for {}",
                self.program,
                output.status,
                path.display()
            );
            return Err(Error::Transcode(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        if output.stdout.is_empty() {
            return Err(Error::Transcode(format!(
                "{} produced no audio for {}",
                self.program,
                path.display()
            )));
        }
        Ok(Bytes::from(output.stdout))
    }
}

/// Split raw audio into 160-byte frames, padding the last partial frame
/// with A-law silence
pub fn split_frames(audio: &Bytes) -> Vec<Bytes> {
    let mut frames = Vec::with_capacity(audio.len().div_ceil(FRAME_SIZE));
    let mut offset = 0;
    while offset < audio.len() {
        let end = (offset + FRAME_SIZE).min(audio.len());
        if end - offset == FRAME_SIZE {
            frames.push(audio.slice(offset..end));
        } else {
            let mut padded = Vec::with_capacity(FRAME_SIZE);
            padded.extend_from_slice(&audio[offset..end]);
            padded.resize(FRAME_SIZE, ALAW_SILENCE);
            frames.push(Bytes::from(padded));
        }
        offset = end;
    }
    frames
}

/// Wall-clock playback length of raw audio repeated `repeat` times
pub fn playback_duration(audio_len: usize, repeat: u32) -> Duration {
    let frames = audio_len.div_ceil(FRAME_SIZE) as u64 * repeat as u64;
    Duration::from_millis(frames * PTIME_MS as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_frames_pads_tail() {
        let audio = Bytes::from(vec![0x2Au8; FRAME_SIZE * 2 + 10]);
        let frames = split_frames(&audio);
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.len() == FRAME_SIZE));
        assert_eq!(frames[2][9], 0x2A);
        assert_eq!(frames[2][10], ALAW_SILENCE);
    }

    #[test]
    fn test_split_frames_empty() {
        assert!(split_frames(&Bytes::new()).is_empty());
    }

    #[test]
    fn test_playback_duration() {
        // 8000 bytes = 50 frames = 1s, three repeats
        assert_eq!(playback_duration(8000, 3), Duration::from_secs(3));
        // Partial frame rounds up to a whole tick
        assert_eq!(playback_duration(1, 1), Duration::from_millis(20));
        assert_eq!(playback_duration(0, 3), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_process_failure_surfaces_exit_code() {
        let transcoder = ProcessTranscoder::new("false");
        let err = transcoder.transcode(Path::new("missing.wav")).await;
        assert!(matches!(err, Err(Error::Transcode(_))));
    }

    #[tokio::test]
    async fn test_missing_program_is_io_error() {
        let transcoder = ProcessTranscoder::new("no-such-encoder-binary");
        let err = transcoder.transcode(Path::new("missing.wav")).await;
        assert!(matches!(err, Err(Error::Io(_))));
    }
}
