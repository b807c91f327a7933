//! C3 Media Pipeline: extracts a mono 16 kHz 64 kbps MP3 track from a video
//! via an external `ffmpeg` binary. Every exit path — success, failure, or
//! panic unwinding through this function — removes the scoped temp files.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

const INPUT_CAP: usize = 100 * 1024 * 1024;
const OUTPUT_CAP: usize = 25 * 1024 * 1024;
const EXTRACT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("no audio track in video")]
    NoAudio,
    #[error("too large: {0}")]
    TooLarge(String),
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),
}

/// Deletes its file on drop, regardless of how the scope is exited.
struct ScopedTempFile {
    path: PathBuf,
}

impl ScopedTempFile {
    fn new(extension: &str) -> Self {
        let name = format!(
            "botcore-media-{}-{}.{extension}",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        );
        Self {
            path: std::env::temp_dir().join(name),
        }
    }
}

impl Drop for ScopedTempFile {
    fn drop(&mut self) {
        if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn ffmpeg_binary() -> String {
    std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string())
}

pub struct MediaPipeline;

impl MediaPipeline {
    pub fn new() -> Self {
        Self
    }

    pub async fn extract_audio(&self, video_bytes: &[u8]) -> Result<Vec<u8>, MediaError> {
        if video_bytes.len() > INPUT_CAP {
            return Err(MediaError::TooLarge(format!(
                "video is {} bytes, input cap is {INPUT_CAP}",
                video_bytes.len()
            )));
        }

        let input = ScopedTempFile::new("mp4");
        let output = ScopedTempFile::new("mp3");

        tokio::fs::write(&input.path, video_bytes)
            .await
            .map_err(|e| MediaError::ExtractionFailed(format!("failed to stage input: {e}")))?;

        let result = run_ffmpeg(&input.path, &output.path).await;
        result?;

        let audio = tokio::fs::read(&output.path)
            .await
            .map_err(|e| MediaError::ExtractionFailed(format!("failed to read output: {e}")))?;

        if audio.len() > OUTPUT_CAP {
            return Err(MediaError::TooLarge(format!(
                "extracted audio is {} bytes, output cap is {OUTPUT_CAP}",
                audio.len()
            )));
        }

        Ok(audio)
    }
}

impl Default for MediaPipeline {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_ffmpeg(input: &Path, output: &Path) -> Result<(), MediaError> {
    let mut cmd = Command::new(ffmpeg_binary());
    cmd.arg("-y")
        .arg("-i")
        .arg(input)
        .arg("-vn")
        .arg("-ac")
        .arg("1")
        .arg("-ar")
        .arg("16000")
        .arg("-b:a")
        .arg("64k")
        .arg(output)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let child = cmd
        .spawn()
        .map_err(|e| MediaError::ExtractionFailed(format!("failed to spawn ffmpeg: {e}")))?;

    let output_result = tokio::time::timeout(EXTRACT_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| MediaError::ExtractionFailed("ffmpeg timed out".to_string()))?
        .map_err(|e| MediaError::ExtractionFailed(format!("ffmpeg wait failed: {e}")))?;

    let stderr = String::from_utf8_lossy(&output_result.stderr);

    if !output_result.status.success() {
        if stderr.contains("Stream map") && stderr.contains("matches no streams")
            || stderr.contains("does not contain any stream")
            || stderr.to_lowercase().contains("no audio")
        {
            return Err(MediaError::NoAudio);
        }
        return Err(MediaError::ExtractionFailed(format!(
            "ffmpeg exited with {}: {stderr}",
            output_result.status
        )));
    }

    // ffmpeg can exit 0 but emit zero audio frames when the input truly has
    // no audio stream (e.g. `-vn` with nothing left to map).
    if stderr.contains("Output file is empty") {
        return Err(MediaError::NoAudio);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_cap_is_100_mib() {
        assert_eq!(INPUT_CAP, 100 * 1024 * 1024);
    }

    #[test]
    fn output_cap_is_25_mib() {
        assert_eq!(OUTPUT_CAP, 25 * 1024 * 1024);
    }

    #[test]
    fn scoped_temp_file_removes_on_drop() {
        let temp = ScopedTempFile::new("bin");
        let path = temp.path.clone();
        std::fs::write(&path, b"x").unwrap();
        assert!(path.exists());
        drop(temp);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn rejects_oversized_input_before_touching_disk() {
        let pipeline = MediaPipeline::new();
        let oversized = vec![0u8; INPUT_CAP + 1];
        let result = pipeline.extract_audio(&oversized).await;
        assert!(matches!(result, Err(MediaError::TooLarge(_))));
    }
}
