//! Face encoder backed by an external program.
//!
//! Each call runs the configured command, writes the frame to its stdin as
//! PNG and reads a JSON array from its stdout:
//!
//! ```json
//! [{ "location": [top, right, bottom, left], "encoding": [0.01, ...] }]
//! ```

use image::{ImageFormat, RgbImage};
use rollcall_core::{BoundingBox, DetectedFace, EncoderError, FaceEncoder, Template};
use serde::Deserialize;
use std::io::Cursor;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::runtime::{Builder, Runtime};

#[derive(Deserialize)]
struct WireFace {
    location: [u32; 4],
    encoding: Vec<f32>,
}

/// Runs the external encoder once per frame on a private current-thread
/// runtime, so the engine thread can call it synchronously. The runtime is
/// built on first use, on the calling thread.
///
/// A child that outlives `timeout` is killed and reaped by the runtime.
pub struct CommandEncoder {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    runtime: Option<Runtime>,
}

impl CommandEncoder {
    /// `command` is the program followed by its arguments.
    pub fn new(command: &[String], timeout: Duration) -> Result<Self, EncoderError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| EncoderError::Failed("empty encoder command".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
            runtime: None,
        })
    }

    fn ensure_runtime(&mut self) -> Result<(), EncoderError> {
        if self.runtime.is_none() {
            self.runtime = Some(Builder::new_current_thread().enable_all().build()?);
        }
        Ok(())
    }

    async fn run(&self, png: Vec<u8>) -> Result<Output, EncoderError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EncoderError::Failed("encoder stdin not piped".into()))?;

        // Feed stdin while draining stdout/stderr; dropping stdin closes the
        // pipe so the child sees EOF.
        let feed = async move {
            let written = stdin.write_all(&png).await;
            drop(stdin);
            written
        };
        let (written, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EncoderError::Failed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        if let Err(e) = written {
            return Err(EncoderError::Failed(format!(
                "{} exited before reading the frame: {e}",
                self.program
            )));
        }
        Ok(output)
    }
}

impl FaceEncoder for CommandEncoder {
    fn detect_and_encode(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, EncoderError> {
        let mut png = Vec::new();
        image.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;

        self.ensure_runtime()?;
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| EncoderError::Failed("encoder runtime unavailable".into()))?;
        let output = runtime
            .block_on(async { tokio::time::timeout(self.timeout, self.run(png)).await })
            .map_err(|_| {
                EncoderError::Failed(format!("{} timed out after {:?}", self.program, self.timeout))
            })??;

        let faces = parse_faces(&output.stdout)?;
        tracing::debug!(faces = faces.len(), width = image.width(), height = image.height(), "frame encoded");
        Ok(faces)
    }
}

fn parse_faces(stdout: &[u8]) -> Result<Vec<DetectedFace>, EncoderError> {
    let wire: Vec<WireFace> = serde_json::from_slice(stdout)
        .map_err(|e| EncoderError::Failed(format!("bad encoder output: {e}")))?;
    Ok(wire
        .into_iter()
        .map(|f| {
            let [top, right, bottom, left] = f.location;
            DetectedFace {
                location: BoundingBox { top, right, bottom, left },
                template: Template::new(f.encoding),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn shell(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    /// Noise image whose PNG is far larger than a pipe buffer.
    fn noisy_frame() -> RgbImage {
        let mut seed: u32 = 0x1234_5678;
        RgbImage::from_fn(640, 480, |_, _| {
            let mut next = || {
                seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (seed >> 24) as u8
            };
            image::Rgb([next(), next(), next()])
        })
    }

    #[test]
    fn test_parse_faces_in_order() {
        let json = br#"[
            {"location": [1, 20, 30, 4], "encoding": [0.5, -0.5]},
            {"location": [5, 6, 7, 8], "encoding": [1.0]}
        ]"#;
        let faces = parse_faces(json).unwrap();
        assert_eq!(faces.len(), 2);
        assert_eq!(faces[0].location, BoundingBox { top: 1, right: 20, bottom: 30, left: 4 });
        assert_eq!(faces[0].template.values, vec![0.5, -0.5]);
        assert_eq!(faces[1].template.values, vec![1.0]);
    }

    #[test]
    fn test_parse_no_faces() {
        assert!(parse_faces(b"[]").unwrap().is_empty());
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(parse_faces(b"not json"), Err(EncoderError::Failed(_))));
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(CommandEncoder::new(&[], TIMEOUT).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_runs_external_program() {
        // `sh -c` drains stdin and prints one face.
        let cmd: Vec<String> = [
            "sh",
            "-c",
            r#"cat >/dev/null; echo '[{"location":[0,2,2,0],"encoding":[0.25]}]'"#,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let mut encoder = CommandEncoder::new(&cmd, TIMEOUT).unwrap();
        let faces = encoder.detect_and_encode(&RgbImage::new(4, 4)).unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].template.values, vec![0.25]);
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_program_reports_stderr() {
        let cmd: Vec<String> = ["sh", "-c", "cat >/dev/null; echo boom >&2; exit 3"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut encoder = CommandEncoder::new(&cmd, TIMEOUT).unwrap();
        let err = encoder.detect_and_encode(&RgbImage::new(4, 4)).unwrap_err();
        assert!(err.to_string().contains("boom"), "got {err}");
    }

    #[cfg(unix)]
    #[test]
    fn test_child_ignoring_stdin_reports_stderr() {
        let mut encoder =
            CommandEncoder::new(&shell("echo no camera model >&2; exit 3"), TIMEOUT).unwrap();
        for _ in 0..3 {
            let err = encoder.detect_and_encode(&noisy_frame()).unwrap_err();
            assert!(err.to_string().contains("no camera model"), "got {err}");
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_child_exiting_early_with_success_is_an_error() {
        let mut encoder = CommandEncoder::new(&shell("exit 0"), TIMEOUT).unwrap();
        let err = encoder.detect_and_encode(&noisy_frame()).unwrap_err();
        assert!(matches!(err, EncoderError::Failed(_)), "got {err}");
    }

    #[cfg(unix)]
    #[test]
    fn test_hung_child_times_out() {
        let mut encoder =
            CommandEncoder::new(&shell("exec sleep 30"), Duration::from_millis(200)).unwrap();
        let started = Instant::now();
        let err = encoder.detect_and_encode(&RgbImage::new(4, 4)).unwrap_err();
        assert!(err.to_string().contains("timed out"), "got {err}");
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
