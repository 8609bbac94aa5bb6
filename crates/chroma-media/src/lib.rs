//! chroma-media: ffmpeg-backed implementation of the chroma codec seams.
//!
//! Every operation shells out to the `ffmpeg` / `ffprobe` binaries. Frames are
//! streamed as raw RGB24 over a pipe, so decoding one session never holds more
//! than a single frame in memory beyond what the caller keeps.

pub mod probe;

use chroma_core::{MediaCodec, MediaError, VideoDecoder, VideoInfo};
use image::RgbImage;
use std::fs;
use std::io::{self, Read};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread::{self, JoinHandle};

const CONCAT_LIST: &str = "concat.txt";

/// Paths to the ffmpeg tool binaries.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

impl Ffmpeg {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    /// Run a tool to completion, turning a non-zero exit into an error that
    /// carries its stderr.
    fn run(mut command: Command) -> Result<Vec<u8>, MediaError> {
        let program = command.get_program().to_string_lossy().into_owned();
        let output = command
            .stdin(Stdio::null())
            .output()
            .map_err(|source| MediaError::Spawn {
                program: program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(MediaError::Failed {
                program,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

/// A running tool process with piped stdout.
///
/// Dropping the guard kills and reaps the process unless it already exited,
/// so an early return never leaves a zombie behind. Stderr is drained on a
/// helper thread and attached to the error when the process fails.
struct ChildGuard {
    child: Child,
    program: String,
    stderr: Option<JoinHandle<String>>,
}

impl ChildGuard {
    fn spawn(mut command: Command) -> Result<Self, MediaError> {
        let program = command.get_program().to_string_lossy().into_owned();
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| MediaError::Spawn {
                program: program.clone(),
                source,
            })?;
        let stderr = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut text = String::new();
                let _ = pipe.read_to_string(&mut text);
                text
            })
        });
        Ok(Self {
            child,
            program,
            stderr,
        })
    }

    fn stdout(&mut self) -> Result<ChildStdout, MediaError> {
        self.child
            .stdout
            .take()
            .ok_or_else(|| MediaError::Decode(format!("{} stdout not captured", self.program)))
    }

    /// Wait for exit. A non-zero status becomes `Failed` with the captured
    /// stderr.
    fn finish(mut self) -> Result<(), MediaError> {
        let status = self.child.wait()?;
        let stderr = self
            .stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        if !status.success() {
            return Err(MediaError::Failed {
                program: self.program.clone(),
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// One line of an ffmpeg concat-demuxer list. Single quotes inside the path
/// are closed, escaped and reopened.
pub fn concat_line(path: &Path) -> String {
    let escaped = path.to_string_lossy().replace('\'', r"'\''");
    format!("file '{escaped}'")
}

/// Fill `buf` with exactly one frame. `Ok(false)` on a clean end of
/// stream before the first byte; a partial frame is an error.
pub fn read_frame(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("truncated frame: {filled} of {} bytes", buf.len()),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

impl MediaCodec for Ffmpeg {
    fn transcode(&self, input: &Path, output: &Path) -> Result<(), MediaError> {
        let mut command = Command::new(&self.ffmpeg);
        command
            .args(["-y", "-i"])
            .arg(input)
            .args(["-c:v", "libx264", "-preset", "fast", "-crf", "23"])
            .args(["-c:a", "aac", "-strict", "experimental"])
            .arg(output);
        Self::run(command)?;
        tracing::debug!(input = %input.display(), output = %output.display(), "fragment transcoded");
        Ok(())
    }

    fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MediaError> {
        let dir = output.parent().unwrap_or(Path::new("."));
        let list_path = dir.join(CONCAT_LIST);
        let mut list = String::new();
        for input in inputs {
            let absolute = fs::canonicalize(input)?;
            list.push_str(&concat_line(&absolute));
            list.push('\n');
        }
        fs::write(&list_path, list)?;

        let mut command = Command::new(&self.ffmpeg);
        command
            .args(["-y", "-f", "concat", "-safe", "0", "-i"])
            .arg(&list_path)
            .args(["-c", "copy"])
            .arg(output);
        let result = Self::run(command);
        let _ = fs::remove_file(&list_path);
        result?;
        tracing::debug!(inputs = inputs.len(), output = %output.display(), "fragments concatenated");
        Ok(())
    }
}

impl VideoDecoder for Ffmpeg {
    fn probe(&self, path: &Path) -> Result<VideoInfo, MediaError> {
        let mut command = Command::new(&self.ffprobe);
        command
            .args(["-v", "error", "-select_streams", "v:0", "-show_entries"])
            .arg("stream=width,height,avg_frame_rate,r_frame_rate")
            .args(["-of", "json"])
            .arg(path);
        let stdout = Self::run(command)?;
        probe::parse_probe(&stdout).map_err(|reason| MediaError::Probe {
            path: path.to_path_buf(),
            reason,
        })
    }

    fn decode(
        &self,
        path: &Path,
        visit: &mut dyn FnMut(u64, &RgbImage) -> ControlFlow<()>,
    ) -> Result<u64, MediaError> {
        let info = self.probe(path)?;

        // -noautorotate keeps frame dimensions equal to the probed ones
        let mut command = Command::new(&self.ffmpeg);
        command
            .args(["-v", "error", "-nostdin", "-noautorotate", "-i"])
            .arg(path)
            .args([
                "-map", "0:v:0", "-vsync", "0", "-f", "rawvideo", "-pix_fmt", "rgb24", "-",
            ]);
        let mut child = ChildGuard::spawn(command)?;
        let mut stdout = child.stdout()?;

        let frame_len = info.width as usize * info.height as usize * 3;
        let mut buf = vec![0u8; frame_len];
        let mut visited = 0u64;
        loop {
            match read_frame(&mut stdout, &mut buf) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    // A truncated stream usually means ffmpeg failed; prefer its report
                    drop(stdout);
                    return Err(child.finish().err().unwrap_or(MediaError::Io(e)));
                }
            }
            let frame = RgbImage::from_raw(info.width, info.height, buf.clone())
                .ok_or_else(|| MediaError::Decode("frame buffer size mismatch".into()))?;
            let flow = visit(visited, &frame);
            visited += 1;
            if flow.is_break() {
                // Dropping the guard stops the decoder
                return Ok(visited);
            }
        }

        drop(stdout);
        child.finish()?;
        tracing::debug!(path = %path.display(), frames = visited, "video decoded");
        Ok(visited)
    }
}
