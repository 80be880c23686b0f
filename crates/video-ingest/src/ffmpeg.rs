//! FFmpeg subprocess backend: the decoder runs as a child process writing raw
//! BGR24 frames to stdout, which keeps codec crashes out of the monitor and
//! lets a stop request interrupt a blocked read by killing the child.

use std::{
    io::{ErrorKind, Read},
    path::PathBuf,
    process::{Child, ChildStdout, Command, Stdio},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use anyhow::anyhow;
use link_core::AbortHandle;
use tracing::debug;

use crate::{
    backend::{FrameSource, SourceConnector, SourceKind, parse_device_index, redact_uri},
    types::{CaptureError, Frame, Resolution},
};

#[derive(Clone, Debug)]
pub struct FfmpegOptions {
    /// Scale decoded frames to this size; probe the source when unset.
    pub output: Option<Resolution>,
    /// Decode on the GPU through NVDEC.
    pub use_nvdec: bool,
    /// Socket I/O timeout for network sources.
    pub io_timeout: Duration,
    /// Restart file sources from the beginning when they end.
    pub loop_files: bool,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
}

impl Default for FfmpegOptions {
    fn default() -> Self {
        Self {
            output: None,
            use_nvdec: false,
            io_timeout: Duration::from_secs(5),
            loop_files: true,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
        }
    }
}

/// Opens one camera through an `ffmpeg` child process per connection.
pub struct FfmpegConnector {
    uri: String,
    kind: SourceKind,
    options: FfmpegOptions,
}

impl FfmpegConnector {
    pub fn new(uri: impl Into<String>, options: FfmpegOptions) -> Self {
        let uri = uri.into();
        let kind = SourceKind::from_uri(&uri);
        Self { uri, kind, options }
    }

    fn probe_resolution(&self) -> Result<Resolution, CaptureError> {
        let mut cmd = Command::new(&self.options.ffprobe_path);
        cmd.args(["-v", "error"]);
        cmd.args(input_args(self.kind, &self.options, false));
        cmd.args([
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height",
            "-of",
            "csv=s=x:p=0",
        ])
        .arg(input_path(&self.uri, self.kind))
        .stdin(Stdio::null())
        .stderr(Stdio::null());

        let output = cmd.output().map_err(CaptureError::Spawn)?;
        if !output.status.success() {
            return Err(CaptureError::Open {
                uri: redact_uri(&self.uri),
            });
        }
        parse_probe_output(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            CaptureError::UnknownResolution {
                uri: redact_uri(&self.uri),
            }
        })
    }
}

impl SourceConnector for FfmpegConnector {
    fn connect(&self) -> Result<Box<dyn FrameSource>, CaptureError> {
        let resolution = match self.options.output {
            Some(size) => size,
            None => self.probe_resolution()?,
        };

        let args = ffmpeg_args(&self.uri, self.kind, resolution, &self.options);
        debug!(source = %redact_uri(&self.uri), %resolution, "launching ffmpeg decoder");

        let mut child = Command::new(&self.options.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(CaptureError::Spawn)?;

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")));
            }
        };

        let frame_bytes = resolution.pixel_count() * 3;
        Ok(Box::new(FfmpegSource {
            child: Arc::new(Mutex::new(child)),
            stdout,
            resolution,
            scratch: vec![0u8; frame_bytes],
        }))
    }

    fn describe(&self) -> String {
        format!("ffmpeg:{}", redact_uri(&self.uri))
    }
}

struct FfmpegSource {
    child: Arc<Mutex<Child>>,
    stdout: ChildStdout,
    resolution: Resolution,
    scratch: Vec<u8>,
}

impl FfmpegSource {
    fn fill(stdout: &mut ChildStdout, buf: &mut [u8]) -> Result<(), CaptureError> {
        stdout.read_exact(buf).map_err(|err| match err.kind() {
            ErrorKind::UnexpectedEof => CaptureError::EndOfStream,
            _ => CaptureError::Read(err),
        })
    }
}

impl FrameSource for FfmpegSource {
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        let mut data = vec![0u8; self.scratch.len()];
        Self::fill(&mut self.stdout, &mut data)?;
        Ok(Frame::bgr8(data, self.resolution))
    }

    fn grab(&mut self) -> Result<(), CaptureError> {
        Self::fill(&mut self.stdout, &mut self.scratch)
    }

    fn abort_handle(&self) -> Option<AbortHandle> {
        let child = self.child.clone();
        Some(Arc::new(move || {
            let _ = child.lock().unwrap_or_else(PoisonError::into_inner).kill();
        }))
    }

    fn close(&mut self) {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = child.kill();
        let _ = child.wait();
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn input_path(uri: &str, kind: SourceKind) -> String {
    match (kind, parse_device_index(uri)) {
        (SourceKind::Device, Some(index)) => format!("/dev/video{index}"),
        _ => uri.to_string(),
    }
}

/// Demuxer options placed before `-i`. Shared by ffmpeg and ffprobe.
fn input_args(kind: SourceKind, options: &FfmpegOptions, decode: bool) -> Vec<String> {
    let timeout_us = options.io_timeout.as_micros().to_string();
    let mut args: Vec<String> = Vec::new();
    match kind {
        SourceKind::Rtsp => {
            args.extend(["-rtsp_transport", "tcp", "-timeout"].map(String::from));
            args.push(timeout_us);
        }
        SourceKind::Http => {
            args.push("-rw_timeout".into());
            args.push(timeout_us);
        }
        SourceKind::Device => {
            args.extend(["-f", "video4linux2"].map(String::from));
        }
        SourceKind::File => {
            if decode {
                if options.loop_files {
                    args.extend(["-stream_loop", "-1"].map(String::from));
                }
                // Pace files at their native rate, like a live camera.
                args.push("-re".into());
            }
        }
    }
    if decode && kind.is_network() {
        // Keep the demuxer from queueing frames while we are not reading.
        args.extend(
            ["-fflags", "nobuffer", "-flags", "low_delay", "-max_delay", "0"].map(String::from),
        );
    }
    args
}

pub(crate) fn ffmpeg_args(
    uri: &str,
    kind: SourceKind,
    size: Resolution,
    options: &FfmpegOptions,
) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
        .map(String::from)
        .to_vec();
    args.extend(input_args(kind, options, true));
    if options.use_nvdec {
        args.extend(["-hwaccel", "cuda"].map(String::from));
    }
    args.push("-i".into());
    args.push(input_path(uri, kind));
    args.push("-an".into());
    args.push("-vf".into());
    args.push(format!("scale={}:{}", size.width, size.height));
    args.extend(["-pix_fmt", "bgr24", "-f", "rawvideo", "-"].map(String::from));
    args
}

fn parse_probe_output(stdout: &str) -> Option<Resolution> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let (w, h) = line.split_once('x')?;
    let resolution = Resolution::new(w.trim().parse().ok()?, h.trim().parse().ok()?);
    (!resolution.is_empty()).then_some(resolution)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(args: &[String], flag: &str) -> Option<usize> {
        args.iter().position(|a| a == flag)
    }

    #[test]
    fn rtsp_args_request_low_latency_tcp() {
        let opts = FfmpegOptions::default();
        let args = ffmpeg_args(
            "rtsp://cam/Streaming/Channels/102",
            SourceKind::Rtsp,
            Resolution::new(1280, 720),
            &opts,
        );
        let input = position(&args, "-i").unwrap();
        let transport = position(&args, "-rtsp_transport").unwrap();
        assert!(transport < input);
        assert_eq!(args[transport + 1], "tcp");
        assert_eq!(args[position(&args, "-timeout").unwrap() + 1], "5000000");
        assert_eq!(args[position(&args, "-fflags").unwrap() + 1], "nobuffer");
        assert!(args.contains(&"scale=1280:720".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn file_sources_loop_at_native_rate() {
        let opts = FfmpegOptions::default();
        let args = ffmpeg_args("belt.mp4", SourceKind::File, Resolution::new(640, 360), &opts);
        assert!(position(&args, "-stream_loop").unwrap() < position(&args, "-i").unwrap());
        assert!(args.contains(&"-re".to_string()));
        assert!(!args.contains(&"nobuffer".to_string()));
    }

    #[test]
    fn device_index_maps_to_v4l_path() {
        let args = ffmpeg_args(
            "2",
            SourceKind::Device,
            Resolution::new(640, 480),
            &FfmpegOptions::default(),
        );
        assert_eq!(args[position(&args, "-i").unwrap() + 1], "/dev/video2");
        assert!(args.contains(&"video4linux2".to_string()));
    }

    #[test]
    fn nvdec_flag_is_optional() {
        let mut opts = FfmpegOptions::default();
        let plain = ffmpeg_args("a.mp4", SourceKind::File, Resolution::new(8, 8), &opts);
        assert!(!plain.contains(&"-hwaccel".to_string()));
        opts.use_nvdec = true;
        let gpu = ffmpeg_args("a.mp4", SourceKind::File, Resolution::new(8, 8), &opts);
        assert!(position(&gpu, "-hwaccel").unwrap() < position(&gpu, "-i").unwrap());
    }

    #[test]
    fn probe_output_parsing() {
        assert_eq!(parse_probe_output("1920x1080\n"), Some(Resolution::new(1920, 1080)));
        assert_eq!(parse_probe_output("\n 704x576 \n"), Some(Resolution::new(704, 576)));
        assert_eq!(parse_probe_output("0x0"), None);
        assert_eq!(parse_probe_output("garbage"), None);
    }
}
