use std::io::Read;
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};

use image::RgbImage;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ffmpeg not found")]
    FfmpegNotFound,
    #[error("ffmpeg failed: {0}")]
    FfmpegFailed(String),
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// A stream of decoded frames.
pub trait FrameSource: Send {
    /// Next frame, or `Ok(None)` at end of stream.
    fn read_frame(&mut self) -> Result<Option<RgbImage>, SourceError>;

    /// Restarts from the first frame. Only meaningful for finite sources.
    fn rewind(&mut self) -> Result<(), SourceError>;

    /// Files loop; cameras and network streams do not.
    fn is_finite(&self) -> bool;
}

/// Opens sources by locator. Dropping the returned source releases it.
pub trait SourceOpener: Send + Sync {
    fn open(&self, locator: &str) -> Result<Box<dyn FrameSource>, SourceError>;
}

impl<F> SourceOpener for F
where
    F: Fn(&str) -> Result<Box<dyn FrameSource>, SourceError> + Send + Sync,
{
    fn open(&self, locator: &str) -> Result<Box<dyn FrameSource>, SourceError> {
        self(locator)
    }
}

/// Opens every locator through an ffmpeg subprocess scaled to a fixed size.
#[derive(Debug, Clone, Copy)]
pub struct FfmpegOpener {
    pub width: u32,
    pub height: u32,
}

impl SourceOpener for FfmpegOpener {
    fn open(&self, locator: &str) -> Result<Box<dyn FrameSource>, SourceError> {
        Ok(Box::new(FfmpegSource::open(locator, self.width, self.height)?))
    }
}

/// Decodes any ffmpeg input into raw RGB frames read from its stdout.
pub struct FfmpegSource {
    locator: String,
    width: u32,
    height: u32,
    finite: bool,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    /// First frame, read while opening to prove the input is usable.
    primed: Option<RgbImage>,
}

impl FfmpegSource {
    pub fn open(locator: &str, width: u32, height: u32) -> Result<Self, SourceError> {
        let finite = !locator.contains("://") && !locator.starts_with("/dev/");
        if finite && !Path::new(locator).exists() {
            return Err(SourceError::Unavailable(format!("{locator}: no such file")));
        }

        let mut source = Self {
            locator: locator.to_string(),
            width,
            height,
            finite,
            child: None,
            stdout: None,
            primed: None,
        };
        source.start()?;
        Ok(source)
    }

    fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    fn start(&mut self) -> Result<(), SourceError> {
        self.stop();

        let mut child = self.spawn_ffmpeg()?;
        let stdout = child.stdout.take().ok_or(SourceError::FfmpegFailed(
            "failed to capture stdout".to_string(),
        ))?;
        self.child = Some(child);
        self.stdout = Some(stdout);

        match self.read_raw()? {
            Some(frame) => {
                self.primed = Some(frame);
                tracing::debug!(source = %self.locator, "ffmpeg source started");
                Ok(())
            }
            None => {
                self.stop();
                Err(SourceError::Unavailable(format!(
                    "{}: no frames decoded",
                    self.locator
                )))
            }
        }
    }

    fn spawn_ffmpeg(&self) -> Result<Child, SourceError> {
        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-hide_banner", "-loglevel", "error"]);

        if self.locator.starts_with("rtsp://") {
            cmd.args(["-rtsp_transport", "tcp"]);
        }
        if self.locator.starts_with("/dev/video") {
            cmd.args(["-f", "v4l2"]);
        }
        if self.finite {
            // play files back at their native rate instead of as fast as
            // they decode
            cmd.arg("-re");
        }

        cmd.args(["-i", &self.locator])
            .args([
                "-an",
                "-vf",
                &format!("scale={}:{}", self.width, self.height),
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgb24",
                "pipe:1",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    SourceError::FfmpegNotFound
                } else {
                    SourceError::Io(e)
                }
            })
    }

    fn read_raw(&mut self) -> Result<Option<RgbImage>, SourceError> {
        let size = self.frame_size();
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(None);
        };

        let mut buf = vec![0u8; size];
        match stdout.read_exact(&mut buf) {
            Ok(()) => Ok(RgbImage::from_raw(self.width, self.height, buf)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn stop(&mut self) {
        self.stdout.take();
        self.primed.take();
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl FrameSource for FfmpegSource {
    fn read_frame(&mut self) -> Result<Option<RgbImage>, SourceError> {
        if let Some(frame) = self.primed.take() {
            return Ok(Some(frame));
        }
        self.read_raw()
    }

    fn rewind(&mut self) -> Result<(), SourceError> {
        self.start()
    }

    fn is_finite(&self) -> bool {
        self.finite
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    pub fn solid(width: u32, height: u32, value: u8) -> RgbImage {
        RgbImage::from_pixel(width, height, image::Rgb([value, value, value]))
    }

    /// In-memory source over a fixed set of frames. Finite ones loop,
    /// live ones fail once the frames run out, like a dropped stream.
    pub struct ScriptedSource {
        frames: Vec<RgbImage>,
        queue: VecDeque<RgbImage>,
        live: bool,
        pub rewinds: Arc<AtomicUsize>,
    }

    impl ScriptedSource {
        pub fn new(frames: Vec<RgbImage>) -> Self {
            Self {
                queue: frames.iter().cloned().collect(),
                frames,
                live: false,
                rewinds: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn live(frames: Vec<RgbImage>) -> Self {
            Self {
                live: true,
                ..Self::new(frames)
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn read_frame(&mut self) -> Result<Option<RgbImage>, SourceError> {
            // pace like a real stream
            std::thread::sleep(std::time::Duration::from_millis(2));
            match self.queue.pop_front() {
                None if self.live => Err(SourceError::FfmpegFailed("stream dropped".into())),
                frame => Ok(frame),
            }
        }

        fn rewind(&mut self) -> Result<(), SourceError> {
            self.rewinds.fetch_add(1, Ordering::Relaxed);
            self.queue = self.frames.iter().cloned().collect();
            Ok(())
        }

        fn is_finite(&self) -> bool {
            !self.live
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_missing_file_is_unavailable() {
        let err = FfmpegSource::open("/definitely/not/here.mp4", 64, 48).err();
        assert!(matches!(err, Some(SourceError::Unavailable(_))));
    }

    #[test]
    fn test_scripted_source_loops() {
        let mut src = ScriptedSource::new(vec![solid(4, 4, 1), solid(4, 4, 2)]);
        assert!(src.read_frame().unwrap().is_some());
        assert!(src.read_frame().unwrap().is_some());
        assert!(src.read_frame().unwrap().is_none());
        src.rewind().unwrap();
        assert_eq!(src.read_frame().unwrap().unwrap().get_pixel(0, 0)[0], 1);
    }

    #[test]
    fn test_live_scripted_source_drops() {
        let mut src = ScriptedSource::live(vec![solid(4, 4, 1)]);
        assert!(!src.is_finite());
        assert!(src.read_frame().unwrap().is_some());
        assert!(src.read_frame().is_err());
    }

    #[test]
    fn test_closure_opener() {
        let opener = |locator: &str| -> Result<Box<dyn FrameSource>, SourceError> {
            if locator == "ok" {
                Ok(Box::new(ScriptedSource::new(vec![solid(2, 2, 0)])))
            } else {
                Err(SourceError::Unavailable(locator.to_string()))
            }
        };
        assert!(SourceOpener::open(&opener, "ok").is_ok());
        assert!(SourceOpener::open(&opener, "nope").is_err());
    }
}
