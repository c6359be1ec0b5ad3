use std::io;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use image::imageops::{self, FilterType};
use image::RgbImage;
use thiserror::Error;

use crate::analytics::{DetectError, Detector, WholeImage, YoloDetector};
use crate::config::RecognitionConfig;
use crate::shutdown::Shutdown;

use super::plate_log::{PlateLog, PlateRow};
use super::queue::{Task, TaskReceiver};
use super::recognizer::{HttpRecognizer, RecognizeError, Recognition, Recognizer};

/// Plate crops are upscaled to this width before recognition.
const PLATE_WIDTH: u32 = 400;
const FILE_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%6f";

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("plate localization failed: {0}")]
    Detect(#[from] DetectError),
    #[error("recognizer setup failed: {0}")]
    Recognize(#[from] RecognizeError),
    #[error("no recognition endpoint configured")]
    MissingEndpoint,
}

/// What happened to one plate region of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evidence {
    Recognized { text: String, path: PathBuf },
    /// Image kept under its provisional name for review.
    Unreadable { path: PathBuf },
}

/// Drains the task queue: localize plates, save evidence, recognize, log.
pub struct Worker {
    localizer: Box<dyn Detector>,
    recognizer: Box<dyn Recognizer>,
    output_dir: PathBuf,
    log: PlateLog,
}

impl Worker {
    pub fn new(
        localizer: Box<dyn Detector>,
        recognizer: Box<dyn Recognizer>,
        output_dir: impl Into<PathBuf>,
        log_file: impl AsRef<Path>,
    ) -> Result<Self, TaskError> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)?;
        let log = PlateLog::open(log_file)?;
        Ok(Self {
            localizer,
            recognizer,
            output_dir,
            log,
        })
    }

    /// Plate model localizer when one is configured, whole-crop otherwise,
    /// with the HTTP recognizer.
    pub fn from_config(config: &RecognitionConfig) -> Result<Self, TaskError> {
        let localizer: Box<dyn Detector> = match &config.plate_model {
            Some(model) => Box::new(YoloDetector::plates(model)?),
            None => Box::new(WholeImage),
        };
        let endpoint = config.endpoint.as_deref().ok_or(TaskError::MissingEndpoint)?;
        let recognizer = HttpRecognizer::new(
            endpoint,
            config.min_text_len,
            Duration::from_secs(config.request_timeout_secs),
        )?;
        Self::new(localizer, Box::new(recognizer), &config.output_dir, &config.log_file)
    }

    /// Runs a worker on its own thread. `build` executes on that thread so
    /// thread-bound clients are created where they are used.
    pub fn spawn<F>(
        build: F,
        receiver: TaskReceiver,
        shutdown: Shutdown,
    ) -> io::Result<JoinHandle<()>>
    where
        F: FnOnce() -> Result<Worker, TaskError> + Send + 'static,
    {
        thread::Builder::new()
            .name("plate-worker".to_string())
            .spawn(move || match build() {
                Ok(worker) => worker.run(&receiver, &shutdown),
                Err(e) => tracing::error!(error = %e, "failed to start plate worker"),
            })
    }

    pub fn run(mut self, receiver: &TaskReceiver, shutdown: &Shutdown) {
        tracing::info!(output = %self.output_dir.display(), "plate worker started");

        while let Some(task) = receiver.recv(shutdown) {
            if let Err(e) = self.process(&task) {
                tracing::error!(feed = %task.feed_name, error = %e, "failed to process task");
            }
        }

        tracing::info!("plate worker stopped");
    }

    pub fn process(&mut self, task: &Task) -> Result<Vec<Evidence>, TaskError> {
        let (width, height) = task.image.dimensions();
        let regions = self.localizer.detect(&task.image)?;
        let stamp = task.created_at.format(FILE_TIMESTAMP_FORMAT).to_string();
        let location = file_safe(&task.feed_name);

        let mut evidence = Vec::new();
        for (n, region) in regions.iter().enumerate() {
            let Some((x, y, w, h)) = region.clip(width, height) else {
                continue;
            };
            let crop = imageops::crop_imm(&task.image, x, y, w, h).to_image();
            let plate = upscale_to_width(&crop, PLATE_WIDTH);

            let provisional = self
                .output_dir
                .join(format!("plate_{location}_{stamp}_{n}.jpg"));
            plate.save(&provisional)?;
            tracing::debug!(path = %provisional.display(), "plate image saved");

            let recognition = match self.recognizer.recognize(&plate) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(feed = %task.feed_name, error = %e, "plate recognition failed");
                    Recognition::Unreadable
                }
            };

            match recognition {
                Recognition::Text(text) => {
                    self.log.append(&PlateRow {
                        timestamp: task.created_at,
                        plate: &text,
                        location: &task.feed_name,
                        direction: task.direction,
                    })?;

                    let final_path = self.output_dir.join(format!("{text}_{stamp}_{n}.jpg"));
                    let path = match std::fs::rename(&provisional, &final_path) {
                        Ok(()) => final_path,
                        Err(e) => {
                            tracing::warn!(
                                path = %provisional.display(),
                                error = %e,
                                "could not rename plate image"
                            );
                            provisional
                        }
                    };

                    tracing::info!(
                        plate = %text,
                        feed = %task.feed_name,
                        direction = %task.direction,
                        "plate recognized"
                    );
                    evidence.push(Evidence::Recognized { text, path });
                }
                Recognition::Unreadable => {
                    tracing::info!(
                        path = %provisional.display(),
                        "plate unreadable, image kept for review"
                    );
                    evidence.push(Evidence::Unreadable { path: provisional });
                }
            }
        }

        Ok(evidence)
    }
}

fn upscale_to_width(image: &RgbImage, target_width: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    let target_height = ((h as u64 * target_width as u64) / w.max(1) as u64).max(1) as u32;
    imageops::resize(image, target_width, target_height, FilterType::CatmullRom)
}

fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
