use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use image::imageops::{self, FilterType};
use image::RgbImage;
use thiserror::Error;

use crate::analytics::Detector;
use crate::annotate;
use crate::buffer::DropOldestBuffer;
use crate::camera::{FrameSource, SourceError, SourceOpener};
use crate::config::PipelineConfig;
use crate::shutdown::Shutdown;
use crate::store::{Feed, FeedId};
use crate::tasks::{Task, TaskQueue};
use crate::tracking::{CentroidTracker, CrossingCounter};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source {locator} unavailable after {attempts} attempt(s): {source}")]
    SourceUnavailable {
        locator: String,
        attempts: u32,
        source: SourceError,
    },
    #[error("cancelled while opening {0}")]
    Cancelled(String),
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A processed frame with the counting line and tracked objects drawn on it.
#[derive(Debug, Clone)]
pub struct AnnotatedFrame {
    pub feed_id: FeedId,
    pub image: RgbImage,
    /// Index among processed frames, starting at 1.
    pub sequence: u64,
    pub tracked: usize,
    pub crossings: usize,
}

/// Admits the Nth, 2Nth, 3Nth... frame.
#[derive(Debug, Clone)]
pub struct FrameSampler {
    every: u64,
    seen: u64,
}

impl FrameSampler {
    pub fn new(every: u32) -> Self {
        Self {
            every: every.max(1) as u64,
            seen: 0,
        }
    }

    pub fn admit(&mut self) -> bool {
        self.seen += 1;
        self.seen % self.every == 0
    }
}

/// Per-feed detect, track and count stage. Owns all per-feed state, so it
/// needs no locking besides the store's.
pub struct ProcessingUnit {
    feed_id: FeedId,
    feed_name: String,
    detector: Box<dyn Detector>,
    tracker: CentroidTracker,
    counter: CrossingCounter,
    tasks: Option<TaskQueue>,
    sampler: FrameSampler,
    width: u32,
    height: u32,
    processed: u64,
}

impl ProcessingUnit {
    pub fn new(
        feed: &Feed,
        detector: Box<dyn Detector>,
        tracker: CentroidTracker,
        counter: CrossingCounter,
        tasks: Option<TaskQueue>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            feed_id: feed.id,
            feed_name: feed.display_name(),
            detector,
            tracker,
            counter,
            tasks,
            sampler: FrameSampler::new(config.frame_skip),
            width: config.process_width,
            height: config.process_height,
            processed: 0,
        }
    }

    /// Runs one captured frame through the stage. Returns `None` for frames
    /// the sampler skips and for frames the detector failed on.
    pub fn handle(&mut self, frame: RgbImage) -> Option<AnnotatedFrame> {
        if !self.sampler.admit() {
            return None;
        }

        let mut frame = if frame.dimensions() == (self.width, self.height) {
            frame
        } else {
            imageops::resize(&frame, self.width, self.height, FilterType::Triangle)
        };

        let detections = match self.detector.detect(&frame) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(feed = self.feed_id, error = %e, "detection failed, skipping frame");
                return None;
            }
        };

        let disappeared = self.tracker.update(&detections);
        let crossings = self.counter.observe(self.tracker.objects_mut(), &disappeared);

        if let Some(tasks) = &self.tasks {
            for crossing in &crossings {
                let Some((x, y, w, h)) = crossing.bbox.clip(self.width, self.height) else {
                    continue;
                };
                let crop = imageops::crop_imm(&frame, x, y, w, h).to_image();
                tasks.try_enqueue(Task::new(crop, crossing.direction, self.feed_name.as_str()));
            }
        }

        annotate::draw_overlay(&mut frame, self.counter.line_y(), self.tracker.objects().values());
        self.processed += 1;

        Some(AnnotatedFrame {
            feed_id: self.feed_id,
            image: frame,
            sequence: self.processed,
            tracked: self.tracker.objects().len(),
            crossings: crossings.len(),
        })
    }
}

/// One worker thread plus the channel that disconnects when it exits.
struct Unit {
    name: String,
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

impl Unit {
    fn spawn<F>(name: String, body: F) -> std::io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (done_tx, done) = crossbeam_channel::bounded::<()>(0);
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let _done = done_tx;
            body();
        })?;
        Ok(Self { name, handle, done })
    }

    fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Joins within `timeout`, otherwise leaves the thread running detached.
    fn join(self, timeout: Duration) -> bool {
        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(unit = %self.name, "unit did not stop in time, abandoning it");
                false
            }
            _ => {
                if self.handle.join().is_err() {
                    tracing::error!(unit = %self.name, "unit panicked");
                }
                true
            }
        }
    }
}

/// Capture and processing threads for a single feed, joined by a pair of
/// drop-oldest buffers.
pub struct FeedPipeline {
    feed_id: FeedId,
    name: String,
    shutdown: Shutdown,
    results: Arc<DropOldestBuffer<AnnotatedFrame>>,
    capture: Option<Unit>,
    process: Option<Unit>,
    join_timeout: Duration,
}

impl FeedPipeline {
    /// Opens the feed's source, retrying a bounded number of times, then
    /// spawns the capture and processing units.
    pub fn start(
        feed: &Feed,
        locator: &str,
        opener: Arc<dyn SourceOpener>,
        unit: ProcessingUnit,
        config: &PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let shutdown = Shutdown::new();
        let source = open_with_retries(
            opener.as_ref(),
            locator,
            config.open_attempts,
            config.open_retry_delay(),
            &shutdown,
        )?;

        let frames = Arc::new(DropOldestBuffer::<RgbImage>::new("frames", config.frame_buffer));
        let results = Arc::new(DropOldestBuffer::new("results", config.result_buffer));

        let capture = {
            let frames = Arc::clone(&frames);
            let shutdown = shutdown.clone();
            let locator = locator.to_string();
            let reopen_delay = config.reopen_delay();
            let feed_id = feed.id;
            Unit::spawn(format!("capture-{}", feed.id), move || {
                capture_loop(feed_id, source, opener.as_ref(), &locator, &frames, &shutdown, reopen_delay)
            })?
        };

        let process = {
            let results = Arc::clone(&results);
            let shutdown_p = shutdown.clone();
            let frame_wait = config.frame_wait();
            let feed_id = feed.id;
            match Unit::spawn(format!("process-{}", feed.id), move || {
                process_loop(feed_id, unit, &frames, &results, &shutdown_p, frame_wait)
            }) {
                Ok(u) => u,
                Err(e) => {
                    shutdown.trigger();
                    capture.join(config.join_timeout());
                    return Err(e.into());
                }
            }
        };

        tracing::info!(feed = feed.id, name = %feed.display_name(), source = %locator, "feed pipeline started");

        Ok(Self {
            feed_id: feed.id,
            name: feed.display_name(),
            shutdown,
            results,
            capture: Some(capture),
            process: Some(process),
            join_timeout: config.join_timeout(),
        })
    }

    pub fn feed_id(&self) -> FeedId {
        self.feed_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_triggered()
            && self.capture.as_ref().is_some_and(Unit::is_alive)
            && self.process.as_ref().is_some_and(Unit::is_alive)
    }

    /// Newest annotated frame. Older pending results are discarded.
    pub fn latest_frame(&self) -> Option<AnnotatedFrame> {
        self.results.latest()
    }

    /// Signals both units and joins each within the configured timeout.
    /// Safe to call more than once.
    pub fn stop(&mut self) {
        if self.capture.is_none() && self.process.is_none() {
            return;
        }
        self.shutdown.trigger();

        let mut clean = true;
        if let Some(unit) = self.process.take() {
            clean &= unit.join(self.join_timeout);
        }
        if let Some(unit) = self.capture.take() {
            clean &= unit.join(self.join_timeout);
        }

        tracing::info!(feed = self.feed_id, clean, "feed pipeline stopped");
    }
}

impl Drop for FeedPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_with_retries(
    opener: &dyn SourceOpener,
    locator: &str,
    attempts: u32,
    delay: Duration,
    shutdown: &Shutdown,
) -> Result<Box<dyn FrameSource>, PipelineError> {
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match opener.open(locator) {
            Ok(source) => return Ok(source),
            Err(e) if attempt >= attempts => {
                return Err(PipelineError::SourceUnavailable {
                    locator: locator.to_string(),
                    attempts,
                    source: e,
                })
            }
            Err(e) => {
                tracing::warn!(source = %locator, attempt, error = %e, "failed to open source, retrying");
                if shutdown.wait(delay) {
                    return Err(PipelineError::Cancelled(locator.to_string()));
                }
            }
        }
    }
}

fn capture_loop(
    feed_id: FeedId,
    source: Box<dyn FrameSource>,
    opener: &dyn SourceOpener,
    locator: &str,
    frames: &DropOldestBuffer<RgbImage>,
    shutdown: &Shutdown,
    reopen_delay: Duration,
) {
    tracing::debug!(feed = feed_id, "capture started");
    let mut source = Some(source);

    while !shutdown.is_triggered() {
        let Some(current) = source.as_mut() else {
            match opener.open(locator) {
                Ok(s) => {
                    tracing::info!(feed = feed_id, "source reopened");
                    source = Some(s);
                }
                Err(e) => {
                    tracing::warn!(feed = feed_id, error = %e, "failed to reopen source");
                    if shutdown.wait(reopen_delay) {
                        break;
                    }
                }
            }
            continue;
        };

        match current.read_frame() {
            Ok(Some(frame)) => {
                frames.push(frame);
            }
            Ok(None) if current.is_finite() => {
                tracing::debug!(feed = feed_id, "end of file, rewinding");
                if let Err(e) = current.rewind() {
                    tracing::warn!(feed = feed_id, error = %e, "failed to rewind source");
                    source = None;
                }
            }
            Ok(None) => {
                tracing::warn!(feed = feed_id, "stream ended, reopening");
                source = None;
                if shutdown.wait(reopen_delay) {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(feed = feed_id, error = %e, "frame read failed, reopening");
                source = None;
                if shutdown.wait(reopen_delay) {
                    break;
                }
            }
        }
    }

    drop(source);
    tracing::debug!(feed = feed_id, "capture stopped, source released");
}

fn process_loop(
    feed_id: FeedId,
    mut unit: ProcessingUnit,
    frames: &DropOldestBuffer<RgbImage>,
    results: &DropOldestBuffer<AnnotatedFrame>,
    shutdown: &Shutdown,
    frame_wait: Duration,
) {
    tracing::debug!(feed = feed_id, "processing started");

    while !shutdown.is_triggered() {
        let Some(frame) = frames.pop(frame_wait, shutdown) else {
            continue;
        };
        if let Some(result) = unit.handle(frame) {
            results.push(result);
        }
    }

    tracing::debug!(feed = feed_id, "processing stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::DetectError;
    use crate::camera::testing::{solid, ScriptedSource};
    use crate::geometry::BBox;
    use crate::store::testing::{read_doc, store_with};
    use crate::store::CounterStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    const DOC: &str = r#"{
        "feeds": [
            {"id": 7, "name": "Gate", "type": "counter", "video_source": "gate.mp4", "status": "active"}
        ],
        "global_car_count": 0
    }"#;

    /// One box centred at (25, v) where v is the frame's grey level.
    struct GreyLevel;

    impl Detector for GreyLevel {
        fn detect(&mut self, image: &RgbImage) -> Result<Vec<BBox>, DetectError> {
            let v = image.get_pixel(0, 0)[0] as f32;
            Ok(vec![BBox::new(20.0, v - 5.0, 10.0, 10.0)])
        }
    }

    struct Failing;

    impl Detector for Failing {
        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<BBox>, DetectError> {
            Err(DetectError::Inference("model exploded".into()))
        }
    }

    fn config(frame_skip: u32) -> PipelineConfig {
        PipelineConfig {
            frame_skip,
            process_width: 64,
            process_height: 48,
            open_attempts: 2,
            open_retry_delay_ms: 10,
            reopen_delay_ms: 10,
            frame_wait_ms: 50,
            ..PipelineConfig::default()
        }
    }

    fn unit(
        store: &CounterStore,
        detector: Box<dyn Detector>,
        tasks: Option<TaskQueue>,
        cfg: &PipelineConfig,
    ) -> ProcessingUnit {
        let feed = store.snapshot().unwrap().feed(7).unwrap().clone();
        let counter = CrossingCounter::for_feed(&feed, store.clone(), cfg.process_height);
        ProcessingUnit::new(&feed, detector, CentroidTracker::new(10, 50.0), counter, tasks, cfg)
    }

    fn moving_frames() -> Vec<RgbImage> {
        [10u8, 14, 18, 22, 26, 30]
            .into_iter()
            .map(|v| solid(64, 48, v))
            .collect()
    }

    #[test]
    fn test_sampler_admits_every_nth() {
        let mut sampler = FrameSampler::new(3);
        let admitted: Vec<bool> = (0..9).map(|_| sampler.admit()).collect();
        assert_eq!(
            admitted,
            vec![false, false, true, false, false, true, false, false, true]
        );
        assert!(FrameSampler::new(1).admit());
    }

    #[test]
    fn test_handle_processes_one_in_n() {
        let store = store_with("unit_skip", DOC);
        let cfg = config(3);
        let mut unit = unit(&store, Box::new(GreyLevel), None, &cfg);
        let processed = (0..9)
            .filter_map(|_| unit.handle(solid(64, 48, 10)))
            .count();
        assert_eq!(processed, 3);
    }

    #[test]
    fn test_crossing_counts_and_enqueues_task() {
        let store = store_with("unit_crossing", DOC);
        let cfg = config(1);
        let (queue, rx) = TaskQueue::bounded(4);
        let mut unit = unit(&store, Box::new(GreyLevel), Some(queue), &cfg);

        let crossings: usize = moving_frames()
            .into_iter()
            .filter_map(|f| unit.handle(f))
            .map(|r| r.crossings)
            .sum();
        assert_eq!(crossings, 1);

        let doc = read_doc(&store);
        assert_eq!(doc.global_car_count, 1);
        assert_eq!(doc.feed(7).unwrap().count, 1);

        let task = rx.try_recv().unwrap();
        assert_eq!(task.feed_name, "Gate");
        assert_eq!(task.image.dimensions(), (10, 10));
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_resizes_to_processing_resolution() {
        let store = store_with("unit_resize", DOC);
        let cfg = config(1);
        let mut unit = unit(&store, Box::new(GreyLevel), None, &cfg);
        let result = unit.handle(solid(128, 96, 10)).unwrap();
        assert_eq!(result.image.dimensions(), (64, 48));
    }

    #[test]
    fn test_detector_failure_skips_frame() {
        let store = store_with("unit_fail", DOC);
        let cfg = config(1);
        let mut unit = unit(&store, Box::new(Failing), None, &cfg);
        assert!(unit.handle(solid(64, 48, 10)).is_none());
        assert!(unit.handle(solid(64, 48, 10)).is_none());
    }

    #[test]
    fn test_pipeline_lifecycle() {
        let store = store_with("pipeline_lifecycle", DOC);
        let feed = store.snapshot().unwrap().feed(7).unwrap().clone();
        let cfg = config(1);
        let rewinds = Arc::new(AtomicUsize::new(0));
        let shared = Arc::clone(&rewinds);
        let opener: Arc<dyn SourceOpener> =
            Arc::new(move |_: &str| -> Result<Box<dyn FrameSource>, SourceError> {
                let mut src = ScriptedSource::new(moving_frames());
                src.rewinds = Arc::clone(&shared);
                Ok(Box::new(src))
            });

        let unit = unit(&store, Box::new(GreyLevel), None, &cfg);
        let mut pipeline = FeedPipeline::start(&feed, "gate.mp4", opener, unit, &cfg).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut frame = None;
        while frame.is_none() && Instant::now() < deadline {
            frame = pipeline.latest_frame();
            thread::sleep(Duration::from_millis(10));
        }
        let frame = frame.expect("no annotated frame produced");
        assert_eq!(frame.feed_id, 7);
        assert_eq!(frame.image.dimensions(), (64, 48));
        assert!(pipeline.is_running());

        // six frames at 2ms each loop many times within this window
        while rewinds.load(Ordering::Relaxed) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(rewinds.load(Ordering::Relaxed) > 0);

        let start = Instant::now();
        pipeline.stop();
        assert!(!pipeline.is_running());
        assert!(start.elapsed() < Duration::from_secs(2));
        pipeline.stop();
    }

    #[test]
    fn test_dropped_stream_is_reopened() {
        let store = store_with("pipeline_reopen", DOC);
        let feed = store.snapshot().unwrap().feed(7).unwrap().clone();
        let cfg = config(1);
        let opens = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&opens);
        let opener: Arc<dyn SourceOpener> =
            Arc::new(move |locator: &str| -> Result<Box<dyn FrameSource>, SourceError> {
                // the second attempt hits a camera that is still down
                if counted.fetch_add(1, Ordering::Relaxed) == 1 {
                    return Err(SourceError::Unavailable(locator.to_string()));
                }
                Ok(Box::new(ScriptedSource::live(moving_frames())))
            });

        let unit = unit(&store, Box::new(GreyLevel), None, &cfg);
        let mut pipeline = FeedPipeline::start(&feed, "rtsp://cam", opener, unit, &cfg).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while opens.load(Ordering::Relaxed) < 4 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(opens.load(Ordering::Relaxed) >= 4);
        assert!(pipeline.is_running());

        // frames keep flowing from the reopened source
        while pipeline.latest_frame().is_some() {}
        let mut frame = None;
        while frame.is_none() && Instant::now() < deadline {
            frame = pipeline.latest_frame();
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(frame.map(|f| f.feed_id), Some(7));

        pipeline.stop();
        assert!(!pipeline.is_running());
    }

    #[test]
    fn test_stop_interrupts_blocked_processing() {
        let store = store_with("pipeline_blocked", DOC);
        let feed = store.snapshot().unwrap().feed(7).unwrap().clone();
        let cfg = PipelineConfig {
            frame_wait_ms: 60_000,
            ..config(1)
        };
        // never yields a frame, so processing sits in its buffer wait
        let opener: Arc<dyn SourceOpener> =
            Arc::new(|_: &str| -> Result<Box<dyn FrameSource>, SourceError> {
                Ok(Box::new(ScriptedSource::new(Vec::new())))
            });

        let unit = unit(&store, Box::new(GreyLevel), None, &cfg);
        let mut pipeline = FeedPipeline::start(&feed, "gate.mp4", opener, unit, &cfg).unwrap();
        thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        pipeline.stop();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(pipeline.latest_frame().is_none());
    }

    #[test]
    fn test_unavailable_source_gives_up() {
        let store = store_with("pipeline_unavailable", DOC);
        let feed = store.snapshot().unwrap().feed(7).unwrap().clone();
        let cfg = config(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let opener: Arc<dyn SourceOpener> =
            Arc::new(move |locator: &str| -> Result<Box<dyn FrameSource>, SourceError> {
                counted.fetch_add(1, Ordering::Relaxed);
                Err(SourceError::Unavailable(locator.to_string()))
            });

        let unit = unit(&store, Box::new(GreyLevel), None, &cfg);
        let err = FeedPipeline::start(&feed, "gate.mp4", opener, unit, &cfg).err();
        assert!(matches!(
            err,
            Some(PipelineError::SourceUnavailable { attempts: 2, .. })
        ));
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }
}
