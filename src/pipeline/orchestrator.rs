use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;

use crate::analytics::{DetectError, Detector};
use crate::camera::SourceOpener;
use crate::config::Config;
use crate::shutdown::Shutdown;
use crate::store::{CounterStore, FeedId, StoreError};
use crate::tasks::TaskQueue;
use crate::tracking::{CentroidTracker, CrossingCounter};

use super::feed::{AnnotatedFrame, FeedPipeline, ProcessingUnit};

const RELAY_INTERVAL: Duration = Duration::from_millis(30);

/// Receives the newest annotated frame of each running feed.
pub trait FrameSink: Send + Sync {
    fn publish(&self, feed_id: FeedId, frame: AnnotatedFrame);

    /// The feed stopped and will publish nothing more.
    fn retire(&self, feed_id: FeedId);
}

/// Keeps only the most recent frame per feed.
#[derive(Clone, Default)]
pub struct LatestFrames {
    frames: Arc<RwLock<HashMap<FeedId, Arc<AnnotatedFrame>>>>,
}

impl LatestFrames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, feed_id: FeedId) -> Option<Arc<AnnotatedFrame>> {
        self.frames
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&feed_id)
            .cloned()
    }
}

impl FrameSink for LatestFrames {
    fn publish(&self, feed_id: FeedId, frame: AnnotatedFrame) {
        self.frames
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(feed_id, Arc::new(frame));
    }

    fn retire(&self, feed_id: FeedId) {
        self.frames
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&feed_id);
    }
}

/// Builds a fresh vehicle detector for each feed.
pub type DetectorFactory = dyn Fn() -> Result<Box<dyn Detector>, DetectError> + Send + Sync;

#[derive(Debug, Clone, Serialize)]
pub struct ActiveFeed {
    pub id: FeedId,
    pub name: String,
}

/// Runs one pipeline per active feed and relays their output to a sink.
pub struct FeedOrchestrator {
    pipelines: Arc<Mutex<Vec<FeedPipeline>>>,
    shutdown: Shutdown,
    relay: Mutex<Option<JoinHandle<()>>>,
}

impl FeedOrchestrator {
    /// Starts every active feed in the store. Feeds whose source cannot be
    /// opened, or whose detector fails to load, are logged and skipped.
    pub fn start(
        store: &CounterStore,
        config: &Config,
        opener: Arc<dyn SourceOpener>,
        detectors: &DetectorFactory,
        tasks: Option<TaskQueue>,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Self, StoreError> {
        let document = store.snapshot()?;
        let base = store.base_dir();
        let mut pipelines = Vec::new();

        for feed in document.active_feeds() {
            let detector = match detectors() {
                Ok(d) => d,
                Err(e) => {
                    tracing::error!(feed = feed.id, error = %e, "failed to load detector, skipping feed");
                    continue;
                }
            };

            let tracker = CentroidTracker::new(config.tracker.max_disappeared, config.tracker.max_distance);
            let counter = CrossingCounter::for_feed(feed, store.clone(), config.pipeline.process_height);
            let unit = ProcessingUnit::new(feed, detector, tracker, counter, tasks.clone(), &config.pipeline);
            let locator = feed.resolve_source(&base);

            match FeedPipeline::start(feed, &locator, Arc::clone(&opener), unit, &config.pipeline) {
                Ok(pipeline) => pipelines.push(pipeline),
                Err(e) => {
                    tracing::error!(feed = feed.id, name = %feed.display_name(), error = %e, "failed to start feed, skipping");
                }
            }
        }

        tracing::info!(started = pipelines.len(), "feed orchestrator running");

        let pipelines = Arc::new(Mutex::new(pipelines));
        let shutdown = Shutdown::new();

        let relay = {
            let pipelines = Arc::clone(&pipelines);
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name("frame-relay".to_string())
                .spawn(move || relay_loop(&pipelines, sink.as_ref(), &shutdown))
        };
        let relay = match relay {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!(error = %e, "failed to spawn frame relay");
                None
            }
        };

        Ok(Self {
            pipelines,
            shutdown,
            relay: Mutex::new(relay),
        })
    }

    pub fn active_feeds(&self) -> Vec<ActiveFeed> {
        self.pipelines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|p| p.is_running())
            .map(|p| ActiveFeed {
                id: p.feed_id(),
                name: p.name().to_string(),
            })
            .collect()
    }

    /// Stops the relay, then every pipeline.
    pub fn stop(&self) {
        self.shutdown.trigger();
        if let Some(handle) = self
            .relay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            if handle.join().is_err() {
                tracing::error!("frame relay panicked");
            }
        }

        let mut pipelines = self.pipelines.lock().unwrap_or_else(PoisonError::into_inner);
        for pipeline in pipelines.iter_mut() {
            pipeline.stop();
        }
        if !pipelines.is_empty() {
            pipelines.clear();
            tracing::info!("feed orchestrator stopped");
        }
    }
}

impl Drop for FeedOrchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn relay_loop(pipelines: &Mutex<Vec<FeedPipeline>>, sink: &dyn FrameSink, shutdown: &Shutdown) {
    while !shutdown.wait(RELAY_INTERVAL) {
        let dead = {
            let mut pipelines = pipelines.lock().unwrap_or_else(PoisonError::into_inner);
            let (alive, dead): (Vec<_>, Vec<_>) =
                pipelines.drain(..).partition(FeedPipeline::is_running);
            *pipelines = alive;
            for pipeline in pipelines.iter() {
                if let Some(frame) = pipeline.latest_frame() {
                    sink.publish(pipeline.feed_id(), frame);
                }
            }
            dead
        };

        // stopping joins threads with a timeout, keep the lock free meanwhile
        for mut pipeline in dead {
            tracing::warn!(feed = pipeline.feed_id(), "feed pipeline no longer running, dropping it");
            pipeline.stop();
            sink.retire(pipeline.feed_id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::DetectError;
    use crate::camera::testing::{solid, ScriptedSource};
    use crate::camera::{FrameSource, SourceError};
    use crate::config::PipelineConfig;
    use crate::geometry::BBox;
    use crate::store::testing::store_with;
    use image::RgbImage;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    const DOC: &str = r#"{
        "feeds": [
            {"id": 1, "name": "Gate", "type": "counter", "video_source": "gate.mp4", "status": "active"},
            {"id": 2, "name": "Broken", "type": "counter", "video_source": "missing.mp4", "status": "active"},
            {"id": 3, "name": "Lot", "type": "multicam", "video_source": "lot.mp4", "status": "active",
             "totalSlots": 5, "availableSlots": 5},
            {"id": 4, "name": "Off", "type": "counter", "video_source": "gate.mp4", "status": "inactive"}
        ],
        "global_car_count": 0
    }"#;

    struct Nothing;

    impl Detector for Nothing {
        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<BBox>, DetectError> {
            Ok(Vec::new())
        }
    }

    /// Works until told to crash, which takes its processing thread down.
    struct Crashing(Arc<AtomicBool>);

    impl Detector for Crashing {
        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<BBox>, DetectError> {
            if self.0.load(Ordering::Relaxed) {
                panic!("detector crashed");
            }
            Ok(Vec::new())
        }
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            if Instant::now() > deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        true
    }

    fn config() -> Config {
        let mut config = Config::parse("").unwrap();
        config.pipeline = PipelineConfig {
            frame_skip: 1,
            process_width: 32,
            process_height: 24,
            open_attempts: 1,
            open_retry_delay_ms: 10,
            frame_wait_ms: 20,
            ..PipelineConfig::default()
        };
        config
    }

    #[test]
    fn test_starts_active_feeds_and_relays_frames() {
        let store = store_with("orchestrator", DOC);
        let opener: Arc<dyn SourceOpener> =
            Arc::new(|locator: &str| -> Result<Box<dyn FrameSource>, SourceError> {
                if locator.ends_with("missing.mp4") {
                    return Err(SourceError::Unavailable(locator.to_string()));
                }
                Ok(Box::new(ScriptedSource::new(vec![solid(32, 24, 0); 4])))
            });
        let frames = LatestFrames::new();
        let factory = || -> Result<Box<dyn Detector>, DetectError> { Ok(Box::new(Nothing)) };

        let orchestrator = FeedOrchestrator::start(
            &store,
            &config(),
            opener,
            &factory,
            None,
            Arc::new(frames.clone()),
        )
        .unwrap();

        let mut ids: Vec<FeedId> = orchestrator.active_feeds().iter().map(|f| f.id).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 3]);

        let deadline = Instant::now() + Duration::from_secs(5);
        while (frames.get(1).is_none() || frames.get(3).is_none()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(frames.get(1).unwrap().feed_id, 1);
        assert_eq!(frames.get(3).unwrap().image.dimensions(), (32, 24));
        assert!(frames.get(2).is_none());

        orchestrator.stop();
        assert!(orchestrator.active_feeds().is_empty());
    }

    #[test]
    fn test_detector_failure_skips_feed() {
        let store = store_with("orchestrator_nodetector", DOC);
        let opener: Arc<dyn SourceOpener> =
            Arc::new(|_: &str| -> Result<Box<dyn FrameSource>, SourceError> {
                Ok(Box::new(ScriptedSource::new(vec![solid(32, 24, 0)])))
            });
        let factory = || -> Result<Box<dyn Detector>, DetectError> {
            Err(DetectError::Inference("no model".into()))
        };

        let orchestrator = FeedOrchestrator::start(
            &store,
            &config(),
            opener,
            &factory,
            None,
            Arc::new(LatestFrames::new()),
        )
        .unwrap();
        assert!(orchestrator.active_feeds().is_empty());
        orchestrator.stop();
    }

    #[test]
    fn test_dead_feed_is_retired() {
        let store = store_with(
            "orchestrator_dead",
            r#"{"feeds": [{"id": 1, "name": "Gate", "type": "counter", "video_source": "gate.mp4", "status": "active"}]}"#,
        );
        let opener: Arc<dyn SourceOpener> =
            Arc::new(|_: &str| -> Result<Box<dyn FrameSource>, SourceError> {
                Ok(Box::new(ScriptedSource::new(vec![solid(32, 24, 0); 4])))
            });
        let crash = Arc::new(AtomicBool::new(false));
        let trigger = Arc::clone(&crash);
        let factory = move || -> Result<Box<dyn Detector>, DetectError> {
            Ok(Box::new(Crashing(Arc::clone(&trigger))))
        };
        let frames = LatestFrames::new();

        let orchestrator = FeedOrchestrator::start(
            &store,
            &config(),
            opener,
            &factory,
            None,
            Arc::new(frames.clone()),
        )
        .unwrap();
        assert!(wait_until(|| frames.get(1).is_some()));

        crash.store(true, Ordering::Relaxed);
        assert!(wait_until(|| frames.get(1).is_none()));
        assert!(orchestrator.active_feeds().is_empty());

        orchestrator.stop();
    }
}
