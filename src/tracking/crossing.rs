use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::Serialize;

use crate::geometry::{BBox, Point};
use crate::store::{CounterKey, CounterStore, Feed, FeedId, FeedKind, StoreError};

use super::centroid::{ObjectId, TrackedObject};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Moving down the frame, towards the camera.
    Towards,
    /// Moving up the frame, away from the camera.
    Away,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Towards => "towards",
            Self::Away => "away",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the line `current` ended up on, if the step from `previous`
/// crossed it. Landing exactly on the line counts as crossed when coming from
/// above, and as not yet crossed when coming from below.
pub fn crossing_direction(previous: Point, current: Point, line_y: f32) -> Option<Direction> {
    if previous.y < line_y && line_y <= current.y {
        Some(Direction::Towards)
    } else if previous.y > line_y && line_y >= current.y {
        Some(Direction::Away)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delta {
    Increment,
    Decrement,
}

impl Delta {
    pub fn inverse(self) -> Self {
        match self {
            Self::Increment => Self::Decrement,
            Self::Decrement => Self::Increment,
        }
    }

    fn signed(self) -> i64 {
        match self {
            Self::Increment => 1,
            Self::Decrement => -1,
        }
    }
}

/// What a crossing does to a feed's count.
pub trait CountPolicy: Send {
    fn delta_for(&self, direction: Direction) -> Delta;

    /// Applies and persists one delta, returning the resulting count.
    fn commit(&mut self, delta: Delta) -> Result<i64, StoreError>;
}

/// Counter feeds: vehicles towards the camera add to the feed count and the
/// global count, vehicles going away subtract.
pub struct Throughput {
    feed_id: FeedId,
    store: CounterStore,
}

impl Throughput {
    pub fn new(feed_id: FeedId, store: CounterStore) -> Self {
        Self { feed_id, store }
    }
}

impl CountPolicy for Throughput {
    fn delta_for(&self, direction: Direction) -> Delta {
        match direction {
            Direction::Towards => Delta::Increment,
            Direction::Away => Delta::Decrement,
        }
    }

    fn commit(&mut self, delta: Delta) -> Result<i64, StoreError> {
        let feed_id = self.feed_id;
        let step = delta.signed();
        self.store.transact(|doc| {
            doc.global_car_count += step;
            if let Some(feed) = doc.feed_mut(feed_id) {
                feed.count += step;
            }
            Ok(doc.global_car_count)
        })
    }
}

/// Multicam feeds: a vehicle coming towards the camera takes a slot, one
/// going away frees it. Saturates at both ends.
pub struct Slots {
    feed_id: FeedId,
    store: CounterStore,
    total: u32,
    available: u32,
}

impl Slots {
    pub fn new(feed_id: FeedId, store: CounterStore, total: u32, available: u32) -> Self {
        Self {
            feed_id,
            store,
            total,
            available: available.min(total),
        }
    }

    pub fn available(&self) -> u32 {
        self.available
    }
}

impl CountPolicy for Slots {
    fn delta_for(&self, direction: Direction) -> Delta {
        match direction {
            Direction::Towards => Delta::Decrement,
            Direction::Away => Delta::Increment,
        }
    }

    fn commit(&mut self, delta: Delta) -> Result<i64, StoreError> {
        let next = match delta {
            Delta::Increment => (self.available + 1).min(self.total),
            Delta::Decrement => self.available.saturating_sub(1),
        };
        self.available = self.store.set_available_slots(self.feed_id, next)?;
        Ok(self.available as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dedup {
    /// An identity is counted at most once while it is tracked.
    OncePerIdentity,
    /// An identity is counted again only after reversing direction.
    OnDirectionChange,
}

#[derive(Debug, Clone)]
pub struct Crossing {
    pub object_id: ObjectId,
    pub direction: Direction,
    pub bbox: BBox,
}

pub struct CrossingCounter {
    feed_id: FeedId,
    line_y: f32,
    dedup: Dedup,
    compensate: bool,
    processed: HashSet<ObjectId>,
    policy: Box<dyn CountPolicy>,
}

impl CrossingCounter {
    pub fn new(
        feed_id: FeedId,
        line_y: f32,
        dedup: Dedup,
        compensate: bool,
        policy: Box<dyn CountPolicy>,
    ) -> Self {
        Self {
            feed_id,
            line_y,
            dedup,
            compensate,
            processed: HashSet::new(),
            policy,
        }
    }

    /// Counter for a configured feed. `frame_height` is the processing
    /// resolution; the line defaults to its middle.
    pub fn for_feed(feed: &Feed, store: CounterStore, frame_height: u32) -> Self {
        let line_y = feed.line_y.unwrap_or(frame_height as f32 / 2.0);
        let (dedup, policy): (Dedup, Box<dyn CountPolicy>) = match feed.kind {
            FeedKind::Counter => (
                Dedup::OncePerIdentity,
                Box::new(Throughput::new(feed.id, store)),
            ),
            FeedKind::Multicam => (
                Dedup::OnDirectionChange,
                Box::new(Slots::new(
                    feed.id,
                    store,
                    feed.total_slots,
                    feed.available_slots,
                )),
            ),
        };
        Self::new(
            feed.id,
            line_y,
            dedup,
            feed.compensates_on_disappear(),
            policy,
        )
    }

    pub fn line_y(&self) -> f32 {
        self.line_y
    }

    /// Applies one tracker update: compensates for deregistered objects, then
    /// counts every new crossing. Returns the crossings that were counted.
    pub fn observe(
        &mut self,
        objects: &mut BTreeMap<ObjectId, TrackedObject>,
        disappeared: &[TrackedObject],
    ) -> Vec<Crossing> {
        for gone in disappeared {
            self.processed.remove(&gone.id);
            if !self.compensate {
                continue;
            }
            if let Some(direction) = gone.last_direction {
                let delta = self.policy.delta_for(direction).inverse();
                self.commit(delta, gone.id, "compensated disappeared object");
            }
        }

        let mut crossings = Vec::new();
        for obj in objects.values_mut() {
            let Some(direction) = crossing_direction(obj.previous, obj.centroid, self.line_y)
            else {
                continue;
            };

            let counted = match self.dedup {
                Dedup::OncePerIdentity => self.processed.insert(obj.id),
                Dedup::OnDirectionChange => obj.last_direction != Some(direction),
            };
            if !counted {
                continue;
            }

            obj.last_direction = Some(direction);
            let delta = self.policy.delta_for(direction);
            self.commit(delta, obj.id, "line crossed");
            crossings.push(Crossing {
                object_id: obj.id,
                direction,
                bbox: obj.bbox,
            });
        }

        crossings
    }

    fn commit(&mut self, delta: Delta, object_id: ObjectId, reason: &'static str) {
        match self.policy.commit(delta) {
            Ok(value) => tracing::debug!(
                feed = self.feed_id,
                object = object_id,
                delta = ?delta,
                count = value,
                "{reason}"
            ),
            Err(e) => tracing::warn!(
                feed = self.feed_id,
                object = object_id,
                error = %e,
                "failed to update count"
            ),
        }
    }
}
