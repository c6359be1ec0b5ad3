use std::collections::BTreeMap;

use crate::geometry::{BBox, Point};

use super::crossing::Direction;

pub type ObjectId = u64;

#[derive(Debug, Clone)]
pub struct TrackedObject {
    pub id: ObjectId,
    pub centroid: Point,
    pub previous: Point,
    pub bbox: BBox,
    pub missed: u32,
    pub last_direction: Option<Direction>,
}

/// Pairs existing objects with new detections.
pub trait AssignmentStrategy: Send {
    /// Returns `(object_index, detection_index)` pairs. Each index appears at
    /// most once and no pair is farther apart than `max_distance`.
    fn assign(&self, objects: &[Point], detections: &[Point], max_distance: f32)
        -> Vec<(usize, usize)>;
}

/// Greedy nearest-centroid matching.
///
/// Objects are visited in ascending order of their distance to the closest
/// detection. Each object only ever proposes that closest detection; if it
/// was already claimed the object stays unmatched for this update. This is
/// not an optimal assignment but it is cheap and fully deterministic.
#[derive(Debug, Default, Clone, Copy)]
pub struct GreedyNearest;

impl AssignmentStrategy for GreedyNearest {
    fn assign(
        &self,
        objects: &[Point],
        detections: &[Point],
        max_distance: f32,
    ) -> Vec<(usize, usize)> {
        if objects.is_empty() || detections.is_empty() {
            return Vec::new();
        }

        // (row, nearest column, distance)
        let mut nearest: Vec<(usize, usize, f32)> = objects
            .iter()
            .enumerate()
            .map(|(row, obj)| {
                let mut best_col = 0;
                let mut best = f32::INFINITY;
                for (col, det) in detections.iter().enumerate() {
                    let d = obj.distance(det);
                    if d < best {
                        best = d;
                        best_col = col;
                    }
                }
                (row, best_col, best)
            })
            .collect();

        nearest.sort_by(|a, b| a.2.total_cmp(&b.2));

        let mut used_cols = vec![false; detections.len()];
        let mut pairs = Vec::new();

        for (row, col, distance) in nearest {
            if used_cols[col] || distance > max_distance {
                continue;
            }
            used_cols[col] = true;
            pairs.push((row, col));
        }

        pairs
    }
}

pub struct CentroidTracker {
    next_id: ObjectId,
    objects: BTreeMap<ObjectId, TrackedObject>,
    max_disappeared: u32,
    max_distance: f32,
    strategy: Box<dyn AssignmentStrategy>,
}

impl CentroidTracker {
    pub fn new(max_disappeared: u32, max_distance: f32) -> Self {
        Self::with_strategy(max_disappeared, max_distance, Box::new(GreedyNearest))
    }

    pub fn with_strategy(
        max_disappeared: u32,
        max_distance: f32,
        strategy: Box<dyn AssignmentStrategy>,
    ) -> Self {
        Self {
            next_id: 0,
            objects: BTreeMap::new(),
            max_disappeared,
            max_distance,
            strategy,
        }
    }

    pub fn objects(&self) -> &BTreeMap<ObjectId, TrackedObject> {
        &self.objects
    }

    pub fn objects_mut(&mut self) -> &mut BTreeMap<ObjectId, TrackedObject> {
        &mut self.objects
    }

    /// Feeds one frame of detections into the tracker and returns the objects
    /// deregistered by this update.
    pub fn update(&mut self, detections: &[BBox]) -> Vec<TrackedObject> {
        let ids: Vec<ObjectId> = self.objects.keys().copied().collect();
        let current: Vec<Point> = ids.iter().map(|id| self.objects[id].centroid).collect();
        let incoming: Vec<Point> = detections.iter().map(BBox::centroid).collect();

        let pairs = self
            .strategy
            .assign(&current, &incoming, self.max_distance);

        let mut matched_rows = vec![false; ids.len()];
        let mut matched_cols = vec![false; detections.len()];

        for (row, col) in pairs {
            let Some(obj) = self.objects.get_mut(&ids[row]) else {
                continue;
            };
            obj.previous = obj.centroid;
            obj.centroid = incoming[col];
            obj.bbox = detections[col];
            obj.missed = 0;
            matched_rows[row] = true;
            matched_cols[col] = true;
        }

        let mut disappeared = Vec::new();
        for (row, id) in ids.iter().enumerate() {
            if matched_rows[row] {
                continue;
            }
            let Some(obj) = self.objects.get_mut(id) else {
                continue;
            };
            obj.previous = obj.centroid;
            obj.missed += 1;
            if obj.missed > self.max_disappeared {
                if let Some(gone) = self.objects.remove(id) {
                    tracing::trace!(object = gone.id, "object deregistered");
                    disappeared.push(gone);
                }
            }
        }

        for (col, bbox) in detections.iter().enumerate() {
            if !matched_cols[col] {
                self.register(*bbox);
            }
        }

        disappeared
    }

    fn register(&mut self, bbox: BBox) {
        let id = self.next_id;
        self.next_id += 1;
        let centroid = bbox.centroid();
        self.objects.insert(
            id,
            TrackedObject {
                id,
                centroid,
                previous: centroid,
                bbox,
                missed: 0,
                last_direction: None,
            },
        );
    }
}
