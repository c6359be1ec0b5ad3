mod centroid;
mod crossing;

pub use centroid::{AssignmentStrategy, CentroidTracker, GreedyNearest, ObjectId, TrackedObject};
pub use crossing::{
    crossing_direction, CountPolicy, Crossing, CrossingCounter, Dedup, Delta, Direction, Slots,
    Throughput,
};
