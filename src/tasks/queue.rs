use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Local};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use image::RgbImage;

use crate::shutdown::Shutdown;
use crate::tracking::Direction;

/// Recognition work for one counted crossing.
pub struct Task {
    /// Vehicle crop at processing resolution.
    pub image: RgbImage,
    pub direction: Direction,
    /// Location name of the feed that produced the crossing.
    pub feed_name: String,
    pub created_at: DateTime<Local>,
}

impl Task {
    pub fn new(image: RgbImage, direction: Direction, feed_name: impl Into<String>) -> Self {
        Self {
            image,
            direction,
            feed_name: feed_name.into(),
            created_at: Local::now(),
        }
    }
}

/// Producer side of the bounded task queue. Cloned into every pipeline.
#[derive(Clone)]
pub struct TaskQueue {
    tx: Sender<Task>,
    dropped: Arc<AtomicU64>,
}

pub struct TaskReceiver {
    rx: Receiver<Task>,
}

impl TaskQueue {
    pub fn bounded(capacity: usize) -> (Self, TaskReceiver) {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            TaskReceiver { rx },
        )
    }

    /// Offers a task without blocking. A full queue drops the incoming task.
    pub fn try_enqueue(&self, task: Task) -> bool {
        match self.tx.try_send(task) {
            Ok(()) => true,
            Err(TrySendError::Full(task)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    feed = %task.feed_name,
                    direction = %task.direction,
                    dropped,
                    "task queue full, dropping task"
                );
                false
            }
            Err(TrySendError::Disconnected(task)) => {
                tracing::warn!(feed = %task.feed_name, "task worker gone, dropping task");
                false
            }
        }
    }

}

#[cfg(test)]
impl TaskQueue {
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl TaskReceiver {
    /// Blocks for the next task. `None` once shutdown is triggered or every
    /// producer has been dropped.
    pub fn recv(&self, shutdown: &Shutdown) -> Option<Task> {
        if shutdown.is_triggered() {
            return None;
        }
        crossbeam_channel::select! {
            recv(self.rx) -> task => task.ok(),
            recv(shutdown.signal()) -> _ => None,
        }
    }
}

#[cfg(test)]
impl TaskReceiver {
    pub fn try_recv(&self) -> Option<Task> {
        self.rx.try_recv().ok()
    }
}
