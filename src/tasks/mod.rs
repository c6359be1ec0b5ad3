mod plate_log;
mod queue;
mod recognizer;
mod worker;

pub use plate_log::{PlateLog, PlateRow};
pub use queue::{Task, TaskQueue, TaskReceiver};
pub use recognizer::{clean_plate_text, HttpRecognizer, RecognizeError, Recognition, Recognizer};
pub use worker::{Evidence, TaskError, Worker};
