mod counter_store;
mod document;

pub use counter_store::{CounterKey, CounterStore, StoreError};
pub use document::{Feed, FeedDocument, FeedId, FeedKind, FeedStatus};

#[cfg(test)]
pub(crate) use counter_store::testing;
