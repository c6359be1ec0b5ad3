mod ring;

pub use ring::DropOldestBuffer;
