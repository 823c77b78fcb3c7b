pub mod ring;

pub use ring::RingBuffer;
