pub mod buffer;
pub mod constants;
pub mod decoder;
pub mod encoder;
pub mod filters;
pub mod resample;
pub mod source;

pub use buffer::RingBuffer;
pub use decoder::{MediaOpener, SymphoniaOpener};
pub use encoder::Encoder;
pub use source::{AudioSource, HttpSource, create_client};
