pub mod audio;
pub mod common;
pub mod configs;
pub mod node;
pub mod playback;
pub mod protocol;
pub mod routeplanner;
pub mod sources;
pub mod track;
pub mod voice;

pub use common::errors::NodeError;
pub use node::Node;
