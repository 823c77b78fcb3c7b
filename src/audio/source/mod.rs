//! Byte sources fed to the demuxer.

pub mod client;
pub mod http;

pub use client::create_client;
pub use http::HttpSource;

use std::io::{Read, Seek};

use symphonia::core::io::MediaSource;

/// `Read + Seek + MediaSource` plus what we learned from the transport.
pub trait AudioSource: Read + Seek + MediaSource + Send {
    /// MIME type of the stream, if the origin told us.
    fn content_type(&self) -> Option<String> {
        None
    }
}
