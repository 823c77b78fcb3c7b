//! Collaborators that turn locators into metadata and playable URLs.
//!
//! Extraction and search live outside this crate; these traits are the seam.
//! The implementations here cover direct locators (files and plain URLs).

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::{audio::decoder::symphonia_decoder, common::errors::NodeError, track::TrackDescriptor};

#[async_trait]
pub trait StreamResolver: Send + Sync {
    /// Playable URL (or file path) for `descriptor`.
    async fn resolve(&self, descriptor: &TrackDescriptor) -> Result<String, NodeError>;

    /// Forget anything cached for `descriptor`; the next `resolve` must go
    /// back to the origin. Called after a 403 from the stream host.
    fn invalidate(&self, _descriptor: &TrackDescriptor) {}
}

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn get_metadata(&self, locator: &str) -> Result<TrackDescriptor, NodeError>;
}

/// The locator already is the stream URL.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectResolver;

#[async_trait]
impl StreamResolver for DirectResolver {
    async fn resolve(&self, descriptor: &TrackDescriptor) -> Result<String, NodeError> {
        Ok(descriptor.locator.clone())
    }
}

/// Memoises another resolver per locator.
pub struct CachingResolver {
    inner: Arc<dyn StreamResolver>,
    cache: DashMap<String, String>,
}

impl CachingResolver {
    pub fn new(inner: Arc<dyn StreamResolver>) -> Self {
        Self {
            inner,
            cache: DashMap::new(),
        }
    }

    pub fn cached(&self, locator: &str) -> Option<String> {
        self.cache.get(locator).map(|e| e.value().clone())
    }
}

#[async_trait]
impl StreamResolver for CachingResolver {
    async fn resolve(&self, descriptor: &TrackDescriptor) -> Result<String, NodeError> {
        if let Some(url) = self.cached(&descriptor.locator) {
            return Ok(url);
        }
        let url = self.inner.resolve(descriptor).await?;
        self.cache.insert(descriptor.locator.clone(), url.clone());
        Ok(url)
    }

    fn invalidate(&self, descriptor: &TrackDescriptor) {
        debug!("Dropping cached stream url for {}", descriptor.locator);
        self.cache.remove(&descriptor.locator);
        self.inner.invalidate(descriptor);
    }
}

pub fn is_remote(locator: &str) -> bool {
    locator.starts_with("http://") || locator.starts_with("https://")
}

/// Builds descriptors by probing the media itself: container duration and
/// the title tag, falling back to the file name.
#[derive(Default)]
pub struct ProbeMetadataProvider {
    client: reqwest::Client,
}

impl ProbeMetadataProvider {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MetadataProvider for ProbeMetadataProvider {
    async fn get_metadata(&self, locator: &str) -> Result<TrackDescriptor, NodeError> {
        if !is_remote(locator) && !Path::new(locator).exists() {
            return Err(NodeError::NotFound(locator.to_string()));
        }

        let owned = locator.to_string();
        let client = self.client.clone();
        let handle = tokio::runtime::Handle::current();
        let probe = tokio::task::spawn_blocking(move || {
            symphonia_decoder::probe_metadata(&owned, &client, &handle)
        })
        .await
        .map_err(|e| NodeError::Transport(format!("metadata probe task failed: {}", e)))??;

        let fallback_title = locator
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(locator)
            .to_string();

        let mut descriptor = TrackDescriptor::new(locator, locator);
        descriptor.title = probe.title.unwrap_or(fallback_title);
        match probe.duration {
            Some(seconds) => descriptor.duration = Some(seconds),
            // No length in the container: treat a remote stream as live radio.
            None if is_remote(locator) => descriptor = descriptor.live(),
            None => {}
        }
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StreamResolver for Counting {
        async fn resolve(&self, descriptor: &TrackDescriptor) -> Result<String, NodeError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{}?sig={}", descriptor.locator, n))
        }
    }

    #[tokio::test]
    async fn caches_until_invalidated() {
        let inner = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        let resolver = CachingResolver::new(inner.clone());
        let d = TrackDescriptor::new("https://cdn.example/a", "a");

        assert_eq!(resolver.resolve(&d).await.unwrap(), "https://cdn.example/a?sig=0");
        assert_eq!(resolver.resolve(&d).await.unwrap(), "https://cdn.example/a?sig=0");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        resolver.invalidate(&d);
        assert_eq!(resolver.resolve(&d).await.unwrap(), "https://cdn.example/a?sig=1");
    }

    #[tokio::test]
    async fn direct_resolver_returns_locator() {
        let d = TrackDescriptor::new("/music/a.flac", "a");
        assert_eq!(DirectResolver.resolve(&d).await.unwrap(), "/music/a.flac");
    }

    #[tokio::test]
    async fn missing_local_file_is_not_found() {
        let provider = ProbeMetadataProvider::default();
        let err = provider
            .get_metadata("/definitely/not/here.mp3")
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::NotFound(_)));
    }
}
