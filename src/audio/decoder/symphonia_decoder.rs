//! Decoding through symphonia, for local files and HTTP(S) streams.

use std::{fs::File, io, net::IpAddr, path::Path, sync::Arc};

use symphonia::core::{
    audio::SampleBuffer,
    codecs::{CODEC_TYPE_NULL, Decoder, DecoderOptions},
    errors::Error,
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
    io::{MediaSource, MediaSourceStream},
    meta::{MetadataOptions, MetadataRevision, StandardTagKey},
    probe::Hint,
    units::{Time, TimeBase},
};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::{DecodeError, DecodedFrame, FrameDecoder, MediaOpener, StreamParams};
use crate::{
    audio::source::{AudioSource, HttpSource, create_client},
    common::errors::NodeError,
    routeplanner::RoutePlanner,
    sources::{StreamResolver, is_remote},
    track::TrackDescriptor,
};

/// Distinct egress addresses tried after a 429 before giving up.
const MAX_RATE_LIMIT_RETRIES: usize = 3;

/// The recoverable set: corrupt packets, decoder resets, interrupted reads.
/// Everything else ends the track.
fn classify(err: Error) -> DecodeError {
    match err {
        Error::DecodeError(msg) => DecodeError::Transient(msg.to_string()),
        Error::ResetRequired => DecodeError::Transient("decoder reset required".into()),
        Error::IoError(e) if e.kind() == io::ErrorKind::Interrupted => {
            DecodeError::Transient(e.to_string())
        }
        Error::IoError(e) => match e.into_inner() {
            Some(inner) => match inner.downcast::<NodeError>() {
                Ok(node) => DecodeError::Fatal(*node),
                Err(other) => DecodeError::fatal(other.to_string()),
            },
            None => DecodeError::fatal("i/o error while decoding"),
        },
        other => DecodeError::fatal(other.to_string()),
    }
}

fn seconds(time: Time) -> f64 {
    time.seconds as f64 + time.frac
}

fn hint_for(locator: &str, content_type: Option<&str>) -> Hint {
    let mut hint = Hint::new();
    if let Some(mime) = content_type {
        hint.mime_type(mime);
    }
    let path = locator.split(['?', '#']).next().unwrap_or(locator);
    if let Some(ext) = Path::new(path).extension().and_then(|s| s.to_str()) {
        hint.with_extension(ext);
    }
    hint
}

pub struct SymphoniaDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    time_base: Option<TimeBase>,
    params: StreamParams,
    duration: Option<f64>,
    sample_buf: Option<SampleBuffer<i16>>,
}

impl SymphoniaDecoder {
    pub fn new(source: Box<dyn MediaSource>, hint: Hint) -> Result<Self, DecodeError> {
        let mss = MediaSourceStream::new(source, Default::default());
        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions {
                    enable_gapless: true,
                    ..Default::default()
                },
                &MetadataOptions::default(),
            )
            .map_err(classify_open)?;

        let format = probed.format;
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| DecodeError::fatal("no audio track found"))?;

        let codec_params = track.codec_params.clone();
        let track_id = track.id;
        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(classify_open)?;

        let sample_rate = codec_params.sample_rate.unwrap_or(48_000);
        let channels = codec_params.channels.map(|c| c.count()).unwrap_or(2);
        let time_base = codec_params.time_base;
        let duration = codec_params.n_frames.map(|n| match time_base {
            Some(tb) => seconds(tb.calc_time(n)),
            None => n as f64 / sample_rate as f64,
        });

        info!(
            "SymphoniaDecoder: opened {}Hz {}ch (duration={:?})",
            sample_rate, channels, duration
        );

        Ok(Self {
            format,
            decoder,
            track_id,
            time_base,
            params: StreamParams {
                sample_rate,
                channels,
            },
            duration,
            sample_buf: None,
        })
    }

    fn ts_seconds(&self, ts: u64) -> f64 {
        match self.time_base {
            Some(tb) => seconds(tb.calc_time(ts)),
            None => ts as f64 / self.params.sample_rate.max(1) as f64,
        }
    }
}

/// Open failures never get a retry loop: a bad probe is fatal for the track.
fn classify_open(err: Error) -> DecodeError {
    match classify(err) {
        DecodeError::Transient(m) => DecodeError::fatal(m),
        fatal => fatal,
    }
}

impl FrameDecoder for SymphoniaDecoder {
    fn params(&self) -> StreamParams {
        self.params
    }

    fn duration(&self) -> Option<f64> {
        self.duration
    }

    fn next_frame(&mut self) -> Result<Option<DecodedFrame>, DecodeError> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(Error::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(Error::ResetRequired) => {
                    self.decoder.reset();
                    return Err(DecodeError::Transient("stream parameters changed".into()));
                }
                Err(e) => return Err(classify(e)),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let timestamp = self.ts_seconds(packet.ts());
            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(Error::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(e) => return Err(classify(e)),
            };

            let spec = *decoded.spec();
            let channels = spec.channels.count();
            let needed = decoded.capacity() * channels;
            let mut buf = match self.sample_buf.take() {
                Some(buf) if buf.capacity() >= needed => buf,
                _ => SampleBuffer::<i16>::new(decoded.capacity() as u64, spec),
            };
            buf.copy_interleaved_ref(decoded);
            let samples = buf.samples().to_vec();
            self.sample_buf = Some(buf);

            if samples.is_empty() {
                continue;
            }

            self.params = StreamParams {
                sample_rate: spec.rate,
                channels,
            };
            return Ok(Some(DecodedFrame {
                samples,
                params: self.params,
                timestamp,
            }));
        }
    }

    fn seek(&mut self, seconds_target: f64) -> Result<f64, DecodeError> {
        let seeked = self
            .format
            .seek(
                SeekMode::Coarse,
                SeekTo::Time {
                    time: Time::from(seconds_target.max(0.0)),
                    track_id: Some(self.track_id),
                },
            )
            .map_err(classify)?;
        self.decoder.reset();
        self.sample_buf = None;
        Ok(self.ts_seconds(seeked.actual_ts))
    }

    fn close(&mut self) {
        debug!("SymphoniaDecoder: closing track {}", self.track_id);
        let _ = self.decoder.finalize();
    }
}

/// Resolves descriptors to URLs and opens them, applying the bounded retry
/// rules for 403 (re-resolve once) and 429 (rotate egress address).
pub struct SymphoniaOpener {
    handle: Handle,
    resolver: Arc<dyn StreamResolver>,
    planner: Option<Arc<dyn RoutePlanner>>,
    client: reqwest::Client,
}

impl SymphoniaOpener {
    pub fn new(
        handle: Handle,
        resolver: Arc<dyn StreamResolver>,
        planner: Option<Arc<dyn RoutePlanner>>,
    ) -> Result<Self, NodeError> {
        Ok(Self {
            handle,
            resolver,
            planner,
            client: create_client(None)?,
        })
    }

    fn open_source(
        &self,
        url: &str,
        local_address: Option<IpAddr>,
    ) -> Result<(Box<dyn MediaSource>, Hint), NodeError> {
        if is_remote(url) {
            let client = match local_address {
                Some(ip) => create_client(Some(ip))?,
                None => self.client.clone(),
            };
            let source = HttpSource::open(client, url, self.handle.clone())?;
            let hint = hint_for(url, source.content_type().as_deref());
            return Ok((Box::new(source), hint));
        }

        let file = File::open(url).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => NodeError::NotFound(url.to_string()),
            _ => NodeError::Io(e),
        })?;
        Ok((Box::new(file), hint_for(url, None)))
    }

    fn open_url(
        &self,
        url: &str,
        local_address: Option<IpAddr>,
    ) -> Result<Box<dyn FrameDecoder>, NodeError> {
        let (source, hint) = self.open_source(url, local_address)?;
        let decoder = SymphoniaDecoder::new(source, hint).map_err(DecodeError::into_node_error)?;
        Ok(Box::new(decoder))
    }
}

impl MediaOpener for SymphoniaOpener {
    fn open(&self, descriptor: &TrackDescriptor) -> Result<Box<dyn FrameDecoder>, NodeError> {
        let mut reresolved = false;
        let mut rotations = 0;

        loop {
            let url = self.handle.block_on(self.resolver.resolve(descriptor))?;
            let local_address = if is_remote(&url) {
                self.planner.as_ref().and_then(|p| p.get_address())
            } else {
                None
            };

            match self.open_url(&url, local_address) {
                Ok(decoder) => return Ok(decoder),
                Err(NodeError::Forbidden(msg)) if !reresolved => {
                    warn!("[{}] Stream host refused ({}), re-resolving", descriptor.id, msg);
                    self.resolver.invalidate(descriptor);
                    reresolved = true;
                }
                Err(NodeError::RateLimited(msg)) => {
                    match (&self.planner, local_address) {
                        (Some(planner), Some(ip)) if rotations < MAX_RATE_LIMIT_RETRIES => {
                            warn!("[{}] Rate limited on {} ({}), rotating", descriptor.id, ip, msg);
                            planner.mark_failed(ip);
                            rotations += 1;
                        }
                        _ => return Err(NodeError::RateLimited(msg)),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// What a probe could learn about a locator without decoding it.
#[derive(Debug, Default)]
pub struct ProbeInfo {
    pub duration: Option<f64>,
    pub title: Option<String>,
}

fn title_from(revision: &MetadataRevision) -> Option<String> {
    revision
        .tags()
        .iter()
        .find(|t| t.std_key == Some(StandardTagKey::TrackTitle))
        .map(|t| t.value.to_string())
}

/// Probe container metadata. Blocks; run on a blocking thread.
pub fn probe_metadata(
    locator: &str,
    client: &reqwest::Client,
    handle: &Handle,
) -> Result<ProbeInfo, NodeError> {
    let (source, hint): (Box<dyn MediaSource>, Hint) = if is_remote(locator) {
        let source = HttpSource::open(client.clone(), locator, handle.clone())?;
        let hint = hint_for(locator, source.content_type().as_deref());
        (Box::new(source), hint)
    } else {
        let file = File::open(locator).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => NodeError::NotFound(locator.to_string()),
            _ => NodeError::Io(e),
        })?;
        (Box::new(file), hint_for(locator, None))
    };

    let mss = MediaSourceStream::new(source, Default::default());
    let mut probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| classify_open(e).into_node_error())?;

    let mut info = ProbeInfo::default();
    if let Some(track) = probed
        .format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
    {
        let params = &track.codec_params;
        info.duration = match (params.n_frames, params.time_base, params.sample_rate) {
            (Some(n), Some(tb), _) => Some(seconds(tb.calc_time(n))),
            (Some(n), None, Some(rate)) => Some(n as f64 / rate as f64),
            _ => None,
        };
    }

    info.title = probed
        .format
        .metadata()
        .current()
        .and_then(title_from)
        .or_else(|| {
            probed
                .metadata
                .get()
                .and_then(|m| m.current().and_then(title_from))
        });

    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_packets_are_transient() {
        let err = classify(Error::DecodeError("bad frame header"));
        assert!(matches!(err, DecodeError::Transient(_)));
        assert!(matches!(classify(Error::ResetRequired), DecodeError::Transient(_)));
    }

    #[test]
    fn unsupported_codec_is_fatal() {
        let err = classify(Error::Unsupported("codec"));
        assert!(matches!(err, DecodeError::Fatal(NodeError::DecodeFatal(_))));
    }

    #[test]
    fn transport_errors_keep_their_kind() {
        let io_err = io::Error::other(NodeError::RateLimited("cdn".into()));
        match classify(Error::IoError(io_err)) {
            DecodeError::Fatal(NodeError::RateLimited(m)) => assert_eq!(m, "cdn"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_file_is_not_found() {
        let handle = tokio::runtime::Runtime::new().unwrap();
        let opener = SymphoniaOpener::new(
            handle.handle().clone(),
            Arc::new(crate::sources::DirectResolver),
            None,
        )
        .unwrap();
        let descriptor = TrackDescriptor::new("/no/such/file.flac", "x");
        assert!(matches!(
            opener.open(&descriptor),
            Err(NodeError::NotFound(_))
        ));
    }
}
