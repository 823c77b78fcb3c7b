//! Per-track DSP graph, rebuilt whenever the track's filter settings change.

pub mod channel_mix;
pub mod lfo;
pub mod low_pass;
pub mod rotation;
pub mod settings;
pub mod timescale;
pub mod tremolo;
pub mod volume;

pub use settings::*;

use crate::audio::decoder::StreamParams;

/// In-place stage over interleaved stereo i16: `[L, R, L, R, ...]`.
pub trait AudioFilter: Send {
    fn process(&mut self, samples: &mut [i16]);
    /// Whether this stage changes the signal with its current parameters.
    fn is_enabled(&self) -> bool;
    /// Drop internal history (on seek or rebuild).
    fn reset(&mut self);
}

/// Result of pushing one frame through the graph.
#[derive(Debug, PartialEq)]
pub enum FilterOutput {
    Frame(Vec<i16>),
    /// A length-changing stage swallowed the input without emitting yet.
    NeedsMore,
}

/// Ordered chain of in-place stages plus an optional timescale stage that
/// runs last.
pub struct FilterGraph {
    params: StreamParams,
    stages: Vec<Box<dyn AudioFilter>>,
    timescale: Option<timescale::TimescaleFilter>,
}

impl FilterGraph {
    /// Graph for `filters` at the decoder's sample rate. Stages whose
    /// parameters are neutral are left out.
    pub fn build(filters: &Filters, params: StreamParams) -> Self {
        let rate = params.sample_rate;
        let mut stages: Vec<Box<dyn AudioFilter>> = Vec::new();

        let mut push = |stage: Box<dyn AudioFilter>| {
            if stage.is_enabled() {
                stages.push(stage);
            }
        };

        if let Some(volume) = filters.volume {
            push(Box::new(volume::VolumeFilter::new(volume)));
        }
        if let Some(t) = &filters.tremolo {
            push(Box::new(tremolo::TremoloFilter::new(
                rate,
                t.frequency.unwrap_or(2.0),
                t.depth.unwrap_or(0.5),
            )));
        }
        if let Some(r) = &filters.rotation {
            push(Box::new(rotation::RotationFilter::new(
                rate,
                r.rotation_hz.unwrap_or(0.0),
            )));
        }
        if let Some(cm) = &filters.channel_mix {
            push(Box::new(channel_mix::ChannelMixFilter::new(
                cm.left_to_left.unwrap_or(1.0),
                cm.left_to_right.unwrap_or(0.0),
                cm.right_to_left.unwrap_or(0.0),
                cm.right_to_right.unwrap_or(1.0),
            )));
        }
        if let Some(lp) = &filters.low_pass {
            push(Box::new(low_pass::LowPassFilter::new(
                lp.smoothing.unwrap_or(20.0),
            )));
        }

        let timescale = filters
            .timescale
            .as_ref()
            .map(|t| {
                timescale::TimescaleFilter::new(
                    t.speed.unwrap_or(1.0),
                    t.pitch.unwrap_or(1.0),
                    t.rate.unwrap_or(1.0),
                )
            })
            .filter(|t| t.is_enabled());

        Self {
            params,
            stages,
            timescale,
        }
    }

    pub fn params(&self) -> StreamParams {
        self.params
    }

    pub fn is_active(&self) -> bool {
        !self.stages.is_empty() || self.timescale.is_some()
    }

    pub fn process(&mut self, mut samples: Vec<i16>) -> FilterOutput {
        for stage in self.stages.iter_mut() {
            stage.process(&mut samples);
        }

        if let Some(ts) = self.timescale.as_mut() {
            samples = ts.process(&samples);
        }

        if samples.is_empty() {
            FilterOutput::NeedsMore
        } else {
            FilterOutput::Frame(samples)
        }
    }

    pub fn reset(&mut self) {
        for stage in self.stages.iter_mut() {
            stage.reset();
        }
        if let Some(ts) = self.timescale.as_mut() {
            ts.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARAMS: StreamParams = StreamParams {
        sample_rate: 48_000,
        channels: 2,
    };

    #[test]
    fn empty_settings_pass_through() {
        let mut graph = FilterGraph::build(&Filters::default(), PARAMS);
        assert!(!graph.is_active());
        assert_eq!(graph.process(vec![1, 2, 3, 4]), FilterOutput::Frame(vec![1, 2, 3, 4]));
    }

    #[test]
    fn neutral_stages_are_skipped() {
        let filters = Filters {
            volume: Some(1.0),
            channel_mix: Some(ChannelMixSettings {
                left_to_left: Some(1.0),
                left_to_right: None,
                right_to_left: None,
                right_to_right: None,
            }),
            ..Default::default()
        };
        assert!(!FilterGraph::build(&filters, PARAMS).is_active());
    }

    #[test]
    fn volume_stage_scales() {
        let filters = Filters {
            volume: Some(0.5),
            ..Default::default()
        };
        let mut graph = FilterGraph::build(&filters, PARAMS);
        assert_eq!(graph.process(vec![100, -100]), FilterOutput::Frame(vec![50, -50]));
    }

    #[test]
    fn swap_channels_with_mix_matrix() {
        let filters = Filters {
            channel_mix: Some(ChannelMixSettings {
                left_to_left: Some(0.0),
                left_to_right: Some(1.0),
                right_to_left: Some(1.0),
                right_to_right: Some(0.0),
            }),
            ..Default::default()
        };
        let mut graph = FilterGraph::build(&filters, PARAMS);
        assert_eq!(graph.process(vec![10, 20]), FilterOutput::Frame(vec![20, 10]));
    }

    #[test]
    fn timescale_can_ask_for_more_input() {
        let filters = Filters {
            timescale: Some(TimescaleSettings {
                speed: Some(1.25),
                pitch: None,
                rate: None,
            }),
            ..Default::default()
        };
        let mut graph = FilterGraph::build(&filters, PARAMS);
        assert_eq!(graph.process(vec![0, 0]), FilterOutput::NeedsMore);
    }
}
