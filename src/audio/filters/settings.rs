use serde::{Deserialize, Serialize};

macro_rules! define_filters {
    ($($field:ident : $type:ty => $name:expr),* $(,)?) => {
        /// Per-track DSP settings. Absent fields leave that stage out of the graph.
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct Filters {
            $(
                #[serde(default, skip_serializing_if = "Option::is_none")]
                pub $field: Option<$type>,
            )*
        }

        impl Filters {
            /// Names of all supported filters in camelCase.
            pub fn names() -> Vec<&'static str> {
                vec![$($name),*]
            }

            /// Merge a partial update; fields absent from `incoming` are kept.
            pub fn merge_from(&mut self, incoming: Filters) {
                $(
                    if incoming.$field.is_some() {
                        self.$field = incoming.$field;
                    }
                )*
            }

            pub fn is_all_none(&self) -> bool {
                $(
                    self.$field.is_none() &&
                )* true
            }
        }
    };
}

define_filters! {
    volume: f32 => "volume",
    timescale: TimescaleSettings => "timescale",
    tremolo: TremoloSettings => "tremolo",
    rotation: RotationSettings => "rotation",
    channel_mix: ChannelMixSettings => "channelMix",
    low_pass: LowPassSettings => "lowPass",
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimescaleSettings {
    pub speed: Option<f64>,
    pub pitch: Option<f64>,
    pub rate: Option<f64>,
}

impl TimescaleSettings {
    /// Source seconds consumed per output second.
    pub fn ratio(&self) -> f64 {
        super::timescale::ratio(
            self.speed.unwrap_or(1.0),
            self.pitch.unwrap_or(1.0),
            self.rate.unwrap_or(1.0),
        )
    }
}

impl Filters {
    pub fn timescale_ratio(&self) -> f64 {
        self.timescale.as_ref().map_or(1.0, TimescaleSettings::ratio)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TremoloSettings {
    pub frequency: Option<f32>,
    pub depth: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationSettings {
    pub rotation_hz: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMixSettings {
    pub left_to_left: Option<f32>,
    pub left_to_right: Option<f32>,
    pub right_to_left: Option<f32>,
    pub right_to_right: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LowPassSettings {
    pub smoothing: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_untouched_fields() {
        let mut current = Filters {
            volume: Some(0.5),
            ..Default::default()
        };
        current.merge_from(Filters {
            rotation: Some(RotationSettings {
                rotation_hz: Some(0.2),
            }),
            ..Default::default()
        });
        assert_eq!(current.volume, Some(0.5));
        assert!(current.rotation.is_some());
        assert!(!current.is_all_none());
    }

    #[test]
    fn deserializes_camel_case() {
        let filters: Filters =
            serde_json::from_str(r#"{"channelMix":{"leftToRight":0.5},"lowPass":{"smoothing":20}}"#)
                .unwrap();
        assert_eq!(
            filters.channel_mix.and_then(|c| c.left_to_right),
            Some(0.5)
        );
        assert_eq!(filters.low_pass.and_then(|l| l.smoothing), Some(20.0));
        assert!(Filters::names().contains(&"channelMix"));
    }

    #[test]
    fn timescale_ratio_defaults_to_one() {
        assert_eq!(Filters::default().timescale_ratio(), 1.0);
        let filters = Filters {
            timescale: Some(TimescaleSettings {
                speed: Some(2.0),
                pitch: None,
                rate: Some(1.5),
            }),
            ..Default::default()
        };
        assert!((filters.timescale_ratio() - 3.0).abs() < 1e-9);
    }
}
