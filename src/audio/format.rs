use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Sample encoding on the filter's stdin/stdout. Always little-endian,
/// always interleaved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    #[default]
    S16le,
    S32le,
    F32le,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::S16le => 2,
            SampleFormat::S32le | SampleFormat::F32le => 4,
        }
    }

    pub fn bits(self) -> u32 {
        self.bytes_per_sample() as u32 * 8
    }

    /// Value of `PA_LAMBDA_SIGNED` handed to the filter.
    pub fn signedness(self) -> &'static str {
        match self {
            SampleFormat::S16le | SampleFormat::S32le => "signed",
            SampleFormat::F32le => "float",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SampleFormat::S16le => "s16le",
            SampleFormat::S32le => "s32le",
            SampleFormat::F32le => "f32le",
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SampleFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "s16le" | "s16" => Ok(SampleFormat::S16le),
            "s32le" | "s32" => Ok(SampleFormat::S32le),
            "f32le" | "f32" | "float32le" => Ok(SampleFormat::F32le),
            other => Err(format!(
                "unknown sample format `{}` (expected s16le, s32le or f32le)",
                other
            )),
        }
    }
}

/// The negotiated stream layout shared by both endpoints and the filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleSpec {
    pub format: SampleFormat,
    pub rate: u32,
    pub channels: usize,
}

impl SampleSpec {
    pub fn bytes_per_frame(&self) -> usize {
        self.format.bytes_per_sample() * self.channels
    }

    /// Environment exported to the filter process so it knows the framing
    /// of the raw byte stream.
    pub fn lambda_env(&self, buffer_frames: u32) -> Vec<(&'static str, String)> {
        vec![
            ("PA_LAMBDA_SAMPLE_RATE", self.rate.to_string()),
            ("PA_LAMBDA_CHANNELS", self.channels.to_string()),
            ("PA_LAMBDA_BUFFER_SIZE", buffer_frames.to_string()),
            ("PA_LAMBDA_SAMPLE_FORMAT", self.format.name().to_string()),
            (
                "PA_LAMBDA_BYTES_PER_SAMPLE",
                self.format.bytes_per_sample().to_string(),
            ),
            ("PA_LAMBDA_BYTES_PER_FRAME", self.bytes_per_frame().to_string()),
            ("PA_LAMBDA_SIGNED", self.format.signedness().to_string()),
            ("PA_LAMBDA_BITS", self.format.bits().to_string()),
        ]
    }
}

/// Standard channel positions for a given count. Counts past the
/// surround layouts fall back to `AUX<n>`.
pub fn default_channel_map(channels: usize) -> Vec<String> {
    const SURROUND: [&str; 8] = ["FL", "FR", "FC", "LFE", "RL", "RR", "SL", "SR"];
    match channels {
        1 => vec!["MONO".to_string()],
        2 => vec!["FL".to_string(), "FR".to_string()],
        3 => vec!["FL".to_string(), "FR".to_string(), "FC".to_string()],
        4 => ["FL", "FR", "RL", "RR"].iter().map(|s| s.to_string()).collect(),
        5 => ["FL", "FR", "FC", "RL", "RR"].iter().map(|s| s.to_string()).collect(),
        6 => SURROUND[..6].iter().map(|s| s.to_string()).collect(),
        8 => SURROUND.iter().map(|s| s.to_string()).collect(),
        n => (0..n).map(|i| format!("AUX{}", i)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_formats() {
        assert_eq!("s16le".parse::<SampleFormat>(), Ok(SampleFormat::S16le));
        assert_eq!("F32LE".parse::<SampleFormat>(), Ok(SampleFormat::F32le));
        assert!("u8".parse::<SampleFormat>().is_err());
    }

    #[test]
    fn test_lambda_env_defaults() {
        let spec = SampleSpec {
            format: SampleFormat::S16le,
            rate: 44100,
            channels: 2,
        };
        let env = spec.lambda_env(1024);
        let get = |k: &str| {
            env.iter()
                .find(|(key, _)| *key == k)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("PA_LAMBDA_SAMPLE_RATE"), Some("44100"));
        assert_eq!(get("PA_LAMBDA_CHANNELS"), Some("2"));
        assert_eq!(get("PA_LAMBDA_BUFFER_SIZE"), Some("1024"));
        assert_eq!(get("PA_LAMBDA_SAMPLE_FORMAT"), Some("s16le"));
        assert_eq!(get("PA_LAMBDA_BYTES_PER_SAMPLE"), Some("2"));
        assert_eq!(get("PA_LAMBDA_BYTES_PER_FRAME"), Some("4"));
        assert_eq!(get("PA_LAMBDA_SIGNED"), Some("signed"));
        assert_eq!(get("PA_LAMBDA_BITS"), Some("16"));
    }

    #[test]
    fn test_default_channel_map() {
        assert_eq!(default_channel_map(1), vec!["MONO"]);
        assert_eq!(default_channel_map(2), vec!["FL", "FR"]);
        assert_eq!(default_channel_map(6).len(), 6);
        assert_eq!(default_channel_map(7)[6], "AUX6");
    }
}
