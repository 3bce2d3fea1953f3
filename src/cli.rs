use std::path::PathBuf;

use clap::Parser;

use crate::audio::SampleFormat;
use crate::config::BridgeConfig;
use crate::error::BridgeError;

#[derive(Parser, Debug)]
#[command(name = "pw-lambda", version)]
#[command(about = "Splice a shell command into the PipeWire graph as a raw-audio filter")]
pub struct Args {
    /// Filter command, run as `sh -c <COMMAND>`. Reads raw audio on stdin
    /// and writes raw audio to stdout. Pass it as one argument, quoted the
    /// way the shell should see it.
    pub command: Option<String>,

    /// Capture from this node instead of exposing a virtual sink
    #[arg(long, value_name = "NAME")]
    pub source: Option<String>,

    /// Play to this node instead of exposing a virtual source
    #[arg(long, value_name = "NAME")]
    pub sink: Option<String>,

    /// Node name of the sink endpoint
    #[arg(long)]
    pub sink_name: Option<String>,

    /// Node name of the source endpoint
    #[arg(long)]
    pub source_name: Option<String>,

    /// Wire sample format: s16le, s32le or f32le
    #[arg(long)]
    pub format: Option<SampleFormat>,

    #[arg(long)]
    pub rate: Option<u32>,

    #[arg(long)]
    pub channels: Option<usize>,

    /// Comma-separated channel positions, e.g. FL,FR
    #[arg(long, value_delimiter = ',')]
    pub channel_map: Option<Vec<String>>,

    /// Requested quantum in frames
    #[arg(long)]
    pub buffer_frames: Option<u32>,

    /// Config file (default: $XDG_CONFIG_HOME/pw-lambda/config.json)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

impl Args {
    /// Load the config file and apply command-line overrides on top.
    pub fn resolve(self) -> Result<BridgeConfig, BridgeError> {
        let mut config = match self.config.clone().or_else(BridgeConfig::default_path) {
            Some(path) => BridgeConfig::load(&path)?,
            None => BridgeConfig::default(),
        };
        self.apply(&mut config);
        Ok(config)
    }

    fn apply(self, config: &mut BridgeConfig) {
        if let Some(command) = self.command {
            config.command = command;
        }
        if let Some(target) = self.source {
            config.capture_target = Some(target);
        }
        if let Some(target) = self.sink {
            config.playback_target = Some(target);
        }
        if let Some(name) = self.sink_name {
            config.sink_name = name;
        }
        if let Some(name) = self.source_name {
            config.source_name = name;
        }
        if let Some(format) = self.format {
            config.format = format;
        }
        if let Some(rate) = self.rate {
            config.rate = rate;
        }
        if let Some(channels) = self.channels {
            config.channels = channels;
            // A map from the file no longer fits a different channel count.
            if self.channel_map.is_none()
                && config.channel_map.as_ref().is_some_and(|m| m.len() != channels)
            {
                config.channel_map = None;
            }
        }
        if let Some(map) = self.channel_map {
            config.channel_map = Some(map);
        }
        if let Some(frames) = self.buffer_frames {
            config.buffer_frames = frames;
        }
    }
}
