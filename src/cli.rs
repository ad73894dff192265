use std::path::PathBuf;

use clap::Parser;

use crate::{config::Config, present::StrategyKind, render::Technique};

/// Command line flags. Every flag overrides the matching config value.
#[derive(Debug, Default, Parser)]
#[command(name = "scanout", version, about = "Render frames straight to a KMS display")]
pub struct Cli {
    /// Use atomic modesetting and page flipping
    #[arg(short = 'A', long)]
    pub atomic: bool,

    /// Number of frames to render, runs until interrupted otherwise
    #[arg(short = 'c', long, value_name = "N")]
    pub count: Option<u64>,

    /// DRM device to use, the first KMS capable card otherwise
    #[arg(short = 'D', long, value_name = "PATH")]
    pub device: Option<PathBuf>,

    /// Four character pixel format code, e.g. XR24
    #[arg(short = 'f', long, value_name = "FOURCC")]
    pub format: Option<String>,

    /// Format modifier, decimal or 0x prefixed hex
    #[arg(short = 'm', long, value_name = "MODIFIER")]
    pub modifier: Option<String>,

    /// Connector object ID or index
    #[arg(short = 'n', long = "connector-id", value_name = "ID")]
    pub connector: Option<u32>,

    /// Mode name, optionally with @Hz (WxH when offscreen)
    #[arg(short = 'v', long, value_name = "MODE")]
    pub mode: Option<String>,

    /// Refresh rate filter in Hz
    #[arg(short = 'r', long, value_name = "HZ")]
    pub refresh: Option<u32>,

    /// Drawing technique: smooth or bars
    #[arg(short = 'M', long, value_name = "TECHNIQUE")]
    pub technique: Option<Technique>,

    /// Multisample count
    #[arg(short = 's', long, value_name = "N")]
    pub samples: Option<u32>,

    /// Use a fixed pair of scan-out buffers instead of a surface sized ring
    #[arg(short = 'x', long)]
    pub surfaceless: bool,

    /// Render on a render node without any display
    #[arg(short = 'O', long)]
    pub offscreen: bool,

    /// Keep rendering while the previous frame is still being presented
    #[arg(short = 'N', long)]
    pub nonblocking: bool,

    /// Do not pass GPU fences to atomic commits
    #[arg(long)]
    pub no_fencing: bool,

    /// Number of buffers in the ring
    #[arg(long, value_name = "N")]
    pub ring_size: Option<usize>,

    /// Do not stop on terminal input
    #[arg(long)]
    pub no_input: bool,

    /// List connectors and modes, then exit
    #[arg(long)]
    pub probe: bool,
}

impl Cli {
    pub fn apply(&self, config: &mut Config) {
        if self.atomic {
            config.presentation.strategy = StrategyKind::Atomic;
        }
        if let Some(count) = self.count {
            config.frames = Some(count);
        }
        if let Some(device) = &self.device {
            config.display.device = Some(device.clone());
        }
        if let Some(format) = &self.format {
            config.buffers.format = format.clone();
        }
        if let Some(modifier) = &self.modifier {
            config.buffers.modifier = Some(modifier.clone());
        }
        if let Some(connector) = self.connector {
            config.display.connector = Some(connector);
        }
        if let Some(mode) = &self.mode {
            config.display.mode = Some(mode.clone());
        }
        if let Some(refresh) = self.refresh {
            config.display.refresh = refresh;
        }
        if let Some(technique) = self.technique {
            config.render.technique = technique;
        }
        if let Some(samples) = self.samples {
            config.render.samples = samples;
        }
        if let Some(ring_size) = self.ring_size {
            config.buffers.ring_size = ring_size;
        }
        config.buffers.surfaceless |= self.surfaceless;
        config.offscreen |= self.offscreen;
        config.presentation.nonblocking |= self.nonblocking;
        if self.no_fencing {
            config.presentation.fencing = false;
        }
        if self.no_input {
            config.presentation.watch_input = false;
        }
    }
}
