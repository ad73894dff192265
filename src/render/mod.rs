// Render backends
//
// A backend draws one frame into a buffer handed out by the ring and must not
// keep the buffer past the call. What gets drawn is a `Technique`, a pure
// description of rectangles to fill so it can be checked without a GPU.

pub mod gles;

use std::{fmt, os::fd::OwnedFd, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::RenderError;

/// Result of drawing one frame.
#[derive(Debug, Default)]
pub struct RenderOutcome {
    /// GPU completion fence, when the backend exports one instead of waiting.
    pub fence: Option<OwnedFd>,
}

pub trait RenderBackend<B> {
    fn draw_frame(&mut self, buffer: &mut B, frame: u64) -> Result<RenderOutcome, RenderError>;
}

/// Visual technique used to fill each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Technique {
    /// Whole screen cycling through the hue circle.
    #[default]
    Smooth,
    /// Scrolling vertical colour bars.
    Bars,
}

impl FromStr for Technique {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "smooth" => Ok(Technique::Smooth),
            "bars" => Ok(Technique::Bars),
            other => Err(format!("unknown technique {other:?}, expected smooth or bars")),
        }
    }
}

impl fmt::Display for Technique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Technique::Smooth => "smooth",
            Technique::Bars => "bars",
        })
    }
}

/// A solid rectangle in buffer coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fill {
    pub color: [f32; 4],
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

const BAR_COUNT: u32 = 8;
const BAR_SPEED: u64 = 4;

const BAR_COLORS: [[f32; 4]; BAR_COUNT as usize] = [
    [1.0, 1.0, 1.0, 1.0],
    [1.0, 1.0, 0.0, 1.0],
    [0.0, 1.0, 1.0, 1.0],
    [0.0, 1.0, 0.0, 1.0],
    [1.0, 0.0, 1.0, 1.0],
    [1.0, 0.0, 0.0, 1.0],
    [0.0, 0.0, 1.0, 1.0],
    [0.0, 0.0, 0.0, 1.0],
];

impl Technique {
    /// Rectangles covering a `size` buffer for `frame`.
    pub fn paint(self, frame: u64, size: (u32, u32)) -> Vec<Fill> {
        let (width, height) = size;
        if width == 0 || height == 0 {
            return Vec::new();
        }
        match self {
            Technique::Smooth => vec![Fill {
                color: hue_to_rgb((frame % 360) as f32),
                x: 0,
                y: 0,
                width: width as i32,
                height: height as i32,
            }],
            Technique::Bars => bars(frame, width, height),
        }
    }
}

fn bars(frame: u64, width: u32, height: u32) -> Vec<Fill> {
    let bar = width.div_ceil(BAR_COUNT);
    let offset = ((frame * BAR_SPEED) % width as u64) as u32;
    let mut fills = Vec::with_capacity(BAR_COUNT as usize + 1);

    for (i, color) in BAR_COLORS.iter().enumerate() {
        let start = i as u32 * bar;
        if start >= width {
            break;
        }
        let len = bar.min(width - start);
        let x = (start + offset) % width;
        // a bar scrolled past the right edge continues on the left
        let first = len.min(width - x);
        fills.push(Fill {
            color: *color,
            x: x as i32,
            y: 0,
            width: first as i32,
            height: height as i32,
        });
        if first < len {
            fills.push(Fill {
                color: *color,
                x: 0,
                y: 0,
                width: (len - first) as i32,
                height: height as i32,
            });
        }
    }
    fills
}

/// Fully saturated colour for `hue` degrees.
fn hue_to_rgb(hue: f32) -> [f32; 4] {
    let h = (hue % 360.0) / 60.0;
    let x = 1.0 - (h % 2.0 - 1.0).abs();
    let (r, g, b) = match h as u32 {
        0 => (1.0, x, 0.0),
        1 => (x, 1.0, 0.0),
        2 => (0.0, 1.0, x),
        3 => (0.0, x, 1.0),
        4 => (x, 0.0, 1.0),
        _ => (1.0, 0.0, x),
    };
    [r, g, b, 1.0]
}
