//! Pool configuration and color formats.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result, bail};

use crate::error::AllocError;

/// Color format of every slot in a batch surface.
///
/// The allocator treats the format as opaque apart from the geometry needed
/// to size a pitched slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ColorFormat {
    Gray8,
    Rgb,
    Bgr,
    #[default]
    Rgba,
    Bgra,
    Bgrx,
    /// Semi-planar 4:2:0 (Y plane + interleaved UV plane).
    Nv12,
    /// Planar 4:2:0.
    Yuv420,
}

impl ColorFormat {
    pub const ALL: [ColorFormat; 8] = [
        ColorFormat::Gray8,
        ColorFormat::Rgb,
        ColorFormat::Bgr,
        ColorFormat::Rgba,
        ColorFormat::Bgra,
        ColorFormat::Bgrx,
        ColorFormat::Nv12,
        ColorFormat::Yuv420,
    ];

    /// Bytes per pixel of the first (luma or packed) plane.
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            ColorFormat::Gray8 | ColorFormat::Nv12 | ColorFormat::Yuv420 => 1,
            ColorFormat::Rgb | ColorFormat::Bgr => 3,
            ColorFormat::Rgba | ColorFormat::Bgra | ColorFormat::Bgrx => 4,
        }
    }

    /// Rows occupied by all planes relative to `height`, as `(num, den)`.
    pub fn height_factor(self) -> (u32, u32) {
        match self {
            ColorFormat::Nv12 | ColorFormat::Yuv420 => (3, 2),
            _ => (1, 1),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ColorFormat::Gray8 => "gray8",
            ColorFormat::Rgb => "rgb",
            ColorFormat::Bgr => "bgr",
            ColorFormat::Rgba => "rgba",
            ColorFormat::Bgra => "bgra",
            ColorFormat::Bgrx => "bgrx",
            ColorFormat::Nv12 => "nv12",
            ColorFormat::Yuv420 => "yuv420",
        }
    }
}

impl fmt::Display for ColorFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ColorFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        ColorFormat::ALL
            .into_iter()
            .find(|fmt| fmt.name() == lower)
            .with_context(|| format!("Unknown color format: '{}'", s))
    }
}

/// Immutable parameters shared by every batch a pool produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    pub color_format: ColorFormat,
    /// Number of frames per batch surface
    pub batch_size: u32,
    /// GPU the batch memory lives on
    pub device_id: u32,
}

impl PoolConfig {
    pub fn new(
        width: u32,
        height: u32,
        color_format: ColorFormat,
        batch_size: u32,
        device_id: u32,
    ) -> Self {
        Self {
            width,
            height,
            color_format,
            batch_size,
            device_id,
        }
    }

    pub fn validate(&self) -> Result<(), AllocError> {
        if self.width == 0 || self.height == 0 {
            return Err(AllocError::InvalidConfig(format!(
                "frame dimensions must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if self.batch_size == 0 {
            return Err(AllocError::InvalidConfig(
                "batch_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn batch_len(&self) -> usize {
        self.batch_size as usize
    }
}

/// Parses a resolution string such as `640x480` into `(width, height)`.
pub fn parse_resolution(res: &str) -> Result<(u32, u32)> {
    let res = res.trim().to_lowercase();
    let (w, h) = res
        .split_once('x')
        .with_context(|| format!("Invalid resolution '{res}'. Use WIDTHxHEIGHT."))?;

    let width: u32 = w.trim().parse().context("Invalid resolution width")?;
    let height: u32 = h.trim().parse().context("Invalid resolution height")?;
    if width == 0 || height == 0 {
        bail!("Resolution must be non-zero, got {}x{}", width, height);
    }
    Ok((width, height))
}
