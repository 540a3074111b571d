//! Окно вывода для chunk-режима.
//!
//! Свёрточный фронтенд сжимает ось времени, поэтому границы чанка,
//! заданные во входных фреймах, пересчитываются в выходные фреймы
//! через ту же арифметику, что и у свёрток.

use asr_core::{AsrError, AsrResult, EncoderConfig};

/// Time-axis geometry of one convolution layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvTimeGeometry {
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
}

impl ConvTimeGeometry {
    /// `(len + 2·pad − kernel) / stride + 1`, or 0 when the padded input is
    /// shorter than the kernel.
    pub fn output_length(&self, len: usize) -> usize {
        let padded = len + 2 * self.padding;
        if padded < self.kernel {
            0
        } else {
            (padded - self.kernel) / self.stride + 1
        }
    }
}

/// Stride/padding profile of the convolutional front end along time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FrontendGeometry {
    layers: Vec<ConvTimeGeometry>,
}

impl FrontendGeometry {
    pub fn new(layers: Vec<ConvTimeGeometry>) -> Self {
        Self { layers }
    }

    /// Geometry of the `ConvBNReLU` front end described by `config`
    /// (padding is `kernel / 2` on every layer), `None` without a front end.
    pub fn from_config(config: &EncoderConfig) -> Option<Self> {
        if !config.has_conv_frontend() {
            return None;
        }
        let layers = config
            .conv_kernel_sizes
            .values()
            .iter()
            .zip(config.conv_strides.values())
            .map(|(k, s)| ConvTimeGeometry {
                kernel: k.time(),
                stride: s.time(),
                padding: k.time() / 2,
            })
            .collect();
        Some(Self { layers })
    }

    pub fn layers(&self) -> &[ConvTimeGeometry] {
        &self.layers
    }

    /// Number of output frames produced from `len` input frames.
    pub fn output_length(&self, len: usize) -> usize {
        self.layers.iter().fold(len, |l, g| g.output_length(l))
    }

    /// Sum of the time-axis paddings.
    pub fn receptive_field_radius(&self) -> usize {
        self.layers.iter().map(|g| g.padding).sum()
    }
}

/// Output-frame range `[begin, end)` of one chunk.
///
/// `end = None` means no right truncation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkWindow {
    pub begin: usize,
    pub end: Option<usize>,
}

impl ChunkWindow {
    /// Compute the window for `chunk_left_context` frames of left context
    /// followed by `chunk_width` frames.
    ///
    /// With a front end the left context must cover its receptive-field
    /// radius.
    pub fn new(
        chunk_left_context: usize,
        chunk_width: Option<usize>,
        frontend: Option<&FrontendGeometry>,
    ) -> AsrResult<Self> {
        if chunk_width == Some(0) {
            return Err(AsrError::config("chunk_width must be positive"));
        }

        let output_length = |len: usize| frontend.map_or(len, |f| f.output_length(len));

        if let Some(f) = frontend {
            let radius = f.receptive_field_radius();
            if chunk_left_context < radius {
                return Err(AsrError::config(format!(
                    "chunk_left_context ({chunk_left_context}) is smaller than the \
                     receptive field radius of the conv front end ({radius})"
                )));
            }
        }

        let first = output_length(chunk_left_context + 1);
        if first == 0 {
            return Err(AsrError::config(format!(
                "conv front end maps {} input frames to no output frame",
                chunk_left_context + 1
            )));
        }

        let begin = first - 1;
        let end = chunk_width.map(|w| output_length(chunk_left_context + w));
        Ok(Self { begin, end })
    }

    /// Window without truncation.
    pub fn full() -> Self {
        Self { begin: 0, end: None }
    }

    /// True when forward passes should be truncated.
    pub fn is_finite(&self) -> bool {
        self.end.is_some()
    }

    /// Width in output frames, if finite.
    pub fn width(&self) -> Option<usize> {
        self.end.map(|e| e - self.begin)
    }
}
