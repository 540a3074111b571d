//! Positional embeddings for the speech encoder.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, VarBuilder};

use asr_core::{AsrError, AsrResult};

/// Sinusoidal Position Embedding.
///
/// Generates sin/cos positional embeddings with log-spaced timescales.
/// Row 0 is reserved for padding and stays zero, real positions start at 1.
#[derive(Debug, Clone)]
pub struct SinusoidalPositionalEmbedding {
    table: Tensor,
}

impl SinusoidalPositionalEmbedding {
    /// Create a table for positions `1..=max_positions`.
    ///
    /// # Arguments
    /// * `max_positions` - Maximum sequence length
    /// * `channels` - Embedding dimension (must be even)
    pub fn new(max_positions: usize, channels: usize, device: &Device) -> AsrResult<Self> {
        if channels % 2 != 0 || channels < 4 {
            return Err(AsrError::config(format!(
                "sinusoidal positions need an even dimension >= 4, got {channels}"
            )));
        }

        let half_channels = channels / 2;
        let log_timescale_increment = 10000f64.ln() / (half_channels as f64 - 1.0);

        // inv_timescales = exp(-log_timescale_increment * arange(half_channels))
        let inv_timescales: Vec<f32> = (0..half_channels)
            .map(|i| (-log_timescale_increment * i as f64).exp() as f32)
            .collect();

        let rows = max_positions + 1;
        let mut data = vec![0.0_f32; rows * channels];
        for pos in 1..rows {
            for (i, inv) in inv_timescales.iter().enumerate() {
                let scaled = pos as f32 * inv;
                data[pos * channels + i] = scaled.sin();
                data[pos * channels + half_channels + i] = scaled.cos();
            }
        }

        let table = Tensor::from_vec(data, (rows, channels), device)?;
        Ok(Self { table })
    }

    pub fn max_positions(&self) -> usize {
        self.table.dim(0).map_or(0, |r| r - 1)
    }
}

/// Learned positional embedding table (`max_positions + 1` rows, row 0 = padding).
#[derive(Debug, Clone)]
pub struct LearnedPositionalEmbedding {
    embedding: Embedding,
    max_positions: usize,
}

impl LearnedPositionalEmbedding {
    pub fn new(max_positions: usize, channels: usize, vb: VarBuilder) -> AsrResult<Self> {
        let embedding = candle_nn::embedding(max_positions + 1, channels, vb)?;
        Ok(Self {
            embedding,
            max_positions,
        })
    }
}

/// Позиционные эмбеддинги энкодера: синусоидальные или обучаемые.
#[derive(Debug, Clone)]
pub enum PositionalEmbedding {
    Sinusoidal(SinusoidalPositionalEmbedding),
    Learned(LearnedPositionalEmbedding),
}

impl PositionalEmbedding {
    pub fn max_positions(&self) -> usize {
        match self {
            Self::Sinusoidal(s) => s.max_positions(),
            Self::Learned(l) => l.max_positions,
        }
    }

    /// Embeddings for a `[batch, time]` batch with the given valid lengths.
    ///
    /// Returns `[batch, time, channels]`; padded frames get the zero row
    /// (sinusoidal) or the padding row (learned).
    pub fn forward(&self, lengths: &[usize], time: usize, device: &Device) -> AsrResult<Tensor> {
        if time > self.max_positions() {
            return Err(AsrError::input(format!(
                "sequence of {time} frames exceeds max_source_positions ({})",
                self.max_positions()
            )));
        }
        let batch = lengths.len();
        let mut positions = vec![0u32; batch * time];
        for (b, &len) in lengths.iter().enumerate() {
            for t in 0..len.min(time) {
                positions[b * time + t] = t as u32 + 1;
            }
        }
        let positions = Tensor::from_vec(positions, (batch, time), device)?;

        let out = match self {
            Self::Sinusoidal(s) => {
                let flat = positions.flatten_all()?;
                let channels = s.table.dim(1)?;
                s.table
                    .index_select(&flat, 0)?
                    .reshape((batch, time, channels))?
            }
            Self::Learned(l) => l.embedding.forward(&positions)?,
        };
        Ok(out.to_dtype(DType::F32)?)
    }
}
