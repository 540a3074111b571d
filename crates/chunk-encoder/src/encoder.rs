//! Chunk-aware transformer speech encoder.

use candle_core::{DType, Module, Tensor};
use candle_nn::{Dropout, Linear, VarBuilder, linear};
use rand::Rng;
use tracing::{debug, info};

use asr_core::{AsrError, AsrResult, EncoderConfig, TaskConfig};

use crate::chunk::{ChunkWindow, FrontendGeometry};
use crate::conv::{ConvBNReLU, lengths_to_vec, transformer_input_size};
use crate::encoder_out::{EncoderOutput, lengths_tensor, padding_mask};
use crate::layers::{EncoderLayer, LayerNorm, context_mask};
use crate::position::{LearnedPositionalEmbedding, PositionalEmbedding, SinusoidalPositionalEmbedding};

/// Transformer encoder for speech with optional chunk windowing.
///
/// Pipeline:
/// 1. ConvBNReLU sub-sampling (optional)
/// 2. Projection to `encoder_embed_dim`, scaled, plus positional embedding
/// 3. N transformer layers (pre- or post-norm)
/// 4. Chunk window slice (chunk mode only)
/// 5. Output projection to `num_targets` classes (encoder-only models)
#[derive(Debug, Clone)]
pub struct SpeechChunkTransformerEncoder {
    config: EncoderConfig,
    feat_dim: usize,
    conv: Option<ConvBNReLU>,
    fc0: Option<Linear>,
    embed_scale: f64,
    embed_positions: Option<PositionalEmbedding>,
    layernorm_embedding: Option<LayerNorm>,
    layers: Vec<EncoderLayer>,
    layer_norm: Option<LayerNorm>,
    fc_out: Option<Linear>,
    num_targets: Option<usize>,
    dropout: Dropout,
    window: ChunkWindow,
    training_stage: bool,
    training: bool,
}

impl SpeechChunkTransformerEncoder {
    /// Build the encoder; fails with `InvalidConfiguration` on inconsistent
    /// settings (zero chunk width, insufficient left context, ...).
    pub fn new(config: &EncoderConfig, task: &TaskConfig, vb: VarBuilder) -> AsrResult<Self> {
        config.validate()?;

        info!(
            "input feature dimension: {}, channels: {}",
            task.feat_dim, task.feat_in_channels
        );
        let input_size = transformer_input_size(config, task.feat_dim, task.feat_in_channels)?;

        let geometry = FrontendGeometry::from_config(config);
        let window = ChunkWindow::new(task.chunk_left_context, task.chunk_width, geometry.as_ref())?;

        let conv = ConvBNReLU::from_config(config, task.feat_in_channels, vb.pp("conv"))?;

        let embed_dim = config.encoder_embed_dim;
        let fc0 = if input_size != embed_dim {
            Some(linear(input_size, embed_dim, vb.pp("fc0"))?)
        } else {
            None
        };

        let embed_positions = if config.no_token_positional_embeddings {
            None
        } else if config.encoder_learned_pos {
            Some(PositionalEmbedding::Learned(LearnedPositionalEmbedding::new(
                config.max_source_positions,
                embed_dim,
                vb.pp("embed_positions"),
            )?))
        } else {
            Some(PositionalEmbedding::Sinusoidal(SinusoidalPositionalEmbedding::new(
                config.max_source_positions,
                embed_dim,
                vb.device(),
            )?))
        };

        let layernorm_embedding = if config.layernorm_embedding {
            Some(LayerNorm::new(embed_dim, config.layer_norm_eps, vb.pp("layernorm_embedding"))?)
        } else {
            None
        };

        let mut layers = Vec::with_capacity(config.num_layers());
        for i in 0..config.num_layers() {
            layers.push(EncoderLayer::new(config, vb.pp(format!("layers.{i}")))?);
        }

        let layer_norm = if config.encoder_normalize_before {
            Some(LayerNorm::new(embed_dim, config.layer_norm_eps, vb.pp("layer_norm"))?)
        } else {
            None
        };

        let fc_out = match task.num_targets {
            Some(0) => return Err(AsrError::config("num_targets must be positive")),
            Some(n) => Some(linear(embed_dim, n, vb.pp("fc_out"))?),
            None => None,
        };

        debug!(
            "speech encoder: input_size={}, layers={}, window={:?}",
            input_size,
            layers.len(),
            window
        );

        Ok(Self {
            config: config.clone(),
            feat_dim: task.feat_dim,
            conv,
            fc0,
            embed_scale: (embed_dim as f64).sqrt(),
            embed_positions,
            layernorm_embedding,
            layers,
            layer_norm,
            fc_out,
            num_targets: task.num_targets,
            dropout: Dropout::new(config.dropout),
            window,
            training_stage: task.training_stage,
            training: false,
        })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn window(&self) -> ChunkWindow {
        self.window
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Number of output frames for `len` input frames.
    pub fn output_lengths(&self, len: usize) -> usize {
        self.conv.as_ref().map_or(len, |c| c.output_length(len))
    }

    /// Output dimension: `num_targets` with a projection, else the embed dim.
    pub fn output_dim(&self) -> usize {
        self.num_targets.unwrap_or(self.config.encoder_embed_dim)
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// * `features` - `[batch, time, feat_dim]`
    /// * `lengths` - `[batch]` valid frames per item
    /// * `return_all_hiddens` - also return every layer's hidden states
    pub fn forward(
        &self,
        features: &Tensor,
        lengths: &Tensor,
        return_all_hiddens: bool,
    ) -> AsrResult<EncoderOutput> {
        let debug = asr_core::debug::enabled();
        let train = self.training;

        let (batch, time, feat) = features.dims3()?;
        if feat != self.feat_dim {
            return Err(AsrError::input(format!(
                "expected {} feature dims, got {feat}",
                self.feat_dim
            )));
        }
        let mut lens = lengths_to_vec(lengths)?;
        if lens.len() != batch {
            return Err(AsrError::input(format!(
                "{} lengths for a batch of {batch}",
                lens.len()
            )));
        }
        if let Some(&bad) = lens.iter().find(|&&l| l > time) {
            return Err(AsrError::input(format!(
                "length {bad} exceeds {time} input frames"
            )));
        }

        let features = features.to_dtype(DType::F32)?;
        let mut x = match &self.conv {
            Some(conv) => {
                let (x, out_lens) = conv.forward_t(&features, &lens, train)?;
                lens = out_lens;
                x
            }
            None => features,
        };
        let (_, t, _) = x.dims3()?;

        if let Some(fc0) = &self.fc0 {
            x = fc0.forward(&x)?;
        }
        x = (x * self.embed_scale)?;
        if let Some(pos) = &self.embed_positions {
            x = x.broadcast_add(&pos.forward(&lens, t, x.device())?)?;
        }
        if let Some(ln) = &self.layernorm_embedding {
            x = ln.forward(&x)?;
        }
        x = self.dropout.forward(&x, train)?;

        // [batch, 1, 1|time, time], 1 = masked
        let mut mask = padding_mask(&lens, t, x.device())?;
        let key_mask = mask.reshape((batch, 1, 1, t))?;
        let attn_mask = match context_mask(self.config.encoder_transformer_context.as_ref(), t, x.device())? {
            Some(ctx) => key_mask.broadcast_maximum(&ctx.reshape((1, 1, t, t))?)?,
            None => key_mask,
        };
        let has_padding = lens.iter().any(|&l| l < t);
        let attn_mask = (has_padding || self.config.encoder_transformer_context.is_some())
            .then_some(attn_mask);

        let mut states = Vec::new();
        if return_all_hiddens {
            states.push(x.transpose(0, 1)?.contiguous()?);
        }
        let layerdrop = self.config.encoder_layerdrop;
        let mut rng = rand::thread_rng();
        for layer in &self.layers {
            if train && layerdrop > 0.0 && rng.r#gen::<f32>() < layerdrop {
                continue;
            }
            x = layer.forward(&x, attn_mask.as_ref(), train)?;
            if return_all_hiddens {
                states.push(x.transpose(0, 1)?.contiguous()?);
            }
        }
        if let Some(ln) = &self.layer_norm {
            x = ln.forward(&x)?;
        }

        // Chunk mode: keep only the output frames of the current chunk.
        if let (Some(end), true) = (self.window.end, train || !self.training_stage) {
            if lens.windows(2).any(|w| w[0] != w[1]) {
                return Err(AsrError::input(format!(
                    "chunk mode requires equal lengths within a batch, got {lens:?}"
                )));
            }
            let begin = self.window.begin;
            if end > t {
                return Err(AsrError::input(format!(
                    "chunk window [{begin}, {end}) exceeds {t} output frames"
                )));
            }
            let width = end - begin;
            x = x.narrow(1, begin, width)?;
            mask = mask.narrow(1, begin, width)?;
            states = states
                .iter()
                .map(|s| s.narrow(0, begin, width))
                .collect::<candle_core::Result<Vec<_>>>()?;
            lens.fill(width);
        }

        if let Some(fc_out) = &self.fc_out {
            x = fc_out.forward(&x)?;
        }

        if debug {
            eprintln!(
                "DEBUG SpeechEncoder: in_time={}, out_time={}, lengths={:?}, out_dims={:?}",
                time,
                x.dim(1)?,
                lens,
                x.dims()
            );
        }

        let src_lengths = lengths_tensor(&lens, x.device())?;
        Ok(EncoderOutput {
            encoder_out: x.transpose(0, 1)?.contiguous()?,
            padding_mask: Some(mask),
            embedding: None,
            states,
            src_tokens: None,
            src_lengths: Some(src_lengths),
        })
    }
}
