//! Слои трансформера энкодера.
//!
//! - LayerNorm с весом и смещением
//! - Self-attention с Q/K/V/O проекциями, маской паддинга и
//!   ограничением контекста по времени
//! - FFN fc1 → активация → fc2
//! - Pre-norm или post-norm слой энкодера
//! - Блочный quantization noise на весах проекций при обучении

use candle_core::{D, DType, Device, Module, Tensor};
use candle_nn::{Dropout, Linear, VarBuilder, linear};

use asr_core::{ActivationFn, EncoderConfig, TransformerContext};

/// Value written into masked attention scores before the softmax.
const MASK_FILL: f32 = -1e8;

/// LayerNorm layer with learnable weight and bias.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    /// Create a new LayerNorm layer.
    pub fn new(hidden_size: usize, eps: f64, vb: VarBuilder) -> candle_core::Result<Self> {
        let weight = vb.get_with_hints(hidden_size, "weight", candle_nn::Init::Const(1.0))?;
        let bias = vb.get_with_hints(hidden_size, "bias", candle_nn::Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }

    /// Apply LayerNorm to the input tensor.
    pub fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        // вычисления в float32 для стабильности, затем каст обратно
        let input_dtype = x.dtype();
        let x_f32 = x.to_dtype(DType::F32)?;

        let mean = x_f32.mean_keepdim(D::Minus1)?;
        let x_centered = x_f32.broadcast_sub(&mean)?;
        let variance = x_centered.sqr()?.mean_keepdim(D::Minus1)?;
        let x_normed = x_centered.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        let x_normed = x_normed.to_dtype(input_dtype)?;

        x_normed
            .broadcast_mul(&self.weight.to_dtype(input_dtype)?)?
            .broadcast_add(&self.bias.to_dtype(input_dtype)?)
    }
}

/// Linear projection with iterative product-quantization noise.
///
/// In training mode whole blocks of `block_size` input weights are zeroed
/// per output row with probability `p`, and the kept weights are scaled by
/// `1 / (1 - p)`. In eval mode (or with `p = 0`) it is a plain linear layer.
#[derive(Debug, Clone)]
pub struct QuantNoiseLinear {
    inner: Linear,
    p: f32,
    block_size: usize,
}

impl QuantNoiseLinear {
    pub fn new(inner: Linear, p: f32, block_size: usize) -> candle_core::Result<Self> {
        if p > 0.0 {
            let in_features = inner.weight().dim(1)?;
            if block_size == 0 || in_features % block_size != 0 {
                candle_core::bail!(
                    "input features ({in_features}) must be a multiple of the quant noise block size ({block_size})"
                );
            }
        }
        Ok(Self {
            inner,
            p,
            block_size,
        })
    }

    fn from_config(
        in_dim: usize,
        out_dim: usize,
        config: &EncoderConfig,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        Self::new(
            linear(in_dim, out_dim, vb)?,
            config.quant_noise_pq,
            config.quant_noise_pq_block_size,
        )
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        if !train || self.p <= 0.0 {
            return self.inner.forward(x);
        }
        let weight = self.inner.weight();
        let (out_features, in_features) = weight.dims2()?;
        let blocks = in_features / self.block_size;

        let dropped = Tensor::rand(0f32, 1f32, (out_features, blocks), weight.device())?
            .lt(self.p)?
            .to_dtype(weight.dtype())?;
        let keep = dropped
            .unsqueeze(2)?
            .broadcast_as((out_features, blocks, self.block_size))?
            .reshape((out_features, in_features))?
            .affine(-1.0, 1.0)?;
        let noisy = ((weight * keep)? / (1.0 - self.p as f64))?;
        Linear::new(noisy, self.inner.bias().cloned()).forward(x)
    }
}

/// Apply an activation function.
pub fn activate(x: &Tensor, activation: ActivationFn) -> candle_core::Result<Tensor> {
    match activation {
        ActivationFn::Relu => x.relu(),
        ActivationFn::Gelu => x.gelu_erf(),
        ActivationFn::GeluAccurate => x.gelu(),
        ActivationFn::Tanh => x.tanh(),
        ActivationFn::Linear => Ok(x.clone()),
    }
}

/// Attention mask `[time, time]` for time-restricted self-attention:
/// 1 where query `i` may not attend to key `j`, i.e. `j < i - left` or
/// `j > i + right`. `None` when the context is unrestricted on both sides.
pub fn context_mask(
    context: Option<&TransformerContext>,
    time: usize,
    device: &Device,
) -> candle_core::Result<Option<Tensor>> {
    let Some(ctx) = context else {
        return Ok(None);
    };
    if ctx.left.is_none() && ctx.right.is_none() {
        return Ok(None);
    }
    let mut mask = vec![0u8; time * time];
    for i in 0..time {
        for j in 0..time {
            let too_early = ctx.left.is_some_and(|l| j + l < i);
            let too_late = ctx.right.is_some_and(|r| j > i + r);
            if too_early || too_late {
                mask[i * time + j] = 1;
            }
        }
    }
    Tensor::from_vec(mask, (time, time), device).map(Some)
}

/// Multi-Head Self-Attention layer.
///
/// - q_proj, k_proj, v_proj, out_proj (all with bias)
#[derive(Debug, Clone)]
pub struct SelfAttention {
    q_proj: QuantNoiseLinear,
    k_proj: QuantNoiseLinear,
    v_proj: QuantNoiseLinear,
    out_proj: QuantNoiseLinear,
    num_heads: usize,
    head_dim: usize,
    dropout: Dropout,
}

impl SelfAttention {
    /// Create a new attention layer.
    pub fn new(config: &EncoderConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let hidden_size = config.encoder_embed_dim;

        let proj = |name: &str| {
            QuantNoiseLinear::from_config(hidden_size, hidden_size, config, vb.pp(name))
        };
        let q_proj = proj("q_proj")?;
        let k_proj = proj("k_proj")?;
        let v_proj = proj("v_proj")?;
        let out_proj = proj("out_proj")?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            num_heads: config.encoder_attention_heads,
            head_dim: config.head_dim(),
            dropout: Dropout::new(config.attention_dropout),
        })
    }

    /// Forward pass.
    ///
    /// * `hidden_states` - `[batch, time, hidden]`
    /// * `mask` - u8 `[batch, 1, time|1, time]`, 1 = masked
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> candle_core::Result<Tensor> {
        let (batch_size, seq_len, _) = hidden_states.dims3()?;

        let split_heads = |t: Tensor| -> candle_core::Result<Tensor> {
            t.reshape((batch_size, seq_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split_heads(self.q_proj.forward(hidden_states, train)?)?;
        let k = split_heads(self.k_proj.forward(hidden_states, train)?)?;
        let v = split_heads(self.v_proj.forward(hidden_states, train)?)?;

        // Scaled dot-product attention
        let scale = (self.head_dim as f64).sqrt();
        let mut scores = (q.matmul(&k.transpose(2, 3)?)? / scale)?;

        if let Some(mask) = mask {
            let mask = mask.broadcast_as(scores.shape())?;
            let fill = Tensor::new(MASK_FILL, scores.device())?
                .to_dtype(scores.dtype())?
                .broadcast_as(scores.shape())?;
            scores = mask.where_cond(&fill, &scores)?;
        }

        let attn_f32 = scores.to_dtype(DType::F32)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn_f32)?.to_dtype(scores.dtype())?;
        let attn = self.dropout.forward(&attn, train)?;

        let attn_output = attn.matmul(&v)?.transpose(1, 2)?.contiguous()?.reshape((
            batch_size,
            seq_len,
            self.num_heads * self.head_dim,
        ))?;

        self.out_proj.forward(&attn_output, train)
    }
}

/// Feed-Forward Network.
///
/// Structure: fc1 -> activation -> dropout -> fc2
#[derive(Debug, Clone)]
pub struct FeedForward {
    fc1: QuantNoiseLinear,
    fc2: QuantNoiseLinear,
    activation: ActivationFn,
    activation_dropout: Dropout,
}

impl FeedForward {
    /// Create a new FFN layer.
    pub fn new(config: &EncoderConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let (embed, ffn) = (config.encoder_embed_dim, config.encoder_ffn_embed_dim);
        let fc1 = QuantNoiseLinear::from_config(embed, ffn, config, vb.pp("fc1"))?;
        let fc2 = QuantNoiseLinear::from_config(ffn, embed, config, vb.pp("fc2"))?;

        Ok(Self {
            fc1,
            fc2,
            activation: config.activation_fn,
            activation_dropout: Dropout::new(config.activation_dropout),
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let hidden = activate(&self.fc1.forward(x, train)?, self.activation)?;
        let hidden = self.activation_dropout.forward(&hidden, train)?;
        self.fc2.forward(&hidden, train)
    }
}

/// Transformer Encoder Layer.
///
/// Pre-norm (`normalize_before`):
/// - x + dropout(self_attn(self_attn_layer_norm(x)))
/// - x + dropout(ffn(final_layer_norm(x)))
///
/// Post-norm applies the same layer norms after each residual sum.
#[derive(Debug, Clone)]
pub struct EncoderLayer {
    self_attn: SelfAttention,
    mlp: FeedForward,
    self_attn_layer_norm: LayerNorm,
    final_layer_norm: LayerNorm,
    dropout: Dropout,
    normalize_before: bool,
}

impl EncoderLayer {
    /// Create a new encoder layer.
    pub fn new(config: &EncoderConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let self_attn = SelfAttention::new(config, vb.pp("self_attn"))?;
        let mlp = FeedForward::new(config, vb.clone())?;
        let self_attn_layer_norm = LayerNorm::new(
            config.encoder_embed_dim,
            config.layer_norm_eps,
            vb.pp("self_attn_layer_norm"),
        )?;
        let final_layer_norm = LayerNorm::new(
            config.encoder_embed_dim,
            config.layer_norm_eps,
            vb.pp("final_layer_norm"),
        )?;

        Ok(Self {
            self_attn,
            mlp,
            self_attn_layer_norm,
            final_layer_norm,
            dropout: Dropout::new(config.dropout),
            normalize_before: config.encoder_normalize_before,
        })
    }

    /// Forward pass with residual connections.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> candle_core::Result<Tensor> {
        // Self-attention block
        let residual = hidden_states;
        let mut x = if self.normalize_before {
            self.self_attn_layer_norm.forward(hidden_states)?
        } else {
            hidden_states.clone()
        };
        x = self.self_attn.forward(&x, mask, train)?;
        x = (residual + self.dropout.forward(&x, train)?)?;
        if !self.normalize_before {
            x = self.self_attn_layer_norm.forward(&x)?;
        }

        // FFN block
        let residual = x.clone();
        if self.normalize_before {
            x = self.final_layer_norm.forward(&x)?;
        }
        x = self.mlp.forward(&x, train)?;
        x = (residual + self.dropout.forward(&x, train)?)?;
        if !self.normalize_before {
            x = self.final_layer_norm.forward(&x)?;
        }
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::IndexOp;
    use candle_nn::VarMap;

    fn small_config() -> EncoderConfig {
        EncoderConfig {
            encoder_embed_dim: 8,
            encoder_ffn_embed_dim: 16,
            encoder_attention_heads: 2,
            ..EncoderConfig::base()
        }
    }

    #[test]
    fn test_context_mask() {
        let ctx = TransformerContext {
            left: Some(1),
            right: Some(0),
        };
        let mask = context_mask(Some(&ctx), 4, &Device::Cpu).unwrap().unwrap();
        let rows: Vec<Vec<u8>> = mask.to_vec2().unwrap();
        assert_eq!(rows[0], vec![0, 1, 1, 1]);
        assert_eq!(rows[2], vec![1, 0, 0, 1]);
        assert_eq!(rows[3], vec![1, 1, 0, 0]);

        let open = TransformerContext {
            left: None,
            right: None,
        };
        assert!(context_mask(Some(&open), 4, &Device::Cpu).unwrap().is_none());
        assert!(context_mask(None, 4, &Device::Cpu).unwrap().is_none());
    }

    #[test]
    fn test_quant_noise_drops_whole_blocks() {
        let device = Device::Cpu;
        let weight = Tensor::ones((3, 4), DType::F32, &device).unwrap();
        let layer = QuantNoiseLinear::new(Linear::new(weight, None), 0.5, 2).unwrap();
        let eye = Tensor::eye(4, DType::F32, &device).unwrap();

        // row i of the output is column i of the effective weight
        let eval: Vec<Vec<f32>> = layer.forward(&eye, false).unwrap().to_vec2().unwrap();
        assert!(eval.iter().flatten().all(|&v| v == 1.0));

        for _ in 0..8 {
            let cols: Vec<Vec<f32>> = layer.forward(&eye, true).unwrap().to_vec2().unwrap();
            assert!(cols.iter().flatten().all(|&v| v == 0.0 || (v - 2.0).abs() < 1e-6));
            assert_eq!(cols[0], cols[1]);
            assert_eq!(cols[2], cols[3]);
        }
    }

    #[test]
    fn test_quant_noise_block_must_divide_inputs() {
        let weight = Tensor::ones((3, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(QuantNoiseLinear::new(Linear::new(weight.clone(), None), 0.1, 3).is_err());
        assert!(QuantNoiseLinear::new(Linear::new(weight, None), 0.0, 3).is_ok());
    }

    #[test]
    fn test_padding_does_not_change_valid_frames() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let layer = EncoderLayer::new(&small_config(), vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (1, 3, 8), &device).unwrap();
        let junk = Tensor::randn(0f32, 1.0, (1, 2, 8), &device).unwrap();
        let padded = Tensor::cat(&[&x, &junk], 1).unwrap();
        let mask = Tensor::from_vec(vec![0u8, 0, 0, 1, 1], (1, 1, 1, 5), &device).unwrap();

        let short = layer.forward(&x, None, false).unwrap();
        let long = layer.forward(&padded, Some(&mask), false).unwrap();
        let diff = (short - long.i((.., 0..3, ..)).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-4, "diff = {diff}");
    }
}
