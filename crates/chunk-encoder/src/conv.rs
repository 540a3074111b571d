//! Свёрточный фронтенд `ConvBNReLU`.
//!
//! Каждый слой: Conv2d → BatchNorm → ReLU, паддинг `kernel / 2` по обеим
//! осям. Вход `[batch, time, feat]` раскладывается на
//! `[batch, in_channels, time, feat / in_channels]`; ось времени играет роль
//! высоты изображения, частотная ось — ширины.

use candle_core::{DType, Module, ModuleT, Tensor};
use candle_nn::{BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Init, VarBuilder};

use asr_core::{AsrError, AsrResult, EncoderConfig};

use crate::chunk::{ConvTimeGeometry, FrontendGeometry};

/// Один слой Conv2d + BatchNorm с независимыми параметрами по осям.
#[derive(Debug, Clone)]
struct ConvBnLayer {
    conv: Conv2d,
    norm: BatchNorm,
    /// (время, частота)
    stride: (usize, usize),
    padding: (usize, usize),
}

impl ConvBnLayer {
    fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let fan_in = in_channels * kernel.0 * kernel.1;
        let bound = 1.0 / (fan_in as f64).sqrt();
        let conv_vb = vb.pp("conv");
        let weight = conv_vb.get_with_hints(
            (out_channels, in_channels, kernel.0, kernel.1),
            "weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bias = conv_vb.get_with_hints(
            out_channels,
            "bias",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;

        // Разные страйды по осям candle не поддерживает: в этом случае
        // свёртка идёт с шагом 1, а прореживание делается вручную.
        let native_stride = if stride.0 == stride.1 { stride.0 } else { 1 };
        let cfg = Conv2dConfig {
            padding: 0,
            stride: native_stride,
            ..Default::default()
        };
        let conv = Conv2d::new(weight, Some(bias), cfg);

        let bn_cfg = BatchNormConfig {
            eps: 1e-5,
            remove_mean: true,
            affine: true,
            momentum: 0.1,
        };
        let norm = candle_nn::batch_norm(out_channels, bn_cfg, vb.pp("norm"))?;

        Ok(Self {
            conv,
            norm,
            stride,
            padding: (kernel.0 / 2, kernel.1 / 2),
        })
    }

    /// x: [batch, channels, time, freq]
    fn forward_t(&self, x: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let x = x
            .pad_with_zeros(2, self.padding.0, self.padding.0)?
            .pad_with_zeros(3, self.padding.1, self.padding.1)?;
        let mut x = self.conv.forward(&x)?;
        if self.stride.0 != self.stride.1 {
            x = subsample(&x, 2, self.stride.0)?;
            x = subsample(&x, 3, self.stride.1)?;
        }
        self.norm.forward_t(&x, train)?.relu()
    }
}

/// Every `step`-th element along `dim`.
fn subsample(x: &Tensor, dim: usize, step: usize) -> candle_core::Result<Tensor> {
    if step == 1 {
        return Ok(x.clone());
    }
    let len = x.dim(dim)?;
    let idx: Vec<u32> = (0..len as u32).step_by(step).collect();
    let n = idx.len();
    let idx = Tensor::from_vec(idx, n, x.device())?;
    x.index_select(&idx, dim)
}

/// Свёрточный фронтенд энкодера.
#[derive(Debug, Clone)]
pub struct ConvBNReLU {
    layers: Vec<ConvBnLayer>,
    in_channels: usize,
    out_channels: usize,
    geometry: FrontendGeometry,
}

impl ConvBNReLU {
    /// Build from the conv specs of `config`; `Ok(None)` without a front end.
    pub fn from_config(
        config: &EncoderConfig,
        in_channels: usize,
        vb: VarBuilder,
    ) -> AsrResult<Option<Self>> {
        if !config.has_conv_frontend() {
            return Ok(None);
        }
        let channels = config.conv_channels.values();
        let kernels = config.conv_kernel_sizes.values();
        let strides = config.conv_strides.values();

        let mut layers = Vec::with_capacity(channels.len());
        let mut geometry = Vec::with_capacity(channels.len());
        let mut in_ch = in_channels;
        for (i, ((c, k), s)) in channels.iter().zip(&kernels).zip(&strides).enumerate() {
            let out_ch = c.time();
            layers.push(ConvBnLayer::new(
                in_ch,
                out_ch,
                (k.time(), k.freq()),
                (s.time(), s.freq()),
                vb.pp(format!("layers.{i}")),
            )?);
            geometry.push(ConvTimeGeometry {
                kernel: k.time(),
                stride: s.time(),
                padding: k.time() / 2,
            });
            in_ch = out_ch;
        }

        Ok(Some(Self {
            layers,
            in_channels,
            out_channels: in_ch,
            geometry: FrontendGeometry::new(geometry),
        }))
    }

    pub fn geometry(&self) -> &FrontendGeometry {
        &self.geometry
    }

    /// Число выходных кадров для `len` входных.
    pub fn output_length(&self, len: usize) -> usize {
        self.geometry.output_length(len)
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Forward pass: `[batch, time, feat]` → `[batch, time', channels · feat']`.
    ///
    /// Returns the new per-item lengths (clamped to `time'`). Frames past an
    /// item's length are zeroed after every layer so padding never leaks
    /// into valid frames.
    pub fn forward_t(
        &self,
        x: &Tensor,
        lengths: &[usize],
        train: bool,
    ) -> AsrResult<(Tensor, Vec<usize>)> {
        let (batch, time, feat) = x.dims3()?;
        if feat % self.in_channels != 0 {
            return Err(AsrError::input(format!(
                "feature dim {feat} is not divisible by {} input channels",
                self.in_channels
            )));
        }
        let mut x = x
            .reshape((batch, time, self.in_channels, feat / self.in_channels))?
            .transpose(1, 2)?
            .contiguous()?;
        let mut lengths = lengths.to_vec();

        for (layer, geom) in self.layers.iter().zip(self.geometry.layers()) {
            x = layer.forward_t(&x, train)?;
            let t = x.dim(2)?;
            for len in &mut lengths {
                *len = geom.output_length(*len).min(t);
            }
            x = mask_time(&x, &lengths)?;
        }

        let (_, channels, t, f) = x.dims4()?;
        let x = x
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, t, channels * f))?;
        Ok((x, lengths))
    }
}

/// Обнулить кадры за пределами длины каждого элемента батча.
/// x: [batch, channels, time, freq]
fn mask_time(x: &Tensor, lengths: &[usize]) -> candle_core::Result<Tensor> {
    let (batch, _, time, _) = x.dims4()?;
    if lengths.iter().all(|&l| l >= time) {
        return Ok(x.clone());
    }
    let mut keep = vec![0f32; batch * time];
    for (b, &len) in lengths.iter().enumerate() {
        keep[b * time..b * time + len.min(time)].fill(1.0);
    }
    let keep = Tensor::from_vec(keep, (batch, 1, time, 1), x.device())?.to_dtype(x.dtype())?;
    x.broadcast_mul(&keep)
}

/// Input size of the transformer stack.
///
/// With a front end: `feat_dim / in_channels` ceil-divided by every
/// frequency stride, times the last channel count. Without one: `feat_dim`.
pub fn transformer_input_size(
    config: &EncoderConfig,
    feat_dim: usize,
    in_channels: usize,
) -> AsrResult<usize> {
    if in_channels == 0 || feat_dim % in_channels != 0 {
        return Err(AsrError::config(format!(
            "feat_dim ({feat_dim}) must be divisible by feat_in_channels ({in_channels})"
        )));
    }
    if !config.has_conv_frontend() {
        return Ok(feat_dim);
    }
    let size = config
        .conv_strides
        .values()
        .iter()
        .fold(feat_dim / in_channels, |size, s| size.div_ceil(s.freq()));
    let last_channels = config
        .conv_channels
        .values()
        .last()
        .map(|c| c.time())
        .ok_or_else(|| AsrError::config("conv_channels must not be empty"))?;
    Ok(size * last_channels)
}

/// Read a `[batch]` integer lengths tensor.
pub(crate) fn lengths_to_vec(lengths: &Tensor) -> AsrResult<Vec<usize>> {
    let v = lengths.to_dtype(DType::I64)?.to_vec1::<i64>()?;
    v.into_iter()
        .map(|l| {
            usize::try_from(l).map_err(|_| AsrError::input(format!("negative length {l}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, IndexOp};
    use candle_nn::VarMap;

    #[test]
    fn test_transformer_input_size() {
        let config = EncoderConfig::base();
        // 83 -> 83 -> 42 -> 42 -> 21, times 128 channels
        assert_eq!(transformer_input_size(&config, 83, 1).unwrap(), 21 * 128);
        assert!(transformer_input_size(&config, 83, 2).is_err());

        let mut flat = EncoderConfig::base();
        flat.conv_channels = asr_core::ConvSpec::Absent;
        flat.conv_kernel_sizes = asr_core::ConvSpec::Absent;
        flat.conv_strides = asr_core::ConvSpec::Absent;
        assert_eq!(transformer_input_size(&flat, 40, 1).unwrap(), 40);
    }

    #[test]
    fn test_conv_frontend_shapes() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let mut config = EncoderConfig::base();
        config.conv_channels = asr_core::ConvSpec::parse("[4, 8]").unwrap();
        config.conv_kernel_sizes = asr_core::ConvSpec::parse("[(3, 3), (3, 3)]").unwrap();
        config.conv_strides = asr_core::ConvSpec::parse("[(2, 1), (1, 2)]").unwrap();

        let conv = ConvBNReLU::from_config(&config, 1, vb).unwrap().unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 10, 6), &device).unwrap();
        let (y, lengths) = conv.forward_t(&x, &[10, 7], false).unwrap();

        // time: 10 -> 5 -> 5; freq: 6 -> 6 -> 3
        assert_eq!(y.dims(), &[2, 5, 8 * 3]);
        assert_eq!(lengths, vec![5, 4]);
        assert_eq!(
            transformer_input_size(&config, 6, 1).unwrap(),
            y.dim(2).unwrap()
        );

        // padded frames of the second item are zero
        let tail = y.i((1, 4..5, ..)).unwrap().abs().unwrap().sum_all().unwrap();
        assert_eq!(tail.to_scalar::<f32>().unwrap(), 0.0);
    }
}
