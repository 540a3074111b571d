//! Encoder-only speech model with a smoothed state prior.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{D, DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use tracing::{info, warn};

use asr_core::{AsrError, AsrResult, EncoderConfig, TaskConfig};

use crate::encoder::SpeechChunkTransformerEncoder;
use crate::encoder_out::EncoderOutput;

/// State-dict key of the prior.
pub const STATE_PRIOR_KEY: &str = "state_prior";

/// Entries are kept at or above this value before renormalization so
/// that log-prior subtraction stays finite.
pub const STATE_PRIOR_FLOOR: f64 = 1e-10;

/// Распределение априорных вероятностей состояний (классов выхода).
#[derive(Debug, Clone)]
pub struct StatePrior {
    probs: Tensor,
}

impl StatePrior {
    /// Create a prior from a non-negative vector; it is normalized to sum to 1.
    pub fn new(probs: &Tensor) -> AsrResult<Self> {
        let probs = probs.to_dtype(DType::F32)?;
        if probs.rank() != 1 || probs.dim(0)? == 0 {
            return Err(AsrError::input(format!(
                "state prior must be a non-empty vector, got shape {:?}",
                probs.dims()
            )));
        }
        let values: Vec<f32> = probs.to_vec1()?;
        if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(AsrError::input("state prior must be finite and non-negative"));
        }
        Ok(Self {
            probs: normalize(&probs)?,
        })
    }

    pub fn from_vec(values: Vec<f32>, device: &Device) -> AsrResult<Self> {
        let n = values.len();
        Self::new(&Tensor::from_vec(values, n, device)?)
    }

    /// Exponential smoothing towards `new_prior`, then renormalization:
    /// `p ← (1 − factor)·p + factor·new_prior`.
    pub fn update(&mut self, new_prior: &Tensor, factor: f64) -> AsrResult<()> {
        if !(0.0..=1.0).contains(&factor) {
            return Err(AsrError::input(format!(
                "smoothing factor must be in [0, 1], got {factor}"
            )));
        }
        let new_prior = new_prior
            .to_device(self.probs.device())?
            .to_dtype(DType::F32)?;
        if new_prior.dims() != self.probs.dims() {
            return Err(AsrError::input(format!(
                "new prior has shape {:?}, expected {:?}",
                new_prior.dims(),
                self.probs.dims()
            )));
        }
        let mixed = ((&self.probs * (1.0 - factor))? + (new_prior * factor)?)?;
        self.probs = normalize(&mixed)?;
        Ok(())
    }

    pub fn as_tensor(&self) -> &Tensor {
        &self.probs
    }

    pub fn to_vec(&self) -> AsrResult<Vec<f32>> {
        Ok(self.probs.to_vec1()?)
    }

    pub fn len(&self) -> usize {
        self.probs.dim(0).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn normalize(p: &Tensor) -> AsrResult<Tensor> {
    let floor = Tensor::new(STATE_PRIOR_FLOOR as f32, p.device())?;
    let p = p.broadcast_maximum(&floor)?;
    Ok(p.broadcast_div(&p.sum_keepdim(0)?)?)
}

/// Encoder-only speech model.
///
/// Owns the encoder parameters (in a [`VarMap`]), the optional state prior
/// and the training bookkeeping the criterion reads.
pub struct SpeechEncoderModel {
    encoder: SpeechChunkTransformerEncoder,
    varmap: VarMap,
    device: Device,
    state_prior: Option<StatePrior>,
    num_updates: u64,
    epoch: u64,
}

impl SpeechEncoderModel {
    /// Build a freshly initialized model.
    pub fn new(config: &EncoderConfig, task: &TaskConfig, device: &Device) -> AsrResult<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let encoder = SpeechChunkTransformerEncoder::new(config, task, vb)?;
        info!(
            "speech encoder model: {} parameter tensors, output dim {}",
            varmap.all_vars().len(),
            encoder.output_dim()
        );
        Ok(Self {
            encoder,
            varmap,
            device: device.clone(),
            state_prior: None,
            num_updates: 0,
            epoch: 1,
        })
    }

    /// Build a model and load its state dict from a safetensors file.
    pub fn from_safetensors(
        config: &EncoderConfig,
        task: &TaskConfig,
        path: impl AsRef<Path>,
        device: &Device,
    ) -> AsrResult<Self> {
        let mut model = Self::new(config, task, device)?;
        model.load(path, true)?;
        Ok(model)
    }

    pub fn with_state_prior(mut self, prior: StatePrior) -> Self {
        self.state_prior = Some(prior);
        self
    }

    pub fn encoder(&self) -> &SpeechChunkTransformerEncoder {
        &self.encoder
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn forward(
        &self,
        features: &Tensor,
        lengths: &Tensor,
        return_all_hiddens: bool,
    ) -> AsrResult<EncoderOutput> {
        self.encoder.forward(features, lengths, return_all_hiddens)
    }

    /// Reorder an encoder output for beam search.
    pub fn reorder_encoder_out(
        &self,
        encoder_out: &EncoderOutput,
        new_order: &[usize],
    ) -> AsrResult<EncoderOutput> {
        encoder_out.reorder(new_order)
    }

    /// (Log-)softmax over the class axis, `[batch, time, classes]`.
    pub fn get_normalized_probs(&self, net_output: &EncoderOutput, log_probs: bool) -> AsrResult<Tensor> {
        let logits = net_output
            .encoder_out
            .to_dtype(DType::F32)?
            .transpose(0, 1)?
            .contiguous()?;
        let probs = if log_probs {
            candle_nn::ops::log_softmax(&logits, D::Minus1)?
        } else {
            candle_nn::ops::softmax_last_dim(&logits)?
        };
        Ok(probs)
    }

    pub fn output_lengths(&self, in_lengths: usize) -> usize {
        self.encoder.output_lengths(in_lengths)
    }

    pub fn set_num_updates(&mut self, num_updates: u64) {
        self.num_updates = num_updates;
    }

    pub fn num_updates(&self) -> u64 {
        self.num_updates
    }

    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Switch to training mode (dropout, layer drop, batch statistics).
    pub fn train(&mut self) {
        self.encoder.set_training(true);
    }

    pub fn eval(&mut self) {
        self.encoder.set_training(false);
    }

    pub fn is_training(&self) -> bool {
        self.encoder.is_training()
    }

    pub fn state_prior(&self) -> Option<&StatePrior> {
        self.state_prior.as_ref()
    }

    /// Smooth the state prior towards `new_prior`.
    pub fn update_state_prior(&mut self, new_prior: &Tensor, factor: f64) -> AsrResult<()> {
        let prior = self
            .state_prior
            .as_mut()
            .ok_or_else(|| AsrError::input("model has no state prior to update"))?;
        prior.update(new_prior, factor)
    }

    /// All parameters plus `state_prior` when present.
    pub fn state_dict(&self) -> AsrResult<HashMap<String, Tensor>> {
        let mut dict: HashMap<String, Tensor> = self
            .parameters()?
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        if let Some(prior) = &self.state_prior {
            dict.insert(STATE_PRIOR_KEY.to_string(), prior.as_tensor().clone());
        }
        Ok(dict)
    }

    fn parameters(&self) -> AsrResult<std::sync::MutexGuard<'_, HashMap<String, candle_core::Var>>> {
        self.varmap
            .data()
            .lock()
            .map_err(|_| AsrError::input("parameter store is poisoned"))
    }

    /// Load a state dict.
    ///
    /// `state_prior` is taken out first (absent means no prior). With
    /// `strict`, missing and unexpected parameter names are errors;
    /// otherwise they are skipped with a warning. Every entry is checked
    /// before anything is assigned, so a failed load leaves the model as it was.
    pub fn load_state_dict(
        &mut self,
        mut state_dict: HashMap<String, Tensor>,
        strict: bool,
    ) -> AsrResult<()> {
        let state_prior = match state_dict.remove(STATE_PRIOR_KEY) {
            Some(p) => Some(StatePrior::new(&p.to_device(&self.device)?)?),
            None => None,
        };

        let updates = {
            let vars = self.parameters()?;
            let mut expected: Vec<&String> = vars.keys().collect();
            expected.sort();

            let missing: Vec<&String> = expected
                .iter()
                .copied()
                .filter(|n| !state_dict.contains_key(*n))
                .collect();
            let mut unexpected: Vec<&String> =
                state_dict.keys().filter(|n| !vars.contains_key(*n)).collect();
            unexpected.sort();
            if strict && (!missing.is_empty() || !unexpected.is_empty()) {
                return Err(AsrError::MalformedInput(format!(
                    "state dict mismatch: missing {missing:?}, unexpected {unexpected:?}"
                )));
            }
            if !missing.is_empty() || !unexpected.is_empty() {
                warn!("state dict: missing {missing:?}, unexpected {unexpected:?}");
            }

            let mut updates = Vec::with_capacity(expected.len());
            for name in expected {
                let Some(value) = state_dict.get(name) else {
                    continue;
                };
                let current = vars[name].as_tensor();
                if value.dims() != current.dims() {
                    return Err(AsrError::MalformedInput(format!(
                        "parameter {name}: expected shape {:?}, got {:?}",
                        current.dims(),
                        value.dims()
                    )));
                }
                let value = value.to_device(&self.device)?.to_dtype(current.dtype())?;
                updates.push((name.clone(), value));
            }
            updates
        };

        for (name, value) in updates {
            self.varmap.set_one(&name, value)?;
        }
        self.state_prior = state_prior;
        Ok(())
    }

    /// Save the state dict as safetensors.
    pub fn save(&self, path: impl AsRef<Path>) -> AsrResult<()> {
        candle_core::safetensors::save(&self.state_dict()?, path.as_ref())?;
        info!("saved model state to {:?}", path.as_ref());
        Ok(())
    }

    /// Load a state dict from safetensors.
    pub fn load(&mut self, path: impl AsRef<Path>, strict: bool) -> AsrResult<()> {
        let dict = candle_core::safetensors::load(path.as_ref(), &self.device)?;
        self.load_state_dict(dict, strict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_prior_update_sums_to_one() {
        let device = Device::Cpu;
        let mut prior = StatePrior::from_vec(vec![1.0, 1.0, 2.0], &device).unwrap();
        assert_eq!(prior.to_vec().unwrap(), vec![0.25, 0.25, 0.5]);

        let new = Tensor::new(&[0.0f32, 0.0, 1.0], &device).unwrap();
        prior.update(&new, 0.1).unwrap();
        let p = prior.to_vec().unwrap();
        let sum: f32 = p.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!((p[2] - 0.55).abs() < 1e-6);
        assert!((p[0] - 0.225).abs() < 1e-6);
    }

    #[test]
    fn test_state_prior_floor() {
        let device = Device::Cpu;
        let mut prior = StatePrior::from_vec(vec![0.0, 1.0], &device).unwrap();
        prior.update(&Tensor::new(&[0.0f32, 1.0], &device).unwrap(), 1.0).unwrap();
        let p = prior.to_vec().unwrap();
        assert!(p[0] > 0.0);
        assert!(((p[0] + p[1]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_state_prior_rejects_bad_input() {
        let device = Device::Cpu;
        assert!(StatePrior::from_vec(vec![], &device).is_err());
        assert!(StatePrior::from_vec(vec![-1.0, 2.0], &device).is_err());
        let mut prior = StatePrior::from_vec(vec![1.0, 1.0], &device).unwrap();
        assert!(prior.update(&Tensor::new(&[1.0f32, 0.0, 0.0], &device).unwrap(), 0.1).is_err());
        assert!(prior.update(&Tensor::new(&[1.0f32, 0.0], &device).unwrap(), 1.5).is_err());
    }
}
