//! Frame-level cross-entropy criterion with sampled training logs.

use candle_core::{D, DType, IndexOp, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};

use asr_core::{AsrError, AsrResult, TokenDictionary};
use chunk_encoder::EncoderOutput;

use crate::config::CriterionConfig;
use crate::model::CriterionModel;
use crate::sample::Sample;

/// Reference/prediction pair printed during training.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrainingSample {
    /// Update count the sample was drawn at (also the seed of the draw).
    pub num_updates: u64,
    /// Batch index of the drawn utterance.
    pub index: usize,
    /// Its id in [`Sample::id`].
    pub id: u64,
    pub reference: String,
    pub prediction: String,
}

/// Per-batch statistics returned next to the loss.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoggingOutput {
    /// Sum of the (unreduced) loss.
    pub loss: f64,
    pub ntokens: usize,
    pub nsentences: usize,
    pub sample_size: usize,
    pub training_sample: Option<TrainingSample>,
}

/// Cross-entropy over non-padding frame targets.
///
/// Every `print_training_sample_interval` updates one utterance of the
/// current batch is drawn (seeded by the update count) and its reference
/// and greedy prediction are logged.
#[derive(Debug, Clone)]
pub struct CrossEntropyCriterion {
    dictionary: TokenDictionary,
    padding_idx: u32,
    sentence_avg: bool,
    print_interval: u64,
    epoch: u64,
    prev_logged_update: Option<u64>,
}

impl CrossEntropyCriterion {
    pub fn new(config: &CriterionConfig, dictionary: TokenDictionary) -> AsrResult<Self> {
        config.validate()?;
        Ok(Self {
            padding_idx: dictionary.pad(),
            dictionary,
            sentence_avg: config.sentence_avg,
            print_interval: config.print_training_sample_interval,
            epoch: 1,
            prev_logged_update: None,
        })
    }

    pub fn dictionary(&self) -> &TokenDictionary {
        &self.dictionary
    }

    pub fn padding_idx(&self) -> u32 {
        self.padding_idx
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    /// Update count of the last printed sample, `None` before the first one.
    pub fn prev_logged_update(&self) -> Option<u64> {
        self.prev_logged_update
    }

    /// Compute the loss of `sample`.
    ///
    /// Returns `(loss, sample_size, logging_output)`. With `reduce` the loss
    /// is a scalar sum, otherwise one value per target frame
    /// (`[batch * time]`, zero at padding).
    pub fn compute<M: CriterionModel>(
        &mut self,
        model: &mut M,
        sample: &Sample,
        reduce: bool,
    ) -> AsrResult<(Tensor, usize, LoggingOutput)> {
        model.set_epoch(self.epoch);
        let net_output = model.forward(&sample.net_input)?;
        let (loss, lprobs) = self.compute_loss(model, &net_output, sample, reduce)?;

        let nsentences = sample.nsentences()?;
        let sample_size = if self.sentence_avg {
            nsentences
        } else {
            sample.ntokens
        };
        let mut logging_output = LoggingOutput {
            loss: loss.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?,
            ntokens: sample.ntokens,
            nsentences,
            sample_size,
            training_sample: None,
        };

        if let Some(n) = model.num_updates() {
            if model.is_training() && self.should_log(n) {
                self.prev_logged_update = Some(n);
                let target = model.get_targets(sample, &net_output);
                let drawn = self.draw_training_sample(n, &lprobs, target, sample)?;
                info!("sample REF: {}", drawn.reference);
                info!("sample PRD: {}", drawn.prediction);
                logging_output.training_sample = Some(drawn);
            }
        }

        Ok((loss, sample_size, logging_output))
    }

    /// NLL of the targets under the model's log-probabilities, ignoring
    /// padding. Returns the loss and the `[batch, time, classes]` log-probs.
    pub fn compute_loss<M: CriterionModel>(
        &self,
        model: &M,
        net_output: &EncoderOutput,
        sample: &Sample,
        reduce: bool,
    ) -> AsrResult<(Tensor, Tensor)> {
        let lprobs = model.get_normalized_probs(net_output, true)?;
        let target = model.get_targets(sample, net_output).to_dtype(DType::U32)?;
        let (batch, time, classes) = lprobs.dims3()?;
        if target.dims() != [batch, time] {
            return Err(AsrError::input(format!(
                "targets have shape {:?}, model output is {batch}x{time}",
                target.dims()
            )));
        }

        let n = batch * time;
        let flat_target = target.reshape(n)?;
        if n > 0 {
            let max_id = flat_target.max(0)?.to_scalar::<u32>()? as usize;
            if max_id >= classes {
                return Err(AsrError::input(format!(
                    "target id {max_id} out of range for {classes} classes"
                )));
            }
        }

        let picked = lprobs
            .reshape((n, classes))?
            .gather(&flat_target.unsqueeze(1)?, 1)?
            .squeeze(1)?;
        let keep = flat_target.ne(self.padding_idx)?.to_dtype(DType::F32)?;
        let nll = (picked.neg()? * keep)?;
        let loss = if reduce { nll.sum_all()? } else { nll };
        Ok((loss, lprobs))
    }

    /// A bucket boundary of the print interval was crossed at `n` and `n`
    /// has not been logged yet. Floor division, so `n = 0` also qualifies.
    fn should_log(&self, n: u64) -> bool {
        let interval = self.print_interval as i64;
        let current = n as i64;
        current.div_euclid(interval) > (current - 1).div_euclid(interval)
            && self.prev_logged_update != Some(n)
    }

    fn draw_training_sample(
        &self,
        n: u64,
        lprobs: &Tensor,
        target: &Tensor,
        sample: &Sample,
    ) -> AsrResult<TrainingSample> {
        let pred = lprobs.argmax(D::Minus1)?;
        if pred.dims() != target.dims() {
            return Err(AsrError::input(format!(
                "prediction shape {:?} differs from target shape {:?}",
                pred.dims(),
                target.dims()
            )));
        }
        let batch = sample.id.len();
        if batch != pred.dim(0)? {
            return Err(AsrError::input(format!(
                "{batch} sample ids for a batch of {}",
                pred.dim(0)?
            )));
        }
        if batch == 0 {
            return Err(AsrError::input("cannot draw a training sample from an empty batch"));
        }

        let mut rng = StdRng::seed_from_u64(n);
        let index = rng.gen_range(0..batch);

        let target_row: Vec<u32> = target.i(index)?.to_dtype(DType::U32)?.to_vec1()?;
        let length = target_row.iter().filter(|&&t| t != self.padding_idx).count();
        let pred_row: Vec<u32> = pred.i(index)?.to_vec1()?;
        let prediction = self
            .dictionary
            .wordpiece_decode(&self.dictionary.string(&pred_row[..length], false));

        let reference = sample.text.get(index).cloned().ok_or_else(|| {
            AsrError::input(format!("no reference text for batch index {index}"))
        })?;
        let id = sample.id[index];
        debug!("training sample drawn at update {n}: index {index} (id {id}), {length} frames");

        Ok(TrainingSample {
            num_updates: n,
            index,
            id,
            reference,
            prediction,
        })
    }
}
