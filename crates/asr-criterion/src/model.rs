//! Интерфейс модели, который нужен критерию.

use candle_core::Tensor;

use asr_core::AsrResult;
use chunk_encoder::{EncoderOutput, SpeechEncoderModel};

use crate::sample::{NetInput, Sample};

/// Модель, которую может обучать [`crate::CrossEntropyCriterion`].
pub trait CriterionModel {
    /// Прямой проход по входам батча.
    fn forward(&self, net_input: &NetInput) -> AsrResult<EncoderOutput>;

    /// (Log-)вероятности классов, `[batch, time, classes]`.
    fn get_normalized_probs(&self, net_output: &EncoderOutput, log_probs: bool) -> AsrResult<Tensor>;

    /// Цели для `net_output`; по умолчанию `sample.target`.
    fn get_targets<'a>(&self, sample: &'a Sample, _net_output: &EncoderOutput) -> &'a Tensor {
        &sample.target
    }

    /// Счётчик обновлений; `None`, если модель его не ведёт.
    fn num_updates(&self) -> Option<u64>;

    fn is_training(&self) -> bool;

    fn set_epoch(&mut self, epoch: u64);
}

impl CriterionModel for SpeechEncoderModel {
    fn forward(&self, net_input: &NetInput) -> AsrResult<EncoderOutput> {
        SpeechEncoderModel::forward(self, &net_input.features, &net_input.lengths, false)
    }

    fn get_normalized_probs(&self, net_output: &EncoderOutput, log_probs: bool) -> AsrResult<Tensor> {
        SpeechEncoderModel::get_normalized_probs(self, net_output, log_probs)
    }

    fn num_updates(&self) -> Option<u64> {
        Some(SpeechEncoderModel::num_updates(self))
    }

    fn is_training(&self) -> bool {
        SpeechEncoderModel::is_training(self)
    }

    fn set_epoch(&mut self, epoch: u64) {
        SpeechEncoderModel::set_epoch(self, epoch);
    }
}
