//! Training batch as seen by the criterion.

use candle_core::{DType, Tensor};

use asr_core::{AsrError, AsrResult};

/// Model inputs of a batch.
#[derive(Debug, Clone)]
pub struct NetInput {
    /// `[batch, time, feat_dim]`
    pub features: Tensor,
    /// `[batch]` valid frames per item.
    pub lengths: Tensor,
}

/// One training batch.
#[derive(Debug, Clone)]
pub struct Sample {
    pub net_input: NetInput,
    /// `[batch, time]` u32 frame-level targets, padded with the pad index.
    pub target: Tensor,
    /// Number of non-padding target tokens.
    pub ntokens: usize,
    /// Reference transcript of every utterance.
    pub text: Vec<String>,
    /// Dataset index of every utterance; its length is the batch size.
    pub id: Vec<u64>,
}

impl Sample {
    /// Build a sample; `ntokens` counts the targets different from `pad`,
    /// ids are `0..batch`.
    pub fn new(net_input: NetInput, target: &Tensor, text: Vec<String>, pad: u32) -> AsrResult<Self> {
        let target = target.to_dtype(DType::U32)?;
        let (batch, _) = target.dims2()?;
        if text.len() != batch {
            return Err(AsrError::input(format!(
                "{} transcripts for a batch of {batch}",
                text.len()
            )));
        }
        let ntokens = target
            .ne(pad)?
            .to_dtype(DType::U32)?
            .sum_all()?
            .to_scalar::<u32>()? as usize;
        Ok(Self {
            net_input,
            target,
            ntokens,
            text,
            id: (0..batch as u64).collect(),
        })
    }

    /// Replace the default ids with dataset indices, one per utterance.
    pub fn with_ids(mut self, id: Vec<u64>) -> AsrResult<Self> {
        if id.len() != self.text.len() {
            return Err(AsrError::input(format!(
                "{} ids for a batch of {}",
                id.len(),
                self.text.len()
            )));
        }
        self.id = id;
        Ok(self)
    }

    /// Number of sentences in the batch.
    pub fn nsentences(&self) -> AsrResult<usize> {
        Ok(self.target.dim(0)?)
    }
}
