//! Encoder output record and beam-search reordering.

use candle_core::Tensor;

use asr_core::{AsrError, AsrResult};

/// Output of one encoder forward pass.
///
/// Every populated field shares the batch axis (and, where present, the
/// time axis) of `encoder_out`.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// `[time, batch, channels]`
    pub encoder_out: Tensor,
    /// `[batch, time]` u8, 1 = padding.
    pub padding_mask: Option<Tensor>,
    /// `[batch, time, channels]`
    pub embedding: Option<Tensor>,
    /// Intermediate hidden states, each `[time, batch, channels]`.
    /// Empty unless requested.
    pub states: Vec<Tensor>,
    /// `[batch, time]`
    pub src_tokens: Option<Tensor>,
    /// `[batch]` i64 valid lengths.
    pub src_lengths: Option<Tensor>,
}

impl EncoderOutput {
    /// Record holding only the primary activations.
    pub fn new(encoder_out: Tensor) -> Self {
        Self {
            encoder_out,
            padding_mask: None,
            embedding: None,
            states: Vec::new(),
            src_tokens: None,
            src_lengths: None,
        }
    }

    pub fn batch_size(&self) -> AsrResult<usize> {
        Ok(self.encoder_out.dim(1)?)
    }

    pub fn time_len(&self) -> AsrResult<usize> {
        Ok(self.encoder_out.dim(0)?)
    }

    /// Valid lengths as a plain vector (full length when absent).
    pub fn lengths(&self) -> AsrResult<Vec<usize>> {
        match &self.src_lengths {
            Some(l) => crate::conv::lengths_to_vec(l),
            None => Ok(vec![self.time_len()?; self.batch_size()?]),
        }
    }

    /// Check that all populated fields agree on their batch/time extents and
    /// that no valid length exceeds the time extent.
    pub fn validate(&self) -> AsrResult<()> {
        let (time, batch, _) = self.encoder_out.dims3()?;
        let check = |name: &str, got: usize, want: usize| {
            if got == want {
                Ok(())
            } else {
                Err(AsrError::input(format!("{name}: extent {got}, expected {want}")))
            }
        };

        if let Some(mask) = &self.padding_mask {
            let (b, t) = mask.dims2()?;
            check("padding_mask batch", b, batch)?;
            check("padding_mask time", t, time)?;
        }
        if let Some(emb) = &self.embedding {
            check("embedding batch", emb.dim(0)?, batch)?;
        }
        for (i, state) in self.states.iter().enumerate() {
            check(&format!("states[{i}] time"), state.dim(0)?, time)?;
            check(&format!("states[{i}] batch"), state.dim(1)?, batch)?;
        }
        if let Some(tokens) = &self.src_tokens {
            check("src_tokens batch", tokens.dim(0)?, batch)?;
        }
        if let Some(lengths) = &self.src_lengths {
            check("src_lengths batch", lengths.dim(0)?, batch)?;
            if let Some(&bad) = self.lengths()?.iter().find(|&&l| l > time) {
                return Err(AsrError::input(format!(
                    "valid length {bad} exceeds time extent {time}"
                )));
            }
        }
        Ok(())
    }

    /// Reorder the batch for beam search.
    ///
    /// Position `i` of the result holds hypothesis `new_order[i]` in every
    /// populated field. Indices may repeat and the result may be larger than
    /// the input batch; absent fields stay absent. An empty order yields an
    /// output with batch size 0.
    pub fn reorder(&self, new_order: &[usize]) -> AsrResult<EncoderOutput> {
        let batch = self.batch_size()?;
        if let Some(&bad) = new_order.iter().find(|&&i| i >= batch) {
            return Err(AsrError::input(format!(
                "reorder index {bad} out of range for batch of {batch}"
            )));
        }

        let idx: Vec<u32> = new_order.iter().map(|&i| i as u32).collect();
        let idx = Tensor::from_vec(idx, new_order.len(), self.encoder_out.device())?;
        let select = |t: &Tensor, dim: usize| -> AsrResult<Tensor> {
            if new_order.is_empty() {
                return Ok(t.narrow(dim, 0, 0)?);
            }
            let idx = idx.to_device(t.device())?;
            Ok(t.index_select(&idx, dim)?)
        };

        Ok(EncoderOutput {
            encoder_out: select(&self.encoder_out, 1)?,
            padding_mask: self.padding_mask.as_ref().map(|m| select(m, 0)).transpose()?,
            embedding: self.embedding.as_ref().map(|e| select(e, 0)).transpose()?,
            states: self
                .states
                .iter()
                .map(|s| select(s, 1))
                .collect::<AsrResult<Vec<_>>>()?,
            src_tokens: self.src_tokens.as_ref().map(|t| select(t, 0)).transpose()?,
            src_lengths: self.src_lengths.as_ref().map(|l| select(l, 0)).transpose()?,
        })
    }
}

/// `[batch, time]` u8 padding mask from valid lengths.
pub fn padding_mask(
    lengths: &[usize],
    time: usize,
    device: &candle_core::Device,
) -> AsrResult<Tensor> {
    let batch = lengths.len();
    let mut mask = vec![1u8; batch * time];
    for (b, &len) in lengths.iter().enumerate() {
        mask[b * time..b * time + len.min(time)].fill(0);
    }
    Ok(Tensor::from_vec(mask, (batch, time), device)?)
}

/// `[batch]` i64 lengths tensor.
pub fn lengths_tensor(lengths: &[usize], device: &candle_core::Device) -> AsrResult<Tensor> {
    let v: Vec<i64> = lengths.iter().map(|&l| l as i64).collect();
    Ok(Tensor::from_vec(v, lengths.len(), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, IndexOp};

    fn batch_of_three() -> EncoderOutput {
        let device = Device::Cpu;
        // encoder_out[t, b, c] = 100 * b + 10 * t + c
        let data: Vec<f32> = (0..2)
            .flat_map(|t| (0..3).flat_map(move |b| (0..2).map(move |c| (100 * b + 10 * t + c) as f32)))
            .collect();
        let encoder_out = Tensor::from_vec(data, (2, 3, 2), &device).unwrap();
        EncoderOutput {
            padding_mask: Some(padding_mask(&[2, 1, 2], 2, &device).unwrap()),
            src_lengths: Some(lengths_tensor(&[2, 1, 2], &device).unwrap()),
            ..EncoderOutput::new(encoder_out)
        }
    }

    #[test]
    fn test_padding_mask() {
        let mask = padding_mask(&[3, 1], 3, &Device::Cpu).unwrap();
        let rows: Vec<Vec<u8>> = mask.to_vec2().unwrap();
        assert_eq!(rows, vec![vec![0, 0, 0], vec![0, 1, 1]]);
    }

    #[test]
    fn test_reorder_duplicates_hypotheses() {
        let out = batch_of_three();
        out.validate().unwrap();
        let re = out.reorder(&[2, 0, 0, 1]).unwrap();

        assert_eq!(re.batch_size().unwrap(), 4);
        let col = |t: &Tensor, b: usize| -> Vec<Vec<f32>> { t.i((.., b, ..)).unwrap().to_vec2().unwrap() };
        assert_eq!(col(&re.encoder_out, 1), col(&re.encoder_out, 2));
        assert_eq!(col(&re.encoder_out, 1), col(&out.encoder_out, 0));
        assert_eq!(col(&re.encoder_out, 0), col(&out.encoder_out, 2));
        assert_eq!(col(&re.encoder_out, 3), col(&out.encoder_out, 1));

        let lengths: Vec<i64> = re.src_lengths.as_ref().unwrap().to_vec1().unwrap();
        assert_eq!(lengths, vec![2, 2, 2, 1]);
        let mask: Vec<Vec<u8>> = re.padding_mask.as_ref().unwrap().to_vec2().unwrap();
        assert_eq!(mask[3], vec![0, 1]);

        assert!(re.embedding.is_none());
        assert!(re.states.is_empty());
        assert!(re.src_tokens.is_none());
        re.validate().unwrap();
    }

    #[test]
    fn test_reorder_rejects_out_of_range() {
        let out = batch_of_three();
        assert!(matches!(out.reorder(&[0, 3]), Err(AsrError::InvalidInput(_))));
    }

    #[test]
    fn test_reorder_to_empty_batch() {
        let out = batch_of_three();
        let re = out.reorder(&[]).unwrap();
        assert_eq!(re.batch_size().unwrap(), 0);
        let (time, _, channels) = out.encoder_out.dims3().unwrap();
        assert_eq!(re.encoder_out.dims(), &[time, 0, channels]);
        assert_eq!(re.src_lengths.as_ref().unwrap().dims(), &[0]);
        assert_eq!(re.padding_mask.as_ref().unwrap().dims(), &[0, time]);
        assert!(re.src_tokens.is_none());
    }

    #[test]
    fn test_validate_catches_long_lengths() {
        let mut out = batch_of_three();
        out.src_lengths = Some(lengths_tensor(&[2, 3, 2], &Device::Cpu).unwrap());
        assert!(out.validate().is_err());
    }
}
