//! In-memory datasets and batching into [`Sample`]s.
//!
//! - [`FeatInMemoryDataset`]: матрицы признаков `[frames, feat_dim]`
//! - [`AsrTextDataset`]: транскрипты, их word pieces и id токенов
//! - [`AsrDataset`]: признаки + покадровые цели + текст, сборка батча

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use asr_core::{AsrError, AsrResult, TokenDictionary};

use crate::sample::{NetInput, Sample};

/// Check that `indices` is a valid selection of distinct positions in `0..len`.
fn check_selection(indices: &[usize], len: usize) -> AsrResult<()> {
    if let Some(&bad) = indices.iter().find(|&&i| i >= len) {
        return Err(AsrError::input(format!(
            "index {bad} out of range for a dataset of {len}"
        )));
    }
    let mut seen = vec![false; len];
    for &i in indices {
        if std::mem::replace(&mut seen[i], true) {
            return Err(AsrError::input(format!("duplicate index {i} in selection")));
        }
    }
    Ok(())
}

fn check_index(i: usize, len: usize) -> AsrResult<()> {
    if i >= len {
        return Err(AsrError::input(format!(
            "index {i} out of range for a dataset of {len}"
        )));
    }
    Ok(())
}

fn select<T: Clone>(items: &[T], indices: &[usize]) -> Vec<T> {
    indices.iter().map(|&i| items[i].clone()).collect()
}

/// Feature matrices held in memory, one per utterance.
#[derive(Debug, Clone)]
pub struct FeatInMemoryDataset {
    utt_ids: Vec<String>,
    feats: Vec<Tensor>,
    sizes: Vec<usize>,
    feat_dim: usize,
    epoch: u64,
}

impl FeatInMemoryDataset {
    /// Every matrix must be `[frames, feat_dim]` with the same `feat_dim`.
    pub fn new(utt_ids: Vec<String>, feats: Vec<Tensor>) -> AsrResult<Self> {
        if utt_ids.len() != feats.len() {
            return Err(AsrError::input(format!(
                "{} utterance ids for {} feature matrices",
                utt_ids.len(),
                feats.len()
            )));
        }
        let mut sizes = Vec::with_capacity(feats.len());
        let mut feat_dim = None;
        for (utt, feat) in utt_ids.iter().zip(&feats) {
            let (frames, dim) = feat.dims2().map_err(|_| {
                AsrError::input(format!(
                    "features of {utt} must be [frames, feat_dim], got {:?}",
                    feat.dims()
                ))
            })?;
            if *feat_dim.get_or_insert(dim) != dim {
                return Err(AsrError::MalformedInput(format!(
                    "features of {utt} have dimension {dim}, expected {}",
                    feat_dim.unwrap_or(dim)
                )));
            }
            sizes.push(frames);
        }
        Ok(Self {
            utt_ids,
            feats,
            sizes,
            feat_dim: feat_dim.unwrap_or(0),
            epoch: 1,
        })
    }

    pub fn len(&self) -> usize {
        self.utt_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utt_ids.is_empty()
    }

    pub fn utt_ids(&self) -> &[String] {
        &self.utt_ids
    }

    /// Frames per utterance.
    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn feat_dim(&self) -> usize {
        self.feat_dim
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    pub fn get(&self, i: usize) -> AsrResult<&Tensor> {
        check_index(i, self.len())?;
        Ok(&self.feats[i])
    }

    /// Keep only `indices`, in that order. Indices must be distinct and in range;
    /// on error the dataset is unchanged.
    pub fn filter_and_reorder(&mut self, indices: &[usize]) -> AsrResult<()> {
        check_selection(indices, self.len())?;
        self.utt_ids = select(&self.utt_ids, indices);
        self.feats = select(&self.feats, indices);
        self.sizes = select(&self.sizes, indices);
        Ok(())
    }
}

/// One entry of [`AsrTextDataset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextItem<'a> {
    /// Token ids (only with a dictionary).
    pub ids: Option<&'a [u32]>,
    /// Word pieces separated by spaces (only with a dictionary).
    pub tokens: Option<&'a str>,
    pub text: &'a str,
}

/// Transcripts tokenized once at construction.
#[derive(Debug, Clone)]
pub struct AsrTextDataset {
    utt_ids: Vec<String>,
    texts: Vec<String>,
    token_texts: Option<Vec<String>>,
    ids: Option<Vec<Vec<u32>>>,
    sizes: Vec<usize>,
    append_eos: bool,
}

impl AsrTextDataset {
    /// With a dictionary every text goes through
    /// [`TokenDictionary::wordpiece_encode`] and is mapped to ids, `</s>`
    /// appended when `append_eos`; sizes count ids. Without one, sizes count
    /// whitespace-separated words.
    pub fn new(
        utt_ids: Vec<String>,
        texts: Vec<String>,
        dictionary: Option<&TokenDictionary>,
        append_eos: bool,
    ) -> AsrResult<Self> {
        if utt_ids.len() != texts.len() {
            return Err(AsrError::input(format!(
                "{} utterance ids for {} transcripts",
                utt_ids.len(),
                texts.len()
            )));
        }
        let (token_texts, ids, sizes) = match dictionary {
            Some(dict) => {
                let token_texts: Vec<String> =
                    texts.iter().map(|t| dict.wordpiece_encode(t)).collect();
                let ids: Vec<Vec<u32>> = token_texts
                    .iter()
                    .map(|t| dict.lookup_line(t, append_eos, false))
                    .collect();
                let sizes = ids.iter().map(Vec::len).collect();
                (Some(token_texts), Some(ids), sizes)
            }
            None => {
                let sizes = texts.iter().map(|t| t.split_whitespace().count()).collect();
                (None, None, sizes)
            }
        };
        debug!("text dataset: {} utterances", utt_ids.len());
        Ok(Self {
            utt_ids,
            texts,
            token_texts,
            ids,
            sizes,
            append_eos,
        })
    }

    pub fn len(&self) -> usize {
        self.utt_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utt_ids.is_empty()
    }

    pub fn utt_ids(&self) -> &[String] {
        &self.utt_ids
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn append_eos(&self) -> bool {
        self.append_eos
    }

    pub fn get(&self, i: usize) -> AsrResult<TextItem<'_>> {
        check_index(i, self.len())?;
        Ok(TextItem {
            ids: self.ids.as_ref().map(|ids| ids[i].as_slice()),
            tokens: self.token_texts.as_ref().map(|t| t[i].as_str()),
            text: &self.texts[i],
        })
    }

    pub fn filter_and_reorder(&mut self, indices: &[usize]) -> AsrResult<()> {
        check_selection(indices, self.len())?;
        self.utt_ids = select(&self.utt_ids, indices);
        self.texts = select(&self.texts, indices);
        self.token_texts = self.token_texts.as_ref().map(|t| select(t, indices));
        self.ids = self.ids.as_ref().map(|ids| select(ids, indices));
        self.sizes = select(&self.sizes, indices);
        Ok(())
    }
}

/// Features, frame-level targets and transcripts of the same utterances.
#[derive(Debug, Clone)]
pub struct AsrDataset {
    feats: FeatInMemoryDataset,
    targets: Vec<Vec<u32>>,
    text: AsrTextDataset,
    pad: u32,
}

impl AsrDataset {
    /// The three sources must list the same utterances in the same order.
    pub fn new(
        feats: FeatInMemoryDataset,
        targets: Vec<Vec<u32>>,
        text: AsrTextDataset,
        pad: u32,
    ) -> AsrResult<Self> {
        if targets.len() != feats.len() {
            return Err(AsrError::input(format!(
                "{} target sequences for {} utterances",
                targets.len(),
                feats.len()
            )));
        }
        if feats.utt_ids() != text.utt_ids() {
            return Err(AsrError::MalformedInput(
                "features and transcripts list different utterances".into(),
            ));
        }
        Ok(Self {
            feats,
            targets,
            text,
            pad,
        })
    }

    pub fn len(&self) -> usize {
        self.feats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feats.is_empty()
    }

    pub fn feats(&self) -> &FeatInMemoryDataset {
        &self.feats
    }

    pub fn text(&self) -> &AsrTextDataset {
        &self.text
    }

    pub fn set_epoch(&mut self, epoch: u64) {
        self.feats.set_epoch(epoch);
    }

    /// Applies the same selection to every source.
    pub fn filter_and_reorder(&mut self, indices: &[usize]) -> AsrResult<()> {
        check_selection(indices, self.len())?;
        self.feats.filter_and_reorder(indices)?;
        self.text.filter_and_reorder(indices)?;
        self.targets = select(&self.targets, indices);
        Ok(())
    }

    /// Собрать батч: признаки дополняются нулями до самой длинной
    /// последовательности, цели значением `pad`, `id` равны индексам.
    pub fn collate(&self, indices: &[usize], device: &Device) -> AsrResult<Sample> {
        if indices.is_empty() {
            return Err(AsrError::input("cannot collate an empty batch"));
        }
        for &i in indices {
            check_index(i, self.len())?;
        }

        let sizes = self.feats.sizes();
        let max_frames = indices.iter().map(|&i| sizes[i]).max().unwrap_or(0);
        let mut padded = Vec::with_capacity(indices.len());
        for &i in indices {
            let feat = self.feats.get(i)?.to_dtype(DType::F32)?.to_device(device)?;
            padded.push(feat.pad_with_zeros(0, 0, max_frames - sizes[i])?);
        }
        let features = Tensor::stack(&padded, 0)?;
        let lengths: Vec<usize> = indices.iter().map(|&i| sizes[i]).collect();

        let max_len = indices.iter().map(|&i| self.targets[i].len()).max().unwrap_or(0);
        let mut flat = Vec::with_capacity(indices.len() * max_len);
        for &i in indices {
            let row = &self.targets[i];
            flat.extend_from_slice(row);
            flat.extend(std::iter::repeat_n(self.pad, max_len - row.len()));
        }
        let target = Tensor::from_vec(flat, (indices.len(), max_len), device)?;

        let text = indices
            .iter()
            .map(|&i| self.text.get(i).map(|item| item.text.to_string()))
            .collect::<AsrResult<Vec<_>>>()?;

        let net_input = NetInput {
            features,
            lengths: chunk_encoder::lengths_tensor(&lengths, device)?,
        };
        Sample::new(net_input, &target, text, self.pad)?
            .with_ids(indices.iter().map(|&i| i as u64).collect())
    }
}
