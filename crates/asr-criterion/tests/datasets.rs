//! Datasets in memory and batches built from them.

use asr_core::{AsrError, ConvSpec, EncoderConfig, TaskConfig, TokenDictionary};
use asr_criterion::{
    AsrDataset, AsrTextDataset, CriterionConfig, CrossEntropyCriterion, FeatInMemoryDataset,
};
use candle_core::{DType, Device, IndexOp, Tensor};
use chunk_encoder::SpeechEncoderModel;

fn dictionary() -> TokenDictionary {
    TokenDictionary::from_text("\u{2581}a 5\n\u{2581}b 3\nc 2\n").unwrap()
}

fn utt_ids() -> Vec<String> {
    vec!["u1".into(), "u2".into(), "u3".into()]
}

/// Frame `t` of utterance `u` is filled with `10 * u + t + 1`.
fn feats(device: &Device) -> FeatInMemoryDataset {
    let feats = [3usize, 5, 2]
        .iter()
        .enumerate()
        .map(|(u, &frames)| {
            let data: Vec<f32> = (0..frames)
                .flat_map(|t| std::iter::repeat_n((10 * u + t + 1) as f32, 4))
                .collect();
            Tensor::from_vec(data, (frames, 4), device).unwrap()
        })
        .collect();
    FeatInMemoryDataset::new(utt_ids(), feats).unwrap()
}

fn texts() -> Vec<String> {
    vec!["a b c".into(), "b a".into(), "a".into()]
}

fn dataset(device: &Device) -> AsrDataset {
    let dict = dictionary();
    let text = AsrTextDataset::new(utt_ids(), texts(), Some(&dict), true).unwrap();
    let targets = vec![vec![3, 4, 5], vec![5, 3, 4, 3, 4], vec![4, 4]];
    AsrDataset::new(feats(device), targets, text, dict.pad()).unwrap()
}

#[test]
fn test_text_dataset_encodes_word_pieces() {
    let dict = dictionary();
    let data = AsrTextDataset::new(utt_ids(), texts(), Some(&dict), true).unwrap();
    let item = data.get(1).unwrap();
    assert_eq!(item.text, "b a");
    assert_eq!(item.tokens, Some("\u{2581}b \u{2581}a"));
    assert_eq!(item.ids, Some(&[4u32, 3, dict.eos()][..]));

    // "c" only exists inside words, so the bare marker becomes <unk>
    let first = data.get(0).unwrap();
    assert_eq!(first.ids, Some(&[3u32, 4, dict.unk(), 5, dict.eos()][..]));
    assert_eq!(data.sizes(), &[5, 3, 2]);

    let no_eos = AsrTextDataset::new(utt_ids(), texts(), Some(&dict), false).unwrap();
    assert_eq!(no_eos.sizes(), &[4, 2, 1]);
    assert!(AsrTextDataset::new(utt_ids(), vec!["a".into()], Some(&dict), true).is_err());
}

#[test]
fn test_feature_dataset_filter_and_epoch() {
    let device = Device::Cpu;
    let mut data = feats(&device);
    assert_eq!(data.feat_dim(), 4);
    assert_eq!(data.sizes(), &[3, 5, 2]);
    assert_eq!(data.epoch(), 1);
    data.set_epoch(4);
    assert_eq!(data.epoch(), 4);

    assert!(matches!(data.filter_and_reorder(&[0, 0]), Err(AsrError::InvalidInput(_))));
    assert!(matches!(data.filter_and_reorder(&[5]), Err(AsrError::InvalidInput(_))));
    assert_eq!(data.len(), 3);

    data.filter_and_reorder(&[2, 0]).unwrap();
    assert_eq!(data.utt_ids(), &["u3".to_string(), "u1".to_string()]);
    assert_eq!(data.sizes(), &[2, 3]);
    let first: Vec<Vec<f32>> = data.get(0).unwrap().to_vec2().unwrap();
    assert_eq!(first[0], vec![21.0; 4]);
    assert!(data.get(2).is_err());
}

#[test]
fn test_mixed_feature_dimensions_are_rejected() {
    let device = Device::Cpu;
    let feats = vec![
        Tensor::zeros((3, 4), DType::F32, &device).unwrap(),
        Tensor::zeros((3, 5), DType::F32, &device).unwrap(),
    ];
    assert!(matches!(
        FeatInMemoryDataset::new(vec!["a".into(), "b".into()], feats),
        Err(AsrError::MalformedInput(_))
    ));
    let flat = vec![Tensor::zeros(3, DType::F32, &device).unwrap()];
    assert!(FeatInMemoryDataset::new(vec!["a".into()], flat).is_err());
}

#[test]
fn test_collate_pads_features_and_targets() {
    let device = Device::Cpu;
    let data = dataset(&device);
    let sample = data.collate(&[0, 2], &device).unwrap();

    assert_eq!(sample.net_input.features.dims(), &[2, 3, 4]);
    let lengths: Vec<i64> = sample.net_input.lengths.to_vec1().unwrap();
    assert_eq!(lengths, vec![3, 2]);
    let padded: Vec<Vec<f32>> = sample.net_input.features.i(1).unwrap().to_vec2().unwrap();
    assert_eq!(padded[1], vec![22.0; 4]);
    assert_eq!(padded[2], vec![0.0; 4]);

    let target: Vec<Vec<u32>> = sample.target.to_vec2().unwrap();
    assert_eq!(target, vec![vec![3, 4, 5], vec![4, 4, 0]]);
    assert_eq!(sample.ntokens, 5);
    assert_eq!(sample.id, vec![0, 2]);
    assert_eq!(sample.text, vec!["a b c".to_string(), "a".to_string()]);

    assert!(data.collate(&[], &device).is_err());
    assert!(data.collate(&[3], &device).is_err());
}

#[test]
fn test_filtered_dataset_feeds_the_criterion() {
    let device = Device::Cpu;
    let mut data = dataset(&device);
    data.filter_and_reorder(&[2, 0]).unwrap();
    data.set_epoch(2);
    assert_eq!(data.feats().epoch(), 2);
    assert_eq!(data.text().utt_ids(), &["u3".to_string(), "u1".to_string()]);
    assert!(data.filter_and_reorder(&[1, 1]).is_err());
    assert_eq!(data.len(), 2);

    let sample = data.collate(&[1, 0], &device).unwrap();
    assert_eq!(sample.text, vec!["a b c".to_string(), "a".to_string()]);
    assert_eq!(sample.id, vec![1, 0]);

    let dict = dictionary();
    let config = EncoderConfig {
        conv_channels: ConvSpec::Absent,
        conv_kernel_sizes: ConvSpec::Absent,
        conv_strides: ConvSpec::Absent,
        encoder_embed_dim: 8,
        encoder_ffn_embed_dim: 16,
        encoder_layers: 1,
        encoder_attention_heads: 2,
        dropout: 0.0,
        attention_dropout: 0.0,
        activation_dropout: 0.0,
        max_source_positions: 32,
        ..EncoderConfig::base()
    };
    let task = TaskConfig {
        feat_dim: 4,
        feat_in_channels: 1,
        num_targets: Some(dict.len()),
        chunk_width: None,
        chunk_left_context: 0,
        training_stage: true,
    };
    let mut model = SpeechEncoderModel::new(&config, &task, &device).unwrap();
    model.train();
    model.set_num_updates(500);

    let mut criterion = CrossEntropyCriterion::new(&CriterionConfig::default(), dict).unwrap();
    let (_, sample_size, logging) = criterion.compute(&mut model, &sample, true).unwrap();
    assert_eq!(sample_size, 5);
    let drawn = logging.training_sample.unwrap();
    assert_eq!(drawn.id, sample.id[drawn.index]);
    assert_eq!(drawn.reference, sample.text[drawn.index]);
}
