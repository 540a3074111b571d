//! End-to-end tests of the chunk encoder and the encoder-only model on
//! small randomly initialized networks.

use asr_core::{AsrError, ConvSpec, EncoderConfig, TaskConfig};
use candle_core::{Device, IndexOp, Tensor};
use chunk_encoder::{ChunkWindow, SpeechEncoderModel, StatePrior, lengths_tensor};

fn small_config() -> EncoderConfig {
    EncoderConfig {
        conv_channels: ConvSpec::parse("[4, 4]").unwrap(),
        conv_kernel_sizes: ConvSpec::parse("[(3, 3), (3, 3)]").unwrap(),
        conv_strides: ConvSpec::parse("[(1, 1), (2, 2)]").unwrap(),
        encoder_embed_dim: 16,
        encoder_ffn_embed_dim: 32,
        encoder_layers: 2,
        encoder_attention_heads: 2,
        dropout: 0.0,
        attention_dropout: 0.0,
        activation_dropout: 0.0,
        max_source_positions: 64,
        ..EncoderConfig::base()
    }
}

fn chunk_task() -> TaskConfig {
    TaskConfig {
        feat_dim: 8,
        feat_in_channels: 1,
        num_targets: Some(5),
        chunk_width: Some(8),
        chunk_left_context: 2,
        training_stage: true,
    }
}

fn features(batch: usize, time: usize, device: &Device) -> Tensor {
    Tensor::randn(0f32, 1.0, (batch, time, 8), device).unwrap()
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

#[test]
fn test_window_from_task() {
    let device = Device::Cpu;
    let model = SpeechEncoderModel::new(&small_config(), &chunk_task(), &device).unwrap();
    // output_lengths(3) - 1 = 1, output_lengths(10) = 5
    assert_eq!(model.encoder().window(), ChunkWindow { begin: 1, end: Some(5) });
    assert_eq!(model.output_lengths(12), 6);
}

#[test]
fn test_chunk_mode_slices_in_training_only() {
    let device = Device::Cpu;
    let mut model = SpeechEncoderModel::new(&small_config(), &chunk_task(), &device).unwrap();
    let x = features(2, 12, &device);
    let lengths = lengths_tensor(&[12, 12], &device).unwrap();

    model.train();
    let out = model.forward(&x, &lengths, false).unwrap();
    assert_eq!(out.encoder_out.dims(), &[4, 2, 5]);
    assert_eq!(out.padding_mask.as_ref().unwrap().dims(), &[2, 4]);
    let lens: Vec<i64> = out.src_lengths.as_ref().unwrap().to_vec1().unwrap();
    assert_eq!(lens, vec![4, 4]);
    out.validate().unwrap();

    model.eval();
    let out = model.forward(&x, &lengths, false).unwrap();
    assert_eq!(out.encoder_out.dims(), &[6, 2, 5]);
    let lens: Vec<i64> = out.src_lengths.as_ref().unwrap().to_vec1().unwrap();
    assert_eq!(lens, vec![6, 6]);
}

#[test]
fn test_chunk_mode_at_inference_when_not_training_stage() {
    let device = Device::Cpu;
    let task = TaskConfig {
        training_stage: false,
        ..chunk_task()
    };
    let model = SpeechEncoderModel::new(&small_config(), &task, &device).unwrap();
    assert!(!model.is_training());
    let out = model
        .forward(&features(1, 12, &device), &lengths_tensor(&[12], &device).unwrap(), true)
        .unwrap();
    assert_eq!(out.encoder_out.dims(), &[4, 1, 5]);
    // input of the first layer plus one state per layer, sliced like the output
    assert_eq!(out.states.len(), 3);
    for state in &out.states {
        assert_eq!(state.dims(), &[4, 1, 16]);
    }
}

#[test]
fn test_chunk_mode_rejects_uneven_lengths() {
    let device = Device::Cpu;
    let mut model = SpeechEncoderModel::new(&small_config(), &chunk_task(), &device).unwrap();
    model.train();
    let err = model
        .forward(&features(2, 12, &device), &lengths_tensor(&[12, 10], &device).unwrap(), false)
        .unwrap_err();
    assert!(matches!(err, AsrError::InvalidInput(_)));
}

#[test]
fn test_invalid_chunk_configuration() {
    let device = Device::Cpu;
    let zero_width = TaskConfig {
        chunk_width: Some(0),
        ..chunk_task()
    };
    assert!(matches!(
        SpeechEncoderModel::new(&small_config(), &zero_width, &device),
        Err(AsrError::InvalidConfiguration(_))
    ));

    let short_context = TaskConfig {
        chunk_left_context: 1,
        ..chunk_task()
    };
    assert!(matches!(
        SpeechEncoderModel::new(&small_config(), &short_context, &device),
        Err(AsrError::InvalidConfiguration(_))
    ));
}

#[test]
fn test_padding_mask_and_reorder_of_forward_output() {
    let device = Device::Cpu;
    let task = TaskConfig {
        chunk_width: None,
        num_targets: None,
        ..chunk_task()
    };
    let model = SpeechEncoderModel::new(&small_config(), &task, &device).unwrap();
    let out = model
        .forward(&features(3, 12, &device), &lengths_tensor(&[12, 7, 10], &device).unwrap(), true)
        .unwrap();
    assert_eq!(out.encoder_out.dims(), &[6, 3, 16]);
    let mask: Vec<Vec<u8>> = out.padding_mask.as_ref().unwrap().to_vec2().unwrap();
    assert_eq!(mask[1], vec![0, 0, 0, 0, 1, 1]);

    let re = model.reorder_encoder_out(&out, &[2, 0, 0, 1]).unwrap();
    assert_eq!(re.encoder_out.dims(), &[6, 4, 16]);
    assert_eq!(re.states.len(), out.states.len());
    let a = re.encoder_out.i((.., 1, ..)).unwrap();
    let b = re.encoder_out.i((.., 2, ..)).unwrap();
    assert_eq!(max_abs_diff(&a, &b), 0.0);
    let lens: Vec<i64> = re.src_lengths.as_ref().unwrap().to_vec1().unwrap();
    assert_eq!(lens, vec![5, 6, 6, 4]);
    assert!(re.embedding.is_none());
    re.validate().unwrap();
}

#[test]
fn test_normalized_probs() {
    let device = Device::Cpu;
    let model = SpeechEncoderModel::new(&small_config(), &chunk_task(), &device).unwrap();
    let out = model
        .forward(&features(2, 12, &device), &lengths_tensor(&[12, 12], &device).unwrap(), false)
        .unwrap();
    let probs = model.get_normalized_probs(&out, false).unwrap();
    assert_eq!(probs.dims(), &[2, 6, 5]);
    let sums: Vec<Vec<f32>> = probs.sum(2).unwrap().to_vec2().unwrap();
    for s in sums.iter().flatten() {
        assert!((s - 1.0).abs() < 1e-5);
    }
}

#[test]
fn test_state_dict_round_trip() {
    let device = Device::Cpu;
    let config = small_config();
    let task = chunk_task();
    let prior = StatePrior::from_vec(vec![1.0, 2.0, 3.0, 2.0, 2.0], &device).unwrap();
    let source = SpeechEncoderModel::new(&config, &task, &device)
        .unwrap()
        .with_state_prior(prior);

    let path = std::env::temp_dir().join(format!("chunk-encoder-{}.safetensors", std::process::id()));
    source.save(&path).unwrap();
    let loaded = SpeechEncoderModel::from_safetensors(&config, &task, &path, &device).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(
        loaded.state_prior().unwrap().to_vec().unwrap(),
        source.state_prior().unwrap().to_vec().unwrap()
    );

    let x = features(1, 12, &device);
    let lengths = lengths_tensor(&[12], &device).unwrap();
    let a = source.forward(&x, &lengths, false).unwrap().encoder_out;
    let b = loaded.forward(&x, &lengths, false).unwrap().encoder_out;
    assert!(max_abs_diff(&a, &b) < 1e-6);
}

#[test]
fn test_load_state_dict_without_prior_and_strictness() {
    let device = Device::Cpu;
    let config = small_config();
    let task = chunk_task();
    let source = SpeechEncoderModel::new(&config, &task, &device)
        .unwrap()
        .with_state_prior(StatePrior::from_vec(vec![1.0; 5], &device).unwrap());

    let mut legacy = source.state_dict().unwrap();
    assert!(legacy.remove(chunk_encoder::STATE_PRIOR_KEY).is_some());

    let mut target = SpeechEncoderModel::new(&config, &task, &device)
        .unwrap()
        .with_state_prior(StatePrior::from_vec(vec![1.0; 5], &device).unwrap());
    target.load_state_dict(legacy.clone(), true).unwrap();
    assert!(target.state_prior().is_none());

    let mut extra = legacy.clone();
    extra.insert("bogus.weight".to_string(), Tensor::zeros(3, candle_core::DType::F32, &device).unwrap());
    assert!(matches!(
        target.load_state_dict(extra.clone(), true),
        Err(AsrError::MalformedInput(_))
    ));
    target.load_state_dict(extra, false).unwrap();

    let name = legacy.keys().next().unwrap().clone();
    let mut missing = legacy;
    missing.remove(&name);
    assert!(target.load_state_dict(missing, true).is_err());
}

#[test]
fn test_failed_load_leaves_model_untouched() {
    let device = Device::Cpu;
    let config = small_config();
    let task = chunk_task();
    let source = SpeechEncoderModel::new(&config, &task, &device)
        .unwrap()
        .with_state_prior(StatePrior::from_vec(vec![8.0, 1.0, 1.0, 0.0, 0.0], &device).unwrap());
    let mut target = SpeechEncoderModel::new(&config, &task, &device)
        .unwrap()
        .with_state_prior(StatePrior::from_vec(vec![1.0; 5], &device).unwrap());
    let prior_before = target.state_prior().unwrap().to_vec().unwrap();
    let before: std::collections::HashMap<String, Tensor> = target
        .state_dict()
        .unwrap()
        .into_iter()
        .map(|(name, value)| (name, value.copy().unwrap()))
        .collect();

    let x = features(1, 12, &device);
    let lengths = lengths_tensor(&[12], &device).unwrap();
    let out_before = target.forward(&x, &lengths, false).unwrap().encoder_out;

    let mut extra = source.state_dict().unwrap();
    extra.insert("bogus.weight".to_string(), Tensor::zeros(3, candle_core::DType::F32, &device).unwrap());
    assert!(matches!(
        target.load_state_dict(extra, true),
        Err(AsrError::MalformedInput(_))
    ));

    // one tensor with the wrong shape among otherwise valid entries
    let mut reshaped = source.state_dict().unwrap();
    let mut names: Vec<String> = reshaped
        .keys()
        .filter(|n| n.as_str() != chunk_encoder::STATE_PRIOR_KEY)
        .cloned()
        .collect();
    names.sort();
    let last = names.last().unwrap().clone();
    reshaped.insert(last, Tensor::zeros(7, candle_core::DType::F32, &device).unwrap());
    assert!(matches!(
        target.load_state_dict(reshaped, false),
        Err(AsrError::MalformedInput(_))
    ));

    assert_eq!(target.state_prior().unwrap().to_vec().unwrap(), prior_before);
    let after = target.state_dict().unwrap();
    for (name, value) in &before {
        assert!(max_abs_diff(value, &after[name]) == 0.0, "{name} changed");
    }
    let out_after = target.forward(&x, &lengths, false).unwrap().encoder_out;
    assert!(max_abs_diff(&out_before, &out_after) == 0.0);
}

#[test]
fn test_update_state_prior_through_model() {
    let device = Device::Cpu;
    let mut model = SpeechEncoderModel::new(&small_config(), &chunk_task(), &device).unwrap();
    let observed = Tensor::new(&[0.5f32, 0.1, 0.1, 0.2, 0.1], &device).unwrap();
    assert!(model.update_state_prior(&observed, 0.1).is_err());

    let mut model = model.with_state_prior(StatePrior::from_vec(vec![1.0; 5], &device).unwrap());
    model.update_state_prior(&observed, 0.1).unwrap();
    let p = model.state_prior().unwrap().to_vec().unwrap();
    assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    assert!((p[0] - (0.9 * 0.2 + 0.1 * 0.5)).abs() < 1e-6);
}
