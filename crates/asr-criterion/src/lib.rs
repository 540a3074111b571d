//! # asr-criterion
//!
//! Критерий обучения для encoder-only модели:
//!
//! - [`CrossEntropyCriterion`]: NLL по непаддинговым целям, `sample_size`
//!   по предложениям или токенам
//! - Периодический воспроизводимый вывод одной пары REF/PRD
//! - [`reduce_metrics`]: агрегирование логов в loss (base 2) и perplexity
//! - [`AsrDataset`]: признаки, цели и транскрипты в памяти, сборка [`Sample`]

pub mod config;
pub mod cross_entropy;
pub mod data;
pub mod metrics;
pub mod model;
pub mod sample;

pub use config::CriterionConfig;
pub use cross_entropy::{CrossEntropyCriterion, LoggingOutput, TrainingSample};
pub use data::{AsrDataset, AsrTextDataset, FeatInMemoryDataset, TextItem};
pub use metrics::{Metrics, reduce_metrics};
pub use model::CriterionModel;
pub use sample::{NetInput, Sample};
