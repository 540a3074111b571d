//! # asr-core
//!
//! Базовые типы, конфигурация и ошибки для workspace chunk-энкодера.
//!
//! - Конфигурация энкодера и задачи ([`EncoderConfig`], [`TaskConfig`])
//!   с явными значениями по умолчанию
//! - Разбор описаний свёрток ([`ConvSpec`])
//! - Словарь токенов ([`TokenDictionary`])
//! - Унифицированная обработка ошибок через [`AsrError`]

pub mod config;
pub mod debug;
pub mod dictionary;
pub mod error;

pub use config::{
    ActivationFn, ConvSpec, EncoderConfig, IntOrPair, TaskConfig, TransformerContext,
};
pub use dictionary::TokenDictionary;
pub use error::{AsrError, AsrResult};
