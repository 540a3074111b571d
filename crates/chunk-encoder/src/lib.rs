//! # chunk-encoder
//!
//! Chunk-aware transformer speech encoder.
//!
//! - ConvBNReLU sub-sampling front end ([`ConvBNReLU`])
//! - Transformer stack with time-restricted self-attention
//! - Output window for chunk-wise training and decoding ([`ChunkWindow`])
//! - Beam-search reordering of [`EncoderOutput`]
//! - Encoder-only model with a smoothed state prior ([`SpeechEncoderModel`])

pub mod chunk;
pub mod conv;
pub mod encoder;
pub mod encoder_out;
pub mod layers;
pub mod model;
pub mod position;

pub use chunk::{ChunkWindow, ConvTimeGeometry, FrontendGeometry};
pub use conv::{ConvBNReLU, transformer_input_size};
pub use encoder::SpeechChunkTransformerEncoder;
pub use encoder_out::{EncoderOutput, lengths_tensor, padding_mask};
pub use model::{STATE_PRIOR_KEY, SpeechEncoderModel, StatePrior};
