//! Конфигурационные структуры для chunk-энкодера.
//!
//! Все поля перечислены явно и имеют документированные значения по
//! умолчанию ([`EncoderConfig::base`]). Описания свёрток вида
//! `"[(3, 3), (3, 3)]"` разбираются один раз при загрузке конфигурации
//! в [`ConvSpec`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::{AsrError, AsrResult};

/// Default value of [`EncoderConfig::max_source_positions`].
pub const DEFAULT_MAX_SOURCE_POSITIONS: usize = 10240;

// ---------------------------------------------------------------------------
// Описания свёрток
// ---------------------------------------------------------------------------

/// Одно значение в описании свёртки: число или пара (время, частота).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntOrPair {
    /// Одинаковое значение по обеим осям.
    Single(usize),
    /// Пара (время, частота).
    Pair(usize, usize),
}

impl IntOrPair {
    /// Значение по оси времени.
    pub fn time(&self) -> usize {
        match *self {
            IntOrPair::Single(v) => v,
            IntOrPair::Pair(t, _) => t,
        }
    }

    /// Значение по частотной оси.
    pub fn freq(&self) -> usize {
        match *self {
            IntOrPair::Single(v) => v,
            IntOrPair::Pair(_, f) => f,
        }
    }
}

/// Описание параметров свёрточного фронтенда (каналы, ядра или страйды).
///
/// Заменяет строки вида `"None"`, `"[64, 64]"` и `"[(3, 3), (1, 1)]"`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "Option<RawConvSpec>", into = "Option<RawConvSpec>")]
pub enum ConvSpec {
    /// Свёрточного фронтенда нет.
    #[default]
    Absent,
    /// Плоский список чисел.
    Flat(Vec<usize>),
    /// Список, где хотя бы один элемент является парой.
    Nested(Vec<IntOrPair>),
}

impl ConvSpec {
    /// Разобрать строковое описание (`None`, `[64, 64]`, `[(3, 3), 3]`).
    pub fn parse(text: &str) -> AsrResult<Self> {
        match parse_literal(text)? {
            Literal::None => Ok(ConvSpec::Absent),
            Literal::Int(_) => Err(AsrError::config(format!(
                "conv spec must be a list, got `{text}`"
            ))),
            Literal::Seq(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(literal_to_int_or_pair(&item, text)?);
                }
                Ok(ConvSpec::from_values(values))
            }
        }
    }

    fn from_values(values: Vec<IntOrPair>) -> Self {
        if values.iter().all(|v| matches!(v, IntOrPair::Single(_))) {
            ConvSpec::Flat(values.iter().map(IntOrPair::time).collect())
        } else {
            ConvSpec::Nested(values)
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, ConvSpec::Absent)
    }

    /// Количество слоёв, описанных спецификацией.
    pub fn len(&self) -> usize {
        match self {
            ConvSpec::Absent => 0,
            ConvSpec::Flat(v) => v.len(),
            ConvSpec::Nested(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Значения по слоям в виде [`IntOrPair`].
    pub fn values(&self) -> Vec<IntOrPair> {
        match self {
            ConvSpec::Absent => Vec::new(),
            ConvSpec::Flat(v) => v.iter().copied().map(IntOrPair::Single).collect(),
            ConvSpec::Nested(v) => v.clone(),
        }
    }
}

impl fmt::Display for ConvSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvSpec::Absent => write!(f, "None"),
            _ => {
                let parts: Vec<String> = self
                    .values()
                    .iter()
                    .map(|v| match v {
                        IntOrPair::Single(x) => x.to_string(),
                        IntOrPair::Pair(t, fr) => format!("({t}, {fr})"),
                    })
                    .collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

/// JSON-представление [`ConvSpec`]: строка или (вложенный) массив.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawConvSpec {
    Text(String),
    List(Vec<RawConvItem>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawConvItem {
    Int(usize),
    Seq(Vec<usize>),
}

impl TryFrom<Option<RawConvSpec>> for ConvSpec {
    type Error = AsrError;

    fn try_from(raw: Option<RawConvSpec>) -> AsrResult<Self> {
        match raw {
            None => Ok(ConvSpec::Absent),
            Some(RawConvSpec::Text(text)) => ConvSpec::parse(&text),
            Some(RawConvSpec::List(items)) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(match item {
                        RawConvItem::Int(v) => IntOrPair::Single(v),
                        RawConvItem::Seq(seq) => pair_from_slice(&seq)?,
                    });
                }
                Ok(ConvSpec::from_values(values))
            }
        }
    }
}

impl From<ConvSpec> for Option<RawConvSpec> {
    fn from(spec: ConvSpec) -> Self {
        match spec {
            ConvSpec::Absent => None,
            other => Some(RawConvSpec::List(
                other
                    .values()
                    .into_iter()
                    .map(|v| match v {
                        IntOrPair::Single(x) => RawConvItem::Int(x),
                        IntOrPair::Pair(t, f) => RawConvItem::Seq(vec![t, f]),
                    })
                    .collect(),
            )),
        }
    }
}

fn pair_from_slice(seq: &[usize]) -> AsrResult<IntOrPair> {
    match *seq {
        [v] => Ok(IntOrPair::Single(v)),
        [t, f] => Ok(IntOrPair::Pair(t, f)),
        _ => Err(AsrError::config(format!(
            "conv spec entries must have one or two values, got {seq:?}"
        ))),
    }
}

fn literal_to_int_or_pair(item: &Literal, text: &str) -> AsrResult<IntOrPair> {
    match item {
        Literal::Int(v) => Ok(IntOrPair::Single(non_negative(*v, text)?)),
        Literal::Seq(inner) => {
            let mut seq = Vec::with_capacity(inner.len());
            for lit in inner {
                match lit {
                    Literal::Int(v) => seq.push(non_negative(*v, text)?),
                    _ => {
                        return Err(AsrError::config(format!(
                            "conv spec `{text}` is nested too deeply"
                        )));
                    }
                }
            }
            pair_from_slice(&seq)
        }
        Literal::None => Err(AsrError::config(format!(
            "`None` is not allowed inside conv spec `{text}`"
        ))),
    }
}

fn non_negative(v: i64, text: &str) -> AsrResult<usize> {
    usize::try_from(v)
        .map_err(|_| AsrError::config(format!("negative value {v} in `{text}`")))
}

// ---------------------------------------------------------------------------
// Контекст self-attention
// ---------------------------------------------------------------------------

/// Левый/правый контекст для time-restricted self-attention.
///
/// `None` с одной из сторон означает неограниченный контекст.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransformerContext {
    pub left: Option<usize>,
    pub right: Option<usize>,
}

impl TransformerContext {
    /// Разобрать `None` или пару вида `(64, None)`.
    pub fn parse(text: &str) -> AsrResult<Option<Self>> {
        match parse_literal(text)? {
            Literal::None => Ok(None),
            Literal::Seq(items) if items.len() == 2 => {
                let side = |lit: &Literal| -> AsrResult<Option<usize>> {
                    match lit {
                        Literal::None => Ok(None),
                        Literal::Int(v) => non_negative(*v, text).map(Some),
                        Literal::Seq(_) => Err(AsrError::config(format!(
                            "transformer context `{text}` must hold integers or None"
                        ))),
                    }
                };
                Ok(Some(Self {
                    left: side(&items[0])?,
                    right: side(&items[1])?,
                }))
            }
            _ => Err(AsrError::config(format!(
                "transformer context must be None or a pair, got `{text}`"
            ))),
        }
    }
}

/// JSON forms accepted for the context: `"(64, None)"`, `[64, null]`
/// or `{"left": 64, "right": null}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawTransformerContext {
    Text(String),
    Pair(Option<usize>, Option<usize>),
    Fields {
        left: Option<usize>,
        right: Option<usize>,
    },
}

fn deserialize_transformer_context<'de, D>(
    deserializer: D,
) -> Result<Option<TransformerContext>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Option::<RawTransformerContext>::deserialize(deserializer)? {
        None => None,
        Some(RawTransformerContext::Text(text)) => {
            TransformerContext::parse(&text).map_err(serde::de::Error::custom)?
        }
        Some(RawTransformerContext::Pair(left, right))
        | Some(RawTransformerContext::Fields { left, right }) => {
            Some(TransformerContext { left, right })
        }
    })
}

// ---------------------------------------------------------------------------
// Мини-парсер литералов
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    None,
    Int(i64),
    Seq(Vec<Literal>),
}

fn parse_literal(text: &str) -> AsrResult<Literal> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Literal::None);
    }
    let mut parser = LiteralParser {
        text: trimmed,
        chars: trimmed.char_indices().peekable(),
    };
    let lit = parser.value()?;
    parser.skip_ws();
    if let Some(&(pos, c)) = parser.chars.peek() {
        return Err(AsrError::config(format!(
            "unexpected `{c}` at offset {pos} in `{trimmed}`"
        )));
    }
    Ok(lit)
}

struct LiteralParser<'a> {
    text: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl LiteralParser<'_> {
    fn skip_ws(&mut self) {
        while self.chars.peek().is_some_and(|&(_, c)| c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn error(&self, what: &str) -> AsrError {
        AsrError::config(format!("{what} in `{}`", self.text))
    }

    fn value(&mut self) -> AsrResult<Literal> {
        self.skip_ws();
        match self.chars.peek().copied() {
            Some((_, '[')) => self.seq(']'),
            Some((_, '(')) => self.seq(')'),
            Some((_, c)) if c == '-' || c.is_ascii_digit() => self.int(),
            Some((pos, 'N')) => {
                if self.text[pos..].starts_with("None") {
                    for _ in 0..4 {
                        self.chars.next();
                    }
                    Ok(Literal::None)
                } else {
                    Err(self.error("unknown identifier"))
                }
            }
            Some((_, c)) => Err(self.error(&format!("unexpected `{c}`"))),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn int(&mut self) -> AsrResult<Literal> {
        let mut digits = String::new();
        if let Some(&(_, '-')) = self.chars.peek() {
            digits.push('-');
            self.chars.next();
        }
        while let Some(&(_, c)) = self.chars.peek() {
            if !c.is_ascii_digit() {
                break;
            }
            digits.push(c);
            self.chars.next();
        }
        digits
            .parse::<i64>()
            .map(Literal::Int)
            .map_err(|_| self.error(&format!("bad integer `{digits}`")))
    }

    fn seq(&mut self, close: char) -> AsrResult<Literal> {
        self.chars.next();
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if let Some(&(_, c)) = self.chars.peek() {
                if c == close {
                    self.chars.next();
                    return Ok(Literal::Seq(items));
                }
            }
            items.push(self.value()?);
            self.skip_ws();
            match self.chars.next() {
                Some((_, ',')) => continue,
                Some((_, c)) if c == close => return Ok(Literal::Seq(items)),
                Some((_, c)) => return Err(self.error(&format!("expected `,` or `{close}`, got `{c}`"))),
                None => return Err(self.error(&format!("missing `{close}`"))),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Энкодер
// ---------------------------------------------------------------------------

/// Функция активации в FFN-блоках трансформера.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationFn {
    #[default]
    Relu,
    Gelu,
    GeluAccurate,
    Tanh,
    Linear,
}

/// Configuration of the chunk-aware speech transformer encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Output channels of each conv layer (`Absent` disables the front end).
    pub conv_channels: ConvSpec,

    /// Kernel sizes (time, freq) of each conv layer.
    pub conv_kernel_sizes: ConvSpec,

    /// Strides (time, freq) of each conv layer.
    pub conv_strides: ConvSpec,

    /// Model dimension.
    pub encoder_embed_dim: usize,

    /// FFN inner dimension.
    pub encoder_ffn_embed_dim: usize,

    /// Number of transformer layers.
    pub encoder_layers: usize,

    /// Number of attention heads.
    pub encoder_attention_heads: usize,

    /// Pre-norm (`true`) or post-norm blocks.
    pub encoder_normalize_before: bool,

    /// Learned instead of sinusoidal positional embeddings.
    pub encoder_learned_pos: bool,

    /// Time-restricted self-attention context.
    #[serde(deserialize_with = "deserialize_transformer_context")]
    pub encoder_transformer_context: Option<TransformerContext>,

    pub dropout: f32,
    pub attention_dropout: f32,
    pub activation_dropout: f32,
    pub activation_fn: ActivationFn,

    /// Disable positional embeddings entirely.
    pub no_token_positional_embeddings: bool,

    /// Layer norm right after the embedding.
    pub layernorm_embedding: bool,

    /// Indices of the layers to keep when pruning (overrides `encoder_layers`).
    pub encoder_layers_to_keep: Option<Vec<usize>>,

    /// LayerDrop probability (training only).
    pub encoder_layerdrop: f32,

    /// Iterative PQ quantization noise.
    pub quant_noise_pq: f32,

    /// Block size of the PQ quantization noise.
    pub quant_noise_pq_block_size: usize,

    /// Scalar quantization noise.
    pub quant_noise_scalar: f32,

    /// Maximum number of positions after sub-sampling.
    pub max_source_positions: usize,

    /// Layer normalization epsilon.
    pub layer_norm_eps: f64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self::base()
    }
}

impl EncoderConfig {
    /// Базовая архитектура: 4 свёртки + 12 слоёв трансформера (256 dim, 4 головы).
    pub fn base() -> Self {
        Self {
            conv_channels: ConvSpec::Flat(vec![64, 64, 128, 128]),
            conv_kernel_sizes: ConvSpec::Nested(vec![IntOrPair::Pair(3, 3); 4]),
            conv_strides: ConvSpec::Nested(vec![
                IntOrPair::Pair(1, 1),
                IntOrPair::Pair(2, 2),
                IntOrPair::Pair(1, 1),
                IntOrPair::Pair(2, 2),
            ]),
            encoder_embed_dim: 256,
            encoder_ffn_embed_dim: 1024,
            encoder_layers: 12,
            encoder_attention_heads: 4,
            encoder_normalize_before: true,
            encoder_learned_pos: false,
            encoder_transformer_context: None,
            dropout: 0.2,
            attention_dropout: 0.2,
            activation_dropout: 0.2,
            activation_fn: ActivationFn::Relu,
            no_token_positional_embeddings: false,
            layernorm_embedding: false,
            encoder_layers_to_keep: None,
            encoder_layerdrop: 0.0,
            quant_noise_pq: 0.0,
            quant_noise_pq_block_size: 8,
            quant_noise_scalar: 0.0,
            max_source_positions: DEFAULT_MAX_SOURCE_POSITIONS,
            layer_norm_eps: 1e-5,
        }
    }

    /// Вариант для WSJ (совпадает с базовым).
    pub fn wsj() -> Self {
        Self::base()
    }

    /// Load a JSON config; missing fields take the [`EncoderConfig::base`] defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> AsrResult<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Фактическое число слоёв с учётом `encoder_layers_to_keep`.
    pub fn num_layers(&self) -> usize {
        self.encoder_layers_to_keep
            .as_ref()
            .map_or(self.encoder_layers, Vec::len)
    }

    /// Head dimension.
    pub fn head_dim(&self) -> usize {
        self.encoder_embed_dim / self.encoder_attention_heads
    }

    pub fn has_conv_frontend(&self) -> bool {
        !self.conv_channels.is_absent()
    }

    /// Проверить согласованность всех полей.
    pub fn validate(&self) -> AsrResult<()> {
        if self.encoder_attention_heads == 0
            || self.encoder_embed_dim % self.encoder_attention_heads != 0
        {
            return Err(AsrError::config(format!(
                "encoder_embed_dim {} is not divisible by {} attention heads",
                self.encoder_embed_dim, self.encoder_attention_heads
            )));
        }

        if self.has_conv_frontend() {
            let n = self.conv_channels.len();
            if n == 0 {
                return Err(AsrError::config("conv_channels must not be empty"));
            }
            if self.conv_kernel_sizes.len() != n || self.conv_strides.len() != n {
                return Err(AsrError::config(format!(
                    "conv specs disagree in length: channels={}, kernel_sizes={}, strides={}",
                    n,
                    self.conv_kernel_sizes.len(),
                    self.conv_strides.len()
                )));
            }
            if matches!(self.conv_channels, ConvSpec::Nested(_)) {
                return Err(AsrError::config("conv_channels must be a flat list"));
            }
            let bad = |spec: &ConvSpec| spec.values().iter().any(|v| v.time() == 0 || v.freq() == 0);
            if bad(&self.conv_channels) || bad(&self.conv_kernel_sizes) || bad(&self.conv_strides) {
                return Err(AsrError::config("conv specs must hold positive values"));
            }
        } else if !self.conv_kernel_sizes.is_absent() || !self.conv_strides.is_absent() {
            return Err(AsrError::config(
                "conv kernel sizes/strides given without conv_channels",
            ));
        }

        for (name, p) in [
            ("dropout", self.dropout),
            ("attention_dropout", self.attention_dropout),
            ("activation_dropout", self.activation_dropout),
            ("encoder_layerdrop", self.encoder_layerdrop),
            ("quant_noise_pq", self.quant_noise_pq),
            ("quant_noise_scalar", self.quant_noise_scalar),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(AsrError::config(format!("{name} must be in [0, 1), got {p}")));
            }
        }

        if self.quant_noise_pq > 0.0 {
            let block = self.quant_noise_pq_block_size;
            if block == 0 {
                return Err(AsrError::config("quant_noise_pq_block_size must be positive"));
            }
            for (name, dim) in [
                ("encoder_embed_dim", self.encoder_embed_dim),
                ("encoder_ffn_embed_dim", self.encoder_ffn_embed_dim),
            ] {
                if dim % block != 0 {
                    return Err(AsrError::config(format!(
                        "{name} ({dim}) must be a multiple of quant_noise_pq_block_size ({block})"
                    )));
                }
            }
        }
        // scalar noise is never applied by the encoder
        if self.quant_noise_scalar > 0.0 {
            return Err(AsrError::config(format!(
                "quant_noise_scalar is not supported by the encoder, got {}",
                self.quant_noise_scalar
            )));
        }

        if let Some(keep) = &self.encoder_layers_to_keep {
            if keep.is_empty() {
                return Err(AsrError::config("encoder_layers_to_keep must not be empty"));
            }
            if let Some(&bad) = keep.iter().find(|&&i| i >= self.encoder_layers) {
                return Err(AsrError::config(format!(
                    "encoder_layers_to_keep refers to layer {bad}, but only {} exist",
                    self.encoder_layers
                )));
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Задача (данные)
// ---------------------------------------------------------------------------

/// Dataset-side parameters the encoder is built against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Input feature dimension (e.g. 83 for fbank + pitch).
    pub feat_dim: usize,

    /// Number of input channels the features are split into.
    pub feat_in_channels: usize,

    /// Output classes for the encoder-only model (`None` disables `fc_out`).
    pub num_targets: Option<usize>,

    /// Chunk width in input frames (`None` = rest of utterance).
    pub chunk_width: Option<usize>,

    /// Left context of a chunk in input frames.
    pub chunk_left_context: usize,

    /// `false` enables chunk windowing in eval mode too.
    pub training_stage: bool,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            feat_dim: 83,
            feat_in_channels: 1,
            num_targets: None,
            chunk_width: None,
            chunk_left_context: 0,
            training_stage: true,
        }
    }
}

impl TaskConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> AsrResult<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EncoderConfig::default();
        assert_eq!(config.encoder_embed_dim, 256);
        assert_eq!(config.encoder_layers, 12);
        assert_eq!(config.head_dim(), 64);
        assert_eq!(config.conv_channels.len(), 4);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_conv_specs() {
        assert_eq!(ConvSpec::parse("None").unwrap(), ConvSpec::Absent);
        assert_eq!(ConvSpec::parse("").unwrap(), ConvSpec::Absent);
        assert_eq!(
            ConvSpec::parse("[64, 64, 128, 128]").unwrap(),
            ConvSpec::Flat(vec![64, 64, 128, 128])
        );
        assert_eq!(
            ConvSpec::parse("[(3, 3), 5, (1,)]").unwrap(),
            ConvSpec::Nested(vec![
                IntOrPair::Pair(3, 3),
                IntOrPair::Single(5),
                IntOrPair::Single(1),
            ])
        );
        assert_eq!(
            ConvSpec::parse("[(1, 1), (2, 2)]").unwrap().to_string(),
            "[(1, 1), (2, 2)]"
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ConvSpec::parse("[1, 2").is_err());
        assert!(ConvSpec::parse("[(1, 2, 3)]").is_err());
        assert!(ConvSpec::parse("[-1]").is_err());
        assert!(ConvSpec::parse("__import__('os')").is_err());
        assert!(ConvSpec::parse("7").is_err());
    }

    #[test]
    fn test_transformer_context() {
        assert_eq!(TransformerContext::parse("None").unwrap(), None);
        assert_eq!(
            TransformerContext::parse("(64, None)").unwrap(),
            Some(TransformerContext { left: Some(64), right: None })
        );
        assert!(TransformerContext::parse("(1, 2, 3)").is_err());
        assert!(TransformerContext::parse("(-1, 2)").is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let json = r#"{
            "conv_channels": "[32, 32]",
            "conv_kernel_sizes": [[3, 3], 3],
            "conv_strides": [[2, 2], [2, 2]],
            "encoder_layers": 2,
            "encoder_transformer_context": {"left": 10, "right": null}
        }"#;
        let config: EncoderConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.conv_channels, ConvSpec::Flat(vec![32, 32]));
        assert_eq!(config.conv_strides.values()[1], IntOrPair::Pair(2, 2));
        assert_eq!(config.encoder_embed_dim, 256);
        config.validate().unwrap();

        let back: EncoderConfig =
            serde_json::from_str(&serde_json::to_string(&config).unwrap()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_transformer_context_json_forms() {
        let context = |json: &str| {
            let text = format!(r#"{{"encoder_transformer_context": {json}}}"#);
            serde_json::from_str::<EncoderConfig>(&text).map(|c| c.encoder_transformer_context)
        };
        let expected = Some(TransformerContext { left: Some(64), right: None });
        assert_eq!(context(r#""(64, None)""#).unwrap(), expected);
        assert_eq!(context("[64, null]").unwrap(), expected);
        assert_eq!(context(r#"{"left": 64}"#).unwrap(), expected);
        assert_eq!(context(r#""None""#).unwrap(), None);
        assert_eq!(context("null").unwrap(), None);
        assert!(context(r#""(64, 1, 2)""#).is_err());
        assert_eq!(
            serde_json::from_str::<EncoderConfig>("{}").unwrap().encoder_transformer_context,
            None
        );
    }

    #[test]
    fn test_quant_noise_validation() {
        let mut config = EncoderConfig::base();
        config.quant_noise_pq = 0.1;
        config.quant_noise_pq_block_size = 8;
        config.validate().unwrap();

        config.quant_noise_pq_block_size = 3;
        assert!(matches!(
            config.validate(),
            Err(AsrError::InvalidConfiguration(_))
        ));

        let mut config = EncoderConfig::base();
        config.quant_noise_scalar = 0.1;
        assert!(matches!(
            config.validate(),
            Err(AsrError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_validate_mismatched_specs() {
        let mut config = EncoderConfig::base();
        config.conv_strides = ConvSpec::Flat(vec![1, 2]);
        assert!(matches!(
            config.validate(),
            Err(AsrError::InvalidConfiguration(_))
        ));

        let mut config = EncoderConfig::base();
        config.encoder_layers_to_keep = Some(vec![0, 12]);
        assert!(config.validate().is_err());
        config.encoder_layers_to_keep = Some(vec![0, 11]);
        assert_eq!(config.num_layers(), 2);
    }
}
