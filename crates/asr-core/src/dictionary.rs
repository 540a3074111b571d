//! Словарь токенов: отображение символов в последовательные id.
//!
//! Формат файла: по одному символу на строку: `<symbol> <count>`.
//! Спецсимволы `<pad>`, `</s>`, `<unk>` всегда занимают id 0..3.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use crate::error::{AsrError, AsrResult};

pub const PAD_WORD: &str = "<pad>";
pub const EOS_WORD: &str = "</s>";
pub const UNK_WORD: &str = "<unk>";
pub const SPACE_WORD: &str = "<space>";

/// SentencePiece word-boundary marker.
const WORDPIECE_MARKER: char = '\u{2581}';

#[derive(Debug, Clone)]
pub struct TokenDictionary {
    symbols: Vec<String>,
    counts: Vec<u64>,
    indices: HashMap<String, u32>,
    pad_index: u32,
    eos_index: u32,
    unk_index: u32,
    space_index: Option<u32>,
    nspecial: usize,
    non_lang_syms: Option<Vec<String>>,
}

impl Default for TokenDictionary {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenDictionary {
    /// Пустой словарь только со спецсимволами.
    pub fn new() -> Self {
        let mut dict = Self {
            symbols: Vec::new(),
            counts: Vec::new(),
            indices: HashMap::new(),
            pad_index: 0,
            eos_index: 0,
            unk_index: 0,
            space_index: None,
            nspecial: 0,
            non_lang_syms: None,
        };
        dict.pad_index = dict.add_symbol(PAD_WORD, 1);
        dict.eos_index = dict.add_symbol(EOS_WORD, 1);
        dict.unk_index = dict.add_symbol(UNK_WORD, 1);
        dict.nspecial = dict.symbols.len();
        dict
    }

    /// Загрузить словарь из файла `<symbol> <count>`.
    ///
    /// `non_lang_syms`: необязательный файл с не-языковыми символами
    /// (по одному на строку); каждый из них обязан присутствовать в словаре.
    pub fn load(path: impl AsRef<Path>, non_lang_syms: Option<&Path>) -> AsrResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let mut dict = Self::from_text(&text)?;

        if let Some(nls_path) = non_lang_syms {
            let nls_text = std::fs::read_to_string(nls_path)?;
            let syms: Vec<String> = nls_text
                .lines()
                .map(|l| l.trim_end().to_string())
                .filter(|l| !l.is_empty())
                .collect();
            for sym in &syms {
                if dict.index(sym) == dict.unk_index {
                    return Err(AsrError::MalformedInput(format!(
                        "{sym} in {} is not in the dictionary",
                        nls_path.display()
                    )));
                }
            }
            dict.non_lang_syms = Some(syms);
        }

        debug!("Словарь загружен из {:?}: {} символов", path, dict.len());
        Ok(dict)
    }

    /// Разобрать содержимое файла словаря.
    pub fn from_text(text: &str) -> AsrResult<Self> {
        let mut dict = Self::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let (symbol, count) = line.rsplit_once(' ').ok_or_else(|| {
                AsrError::MalformedInput(format!(
                    "line {}: expected `<symbol> <count>`, got `{line}`",
                    lineno + 1
                ))
            })?;
            let count: u64 = count.parse().map_err(|_| {
                AsrError::MalformedInput(format!("line {}: bad count `{count}`", lineno + 1))
            })?;
            if dict.indices.contains_key(symbol) {
                return Err(AsrError::MalformedInput(format!(
                    "line {}: duplicate symbol `{symbol}`",
                    lineno + 1
                )));
            }
            dict.add_symbol(symbol, count);
        }
        dict.space_index = dict.indices.get(SPACE_WORD).copied();
        Ok(dict)
    }

    /// Добавить символ (или увеличить его счётчик), вернуть id.
    pub fn add_symbol(&mut self, symbol: &str, count: u64) -> u32 {
        if let Some(&idx) = self.indices.get(symbol) {
            self.counts[idx as usize] += count;
            return idx;
        }
        let idx = self.symbols.len() as u32;
        self.indices.insert(symbol.to_string(), idx);
        self.symbols.push(symbol.to_string());
        self.counts.push(count);
        idx
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn nspecial(&self) -> usize {
        self.nspecial
    }

    pub fn pad(&self) -> u32 {
        self.pad_index
    }

    pub fn eos(&self) -> u32 {
        self.eos_index
    }

    pub fn unk(&self) -> u32 {
        self.unk_index
    }

    /// Id символа `<space>`, если он есть в словаре.
    pub fn space(&self) -> Option<u32> {
        self.space_index
    }

    pub fn non_lang_syms(&self) -> Option<&[String]> {
        self.non_lang_syms.as_deref()
    }

    /// Id символа; неизвестные символы отображаются в `<unk>`.
    pub fn index(&self, symbol: &str) -> u32 {
        self.indices.get(symbol).copied().unwrap_or(self.unk_index)
    }

    pub fn symbol(&self, idx: u32) -> Option<&str> {
        self.symbols.get(idx as usize).map(String::as_str)
    }

    pub fn count(&self, idx: u32) -> Option<u64> {
        self.counts.get(idx as usize).copied()
    }

    fn unk_string(&self, escape: bool) -> String {
        if escape {
            format!("<{UNK_WORD}>")
        } else {
            UNK_WORD.to_string()
        }
    }

    /// Id → строка токенов через пробел; `<pad>` и `</s>` пропускаются.
    pub fn string(&self, ids: &[u32], escape_unk: bool) -> String {
        ids.iter()
            .filter(|&&i| i != self.eos_index && i != self.pad_index)
            .map(|&i| {
                if i == self.unk_index {
                    self.unk_string(escape_unk)
                } else {
                    self.symbol(i).unwrap_or(UNK_WORD).to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Строка токенов → id (с `</s>` в конце при `append_eos`).
    pub fn encode_line(
        &mut self,
        line: &str,
        add_if_not_exist: bool,
        append_eos: bool,
        reverse_order: bool,
    ) -> Vec<u32> {
        if !add_if_not_exist {
            return self.lookup_line(line, append_eos, reverse_order);
        }
        let mut tokens: Vec<&str> = line.split_whitespace().collect();
        if reverse_order {
            tokens.reverse();
        }
        let mut ids = Vec::with_capacity(tokens.len() + 1);
        for token in tokens {
            ids.push(self.add_symbol(token, 1));
        }
        if append_eos {
            ids.push(self.eos_index);
        }
        ids
    }

    /// Как [`encode_line`](Self::encode_line) без добавления символов:
    /// неизвестные токены получают `<unk>`.
    pub fn lookup_line(&self, line: &str, append_eos: bool, reverse_order: bool) -> Vec<u32> {
        let mut ids: Vec<u32> = line.split_whitespace().map(|t| self.index(t)).collect();
        if reverse_order {
            ids.reverse();
        }
        if append_eos {
            ids.push(self.eos_index);
        }
        ids
    }

    /// Split a raw sentence into word pieces separated by spaces.
    ///
    /// When the dictionary holds `▁`-prefixed pieces every word is
    /// segmented greedily into the longest known pieces, with `▁` marking
    /// the word start; characters with no known piece become pieces of
    /// their own. Other dictionaries get the text back with its whitespace
    /// normalized. [`wordpiece_decode`](Self::wordpiece_decode) undoes it.
    pub fn wordpiece_encode(&self, text: &str) -> String {
        if !self.symbols.iter().any(|s| s.contains(WORDPIECE_MARKER)) {
            return text.split_whitespace().collect::<Vec<_>>().join(" ");
        }
        let words: Vec<String> = text
            .split_whitespace()
            .map(|word| format!("{WORDPIECE_MARKER}{word}"))
            .collect();
        let mut pieces: Vec<&str> = Vec::new();
        for word in &words {
            let mut rest = word.as_str();
            while let Some(first) = rest.chars().next() {
                let len = rest
                    .char_indices()
                    .map(|(i, c)| i + c.len_utf8())
                    .rev()
                    .find(|&end| self.indices.contains_key(&rest[..end]))
                    .unwrap_or(first.len_utf8());
                pieces.push(&rest[..len]);
                rest = &rest[len..];
            }
        }
        pieces.join(" ")
    }

    /// Восстановить предложение из строки токенов (`<space>` → пробел).
    ///
    /// `use_unk_sym = false` оставляет неизвестные токены как есть, что нужно
    /// для восстановления исходных транскриптов (например, для подсчёта WER).
    pub fn tokens_to_sentence(&self, line: &str, use_unk_sym: bool) -> String {
        let mut sent = String::new();
        for token in line.split_whitespace() {
            if token == SPACE_WORD {
                sent.push(' ');
            } else if use_unk_sym && self.index(token) == self.unk_index {
                sent.push_str(UNK_WORD);
            } else if token != PAD_WORD && token != EOS_WORD {
                sent.push_str(token);
            }
        }
        sent.trim().to_string()
    }

    /// Склеить word pieces: токены через пробел, `▁` обозначает границу слова.
    pub fn wordpiece_decode(&self, text: &str) -> String {
        if text.contains(WORDPIECE_MARKER) {
            let joined: String = text.split_whitespace().collect();
            joined.replace(WORDPIECE_MARKER, " ").trim().to_string()
        } else {
            self.tokens_to_sentence(text, false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_dict() -> TokenDictionary {
        TokenDictionary::from_text("a 10\nb 5\n<space> 3\nc 1\n").unwrap()
    }

    #[test]
    fn test_specials_come_first() {
        let dict = sample_dict();
        assert_eq!(dict.pad(), 0);
        assert_eq!(dict.eos(), 1);
        assert_eq!(dict.unk(), 2);
        assert_eq!(dict.nspecial(), 3);
        assert_eq!(dict.index("a"), 3);
        assert_eq!(dict.space(), Some(5));
        assert_eq!(dict.index("zzz"), dict.unk());
        assert_eq!(dict.len(), 7);
    }

    #[test]
    fn test_string_skips_pad_and_eos() {
        let dict = sample_dict();
        let ids = [3, 5, 4, 2, 1, 0, 0];
        assert_eq!(dict.string(&ids, false), "a <space> b <unk>");
        assert_eq!(dict.string(&ids, true), "a <space> b <<unk>>");
    }

    #[test]
    fn test_tokens_to_sentence() {
        let dict = sample_dict();
        assert_eq!(dict.tokens_to_sentence("a b <space> c </s>", true), "ab c");
        assert_eq!(dict.tokens_to_sentence("a q", true), "a<unk>");
        assert_eq!(dict.tokens_to_sentence("a q", false), "aq");
        assert_eq!(dict.wordpiece_decode("a b <space> c"), "ab c");
        assert_eq!(dict.wordpiece_decode("\u{2581}he llo \u{2581}world"), "hello world");
    }

    #[test]
    fn test_encode_line() {
        let mut dict = sample_dict();
        assert_eq!(dict.encode_line("a c", false, true, false), vec![3, 6, 1]);
        assert_eq!(dict.encode_line("a c", false, false, true), vec![6, 3]);
        let before = dict.len();
        let ids = dict.encode_line("new", true, false, false);
        assert_eq!(ids, vec![before as u32]);
    }

    #[test]
    fn test_wordpiece_encode() {
        let dict = TokenDictionary::from_text("\u{2581}he 5\nllo 4\n\u{2581}world 3\nl 2\n").unwrap();
        let pieces = dict.wordpiece_encode("hello  world");
        assert_eq!(pieces, "\u{2581}he llo \u{2581}world");
        assert_eq!(dict.wordpiece_decode(&pieces), "hello world");
        assert_eq!(dict.wordpiece_encode("hex"), "\u{2581}he x");
        assert_eq!(dict.lookup_line(&dict.wordpiece_encode("hex"), true, false), vec![3, 2, 1]);

        let chars = sample_dict();
        assert_eq!(chars.wordpiece_encode(" a b  <space> c "), "a b <space> c");
    }

    #[test]
    fn test_malformed_lines() {
        assert!(TokenDictionary::from_text("a ten\n").is_err());
        assert!(TokenDictionary::from_text("a 1\na 2\n").is_err());
        assert!(TokenDictionary::from_text("lonely\n").is_err());
    }
}
