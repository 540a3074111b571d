//! # decoding-graph
//!
//! Построение графа декодирования HCLG из инвертированного HCL
//! (лексикон ∘ контекст ∘ топология HMM) и грамматики G:
//!
//! ```text
//! HCLG = connect(determinize(invert(connect(intersect(G, HCL_inv)))))
//! ```
//!
//! Сообщения о ходе построения отправляются в явный [`LogSink`].

use std::path::{Path, PathBuf};

use thiserror::Error;
use wfst::{Fsa, FsaError};

/// Имя файла результата внутри `out_dir`.
pub const HCLG_FILE_NAME: &str = "HCLG.pt";

/// File suffixes loaded as serialized automata; everything else is OpenFst text.
const BINARY_SUFFIXES: [&str; 2] = ["pt", "safetensors"];

#[derive(Error, Debug)]
pub enum GraphError {
    /// Input automaton with unexpected structure.
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Automaton error: {0}")]
    Fsa(#[from] FsaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type GraphResult<T> = Result<T, GraphError>;

/// Получатель сообщений о ходе построения графа.
pub trait LogSink {
    fn info(&mut self, message: &str);

    /// Подробности (размеры промежуточных автоматов).
    fn debug(&mut self, _message: &str) {}
}

/// Forwards to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn info(&mut self, message: &str) {
        tracing::info!("{message}");
    }

    fn debug(&mut self, message: &str) {
        tracing::debug!("{message}");
    }
}

/// Keeps `info` messages in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    pub messages: Vec<String>,
}

impl LogSink for MemorySink {
    fn info(&mut self, message: &str) {
        self.messages.push(message.to_string());
    }
}

/// Load `G`: serialized automaton for binary suffixes, OpenFst acceptor
/// text otherwise.
pub fn load_grammar(path: &Path) -> GraphResult<Fsa> {
    let binary = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| BINARY_SUFFIXES.contains(&e));
    if binary {
        Ok(wfst::io::load(path)?)
    } else {
        let text = std::fs::read_to_string(path)?;
        Ok(wfst::from_openfst(&text, true)?)
    }
}

/// Compose `G` with `HCL_inv` into a determinized, trim HCLG.
///
/// `G` must be an acceptor; a grammar with an output-label layer is
/// rejected before any composition work.
pub fn compose_hclg(hcl_inv: &Fsa, g: &Fsa, sink: &mut dyn LogSink) -> GraphResult<Fsa> {
    if g.has_aux_labels() {
        return Err(GraphError::MalformedInput(
            "G must be an acceptor, got an automaton with output labels".into(),
        ));
    }

    let mut hcl_inv = hcl_inv.clone();
    hcl_inv.arc_sort();
    let mut g = g.clone();
    g.arc_sort();

    let composed = wfst::connect(&wfst::intersect(&g, &hcl_inv)?);
    sink.debug(&format!(
        "G ∘ HCL_inv: {} states, {} arcs",
        composed.num_states(),
        composed.num_arcs()
    ));

    let hclg = composed.invert()?;
    let hclg = wfst::determinize(&hclg)?;
    let hclg = wfst::connect(&hclg);
    sink.debug(&format!(
        "HCLG: {} states, {} arcs",
        hclg.num_states(),
        hclg.num_arcs()
    ));
    Ok(hclg)
}

/// Build HCLG from files and save it as `<out_dir>/HCLG.pt`.
///
/// Nothing is written unless every step succeeds. Returns the saved path.
pub fn build(
    hcl_inv_path: &Path,
    g_path: &Path,
    out_dir: &Path,
    sink: &mut dyn LogSink,
) -> GraphResult<PathBuf> {
    let hcl_inv = wfst::io::load(hcl_inv_path)?;
    let g = load_grammar(g_path)?;
    let hclg = compose_hclg(&hcl_inv, &g, sink)?;

    std::fs::create_dir_all(out_dir)?;
    let save_path = out_dir.join(HCLG_FILE_NAME);
    wfst::io::save(&hclg, &save_path)?;
    sink.info(&format!("saved the decoding graph as {}", save_path.display()));
    Ok(save_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grammar_with_output_labels_is_rejected() {
        let hcl_inv = wfst::from_openfst("0 0 1 7\n0\n", false).unwrap();
        let g = wfst::from_openfst("0 1 1 1\n1\n", false).unwrap();
        let mut sink = MemorySink::default();
        assert!(matches!(
            compose_hclg(&hcl_inv, &g, &mut sink),
            Err(GraphError::MalformedInput(_))
        ));
        assert!(sink.messages.is_empty());
    }

    #[test]
    fn test_text_grammar_is_an_acceptor() {
        let path = std::env::temp_dir().join(format!("g-{}.txt", std::process::id()));
        std::fs::write(&path, "0 1 5 0.25\n1\n").unwrap();
        let g = load_grammar(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert!(!g.has_aux_labels());
        assert_eq!(g.num_arcs(), 1);
    }
}
