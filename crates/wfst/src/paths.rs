//! Enumeration of accepted paths (for inspection of small graphs).

use crate::error::{FsaError, FsaResult};
use crate::fsa::{EPSILON, Fsa, Label, StateId, Weight};

#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedPath {
    /// Non-epsilon input labels.
    pub labels: Vec<Label>,
    /// Concatenated output labels.
    pub aux: Vec<Label>,
    /// Total cost including the final weight.
    pub weight: Weight,
}

/// All accepted paths with at most `max_arcs` arcs.
///
/// Fails if a longer path exists, which also catches cyclic automata.
pub fn accepted_paths(fsa: &Fsa, max_arcs: usize) -> FsaResult<Vec<AcceptedPath>> {
    let mut out = Vec::new();
    if let Some(start) = fsa.start() {
        let mut current = AcceptedPath {
            labels: Vec::new(),
            aux: Vec::new(),
            weight: 0.0,
        };
        walk(fsa, start, 0, max_arcs, &mut current, &mut out)?;
    }
    Ok(out)
}

fn walk(
    fsa: &Fsa,
    state: StateId,
    depth: usize,
    max_arcs: usize,
    current: &mut AcceptedPath,
    out: &mut Vec<AcceptedPath>,
) -> FsaResult<()> {
    if let Some(fw) = fsa.final_weight(state) {
        let mut path = current.clone();
        path.weight += fw;
        out.push(path);
    }
    let arcs = fsa.arcs(state);
    if arcs.is_empty() {
        return Ok(());
    }
    if depth == max_arcs {
        return Err(FsaError::Unsupported(format!(
            "automaton has paths longer than {max_arcs} arcs"
        )));
    }
    for arc in arcs {
        let (labels_len, aux_len, weight) =
            (current.labels.len(), current.aux.len(), current.weight);
        if arc.label != EPSILON {
            current.labels.push(arc.label);
        }
        current.aux.extend_from_slice(&arc.aux);
        current.weight += arc.weight;
        walk(fsa, arc.nextstate, depth + 1, max_arcs, current, out)?;
        current.labels.truncate(labels_len);
        current.aux.truncate(aux_len);
        current.weight = weight;
    }
    Ok(())
}
