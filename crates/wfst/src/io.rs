//! Binary serialization as a safetensors bundle.
//!
//! | key              | dtype | shape  | content                              |
//! |------------------|-------|--------|--------------------------------------|
//! | `header`         | I64   | (4,)   | version, num_states, start (-1), aux |
//! | `arcs`           | I64   | (N, 3) | src, dst, label                      |
//! | `scores`         | F32   | (N,)   | arc costs                            |
//! | `aux_row_splits` | I64   | (N+1,) | ragged output labels (aux layer)     |
//! | `aux_values`     | I64   | (K,)   |                                      |
//! | `finals`         | I64   | (M,)   | final states                         |
//! | `final_weights`  | F32   | (M,)   |                                      |
//!
//! Empty tensors are not written; a missing key means "no entries".

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use tracing::debug;

use crate::error::{FsaError, FsaResult};
use crate::fsa::{Arc, Fsa, State, StateId};

const FORMAT_VERSION: i64 = 1;

/// Write `fsa` to `path`.
pub fn save(fsa: &Fsa, path: impl AsRef<Path>) -> FsaResult<()> {
    let device = Device::Cpu;
    let num_arcs = fsa.num_arcs();

    let mut arcs: Vec<i64> = Vec::with_capacity(num_arcs * 3);
    let mut scores: Vec<f32> = Vec::with_capacity(num_arcs);
    let mut row_splits: Vec<i64> = Vec::with_capacity(num_arcs + 1);
    let mut aux_values: Vec<i64> = Vec::new();
    let mut finals: Vec<i64> = Vec::new();
    let mut final_weights: Vec<f32> = Vec::new();

    row_splits.push(0);
    for (s, state) in fsa.states().iter().enumerate() {
        for arc in &state.arcs {
            arcs.extend_from_slice(&[s as i64, arc.nextstate as i64, arc.label as i64]);
            scores.push(arc.weight);
            aux_values.extend(arc.aux.iter().map(|&l| l as i64));
            row_splits.push(aux_values.len() as i64);
        }
        if let Some(fw) = state.final_weight {
            finals.push(s as i64);
            final_weights.push(fw);
        }
    }

    let header = vec![
        FORMAT_VERSION,
        fsa.num_states() as i64,
        fsa.start().map_or(-1, |s| s as i64),
        fsa.has_aux_labels() as i64,
    ];

    let mut tensors: HashMap<String, Tensor> = HashMap::new();
    tensors.insert("header".into(), Tensor::from_vec(header, 4, &device)?);
    if num_arcs > 0 {
        tensors.insert("arcs".into(), Tensor::from_vec(arcs, (num_arcs, 3), &device)?);
        tensors.insert("scores".into(), Tensor::from_vec(scores, num_arcs, &device)?);
    }
    if fsa.has_aux_labels() {
        let n = row_splits.len();
        tensors.insert("aux_row_splits".into(), Tensor::from_vec(row_splits, n, &device)?);
        if !aux_values.is_empty() {
            let k = aux_values.len();
            tensors.insert("aux_values".into(), Tensor::from_vec(aux_values, k, &device)?);
        }
    }
    if !finals.is_empty() {
        let m = finals.len();
        tensors.insert("finals".into(), Tensor::from_vec(finals, m, &device)?);
        tensors.insert("final_weights".into(), Tensor::from_vec(final_weights, m, &device)?);
    }

    candle_core::safetensors::save(&tensors, path.as_ref())?;
    debug!(
        "saved automaton ({} states, {} arcs) to {:?}",
        fsa.num_states(),
        num_arcs,
        path.as_ref()
    );
    Ok(())
}

fn malformed(msg: impl Into<String>) -> FsaError {
    FsaError::MalformedInput(msg.into())
}

fn vec_i64(tensors: &HashMap<String, Tensor>, key: &str) -> FsaResult<Vec<i64>> {
    match tensors.get(key) {
        Some(t) => Ok(t.flatten_all()?.to_vec1::<i64>()?),
        None => Ok(Vec::new()),
    }
}

fn vec_f32(tensors: &HashMap<String, Tensor>, key: &str) -> FsaResult<Vec<f32>> {
    match tensors.get(key) {
        Some(t) => Ok(t.flatten_all()?.to_vec1::<f32>()?),
        None => Ok(Vec::new()),
    }
}

fn state_id(v: i64, num_states: usize) -> FsaResult<StateId> {
    if v >= 0 && (v as usize) < num_states {
        Ok(v as StateId)
    } else {
        Err(malformed(format!("state id {v} out of range (num_states = {num_states})")))
    }
}

/// Read an automaton written by [`save`].
pub fn load(path: impl AsRef<Path>) -> FsaResult<Fsa> {
    let path = path.as_ref();
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;

    let header = vec_i64(&tensors, "header")?;
    let [version, num_states, start, has_aux] = header[..] else {
        return Err(malformed(format!("{}: missing or bad header", path.display())));
    };
    if version != FORMAT_VERSION {
        return Err(malformed(format!(
            "{}: unsupported format version {version}",
            path.display()
        )));
    }
    let num_states =
        usize::try_from(num_states).map_err(|_| malformed("negative number of states"))?;
    let has_aux = has_aux != 0;

    let arcs = vec_i64(&tensors, "arcs")?;
    let scores = vec_f32(&tensors, "scores")?;
    if arcs.len() != scores.len() * 3 {
        return Err(malformed(format!(
            "{}: {} arc entries but {} scores",
            path.display(),
            arcs.len() / 3,
            scores.len()
        )));
    }
    let num_arcs = scores.len();

    let row_splits = vec_i64(&tensors, "aux_row_splits")?;
    let aux_values = vec_i64(&tensors, "aux_values")?;
    if has_aux {
        let valid = row_splits.len() == num_arcs + 1
            && row_splits.first() == Some(&0)
            && row_splits.last() == Some(&(aux_values.len() as i64))
            && row_splits.windows(2).all(|w| w[0] <= w[1]);
        if !valid {
            return Err(malformed(format!("{}: inconsistent aux labels", path.display())));
        }
    } else if !row_splits.is_empty() || !aux_values.is_empty() {
        return Err(malformed(format!(
            "{}: acceptor carries output labels",
            path.display()
        )));
    }

    let mut states = vec![State::default(); num_states];
    for (i, chunk) in arcs.chunks_exact(3).enumerate() {
        let src = state_id(chunk[0], num_states)?;
        let dst = state_id(chunk[1], num_states)?;
        let aux = if has_aux {
            aux_values[row_splits[i] as usize..row_splits[i + 1] as usize]
                .iter()
                .map(|&l| l as i32)
                .collect()
        } else {
            Vec::new()
        };
        states[src as usize]
            .arcs
            .push(Arc::with_aux(chunk[2] as i32, aux, scores[i], dst));
    }

    let finals = vec_i64(&tensors, "finals")?;
    let final_weights = vec_f32(&tensors, "final_weights")?;
    if finals.len() != final_weights.len() {
        return Err(malformed(format!("{}: final weights mismatch", path.display())));
    }
    for (&s, &w) in finals.iter().zip(&final_weights) {
        states[state_id(s, num_states)? as usize].final_weight = Some(w);
    }

    let start = if start < 0 {
        None
    } else {
        Some(state_id(start, num_states)?)
    };

    Ok(Fsa::from_parts(states, start, has_aux))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsa::EPSILON;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("wfst-io-{}-{name}", std::process::id()))
    }

    #[test]
    fn test_round_trip_transducer() {
        let mut fst = Fsa::transducer();
        for _ in 0..3 {
            fst.add_state();
        }
        fst.set_start(0).unwrap();
        fst.set_final(2, 0.5).unwrap();
        fst.add_arc(0, Arc::with_aux(1, vec![10, 11], 0.25, 1)).unwrap();
        fst.add_arc(1, Arc::with_aux(EPSILON, vec![], 1.0, 2)).unwrap();

        let path = temp_path("fst.safetensors");
        save(&fst, &path).unwrap();
        let loaded = load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, fst);
    }

    #[test]
    fn test_round_trip_empty() {
        let fsa = Fsa::acceptor();
        let path = temp_path("empty.safetensors");
        save(&fsa, &path).unwrap();
        let loaded = load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert!(loaded.is_empty());
        assert!(!loaded.has_aux_labels());
    }

    #[test]
    fn test_missing_file() {
        assert!(load(temp_path("does-not-exist.pt")).is_err());
    }
}
