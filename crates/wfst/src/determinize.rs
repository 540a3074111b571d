//! Weighted determinization in the tropical semiring.
//!
//! Each output state is a weighted subset of input states. Every element
//! carries a residual cost and the output labels it still owes. For each
//! input label only the cheapest path into each input state is kept, so a
//! transducer keeps the outputs of its best path (as in max-semiring
//! determinization). Outputs common to all elements are emitted as early
//! as possible; outputs still pending at a final state are flushed through
//! a single epsilon arc into a shared super-final state.
//!
//! Epsilon input arcs are removed on the way: the result has no epsilon
//! arcs except those flush arcs.

use std::collections::{BTreeMap, VecDeque};

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::{FsaError, FsaResult};
use crate::fsa::{Arc, EPSILON, Fsa, Label, State, StateId, WEIGHT_DELTA, Weight};

/// Default upper bound on the number of output states.
pub const DEFAULT_MAX_STATES: usize = 10_000_000;

#[derive(Debug, Clone, PartialEq)]
struct Element {
    state: StateId,
    residual: Weight,
    pending: Vec<Label>,
}

type SubsetKey = Vec<(StateId, i64, Vec<Label>)>;

fn subset_key(subset: &[Element]) -> SubsetKey {
    subset
        .iter()
        .map(|e| {
            (
                e.state,
                (e.residual / WEIGHT_DELTA).round() as i64,
                e.pending.clone(),
            )
        })
        .collect()
}

/// `candidate` is a better way into the same state than `current`.
fn better(candidate: &Element, current: &Element) -> bool {
    if candidate.residual < current.residual - WEIGHT_DELTA {
        return true;
    }
    if candidate.residual > current.residual + WEIGHT_DELTA {
        return false;
    }
    (candidate.pending.len(), &candidate.pending) < (current.pending.len(), &current.pending)
}

/// Epsilon closure keeping the best element per input state, sorted by state.
fn closure(fsa: &Fsa, seeds: Vec<Element>) -> FsaResult<Vec<Element>> {
    let mut best: FxHashMap<StateId, Element> = FxHashMap::default();
    let mut queue: VecDeque<StateId> = VecDeque::new();

    for elem in seeds {
        match best.get(&elem.state) {
            Some(current) if !better(&elem, current) => {}
            _ => {
                queue.push_back(elem.state);
                best.insert(elem.state, elem);
            }
        }
    }

    let budget = (fsa.num_arcs() + 1).saturating_mul(fsa.num_states() + 1);
    let mut relaxations = 0usize;
    while let Some(s) = queue.pop_front() {
        let Some(elem) = best.get(&s).cloned() else {
            continue;
        };
        for arc in fsa.arcs(s) {
            if arc.label != EPSILON {
                continue;
            }
            let mut pending = elem.pending.clone();
            pending.extend_from_slice(&arc.aux);
            let candidate = Element {
                state: arc.nextstate,
                residual: elem.residual + arc.weight,
                pending,
            };
            let improves = best
                .get(&arc.nextstate)
                .is_none_or(|current| better(&candidate, current));
            if improves {
                relaxations += 1;
                if relaxations > budget {
                    return Err(FsaError::Unsupported(
                        "epsilon cycle with negative weight".into(),
                    ));
                }
                best.insert(arc.nextstate, candidate);
                queue.push_back(arc.nextstate);
            }
        }
    }

    let mut subset: Vec<Element> = best.into_values().collect();
    subset.sort_by_key(|e| e.state);
    Ok(subset)
}

/// Length of the longest common prefix of all pending outputs.
fn common_prefix_len(subset: &[Element]) -> usize {
    let Some(first) = subset.first() else {
        return 0;
    };
    let mut len = first.pending.len();
    for e in &subset[1..] {
        len = len.min(
            first
                .pending
                .iter()
                .zip(&e.pending)
                .take_while(|(x, y)| x == y)
                .count(),
        );
    }
    len
}

/// Determinize with [`DEFAULT_MAX_STATES`] as the state budget.
pub fn determinize(fsa: &Fsa) -> FsaResult<Fsa> {
    determinize_with_limit(fsa, DEFAULT_MAX_STATES)
}

/// Determinize, failing with [`FsaError::DeterminizeLimit`] once more than
/// `max_states` output states would be created.
pub fn determinize_with_limit(fsa: &Fsa, max_states: usize) -> FsaResult<Fsa> {
    let has_aux = fsa.has_aux_labels();
    let Some(start) = fsa.start() else {
        return Ok(Fsa::with_aux_layer(has_aux));
    };

    let mut ids: FxHashMap<SubsetKey, StateId> = FxHashMap::default();
    let mut subsets: Vec<Vec<Element>> = Vec::new();
    let mut states: Vec<State> = Vec::new();
    let mut queue: VecDeque<StateId> = VecDeque::new();
    let mut super_final: Option<StateId> = None;

    let start_subset = closure(
        fsa,
        vec![Element {
            state: start,
            residual: 0.0,
            pending: Vec::new(),
        }],
    )?;
    ids.insert(subset_key(&start_subset), 0);
    subsets.push(start_subset);
    states.push(State::default());
    queue.push_back(0);

    while let Some(id) = queue.pop_front() {
        let subset = subsets[id as usize].clone();

        let mut by_label: BTreeMap<Label, Vec<Element>> = BTreeMap::new();
        for elem in &subset {
            for arc in fsa.arcs(elem.state) {
                if arc.label == EPSILON {
                    continue;
                }
                let mut pending = elem.pending.clone();
                pending.extend_from_slice(&arc.aux);
                by_label.entry(arc.label).or_default().push(Element {
                    state: arc.nextstate,
                    residual: elem.residual + arc.weight,
                    pending,
                });
            }
        }

        let mut arcs = Vec::with_capacity(by_label.len() + 1);
        for (label, seeds) in by_label {
            let mut next = closure(fsa, seeds)?;
            let weight = next
                .iter()
                .map(|e| e.residual)
                .fold(Weight::INFINITY, Weight::min);
            let prefix_len = common_prefix_len(&next);
            let emitted: Vec<Label> = next[0].pending[..prefix_len].to_vec();
            for e in &mut next {
                e.residual -= weight;
                e.pending.drain(..prefix_len);
            }

            let key = subset_key(&next);
            let dest = match ids.get(&key) {
                Some(&d) => d,
                None => {
                    if states.len() >= max_states {
                        return Err(FsaError::DeterminizeLimit(max_states));
                    }
                    let d = states.len() as StateId;
                    ids.insert(key, d);
                    subsets.push(next);
                    states.push(State::default());
                    queue.push_back(d);
                    d
                }
            };
            arcs.push(Arc::with_aux(label, emitted, weight, dest));
        }

        let best_final = subset
            .iter()
            .filter_map(|e| fsa.final_weight(e.state).map(|fw| (e, e.residual + fw)))
            .fold(None::<(&Element, Weight)>, |acc, (e, w)| match acc {
                Some((best, bw))
                    if bw < w - WEIGHT_DELTA
                        || (bw <= w + WEIGHT_DELTA
                            && (best.pending.len(), &best.pending)
                                <= (e.pending.len(), &e.pending)) =>
                {
                    Some((best, bw))
                }
                _ => Some((e, w)),
            });

        if let Some((elem, weight)) = best_final {
            if elem.pending.is_empty() {
                states[id as usize].final_weight = Some(weight);
            } else {
                let sf = match super_final {
                    Some(sf) => sf,
                    None => {
                        let sf = states.len() as StateId;
                        states.push(State {
                            arcs: Vec::new(),
                            final_weight: Some(0.0),
                        });
                        // keeps subset ids aligned with state ids
                        subsets.push(Vec::new());
                        super_final = Some(sf);
                        sf
                    }
                };
                arcs.insert(0, Arc::with_aux(EPSILON, elem.pending.clone(), weight, sf));
            }
        }

        states[id as usize].arcs = arcs;
    }

    debug!(
        "determinize: {} states -> {} states",
        fsa.num_states(),
        states.len()
    );

    Ok(Fsa::from_parts(states, Some(0), has_aux))
}
