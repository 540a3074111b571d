//! Weighted intersection of two automata on their input labels.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::{FsaError, FsaResult};
use crate::fsa::{Arc, EPSILON, Fsa, State, StateId};

/// Product state: (state in `a`, state in `b`, epsilon filter).
///
/// Filter `1` means the last move was an epsilon move of `b` alone; `a`
/// may not take an epsilon move alone until the next synchronized step.
/// This keeps exactly one interleaving of epsilon moves per path pair.
type PairState = (StateId, StateId, u8);

/// Synchronized product of `a` and `b` matching on input labels.
///
/// Non-epsilon labels must match on both sides; epsilon arcs advance one
/// side alone. Weights add, output labels of `a` come before those of `b`.
/// Both inputs must be arc-sorted.
pub fn intersect(a: &Fsa, b: &Fsa) -> FsaResult<Fsa> {
    if !a.is_arc_sorted() || !b.is_arc_sorted() {
        return Err(FsaError::Unsupported(
            "intersect requires arc-sorted inputs".into(),
        ));
    }

    let has_aux = a.has_aux_labels() || b.has_aux_labels();
    let (Some(sa), Some(sb)) = (a.start(), b.start()) else {
        return Ok(Fsa::with_aux_layer(has_aux));
    };

    let mut ids: FxHashMap<PairState, StateId> = FxHashMap::default();
    let mut states: Vec<State> = Vec::new();
    let mut queue: VecDeque<PairState> = VecDeque::new();

    let mut intern = |key: PairState, states: &mut Vec<State>, queue: &mut VecDeque<PairState>| {
        *ids.entry(key).or_insert_with(|| {
            states.push(State::default());
            queue.push_back(key);
            (states.len() - 1) as StateId
        })
    };

    let start = intern((sa, sb, 0), &mut states, &mut queue);

    while let Some(key @ (qa, qb, filter)) = queue.pop_front() {
        let src = intern(key, &mut states, &mut queue);
        let mut arcs = Vec::new();

        for arc_a in a.arcs(qa) {
            if arc_a.label == EPSILON {
                if filter == 0 {
                    let dest = intern((arc_a.nextstate, qb, 0), &mut states, &mut queue);
                    arcs.push(Arc::with_aux(EPSILON, arc_a.aux.clone(), arc_a.weight, dest));
                }
                continue;
            }
            for arc_b in b.arcs_with_label(qb, arc_a.label) {
                let dest = intern((arc_a.nextstate, arc_b.nextstate, 0), &mut states, &mut queue);
                let mut aux = arc_a.aux.clone();
                aux.extend_from_slice(&arc_b.aux);
                arcs.push(Arc::with_aux(arc_a.label, aux, arc_a.weight + arc_b.weight, dest));
            }
        }

        for arc_b in b.arcs_with_label(qb, EPSILON) {
            let dest = intern((qa, arc_b.nextstate, 1), &mut states, &mut queue);
            arcs.push(Arc::with_aux(EPSILON, arc_b.aux.clone(), arc_b.weight, dest));
        }

        arcs.sort_by_key(|arc| arc.label);
        let state = &mut states[src as usize];
        state.arcs = arcs;
        if let (Some(fa), Some(fb)) = (a.final_weight(qa), b.final_weight(qb)) {
            state.final_weight = Some(fa + fb);
        }
    }

    debug!(
        "intersect: {} x {} states -> {} states",
        a.num_states(),
        b.num_states(),
        states.len()
    );

    Ok(Fsa::from_parts(states, Some(start), has_aux))
}
