//! Trimming: keep only states that are both accessible and co-accessible.

use std::collections::VecDeque;

use crate::fsa::{Fsa, State, StateId};

/// Remove states unreachable from the start state or from which no final
/// state can be reached. Surviving states keep their relative order.
///
/// An automaton whose start state is not co-accessible accepts nothing and
/// comes back empty.
pub fn connect(fsa: &Fsa) -> Fsa {
    let n = fsa.num_states();
    let Some(start) = fsa.start() else {
        return Fsa::with_aux_layer(fsa.has_aux_labels());
    };

    let mut accessible = vec![false; n];
    let mut queue = VecDeque::new();
    accessible[start as usize] = true;
    queue.push_back(start);
    while let Some(s) = queue.pop_front() {
        for arc in fsa.arcs(s) {
            let d = arc.nextstate as usize;
            if !accessible[d] {
                accessible[d] = true;
                queue.push_back(arc.nextstate);
            }
        }
    }

    let mut reverse: Vec<Vec<StateId>> = vec![Vec::new(); n];
    for (s, state) in fsa.states().iter().enumerate() {
        for arc in &state.arcs {
            reverse[arc.nextstate as usize].push(s as StateId);
        }
    }
    let mut coaccessible = vec![false; n];
    for s in 0..n {
        if fsa.is_final(s as StateId) {
            coaccessible[s] = true;
            queue.push_back(s as StateId);
        }
    }
    while let Some(s) = queue.pop_front() {
        for &p in &reverse[s as usize] {
            if !coaccessible[p as usize] {
                coaccessible[p as usize] = true;
                queue.push_back(p);
            }
        }
    }

    if !coaccessible[start as usize] {
        return Fsa::with_aux_layer(fsa.has_aux_labels());
    }

    let mut new_id: Vec<Option<StateId>> = vec![None; n];
    let mut next = 0;
    for s in 0..n {
        if accessible[s] && coaccessible[s] {
            new_id[s] = Some(next);
            next += 1;
        }
    }

    let mut states = Vec::with_capacity(next as usize);
    for (s, state) in fsa.states().iter().enumerate() {
        if new_id[s].is_none() {
            continue;
        }
        let arcs = state
            .arcs
            .iter()
            .filter_map(|arc| {
                new_id[arc.nextstate as usize].map(|d| {
                    let mut arc = arc.clone();
                    arc.nextstate = d;
                    arc
                })
            })
            .collect();
        states.push(State {
            arcs,
            final_weight: state.final_weight,
        });
    }

    Fsa::from_parts(states, new_id[start as usize], fsa.has_aux_labels())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsa::Arc;

    #[test]
    fn test_connect_removes_dead_and_unreachable() {
        let mut fsa = Fsa::acceptor();
        for _ in 0..5 {
            fsa.add_state();
        }
        fsa.set_start(0).unwrap();
        fsa.set_final(2, 0.0).unwrap();
        fsa.add_arc(0, Arc::new(1, 0.0, 1)).unwrap();
        fsa.add_arc(1, Arc::new(2, 0.0, 2)).unwrap();
        // dead end
        fsa.add_arc(0, Arc::new(3, 0.0, 3)).unwrap();
        // unreachable
        fsa.add_arc(4, Arc::new(4, 0.0, 2)).unwrap();

        let trimmed = connect(&fsa);
        assert_eq!(trimmed.num_states(), 3);
        assert_eq!(trimmed.num_arcs(), 2);
        assert_eq!(trimmed.start(), Some(0));
        assert!(trimmed.is_final(2));
    }

    #[test]
    fn test_connect_empty_language() {
        let mut fsa = Fsa::acceptor();
        let s0 = fsa.add_state();
        let s1 = fsa.add_state();
        fsa.set_start(s0).unwrap();
        fsa.add_arc(s0, Arc::new(1, 0.0, s1)).unwrap();

        let trimmed = connect(&fsa);
        assert!(trimmed.is_empty());
        assert_eq!(trimmed.num_states(), 0);
    }
}
