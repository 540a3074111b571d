//! Core automaton type.
//!
//! States are dense `u32` ids. Every arc carries an input `label`, an
//! optional output-label sequence (`aux`) and a tropical cost. Label `0`
//! is epsilon. An automaton either has an output-label layer
//! (`has_aux_labels`, i.e. it is a transducer) or it is a plain acceptor
//! whose arcs all have empty `aux`.

use crate::error::{FsaError, FsaResult};

pub type Label = i32;
pub type StateId = u32;
pub type Weight = f32;

pub const EPSILON: Label = 0;

/// Tolerance used when comparing tropical weights.
pub const WEIGHT_DELTA: Weight = 1.0 / 1024.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Arc {
    pub label: Label,
    /// Output labels emitted by this arc (empty = epsilon output).
    pub aux: Vec<Label>,
    pub weight: Weight,
    pub nextstate: StateId,
}

impl Arc {
    pub fn new(label: Label, weight: Weight, nextstate: StateId) -> Self {
        Self {
            label,
            aux: Vec::new(),
            weight,
            nextstate,
        }
    }

    pub fn with_aux(label: Label, aux: Vec<Label>, weight: Weight, nextstate: StateId) -> Self {
        Self {
            label,
            aux,
            weight,
            nextstate,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct State {
    pub arcs: Vec<Arc>,
    pub final_weight: Option<Weight>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fsa {
    states: Vec<State>,
    start: Option<StateId>,
    has_aux: bool,
    arc_sorted: bool,
}

impl Fsa {
    /// Empty acceptor (no output-label layer).
    pub fn acceptor() -> Self {
        Self::with_aux_layer(false)
    }

    /// Empty transducer.
    pub fn transducer() -> Self {
        Self::with_aux_layer(true)
    }

    pub fn with_aux_layer(has_aux: bool) -> Self {
        Self {
            states: Vec::new(),
            start: None,
            has_aux,
            arc_sorted: true,
        }
    }

    pub fn add_state(&mut self) -> StateId {
        self.states.push(State::default());
        (self.states.len() - 1) as StateId
    }

    /// Make sure states `0..n` exist.
    pub fn reserve_states(&mut self, n: usize) {
        if self.states.len() < n {
            self.states.resize_with(n, State::default);
        }
    }

    fn check_state(&self, s: StateId) -> FsaResult<()> {
        if (s as usize) < self.states.len() {
            Ok(())
        } else {
            Err(FsaError::MalformedInput(format!(
                "state {s} out of range (num_states = {})",
                self.states.len()
            )))
        }
    }

    pub fn set_start(&mut self, s: StateId) -> FsaResult<()> {
        self.check_state(s)?;
        self.start = Some(s);
        Ok(())
    }

    pub fn set_final(&mut self, s: StateId, weight: Weight) -> FsaResult<()> {
        self.check_state(s)?;
        self.states[s as usize].final_weight = Some(weight);
        Ok(())
    }

    pub fn add_arc(&mut self, src: StateId, arc: Arc) -> FsaResult<()> {
        self.check_state(src)?;
        self.check_state(arc.nextstate)?;
        if !self.has_aux && !arc.aux.is_empty() {
            return Err(FsaError::MalformedInput(format!(
                "acceptor arc from state {src} carries output labels {:?}",
                arc.aux
            )));
        }
        let arcs = &mut self.states[src as usize].arcs;
        if let Some(last) = arcs.last() {
            if last.label > arc.label {
                self.arc_sorted = false;
            }
        }
        arcs.push(arc);
        Ok(())
    }

    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    pub fn num_arcs(&self) -> usize {
        self.states.iter().map(|s| s.arcs.len()).sum()
    }

    pub fn start(&self) -> Option<StateId> {
        self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start.is_none()
    }

    pub fn final_weight(&self, s: StateId) -> Option<Weight> {
        self.states.get(s as usize).and_then(|st| st.final_weight)
    }

    pub fn is_final(&self, s: StateId) -> bool {
        self.final_weight(s).is_some()
    }

    pub fn arcs(&self, s: StateId) -> &[Arc] {
        self.states
            .get(s as usize)
            .map_or(&[][..], |st| st.arcs.as_slice())
    }

    pub fn states(&self) -> &[State] {
        &self.states
    }

    /// True if the automaton carries an output-label layer.
    pub fn has_aux_labels(&self) -> bool {
        self.has_aux
    }

    pub fn is_arc_sorted(&self) -> bool {
        self.arc_sorted
    }

    /// Sort each state's arcs by input label (stable).
    pub fn arc_sort(&mut self) {
        for state in &mut self.states {
            state.arcs.sort_by_key(|a| a.label);
        }
        self.arc_sorted = true;
    }

    /// Arcs of `s` whose input label equals `label`. Requires [`Fsa::arc_sort`].
    pub fn arcs_with_label(&self, s: StateId, label: Label) -> &[Arc] {
        let arcs = self.arcs(s);
        let lo = arcs.partition_point(|a| a.label < label);
        let hi = lo + arcs[lo..].partition_point(|a| a.label == label);
        &arcs[lo..hi]
    }

    /// Swap input and output labels.
    ///
    /// An empty output becomes an epsilon input. An arc emitting `n > 1`
    /// labels is expanded into a chain of `n` arcs through `n - 1` new
    /// states: the first arc carries the weight and the input label as
    /// its output, the rest have zero weight and no output.
    pub fn invert(&self) -> FsaResult<Fsa> {
        if !self.has_aux {
            return Err(FsaError::Unsupported(
                "invert requires an automaton with an output-label layer".into(),
            ));
        }
        let mut out = Fsa::transducer();
        out.reserve_states(self.states.len());
        for (s, state) in self.states.iter().enumerate() {
            out.states[s].final_weight = state.final_weight;
            for arc in &state.arcs {
                let aux = if arc.label == EPSILON {
                    Vec::new()
                } else {
                    vec![arc.label]
                };
                let Some((&first, rest)) = arc.aux.split_first() else {
                    out.states[s]
                        .arcs
                        .push(Arc::with_aux(EPSILON, aux, arc.weight, arc.nextstate));
                    continue;
                };

                let mut src = s as StateId;
                let mut label = first;
                let (mut weight, mut aux) = (arc.weight, aux);
                for &next_label in rest {
                    let mid = out.add_state();
                    out.states[src as usize]
                        .arcs
                        .push(Arc::with_aux(label, std::mem::take(&mut aux), weight, mid));
                    (src, label, weight) = (mid, next_label, 0.0);
                }
                out.states[src as usize]
                    .arcs
                    .push(Arc::with_aux(label, aux, weight, arc.nextstate));
            }
        }
        out.start = self.start;
        out.arc_sorted = false;
        Ok(out)
    }

    /// True if no state has two outgoing arcs with the same input label.
    pub fn is_deterministic(&self) -> bool {
        self.states.iter().all(|state| {
            let mut labels: Vec<Label> = state.arcs.iter().map(|a| a.label).collect();
            labels.sort_unstable();
            labels.windows(2).all(|w| w[0] != w[1])
        })
    }

    pub(crate) fn from_parts(states: Vec<State>, start: Option<StateId>, has_aux: bool) -> Self {
        let arc_sorted = states
            .iter()
            .all(|st| st.arcs.windows(2).all(|w| w[0].label <= w[1].label));
        Self {
            states,
            start,
            has_aux,
            arc_sorted,
        }
    }
}
