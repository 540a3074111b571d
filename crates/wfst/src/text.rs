//! OpenFst text format.
//!
//! Arc lines are `src dst label [weight]` for acceptors and
//! `src dst ilabel olabel [weight]` for transducers; final-state lines are
//! `state [weight]`. The source state of the first line is the start state.
//! Blank lines and `#` comments are ignored.

use std::fmt::Write as _;

use crate::error::{FsaError, FsaResult};
use crate::fsa::{Arc, EPSILON, Fsa, Label, StateId, Weight};

enum Line {
    Arc {
        src: StateId,
        dst: StateId,
        label: Label,
        aux: Option<Label>,
        weight: Weight,
    },
    Final {
        state: StateId,
        weight: Weight,
    },
}

fn parse_field<T: std::str::FromStr>(field: &str, what: &str, line: usize) -> FsaResult<T> {
    field.parse().map_err(|_| FsaError::Parse {
        line,
        message: format!("bad {what} `{field}`"),
    })
}

fn parse_line(fields: &[&str], acceptor: bool, line: usize) -> FsaResult<Line> {
    let state = |i: usize| parse_field::<StateId>(fields[i], "state", line);
    let label = |i: usize| parse_field::<Label>(fields[i], "label", line);
    let weight = |i: usize| parse_field::<Weight>(fields[i], "weight", line);

    match (acceptor, fields.len()) {
        (_, 1) => Ok(Line::Final {
            state: state(0)?,
            weight: 0.0,
        }),
        (_, 2) => Ok(Line::Final {
            state: state(0)?,
            weight: weight(1)?,
        }),
        (true, 3 | 4) => Ok(Line::Arc {
            src: state(0)?,
            dst: state(1)?,
            label: label(2)?,
            aux: None,
            weight: if fields.len() == 4 { weight(3)? } else { 0.0 },
        }),
        (false, 4 | 5) => Ok(Line::Arc {
            src: state(0)?,
            dst: state(1)?,
            label: label(2)?,
            aux: Some(label(3)?),
            weight: if fields.len() == 5 { weight(4)? } else { 0.0 },
        }),
        (_, n) => Err(FsaError::Parse {
            line,
            message: format!(
                "{n} fields is not valid for an {}",
                if acceptor { "acceptor" } else { "transducer" }
            ),
        }),
    }
}

/// Parse OpenFst text. With `acceptor = true` the result has no
/// output-label layer.
pub fn from_openfst(text: &str, acceptor: bool) -> FsaResult<Fsa> {
    let mut fsa = Fsa::with_aux_layer(!acceptor);
    let mut start: Option<StateId> = None;

    for (idx, raw) in text.lines().enumerate() {
        let lineno = idx + 1;
        let content = raw.split('#').next().unwrap_or("").trim();
        if content.is_empty() {
            continue;
        }
        let fields: Vec<&str> = content.split_whitespace().collect();
        match parse_line(&fields, acceptor, lineno)? {
            Line::Arc {
                src,
                dst,
                label,
                aux,
                weight,
            } => {
                start.get_or_insert(src);
                fsa.reserve_states(src.max(dst) as usize + 1);
                let aux = match aux {
                    Some(EPSILON) | None => Vec::new(),
                    Some(l) => vec![l],
                };
                fsa.add_arc(src, Arc::with_aux(label, aux, weight, dst))?;
            }
            Line::Final { state, weight } => {
                start.get_or_insert(state);
                fsa.reserve_states(state as usize + 1);
                fsa.set_final(state, weight)?;
            }
        }
    }

    if let Some(s) = start {
        fsa.set_start(s)?;
    }
    Ok(fsa)
}

/// Render in OpenFst text; the start state's arcs come first.
///
/// Arcs emitting more than one output label have no text representation.
pub fn to_openfst(fsa: &Fsa) -> FsaResult<String> {
    let mut out = String::new();
    let Some(start) = fsa.start() else {
        return Ok(out);
    };
    let order = std::iter::once(start).chain((0..fsa.num_states() as StateId).filter(|&s| s != start));
    let mut finals = String::new();
    for s in order {
        for arc in fsa.arcs(s) {
            if fsa.has_aux_labels() {
                if arc.aux.len() > 1 {
                    return Err(FsaError::Unsupported(format!(
                        "arc from state {s} emits {} output labels",
                        arc.aux.len()
                    )));
                }
                let olabel = arc.aux.first().copied().unwrap_or(EPSILON);
                let _ = writeln!(
                    out,
                    "{s} {} {} {olabel} {}",
                    arc.nextstate, arc.label, arc.weight
                );
            } else {
                let _ = writeln!(out, "{s} {} {} {}", arc.nextstate, arc.label, arc.weight);
            }
        }
        if let Some(fw) = fsa.final_weight(s) {
            let _ = writeln!(finals, "{s} {fw}");
        }
    }
    if fsa.arcs(start).is_empty() && fsa.is_final(start) {
        // the first line must name the start state
        return Ok(finals);
    }
    out.push_str(&finals);
    Ok(out)
}
