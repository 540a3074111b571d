//! Weighted finite-state automata in the tropical semiring.
//!
//! Just enough of an FSA toolkit to build a static decoding graph:
//! intersection (composition on input labels), determinization with
//! epsilon removal, connection, OpenFst text I/O and a tensor-backed
//! binary format.

pub mod connect;
pub mod determinize;
pub mod error;
pub mod fsa;
pub mod intersect;
pub mod io;
pub mod paths;
pub mod text;

pub use connect::connect;
pub use determinize::{DEFAULT_MAX_STATES, determinize, determinize_with_limit};
pub use error::{FsaError, FsaResult};
pub use fsa::{Arc, EPSILON, Fsa, Label, State, StateId, Weight};
pub use intersect::intersect;
pub use paths::{AcceptedPath, accepted_paths};
pub use text::{from_openfst, to_openfst};
