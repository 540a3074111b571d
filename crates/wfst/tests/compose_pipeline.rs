//! Intersect, connect and determinize a small lexicon with a grammar,
//! then persist the result.

use wfst::{accepted_paths, connect, determinize, from_openfst, intersect, io};

// word -> phones lexicon, inverted: words on the input side
const LEXICON: &str = "\
0 1 1 3
1 0 0 4
0 2 2 3
2 0 0 5
0
";

const GRAMMAR: &str = "\
0 1 1 0.5
0 1 2 1.5
1
";

#[test]
fn test_compose_and_determinize() {
    let mut lexicon = from_openfst(LEXICON, false).unwrap();
    lexicon.arc_sort();
    let mut grammar = from_openfst(GRAMMAR, true).unwrap();
    grammar.arc_sort();

    let composed = connect(&intersect(&lexicon, &grammar).unwrap());
    assert!(!composed.is_empty());
    assert!(composed.has_aux_labels());

    let det = determinize(&composed).unwrap();
    assert!(det.is_deterministic());

    let mut paths = accepted_paths(&det, 16).unwrap();
    paths.sort_by(|a, b| a.labels.cmp(&b.labels));
    assert_eq!(paths.len(), 2);
    assert_eq!(paths[0].labels, vec![1]);
    assert_eq!(paths[0].aux, vec![3, 4]);
    assert!((paths[0].weight - 0.5).abs() < 1e-6);
    assert_eq!(paths[1].labels, vec![2]);
    assert_eq!(paths[1].aux, vec![3, 5]);
    assert!((paths[1].weight - 1.5).abs() < 1e-6);

    let path = std::env::temp_dir().join(format!("wfst-pipeline-{}.pt", std::process::id()));
    io::save(&det, &path).unwrap();
    let loaded = io::load(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(loaded, det);
}
