//! Property-based tests for quantization correctness.
//!
//! Four property families are verified:
//!
//! 1. **Round-trip accuracy**: for any value inside a scale's range,
//!    `|decode(encode(v)) - v| <= 0.5 / scale`.
//!
//! 2. **Shift rounding**: the requantizing right shift equals
//!    `floor(x / 2^s + 1/2)` whenever the result fits.
//!
//! 3. **Calibration monotonicity**: the recorded bound is the running
//!    maximum of every observed batch bound.
//!
//! 4. **Topological order**: graphs built from shuffled nodes, deduplicated
//!    or split always list a node's inputs before the node.

use proptest::prelude::*;
use quantgraph::calibration::TensorStats;
use quantgraph::graph::{Edge, Graph, Node, Op};
use quantgraph::quantization::fixed_point::{clip, decode, encode, max_int, right_shift, scale_for};
use quantgraph::transform::{dedup, split};
use quantgraph::QuantContext;

// ---------------------------------------------------------------------------
// Shared strategies
// ---------------------------------------------------------------------------

/// A random DAG over `[1, 4]` tensors: node `i` is either a relu of one
/// earlier node or the sum of two.
fn dag() -> impl Strategy<Value = Vec<(bool, usize, usize)>> {
    prop::collection::vec((any::<bool>(), any::<usize>(), any::<usize>()), 1..24)
}

fn build_nodes(layout: &[(bool, usize, usize)]) -> Vec<Node> {
    let mut nodes = vec![Node::placeholder("n0", vec![1, 4])];
    for (i, &(binary, a, b)) in layout.iter().enumerate() {
        let id = i + 1;
        let a = Edge::new(format!("n{}", a % id));
        let node = if binary {
            let b = Edge::new(format!("n{}", b % id));
            Node::new(format!("n{id}"), Op::Add, vec![a, b])
        } else {
            Node::new(format!("n{id}"), Op::Relu, vec![a])
        };
        nodes.push(node);
    }
    nodes
}

fn assert_topological(g: &Graph) {
    for (pos, node) in g.nodes().enumerate() {
        for e in &node.inputs {
            let at = g.position(&e.node).expect("input exists");
            assert!(at < pos, "{} used by {} before definition", e.node, node.name);
        }
    }
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn prop_encode_round_trip(precision in 2u32..=24, bound in 1e-3f64..1e4, t in -1.0f64..=1.0) {
        let v = bound * t;
        let scale = scale_for(bound, precision);
        let q = encode(v, scale, precision);
        let err = (decode(q, scale) - v).abs();
        prop_assert!(err <= 0.5 / scale.value() + 1e-9, "v={v} q={q} scale={scale} err={err}");
    }

    #[test]
    fn prop_encode_never_leaves_range(precision in 2u32..=32, k in -20i32..20, v in -1e12f64..1e12) {
        let scale = quantgraph::ScaleExp(k);
        let q = encode(v, scale, precision);
        let hi = max_int(precision);
        prop_assert!(q >= -hi - 1 && q <= hi);
    }

    #[test]
    fn prop_right_shift_rounds_half_up(x in -(1i64 << 30)..(1i64 << 30), s in 1u32..20) {
        let want = (x + (1i64 << (s - 1))).div_euclid(1i64 << s);
        prop_assert_eq!(right_shift(x, s, 32), want);
        prop_assert_eq!(right_shift(x, 0, 32), clip(x, 32));
    }

    #[test]
    fn prop_calibration_is_running_max(bounds in prop::collection::vec(0.0f64..100.0, 1..20)) {
        let mut ctx = QuantContext::new();
        let mut running = 0.0f64;
        for b in bounds {
            ctx.observe("t", b, &TensorStats::from_data(&[b]));
            running = running.max(b);
            prop_assert_eq!(ctx.bound("t"), Some(running));
        }
    }

    #[test]
    fn prop_unordered_graphs_sort_topologically(layout in dag()) {
        let mut nodes = build_nodes(&layout);
        let output = Edge::new(nodes[nodes.len() - 1].name.clone());
        nodes.reverse();
        let g = Graph::from_unordered(nodes, vec![output]).unwrap();
        assert_topological(&g);
        assert_topological(&dedup(&g).unwrap());
    }

    #[test]
    fn prop_split_halves_are_topological(layout in dag(), cut in any::<usize>()) {
        let nodes = build_nodes(&layout);
        let output = Edge::new(nodes[nodes.len() - 1].name.clone());
        let key = nodes[cut % nodes.len()].name.clone();
        let g = Graph::new(nodes, vec![output]).unwrap();
        // a cut that does not separate the graph is an error, never a bad graph
        if let Ok((base, top)) = split(&g, &[key]) {
            assert_topological(&base);
            assert_topological(&top);
        }
    }
}

#[test]
fn test_calibration_example_sequence() {
    let mut ctx = QuantContext::new();
    for b in [3.0, 1.0, 5.0] {
        ctx.observe("x", b, &TensorStats::default());
    }
    assert_eq!(ctx.bound("x"), Some(5.0));
}
