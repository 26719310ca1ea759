//! Static shape inference.

use crate::errors::{QuantizeError, Result};
use crate::graph::{Graph, Node, Op};
use std::collections::BTreeMap;

/// Output shape of every node, keyed by node name.
///
/// Placeholders must be fully bound (no `-1`).
pub fn infer_shapes(graph: &Graph) -> Result<BTreeMap<String, Vec<usize>>> {
    let mut shapes: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for node in graph.nodes() {
        let inputs = node
            .inputs
            .iter()
            .map(|e| {
                shapes
                    .get(&e.node)
                    .map(Vec::as_slice)
                    .ok_or_else(|| QuantizeError::not_found("node", e.node.clone()))
            })
            .collect::<Result<Vec<&[usize]>>>()?;
        let shape = infer_node(node, &inputs)?;
        shapes.insert(node.name.clone(), shape);
    }
    Ok(shapes)
}

/// Resolve a placeholder shape; every dim must be bound.
pub fn bound_shape(name: &str, shape: &[i64]) -> Result<Vec<usize>> {
    shape
        .iter()
        .enumerate()
        .map(|(axis, &d)| {
            usize::try_from(d).map_err(|_| {
                QuantizeError::shape(format!("input '{name}' has unbound dimension at axis {axis}"))
            })
        })
        .collect()
}

fn infer_node(node: &Node, inputs: &[&[usize]]) -> Result<Vec<usize>> {
    let name = node.name.as_str();
    let err = |reason: String| QuantizeError::shape(format!("node '{name}': {reason}"));

    match &node.op {
        Op::Placeholder { shape } => bound_shape(name, shape),
        Op::Constant => Ok(node.payload().map(|p| p.shape().to_vec()).unwrap_or_default()),

        Op::Conv2d(p) => {
            let (x, w) = (inputs[0], inputs[1]);
            if x.len() != 4 || w.len() != 4 {
                return Err(err(format!("conv2d expects 4-D input and weight, got {x:?} and {w:?}")));
            }
            if x[1] != w[1] {
                return Err(QuantizeError::ShapeMismatch {
                    name: name.to_string(),
                    expected: vec![w[0], x[1], w[2], w[3]],
                    actual: w.to_vec(),
                });
            }
            check_bias(name, inputs, w[0])?;
            let h = window_out(x[2], w[2], p.strides[0], p.padding[0], p.dilation[0]).ok_or_else(|| err("kernel larger than input".into()))?;
            let wd = window_out(x[3], w[3], p.strides[1], p.padding[1], p.dilation[1]).ok_or_else(|| err("kernel larger than input".into()))?;
            Ok(vec![x[0], w[0], h, wd])
        }

        Op::Dense => {
            let (x, w) = (inputs[0], inputs[1]);
            if x.len() != 2 || w.len() != 2 {
                return Err(err(format!("dense expects 2-D input and weight, got {x:?} and {w:?}")));
            }
            if x[1] != w[1] {
                return Err(QuantizeError::ShapeMismatch {
                    name: name.to_string(),
                    expected: vec![w[0], x[1]],
                    actual: w.to_vec(),
                });
            }
            check_bias(name, inputs, w[0])?;
            Ok(vec![x[0], w[0]])
        }

        Op::Relu
        | Op::Clip { .. }
        | Op::Softmax { .. }
        | Op::RightShift { .. }
        | Op::LeftShift { .. }
        | Op::CvmClip { .. }
        | Op::Quantize { .. }
        | Op::Dequantize { .. }
        | Op::SoftmaxLut { .. } => {
            if let Op::Softmax { axis } | Op::SoftmaxLut { axis, .. } = node.op {
                if axis >= inputs[0].len() {
                    return Err(err(format!("axis {axis} out of range for {:?}", inputs[0])));
                }
            }
            Ok(inputs[0].to_vec())
        }

        Op::Add | Op::Sub | Op::Mul => broadcast(inputs[0], inputs[1]).ok_or_else(|| {
            QuantizeError::ShapeMismatch {
                name: name.to_string(),
                expected: inputs[0].to_vec(),
                actual: inputs[1].to_vec(),
            }
        }),

        Op::MaxPool2d(p) => {
            let x = inputs[0];
            if x.len() != 4 {
                return Err(err(format!("max_pool2d expects 4-D input, got {x:?}")));
            }
            let h = window_out(x[2], p.kernel[0], p.strides[0], p.padding[0], 1).ok_or_else(|| err("kernel larger than input".into()))?;
            let w = window_out(x[3], p.kernel[1], p.strides[1], p.padding[1], 1).ok_or_else(|| err("kernel larger than input".into()))?;
            Ok(vec![x[0], x[1], h, w])
        }

        Op::Flatten => {
            let x = inputs[0];
            match x.split_first() {
                Some((&n, rest)) => Ok(vec![n, rest.iter().product()]),
                None => Err(err("cannot flatten a scalar".into())),
            }
        }

        Op::Reshape { shape } => reshape_target(inputs[0], shape).map_err(err),

        Op::Transpose { axes } => {
            let x = inputs[0];
            let mut seen = vec![false; x.len()];
            if axes.len() != x.len() || axes.iter().any(|&a| a >= x.len() || std::mem::replace(&mut seen[a], true)) {
                return Err(err(format!("axes {axes:?} are not a permutation of rank {}", x.len())));
            }
            Ok(axes.iter().map(|&a| x[a]).collect())
        }

        Op::Concat { axis } => {
            let first = inputs[0];
            if *axis >= first.len() {
                return Err(err(format!("axis {axis} out of range for {first:?}")));
            }
            let mut out = first.to_vec();
            out[*axis] = 0;
            for shape in inputs {
                let compatible = shape.len() == first.len()
                    && shape.iter().zip(first).enumerate().all(|(i, (a, b))| i == *axis || a == b);
                if !compatible {
                    return Err(QuantizeError::ShapeMismatch {
                        name: name.to_string(),
                        expected: first.to_vec(),
                        actual: shape.to_vec(),
                    });
                }
                out[*axis] += shape[*axis];
            }
            Ok(out)
        }

        Op::Slice { axis, begin, end } => {
            let x = inputs[0];
            if *axis >= x.len() || begin >= end || *end > x[*axis] {
                return Err(err(format!("slice [{begin}, {end}) on axis {axis} is out of range for {x:?}")));
            }
            let mut out = x.to_vec();
            out[*axis] = end - begin;
            Ok(out)
        }
    }
}

fn check_bias(name: &str, inputs: &[&[usize]], channels: usize) -> Result<()> {
    match inputs.get(2) {
        Some(b) if *b != [channels] => Err(QuantizeError::ShapeMismatch {
            name: name.to_string(),
            expected: vec![channels],
            actual: b.to_vec(),
        }),
        _ => Ok(()),
    }
}

/// Output length of a sliding window, or `None` if the window does not fit.
pub(crate) fn window_out(len: usize, kernel: usize, stride: usize, pad: usize, dilation: usize) -> Option<usize> {
    let span = dilation * (kernel.checked_sub(1)?) + 1;
    let padded = len + 2 * pad;
    if span > padded || stride == 0 {
        return None;
    }
    Some((padded - span) / stride + 1)
}

/// Numpy-style broadcast of two shapes.
pub(crate) fn broadcast(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let dim = |s: &[usize], i: usize| {
        let offset = rank - s.len();
        if i < offset { 1 } else { s[i - offset] }
    };
    (0..rank)
        .map(|i| match (dim(a, i), dim(b, i)) {
            (x, y) if x == y => Some(x),
            (1, y) => Some(y),
            (x, 1) => Some(x),
            _ => None,
        })
        .collect()
}

/// Resolve a reshape target: `0` copies the input dim, one `-1` is inferred.
pub(crate) fn reshape_target(input: &[usize], shape: &[i64]) -> std::result::Result<Vec<usize>, String> {
    let total: usize = input.iter().product();
    let mut out = Vec::with_capacity(shape.len());
    let mut infer = None;
    for (i, &d) in shape.iter().enumerate() {
        match d {
            -1 if infer.is_none() => {
                infer = Some(i);
                out.push(1);
            }
            0 => out.push(*input.get(i).ok_or_else(|| format!("reshape dim {i} copies a missing input dim"))?),
            d if d > 0 => out.push(d as usize),
            _ => return Err(format!("invalid reshape target {shape:?}")),
        }
    }
    let known: usize = out.iter().product();
    if let Some(i) = infer {
        if known == 0 || total % known != 0 {
            return Err(format!("cannot reshape {input:?} into {shape:?}"));
        }
        out[i] = total / known;
    } else if known != total {
        return Err(format!("cannot reshape {input:?} into {shape:?}"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Conv2dParams, GraphBuilder, PoolParams};
    use ndarray::Array;

    #[test]
    fn test_conv_pool_dense_chain() {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x", &[2, 3, 8, 8]);
        let w = b.constant("w", Array::zeros(vec![4, 3, 3, 3]));
        let c = b.op("c", Op::Conv2d(Conv2dParams { padding: [1, 1], ..Default::default() }), &[x, w]);
        let p = b.op("p", Op::MaxPool2d(PoolParams { kernel: [2, 2], strides: [2, 2], padding: [0, 0] }), &[c]);
        let f = b.op("f", Op::Flatten, &[p]);
        let fw = b.constant("fw", Array::zeros(vec![10, 64]));
        let d = b.op("d", Op::Dense, &[f, fw]);
        let g = b.build(vec![d]).unwrap();

        let shapes = infer_shapes(&g).unwrap();
        assert_eq!(shapes["c"], [2, 4, 8, 8]);
        assert_eq!(shapes["p"], [2, 4, 4, 4]);
        assert_eq!(shapes["f"], [2, 64]);
        assert_eq!(shapes["d"], [2, 10]);
    }

    #[test]
    fn test_unbound_placeholder_is_shape_error() {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x", &[-1, 4]);
        let r = b.op("r", Op::Relu, &[x]);
        let g = b.build(vec![r]).unwrap();
        assert!(matches!(infer_shapes(&g), Err(QuantizeError::Shape { .. })));
    }

    #[test]
    fn test_dense_mismatch() {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x", &[1, 4]);
        let w = b.constant("w", Array::zeros(vec![2, 5]));
        let d = b.op("d", Op::Dense, &[x, w]);
        let g = b.build(vec![d]).unwrap();
        assert!(matches!(infer_shapes(&g), Err(QuantizeError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_helpers() {
        assert_eq!(broadcast(&[2, 3], &[3]), Some(vec![2, 3]));
        assert_eq!(broadcast(&[2, 1, 4], &[3, 1]), Some(vec![2, 3, 4]));
        assert_eq!(broadcast(&[2], &[3]), None);
        assert_eq!(reshape_target(&[2, 3, 4], &[0, -1]).unwrap(), [2, 12]);
        assert!(reshape_target(&[2, 3], &[4, -1]).is_err());
    }
}
