//! Reference kernels over `ArrayD<f64>`.
//!
//! Realized operators hold integers in `f64` storage. Every integer they
//! produce fits in 53 bits, so the arithmetic is exact.

use crate::errors::{QuantizeError, Result};
use crate::graph::{Conv2dParams, Node, Op, PoolParams, Tensor};
use crate::quantization::fixed_point::{self, ScaleExp};
use crate::transform::shape::{broadcast, reshape_target, window_out};
use ndarray::{s, Array2, Array4, ArrayView2, ArrayView4, Axis, Ix2, Ix4, IxDyn, Slice};

/// Evaluate one non-source node on its input values.
pub fn eval(node: &Node, inputs: &[&Tensor]) -> Result<Tensor> {
    let name = node.name.as_str();
    match &node.op {
        Op::Placeholder { .. } | Op::Constant => Err(QuantizeError::Other(format!(
            "source node '{name}' has no kernel"
        ))),

        Op::Conv2d(p) => conv2d(name, inputs[0], inputs[1], inputs.get(2).copied(), p),
        Op::Dense => dense(name, inputs[0], inputs[1], inputs.get(2).copied()),
        Op::Relu => Ok(inputs[0].mapv(|v| v.max(0.0))),
        Op::Clip { a_min, a_max } => Ok(inputs[0].mapv(|v| v.clamp(*a_min, *a_max))),
        Op::Add => binary(name, inputs[0], inputs[1], Arith::Add),
        Op::Sub => binary(name, inputs[0], inputs[1], Arith::Sub),
        Op::Mul => binary(name, inputs[0], inputs[1], Arith::Mul),
        Op::MaxPool2d(p) => max_pool2d(name, inputs[0], p),

        Op::Flatten => {
            let x = inputs[0];
            let n = x.shape().first().copied().unwrap_or(1);
            let rest = x.len().checked_div(n).unwrap_or(0);
            reshape(name, x, &[n, rest])
        }
        Op::Reshape { shape } => {
            let target = reshape_target(inputs[0].shape(), shape)
                .map_err(|r| QuantizeError::shape(format!("node '{name}': {r}")))?;
            reshape(name, inputs[0], &target)
        }
        Op::Transpose { axes } => {
            if axes.len() != inputs[0].ndim() {
                return Err(QuantizeError::shape(format!("node '{name}': bad transpose axes {axes:?}")));
            }
            Ok(inputs[0].view().permuted_axes(axes.as_slice()).to_owned())
        }
        Op::Concat { axis } => {
            let views: Vec<_> = inputs.iter().map(|t| t.view()).collect();
            ndarray::concatenate(Axis(*axis), &views)
                .map_err(|e| QuantizeError::shape(format!("node '{name}': {e}")))
        }
        Op::Slice { axis, begin, end } => {
            let x = inputs[0];
            if *axis >= x.ndim() || begin >= end || *end > x.shape()[*axis] {
                return Err(QuantizeError::shape(format!("node '{name}': slice out of range")));
            }
            Ok(x.slice_axis(Axis(*axis), Slice::from(*begin..*end)).to_owned())
        }
        Op::Softmax { axis } => softmax(name, inputs[0], *axis),

        Op::RightShift { shift_bit, precision } => {
            Ok(inputs[0].mapv(|v| fixed_point::right_shift(v as i64, *shift_bit, *precision) as f64))
        }
        Op::LeftShift { shift_bit, precision } => {
            Ok(inputs[0].mapv(|v| fixed_point::left_shift(v as i64, *shift_bit, *precision) as f64))
        }
        Op::CvmClip { precision } => {
            Ok(inputs[0].mapv(|v| fixed_point::clip(v as i64, *precision) as f64))
        }
        Op::Quantize { scale_exp, precision } => {
            let scale = ScaleExp(*scale_exp).value();
            Ok(inputs[0].mapv(|v| fixed_point::clip((v * scale).round() as i64, *precision) as f64))
        }
        Op::Dequantize { scale_exp } => {
            let scale = ScaleExp(*scale_exp).value();
            Ok(inputs[0].mapv(|v| v / scale))
        }
        Op::SoftmaxLut { axis, alpha, precision } => {
            softmax_lut(name, inputs[0], inputs[1], *axis, *alpha, *precision)
        }
    }
}

fn as4<'a>(name: &str, t: &'a Tensor) -> Result<ArrayView4<'a, f64>> {
    t.view()
        .into_dimensionality::<Ix4>()
        .map_err(|_| QuantizeError::shape(format!("node '{name}': expected a 4-D tensor, got {:?}", t.shape())))
}

fn as2<'a>(name: &str, t: &'a Tensor) -> Result<ArrayView2<'a, f64>> {
    t.view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| QuantizeError::shape(format!("node '{name}': expected a 2-D tensor, got {:?}", t.shape())))
}

fn conv2d(name: &str, x: &Tensor, w: &Tensor, bias: Option<&Tensor>, p: &Conv2dParams) -> Result<Tensor> {
    let x = as4(name, x)?;
    let w = as4(name, w)?;
    let (n, c, h, wd) = x.dim();
    let (o, wc, kh, kw) = w.dim();
    if c != wc {
        return Err(QuantizeError::ShapeMismatch {
            name: name.to_string(),
            expected: vec![o, c, kh, kw],
            actual: w.shape().to_vec(),
        });
    }
    let too_big = || QuantizeError::shape(format!("node '{name}': kernel larger than input"));
    let oh = window_out(h, kh, p.strides[0], p.padding[0], p.dilation[0]).ok_or_else(too_big)?;
    let ow = window_out(wd, kw, p.strides[1], p.padding[1], p.dilation[1]).ok_or_else(too_big)?;

    let bias: Vec<f64> = bias.map(|t| t.iter().copied().collect()).unwrap_or_default();
    let mut out = Array4::<f64>::zeros((n, o, oh, ow));
    for b in 0..n {
        for oc in 0..o {
            let init = bias.get(oc).copied().unwrap_or(0.0);
            for i in 0..oh {
                for j in 0..ow {
                    let mut acc = init;
                    for ic in 0..c {
                        for ki in 0..kh {
                            let y = (i * p.strides[0] + ki * p.dilation[0]) as isize - p.padding[0] as isize;
                            if y < 0 || y >= h as isize {
                                continue;
                            }
                            for kj in 0..kw {
                                let xx = (j * p.strides[1] + kj * p.dilation[1]) as isize - p.padding[1] as isize;
                                if xx < 0 || xx >= wd as isize {
                                    continue;
                                }
                                acc += x[[b, ic, y as usize, xx as usize]] * w[[oc, ic, ki, kj]];
                            }
                        }
                    }
                    out[[b, oc, i, j]] = acc;
                }
            }
        }
    }
    Ok(out.into_dyn())
}

fn dense(name: &str, x: &Tensor, w: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    let x = as2(name, x)?;
    let w = as2(name, w)?;
    if x.ncols() != w.ncols() {
        return Err(QuantizeError::ShapeMismatch {
            name: name.to_string(),
            expected: vec![w.nrows(), x.ncols()],
            actual: w.shape().to_vec(),
        });
    }
    let mut out: Array2<f64> = x.dot(&w.t());
    if let Some(b) = bias {
        if b.len() != out.ncols() {
            return Err(QuantizeError::ShapeMismatch {
                name: name.to_string(),
                expected: vec![out.ncols()],
                actual: b.shape().to_vec(),
            });
        }
        for mut row in out.rows_mut() {
            row.iter_mut().zip(b.iter()).for_each(|(v, bv)| *v += bv);
        }
    }
    Ok(out.into_dyn())
}

#[derive(Clone, Copy)]
enum Arith {
    Add,
    Sub,
    Mul,
}

fn binary(name: &str, a: &Tensor, b: &Tensor, arith: Arith) -> Result<Tensor> {
    if broadcast(a.shape(), b.shape()).is_none() {
        return Err(QuantizeError::ShapeMismatch {
            name: name.to_string(),
            expected: a.shape().to_vec(),
            actual: b.shape().to_vec(),
        });
    }
    Ok(match arith {
        Arith::Add => a + b,
        Arith::Sub => a - b,
        Arith::Mul => a * b,
    })
}

fn max_pool2d(name: &str, x: &Tensor, p: &PoolParams) -> Result<Tensor> {
    let x = as4(name, x)?;
    let (n, c, h, w) = x.dim();
    let too_big = || QuantizeError::shape(format!("node '{name}': pool window larger than input"));
    let oh = window_out(h, p.kernel[0], p.strides[0], p.padding[0], 1).ok_or_else(too_big)?;
    let ow = window_out(w, p.kernel[1], p.strides[1], p.padding[1], 1).ok_or_else(too_big)?;

    let mut out = Array4::<f64>::from_elem((n, c, oh, ow), f64::NEG_INFINITY);
    for ((b, ch, i, j), v) in out.indexed_iter_mut() {
        let y0 = (i * p.strides[0]) as isize - p.padding[0] as isize;
        let x0 = (j * p.strides[1]) as isize - p.padding[1] as isize;
        let ys = y0.max(0) as usize..((y0 + p.kernel[0] as isize).min(h as isize)).max(0) as usize;
        let xs = x0.max(0) as usize..((x0 + p.kernel[1] as isize).min(w as isize)).max(0) as usize;
        let window = x.slice(s![b, ch, ys, xs]);
        *v = window.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    }
    Ok(out.into_dyn())
}

fn reshape(name: &str, x: &Tensor, shape: &[usize]) -> Result<Tensor> {
    x.to_shape(IxDyn(shape))
        .map(|v| v.into_owned())
        .map_err(|e| QuantizeError::shape(format!("node '{name}': {e}")))
}

fn check_axis(name: &str, x: &Tensor, axis: usize) -> Result<()> {
    if axis >= x.ndim() {
        return Err(QuantizeError::shape(format!(
            "node '{name}': axis {axis} out of range for {:?}",
            x.shape()
        )));
    }
    Ok(())
}

fn softmax(name: &str, x: &Tensor, axis: usize) -> Result<Tensor> {
    check_axis(name, x, axis)?;
    let mut out = x.clone();
    for mut lane in out.lanes_mut(Axis(axis)) {
        let max = lane.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|v| v / sum);
    }
    Ok(out)
}

/// Integer softmax: `T[clamp(x - max, -alpha, 0) + alpha]`, normalized to
/// `2^(p-1)` with round-half-up division and a final clip.
fn softmax_lut(name: &str, x: &Tensor, table: &Tensor, axis: usize, alpha: i64, precision: u32) -> Result<Tensor> {
    check_axis(name, x, axis)?;
    if alpha < 0 || table.len() as i64 != alpha + 1 {
        return Err(QuantizeError::shape(format!(
            "node '{name}': table has {} entries, expected {}",
            table.len(),
            alpha + 1
        )));
    }
    let table: Vec<i64> = table.iter().map(|&v| v as i64).collect();
    let one = 1i64 << (precision - 1);
    let hi = fixed_point::max_int(precision);

    let mut out = x.clone();
    for mut lane in out.lanes_mut(Axis(axis)) {
        let max = lane.iter().map(|&v| v as i64).max().unwrap_or(0);
        let e: Vec<i64> = lane
            .iter()
            .map(|&v| table[((v as i64 - max).clamp(-alpha, 0) + alpha) as usize])
            .collect();
        let sum: i64 = e.iter().sum::<i64>().max(1);
        for (o, ei) in lane.iter_mut().zip(&e) {
            *o = ((ei * one + sum / 2) / sum).min(hi) as f64;
        }
    }
    Ok(out)
}
