//! Operator registry.
//!
//! [`Op`] is a closed tagged union: every rewrite site matches on it
//! exhaustively, so adding an operator is a compile-checked change. Named
//! attribute access ([`Op::attrs`], [`Op::with_attr`]) exists for the places
//! that are driven by configuration data, such as merge-time attribute
//! dependencies and the serialized graph descriptor.

use crate::errors::{QuantizeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

// ===========================================================================
// Attribute values
// ===========================================================================

/// A typed attribute value as it appears in a serialized node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
    Str(String),
}

impl AttrValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttrValue::Int(v) => Some(*v),
            AttrValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Int(v) => Some(*v as f64),
            AttrValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<Vec<i64>> {
        match self {
            AttrValue::Ints(v) => Some(v.clone()),
            AttrValue::Int(v) => Some(vec![*v]),
            AttrValue::Floats(v) if v.iter().all(|x| x.fract() == 0.0) => {
                Some(v.iter().map(|x| *x as i64).collect())
            }
            _ => None,
        }
    }
}

// Floats compare and hash by bit pattern so that `Eq` and `Hash` agree.
impl PartialEq for AttrValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (AttrValue::Int(a), AttrValue::Int(b)) => a == b,
            (AttrValue::Float(a), AttrValue::Float(b)) => a.to_bits() == b.to_bits(),
            (AttrValue::Ints(a), AttrValue::Ints(b)) => a == b,
            (AttrValue::Floats(a), AttrValue::Floats(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (AttrValue::Str(a), AttrValue::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for AttrValue {}

impl Hash for AttrValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            AttrValue::Int(v) => v.hash(state),
            AttrValue::Float(v) => v.to_bits().hash(state),
            AttrValue::Ints(v) => v.hash(state),
            AttrValue::Floats(v) => v.iter().for_each(|x| x.to_bits().hash(state)),
            AttrValue::Str(v) => v.hash(state),
        }
    }
}

// ===========================================================================
// Operator kinds
// ===========================================================================

/// Field-less discriminant of [`Op`], used as a registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Placeholder,
    Constant,
    Conv2d,
    Dense,
    Relu,
    Clip,
    Add,
    Sub,
    Mul,
    MaxPool2d,
    Flatten,
    Reshape,
    Transpose,
    Concat,
    Slice,
    Softmax,
    RightShift,
    LeftShift,
    CvmClip,
    Quantize,
    Dequantize,
    SoftmaxLut,
}

impl OpKind {
    pub const ALL: [OpKind; 22] = [
        OpKind::Placeholder,
        OpKind::Constant,
        OpKind::Conv2d,
        OpKind::Dense,
        OpKind::Relu,
        OpKind::Clip,
        OpKind::Add,
        OpKind::Sub,
        OpKind::Mul,
        OpKind::MaxPool2d,
        OpKind::Flatten,
        OpKind::Reshape,
        OpKind::Transpose,
        OpKind::Concat,
        OpKind::Slice,
        OpKind::Softmax,
        OpKind::RightShift,
        OpKind::LeftShift,
        OpKind::CvmClip,
        OpKind::Quantize,
        OpKind::Dequantize,
        OpKind::SoftmaxLut,
    ];

    pub fn name(self) -> &'static str {
        match self {
            OpKind::Placeholder => "placeholder",
            OpKind::Constant => "constant",
            OpKind::Conv2d => "conv2d",
            OpKind::Dense => "dense",
            OpKind::Relu => "relu",
            OpKind::Clip => "clip",
            OpKind::Add => "add",
            OpKind::Sub => "sub",
            OpKind::Mul => "mul",
            OpKind::MaxPool2d => "max_pool2d",
            OpKind::Flatten => "flatten",
            OpKind::Reshape => "reshape",
            OpKind::Transpose => "transpose",
            OpKind::Concat => "concat",
            OpKind::Slice => "slice",
            OpKind::Softmax => "softmax",
            OpKind::RightShift => "right_shift",
            OpKind::LeftShift => "left_shift",
            OpKind::CvmClip => "cvm_clip",
            OpKind::Quantize => "quantize",
            OpKind::Dequantize => "dequantize",
            OpKind::SoftmaxLut => "softmax_lut",
        }
    }

    /// Operators that only the quantizer and merger emit. A floating graph
    /// entering the pipeline must not contain them.
    pub fn is_realized(self) -> bool {
        matches!(
            self,
            OpKind::RightShift
                | OpKind::LeftShift
                | OpKind::CvmClip
                | OpKind::Quantize
                | OpKind::Dequantize
                | OpKind::SoftmaxLut
        )
    }

    /// Nodes of this kind can be named in a restore policy.
    pub fn is_restorable(self) -> bool {
        !matches!(self, OpKind::Placeholder | OpKind::Constant) && !self.is_realized()
    }

    /// Accepted number of inputs, as an inclusive range.
    pub fn arity(self) -> (usize, usize) {
        match self {
            OpKind::Placeholder | OpKind::Constant => (0, 0),
            OpKind::Conv2d | OpKind::Dense => (2, 3),
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::SoftmaxLut => (2, 2),
            OpKind::Concat => (1, usize::MAX),
            _ => (1, 1),
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OpKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        OpKind::ALL
            .iter()
            .copied()
            .find(|k| k.name() == s)
            .ok_or_else(|| s.to_string())
    }
}

// ===========================================================================
// Operators
// ===========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Conv2dParams {
    pub strides: [usize; 2],
    pub padding: [usize; 2],
    pub dilation: [usize; 2],
}

impl Default for Conv2dParams {
    fn default() -> Self {
        Self { strides: [1, 1], padding: [0, 0], dilation: [1, 1] }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolParams {
    pub kernel: [usize; 2],
    pub strides: [usize; 2],
    pub padding: [usize; 2],
}

/// One operator instance's kind plus its typed parameters.
#[derive(Debug, Clone)]
pub enum Op {
    /// Graph input. `-1` marks an unbound dimension.
    Placeholder { shape: Vec<i64> },
    /// Parameter tensor; the payload lives on the node.
    Constant,
    /// NCHW input, OIHW weight, optional bias `[O]`.
    Conv2d(Conv2dParams),
    /// `[N, in]` input, `[out, in]` weight, optional bias `[out]`.
    Dense,
    Relu,
    Clip { a_min: f64, a_max: f64 },
    Add,
    Sub,
    Mul,
    MaxPool2d(PoolParams),
    Flatten,
    /// `0` copies the input dim, `-1` is inferred.
    Reshape { shape: Vec<i64> },
    Transpose { axes: Vec<usize> },
    Concat { axis: usize },
    /// Half-open range `[begin, end)` along `axis`.
    Slice { axis: usize, begin: usize, end: usize },
    Softmax { axis: usize },
    /// Round-half-up right shift followed by a symmetric clip.
    RightShift { shift_bit: u32, precision: u32 },
    LeftShift { shift_bit: u32, precision: u32 },
    /// Symmetric clip to `±(2^(precision-1) - 1)`.
    CvmClip { precision: u32 },
    /// Real to integer at scale `2^scale_exp`.
    Quantize { scale_exp: i32, precision: u32 },
    /// Integer at scale `2^scale_exp` back to real.
    Dequantize { scale_exp: i32 },
    /// Integer softmax through an exponential lookup table (second input).
    SoftmaxLut { axis: usize, alpha: i64, precision: u32 },
}

impl Op {
    pub fn kind(&self) -> OpKind {
        match self {
            Op::Placeholder { .. } => OpKind::Placeholder,
            Op::Constant => OpKind::Constant,
            Op::Conv2d(_) => OpKind::Conv2d,
            Op::Dense => OpKind::Dense,
            Op::Relu => OpKind::Relu,
            Op::Clip { .. } => OpKind::Clip,
            Op::Add => OpKind::Add,
            Op::Sub => OpKind::Sub,
            Op::Mul => OpKind::Mul,
            Op::MaxPool2d(_) => OpKind::MaxPool2d,
            Op::Flatten => OpKind::Flatten,
            Op::Reshape { .. } => OpKind::Reshape,
            Op::Transpose { .. } => OpKind::Transpose,
            Op::Concat { .. } => OpKind::Concat,
            Op::Slice { .. } => OpKind::Slice,
            Op::Softmax { .. } => OpKind::Softmax,
            Op::RightShift { .. } => OpKind::RightShift,
            Op::LeftShift { .. } => OpKind::LeftShift,
            Op::CvmClip { .. } => OpKind::CvmClip,
            Op::Quantize { .. } => OpKind::Quantize,
            Op::Dequantize { .. } => OpKind::Dequantize,
            Op::SoftmaxLut { .. } => OpKind::SoftmaxLut,
        }
    }

    /// Attributes by name, in a stable order.
    pub fn attrs(&self) -> BTreeMap<&'static str, AttrValue> {
        let mut attrs = BTreeMap::new();
        let pair = |v: [usize; 2]| AttrValue::Ints(v.iter().map(|&x| x as i64).collect());
        match self {
            Op::Placeholder { shape } => {
                attrs.insert("shape", AttrValue::Ints(shape.clone()));
            }
            Op::Conv2d(p) => {
                attrs.insert("strides", pair(p.strides));
                attrs.insert("padding", pair(p.padding));
                attrs.insert("dilation", pair(p.dilation));
            }
            Op::Clip { a_min, a_max } => {
                attrs.insert("a_min", AttrValue::Float(*a_min));
                attrs.insert("a_max", AttrValue::Float(*a_max));
            }
            Op::MaxPool2d(p) => {
                attrs.insert("kernel", pair(p.kernel));
                attrs.insert("strides", pair(p.strides));
                attrs.insert("padding", pair(p.padding));
            }
            Op::Reshape { shape } => {
                attrs.insert("shape", AttrValue::Ints(shape.clone()));
            }
            Op::Transpose { axes } => {
                attrs.insert("axes", AttrValue::Ints(axes.iter().map(|&a| a as i64).collect()));
            }
            Op::Concat { axis } | Op::Softmax { axis } => {
                attrs.insert("axis", AttrValue::Int(*axis as i64));
            }
            Op::Slice { axis, begin, end } => {
                attrs.insert("axis", AttrValue::Int(*axis as i64));
                attrs.insert("begin", AttrValue::Int(*begin as i64));
                attrs.insert("end", AttrValue::Int(*end as i64));
            }
            Op::RightShift { shift_bit, precision } | Op::LeftShift { shift_bit, precision } => {
                attrs.insert("shift_bit", AttrValue::Int(*shift_bit as i64));
                attrs.insert("precision", AttrValue::Int(*precision as i64));
            }
            Op::CvmClip { precision } => {
                attrs.insert("precision", AttrValue::Int(*precision as i64));
            }
            Op::Quantize { scale_exp, precision } => {
                attrs.insert("scale_exp", AttrValue::Int(*scale_exp as i64));
                attrs.insert("precision", AttrValue::Int(*precision as i64));
            }
            Op::Dequantize { scale_exp } => {
                attrs.insert("scale_exp", AttrValue::Int(*scale_exp as i64));
            }
            Op::SoftmaxLut { axis, alpha, precision } => {
                attrs.insert("axis", AttrValue::Int(*axis as i64));
                attrs.insert("alpha", AttrValue::Int(*alpha));
                attrs.insert("precision", AttrValue::Int(*precision as i64));
            }
            Op::Constant | Op::Dense | Op::Relu | Op::Add | Op::Sub | Op::Mul | Op::Flatten => {}
        }
        attrs
    }

    /// Build a typed operator from its kind and a named attribute map.
    ///
    /// `node` is only used in error messages.
    pub fn from_attrs(kind: OpKind, attrs: &BTreeMap<String, AttrValue>, node: &str) -> Result<Op> {
        let r = AttrReader { node, attrs };
        let op = match kind {
            OpKind::Placeholder => Op::Placeholder { shape: r.ints("shape")? },
            OpKind::Constant => Op::Constant,
            OpKind::Conv2d => Op::Conv2d(Conv2dParams {
                strides: r.pair_or("strides", [1, 1])?,
                padding: r.pair_or("padding", [0, 0])?,
                dilation: r.pair_or("dilation", [1, 1])?,
            }),
            OpKind::Dense => Op::Dense,
            OpKind::Relu => Op::Relu,
            OpKind::Clip => Op::Clip { a_min: r.float("a_min")?, a_max: r.float("a_max")? },
            OpKind::Add => Op::Add,
            OpKind::Sub => Op::Sub,
            OpKind::Mul => Op::Mul,
            OpKind::MaxPool2d => {
                let kernel = r.pair("kernel")?;
                Op::MaxPool2d(PoolParams {
                    kernel,
                    strides: r.pair_or("strides", kernel)?,
                    padding: r.pair_or("padding", [0, 0])?,
                })
            }
            OpKind::Flatten => Op::Flatten,
            OpKind::Reshape => Op::Reshape { shape: r.ints("shape")? },
            OpKind::Transpose => Op::Transpose { axes: r.usizes("axes")? },
            OpKind::Concat => Op::Concat { axis: r.usize_or("axis", 1)? },
            OpKind::Slice => Op::Slice {
                axis: r.usize("axis")?,
                begin: r.usize("begin")?,
                end: r.usize("end")?,
            },
            OpKind::Softmax => Op::Softmax { axis: r.usize_or("axis", 1)? },
            OpKind::RightShift => Op::RightShift {
                shift_bit: r.usize("shift_bit")? as u32,
                precision: r.usize("precision")? as u32,
            },
            OpKind::LeftShift => Op::LeftShift {
                shift_bit: r.usize("shift_bit")? as u32,
                precision: r.usize("precision")? as u32,
            },
            OpKind::CvmClip => Op::CvmClip { precision: r.usize("precision")? as u32 },
            OpKind::Quantize => Op::Quantize {
                scale_exp: r.int("scale_exp")? as i32,
                precision: r.usize("precision")? as u32,
            },
            OpKind::Dequantize => Op::Dequantize { scale_exp: r.int("scale_exp")? as i32 },
            OpKind::SoftmaxLut => Op::SoftmaxLut {
                axis: r.usize("axis")?,
                alpha: r.int("alpha")?,
                precision: r.usize("precision")? as u32,
            },
        };
        Ok(op)
    }

    /// Copy of this operator with one attribute replaced.
    pub fn with_attr(&self, name: &str, value: AttrValue, node: &str) -> Result<Op> {
        let mut attrs: BTreeMap<String, AttrValue> =
            self.attrs().into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        if !attrs.contains_key(name) {
            return Err(QuantizeError::not_found("attribute", format!("{node}.{name}")));
        }
        attrs.insert(name.to_string(), value);
        Op::from_attrs(self.kind(), &attrs, node)
    }
}

impl PartialEq for Op {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind() && self.attrs() == other.attrs()
    }
}

impl Eq for Op {}

impl Hash for Op {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind().hash(state);
        for (k, v) in self.attrs() {
            k.hash(state);
            v.hash(state);
        }
    }
}

// ===========================================================================
// Attribute parsing helpers
// ===========================================================================

struct AttrReader<'a> {
    node: &'a str,
    attrs: &'a BTreeMap<String, AttrValue>,
}

impl AttrReader<'_> {
    fn invalid(&self, key: &str, expected: &str) -> QuantizeError {
        QuantizeError::graph(format!(
            "node '{}': attribute '{key}' must be {expected}",
            self.node
        ))
    }

    fn get(&self, key: &str) -> Result<&AttrValue> {
        self.attrs
            .get(key)
            .ok_or_else(|| QuantizeError::not_found("attribute", format!("{}.{key}", self.node)))
    }

    fn int(&self, key: &str) -> Result<i64> {
        self.get(key)?.as_i64().ok_or_else(|| self.invalid(key, "an integer"))
    }

    fn usize(&self, key: &str) -> Result<usize> {
        let v = self.int(key)?;
        usize::try_from(v).map_err(|_| self.invalid(key, "non-negative"))
    }

    fn usize_or(&self, key: &str, default: usize) -> Result<usize> {
        if self.attrs.contains_key(key) { self.usize(key) } else { Ok(default) }
    }

    fn float(&self, key: &str) -> Result<f64> {
        self.get(key)?.as_f64().ok_or_else(|| self.invalid(key, "a number"))
    }

    fn ints(&self, key: &str) -> Result<Vec<i64>> {
        self.get(key)?.as_ints().ok_or_else(|| self.invalid(key, "a list of integers"))
    }

    fn usizes(&self, key: &str) -> Result<Vec<usize>> {
        self.ints(key)?
            .into_iter()
            .map(|v| usize::try_from(v).map_err(|_| self.invalid(key, "non-negative")))
            .collect()
    }

    fn pair(&self, key: &str) -> Result<[usize; 2]> {
        match self.usizes(key)?.as_slice() {
            [v] => Ok([*v, *v]),
            [a, b] => Ok([*a, *b]),
            _ => Err(self.invalid(key, "one or two integers")),
        }
    }

    fn pair_or(&self, key: &str, default: [usize; 2]) -> Result<[usize; 2]> {
        if self.attrs.contains_key(key) { self.pair(key) } else { Ok(default) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_kind_names_round_trip() {
        for kind in OpKind::ALL {
            assert_eq!(kind.name().parse::<OpKind>().unwrap(), kind);
        }
        assert!("lrn".parse::<OpKind>().is_err());
    }

    #[test]
    fn test_with_attr_rewrites_clip() {
        let op = Op::Clip { a_min: 0.0, a_max: 6.0 };
        let op = op.with_attr("a_max", AttrValue::Int(192), "relu6").unwrap();
        match op {
            Op::Clip { a_min, a_max } => {
                assert_eq!(a_min, 0.0);
                assert_eq!(a_max, 192.0);
            }
            other => panic!("unexpected op {other:?}"),
        }
        assert!(Op::Relu.with_attr("a_max", AttrValue::Int(1), "r").is_err());
    }

    #[test]
    fn test_structural_hash_dedups_equal_ops() {
        let mut set = HashSet::new();
        set.insert(Op::Conv2d(Conv2dParams::default()));
        set.insert(Op::Conv2d(Conv2dParams::default()));
        set.insert(Op::Conv2d(Conv2dParams { strides: [2, 2], ..Default::default() }));
        set.insert(Op::Clip { a_min: 0.0, a_max: 6.0 });
        set.insert(Op::Clip { a_min: 0.0, a_max: 6.0 });
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_pool_strides_default_to_kernel() {
        let mut attrs = BTreeMap::new();
        attrs.insert("kernel".to_string(), AttrValue::Ints(vec![2]));
        let op = Op::from_attrs(OpKind::MaxPool2d, &attrs, "pool").unwrap();
        assert_eq!(
            op,
            Op::MaxPool2d(PoolParams { kernel: [2, 2], strides: [2, 2], padding: [0, 0] })
        );
    }
}
