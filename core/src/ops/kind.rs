use anyhow::{anyhow, Result};

use super::params::*;
use crate::parallel::{DataType, ParallelDim};
use crate::runtime::Initializer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[derive(strum_macros::Display, strum_macros::EnumIter, strum_macros::AsRefStr)]
pub enum OperatorType {
    Input,
    Weight,
    NoOp,
    Linear,
    Conv2D,
    Pool2D,
    Embedding,
    MultiHeadAttention,
    BatchNorm,
    LayerNorm,
    BatchMatmul,
    ElementUnary,
    ElementBinary,
    Softmax,
    Dropout,
    Reshape,
    Flat,
    Concat,
    Split,
    Transpose,
    Cast,
    ReduceSum,
    Aggregate,
    Repartition,
    Replicate,
    Reduction,
    Combine,
    Fused,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OperatorKind {
    Input,
    Weight,
    NoOp,
    Linear(LinearParams),
    Conv2D(Conv2DParams),
    Pool2D(Pool2DParams),
    Embedding(EmbeddingParams),
    MultiHeadAttention(MultiHeadAttentionParams),
    BatchNorm(BatchNormParams),
    LayerNorm(LayerNormParams),
    BatchMatmul,
    ElementUnary(ElementUnaryParams),
    ElementBinary(ElementBinaryParams),
    Softmax(SoftmaxParams),
    Dropout(DropoutParams),
    Reshape(ReshapeParams),
    Flat,
    Concat(ConcatParams),
    Split(SplitParams),
    Transpose(TransposeParams),
    Cast(CastParams),
    ReduceSum(ReduceParams),
    Aggregate(AggregateParams),
    Repartition(ParallelOpParams),
    Replicate(ParallelOpParams),
    Reduction(ParallelOpParams),
    Combine(ParallelOpParams),
    Fused,
}

/// Shape and initializer of one weight, dims in internal order.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightSpec {
    pub dims: Vec<usize>,
    pub initializer: Initializer,
}

fn fresh(size: usize) -> ParallelDim {
    ParallelDim::new(size)
}

fn expect_inputs(kind: &OperatorKind, inputs: &[&[ParallelDim]], n: usize) -> Result<()> {
    if inputs.len() != n {
        return Err(anyhow!(
            "{} expects {} inputs, got {}",
            kind.op_type(),
            n,
            inputs.len()
        ));
    }
    Ok(())
}

fn expect_rank(kind: &OperatorKind, dims: &[ParallelDim], rank: usize) -> Result<()> {
    if dims.len() != rank {
        return Err(anyhow!(
            "{} expects a rank {} input, got {:?}",
            kind.op_type(),
            rank,
            dims
        ));
    }
    Ok(())
}

fn window_out(size: usize, kernel: usize, stride: usize, padding: usize) -> Result<usize> {
    if stride == 0 || size + 2 * padding < kernel {
        return Err(anyhow!(
            "invalid window, size:{} kernel:{} stride:{} padding:{}",
            size,
            kernel,
            stride,
            padding
        ));
    }
    Ok(1 + (size + 2 * padding - kernel) / stride)
}

impl OperatorKind {
    pub fn op_type(&self) -> OperatorType {
        match self {
            OperatorKind::Input => OperatorType::Input,
            OperatorKind::Weight => OperatorType::Weight,
            OperatorKind::NoOp => OperatorType::NoOp,
            OperatorKind::Linear(_) => OperatorType::Linear,
            OperatorKind::Conv2D(_) => OperatorType::Conv2D,
            OperatorKind::Pool2D(_) => OperatorType::Pool2D,
            OperatorKind::Embedding(_) => OperatorType::Embedding,
            OperatorKind::MultiHeadAttention(_) => OperatorType::MultiHeadAttention,
            OperatorKind::BatchNorm(_) => OperatorType::BatchNorm,
            OperatorKind::LayerNorm(_) => OperatorType::LayerNorm,
            OperatorKind::BatchMatmul => OperatorType::BatchMatmul,
            OperatorKind::ElementUnary(_) => OperatorType::ElementUnary,
            OperatorKind::ElementBinary(_) => OperatorType::ElementBinary,
            OperatorKind::Softmax(_) => OperatorType::Softmax,
            OperatorKind::Dropout(_) => OperatorType::Dropout,
            OperatorKind::Reshape(_) => OperatorType::Reshape,
            OperatorKind::Flat => OperatorType::Flat,
            OperatorKind::Concat(_) => OperatorType::Concat,
            OperatorKind::Split(_) => OperatorType::Split,
            OperatorKind::Transpose(_) => OperatorType::Transpose,
            OperatorKind::Cast(_) => OperatorType::Cast,
            OperatorKind::ReduceSum(_) => OperatorType::ReduceSum,
            OperatorKind::Aggregate(_) => OperatorType::Aggregate,
            OperatorKind::Repartition(_) => OperatorType::Repartition,
            OperatorKind::Replicate(_) => OperatorType::Replicate,
            OperatorKind::Reduction(_) => OperatorType::Reduction,
            OperatorKind::Combine(_) => OperatorType::Combine,
            OperatorKind::Fused => OperatorType::Fused,
        }
    }

    pub fn is_parallel_op(&self) -> bool {
        matches!(
            self,
            OperatorKind::Repartition(_)
                | OperatorKind::Replicate(_)
                | OperatorKind::Reduction(_)
                | OperatorKind::Combine(_)
        )
    }

    pub fn is_input_or_weight(&self) -> bool {
        matches!(self, OperatorKind::Input | OperatorKind::Weight)
    }

    pub fn can_inplace_output(&self) -> bool {
        match self {
            OperatorKind::ElementUnary(p) => p.inplace,
            OperatorKind::ElementBinary(p) => p.inplace_a,
            _ => false,
        }
    }

    /// The parameter struct identifying this operator, none for kinds without one.
    pub fn get_op_parameters(&self) -> Option<OperatorKind> {
        match self {
            OperatorKind::Input
            | OperatorKind::Weight
            | OperatorKind::NoOp
            | OperatorKind::Flat
            | OperatorKind::BatchMatmul
            | OperatorKind::Fused => None,
            _ => Some(self.clone()),
        }
    }

    pub fn check_params(&self) -> Result<()> {
        match self {
            OperatorKind::Dropout(p) if !(p.rate >= 0.0 && p.rate < 1.0) => {
                Err(anyhow!("dropout rate must be in [0, 1), got {}", p.rate))
            }
            OperatorKind::MultiHeadAttention(p)
                if p.num_heads == 0 || p.embed_dim % p.num_heads != 0 =>
            {
                Err(anyhow!(
                    "embed_dim {} is not divisible by num_heads {}",
                    p.embed_dim,
                    p.num_heads
                ))
            }
            OperatorKind::Conv2D(p)
                if p.groups == 0 || p.out_channels % p.groups != 0 =>
            {
                Err(anyhow!("invalid conv2d groups:{:?}", p))
            }
            OperatorKind::Linear(p) if p.out_channels == 0 => {
                Err(anyhow!("linear with zero output channels"))
            }
            OperatorKind::Repartition(p)
            | OperatorKind::Replicate(p)
            | OperatorKind::Reduction(p)
            | OperatorKind::Combine(p)
                if p.degree == 0 =>
            {
                Err(anyhow!("{} degree must be positive", self.op_type()))
            }
            _ => Ok(()),
        }
    }

    /// Output dims of a compute operator from its inputs' replica-free dims.
    /// Axes kept from an input keep their degree, new axes start unsplit.
    pub fn infer_output_dims(&self, inputs: &[&[ParallelDim]]) -> Result<Vec<Vec<ParallelDim>>> {
        let out = match self {
            OperatorKind::Input | OperatorKind::Weight | OperatorKind::Fused => {
                return Err(anyhow!("{} has no shape inference", self.op_type()));
            }
            OperatorKind::Repartition(_)
            | OperatorKind::Replicate(_)
            | OperatorKind::Reduction(_)
            | OperatorKind::Combine(_) => {
                return Err(anyhow!(
                    "{} works on parallel dims, use infer_parallel_dims",
                    self.op_type()
                ));
            }
            OperatorKind::NoOp
            | OperatorKind::ElementUnary(_)
            | OperatorKind::Dropout(_)
            | OperatorKind::Cast(_) => {
                expect_inputs(self, inputs, 1)?;
                inputs[0].to_vec()
            }
            OperatorKind::Softmax(p) => {
                expect_inputs(self, inputs, 1)?;
                if p.dim >= inputs[0].len() {
                    return Err(anyhow!("softmax dim {} out of range", p.dim));
                }
                inputs[0].to_vec()
            }
            OperatorKind::LayerNorm(p) => {
                expect_inputs(self, inputs, 1)?;
                if p.axes.is_empty() || p.axes.iter().any(|a| *a >= inputs[0].len()) {
                    return Err(anyhow!("invalid layer norm axes:{:?}", p.axes));
                }
                inputs[0].to_vec()
            }
            OperatorKind::BatchNorm(_) => {
                expect_inputs(self, inputs, 1)?;
                expect_rank(self, inputs[0], 4)?;
                inputs[0].to_vec()
            }
            OperatorKind::Linear(p) => {
                expect_inputs(self, inputs, 1)?;
                let mut dims = vec![fresh(p.out_channels)];
                dims.extend_from_slice(&inputs[0][1..]);
                dims
            }
            OperatorKind::Conv2D(p) => {
                expect_inputs(self, inputs, 1)?;
                let x = inputs[0];
                expect_rank(self, x, 4)?;
                if x[2].size % p.groups != 0 {
                    return Err(anyhow!(
                        "input channels {} not divisible by groups {}",
                        x[2].size,
                        p.groups
                    ));
                }
                vec![
                    fresh(window_out(x[0].size, p.kernel_w, p.stride_w, p.padding_w)?),
                    fresh(window_out(x[1].size, p.kernel_h, p.stride_h, p.padding_h)?),
                    fresh(p.out_channels),
                    x[3],
                ]
            }
            OperatorKind::Pool2D(p) => {
                expect_inputs(self, inputs, 1)?;
                let x = inputs[0];
                expect_rank(self, x, 4)?;
                vec![
                    fresh(window_out(x[0].size, p.kernel_w, p.stride_w, p.padding_w)?),
                    fresh(window_out(x[1].size, p.kernel_h, p.stride_h, p.padding_h)?),
                    x[2],
                    x[3],
                ]
            }
            OperatorKind::Embedding(p) => {
                expect_inputs(self, inputs, 1)?;
                let mut dims = vec![fresh(p.out_channels)];
                match p.aggr {
                    AggrMode::None => dims.extend_from_slice(inputs[0]),
                    AggrMode::Sum | AggrMode::Avg => dims.extend_from_slice(&inputs[0][1..]),
                }
                dims
            }
            OperatorKind::MultiHeadAttention(p) => {
                expect_inputs(self, inputs, 3)?;
                let (q, k, v) = (inputs[0], inputs[1], inputs[2]);
                expect_rank(self, q, 3)?;
                expect_rank(self, k, 3)?;
                expect_rank(self, v, 3)?;
                if k[1].size != v[1].size || q[2].size != k[2].size || k[2].size != v[2].size {
                    return Err(anyhow!(
                        "attention inputs disagree, q:{:?} k:{:?} v:{:?}",
                        q,
                        k,
                        v
                    ));
                }
                vec![fresh(p.embed_dim), q[1], q[2]]
            }
            OperatorKind::BatchMatmul => {
                expect_inputs(self, inputs, 2)?;
                let (a, b) = (inputs[0], inputs[1]);
                if a.len() < 2 || a.len() != b.len() || a[0].size != b[1].size {
                    return Err(anyhow!("batch matmul shape mismatch, a:{:?} b:{:?}", a, b));
                }
                if a[2..].iter().zip(b[2..].iter()).any(|(x, y)| x.size != y.size) {
                    return Err(anyhow!("batch matmul batch dims differ, a:{:?} b:{:?}", a, b));
                }
                let mut dims = vec![fresh(b[0].size), a[1]];
                dims.extend_from_slice(&a[2..]);
                dims
            }
            OperatorKind::ElementBinary(_) => {
                expect_inputs(self, inputs, 2)?;
                let (a, b) = (inputs[0], inputs[1]);
                let rank = a.len().max(b.len());
                let mut dims = Vec::with_capacity(rank);
                for i in 0..rank {
                    match (a.get(i), b.get(i)) {
                        (Some(x), Some(y)) if x.size == y.size => dims.push(*x),
                        (Some(x), Some(y)) if y.size == 1 => dims.push(*x),
                        (Some(x), Some(y)) if x.size == 1 => dims.push(*y),
                        (Some(x), None) => dims.push(*x),
                        (None, Some(y)) => dims.push(*y),
                        _ => {
                            return Err(anyhow!(
                                "operands cannot be broadcast, a:{:?} b:{:?}",
                                a,
                                b
                            ))
                        }
                    }
                }
                dims
            }
            OperatorKind::Reshape(p) => {
                expect_inputs(self, inputs, 1)?;
                let x = inputs[0];
                let volume: usize = x.iter().map(|d| d.size).product();
                if p.shape.is_empty() || p.shape.iter().product::<usize>() != volume {
                    return Err(anyhow!(
                        "reshape must preserve volume {}, target:{:?}",
                        volume,
                        p.shape
                    ));
                }
                let mut dims: Vec<ParallelDim> = p.shape.iter().map(|s| fresh(*s)).collect();
                if let (Some(last), Some(sample)) = (dims.last_mut(), x.last()) {
                    if last.size == sample.size {
                        *last = *sample;
                    }
                }
                dims
            }
            OperatorKind::Flat => {
                expect_inputs(self, inputs, 1)?;
                let x = inputs[0];
                expect_rank(self, x, 4)?;
                vec![fresh(x[0].size * x[1].size * x[2].size), x[3]]
            }
            OperatorKind::Concat(p) => {
                if inputs.is_empty() {
                    return Err(anyhow!("concat needs at least one input"));
                }
                let first = inputs[0];
                if p.axis >= first.len() {
                    return Err(anyhow!("concat axis {} out of range", p.axis));
                }
                let mut total = 0;
                for x in inputs {
                    if x.len() != first.len()
                        || x
                            .iter()
                            .zip(first.iter())
                            .enumerate()
                            .any(|(i, (a, b))| i != p.axis && a.size != b.size)
                    {
                        return Err(anyhow!("concat inputs disagree, {:?} vs {:?}", x, first));
                    }
                    total += x[p.axis].size;
                }
                let mut dims = first.to_vec();
                dims[p.axis] = fresh(total);
                dims
            }
            OperatorKind::Split(p) => {
                expect_inputs(self, inputs, 1)?;
                let x = inputs[0];
                if p.axis >= x.len() || p.splits.iter().sum::<usize>() != x[p.axis].size {
                    return Err(anyhow!(
                        "split {:?} along axis {} does not match {:?}",
                        p.splits,
                        p.axis,
                        x
                    ));
                }
                return Ok(p
                    .splits
                    .iter()
                    .map(|s| {
                        let mut dims = x.to_vec();
                        dims[p.axis] = fresh(*s);
                        dims
                    })
                    .collect());
            }
            OperatorKind::Transpose(p) => {
                expect_inputs(self, inputs, 1)?;
                let x = inputs[0];
                let mut seen = vec![false; x.len()];
                for axis in &p.perm {
                    match seen.get_mut(*axis) {
                        Some(s) if !*s => *s = true,
                        _ => return Err(anyhow!("invalid permutation:{:?}", p.perm)),
                    }
                }
                if p.perm.len() != x.len() {
                    return Err(anyhow!("invalid permutation:{:?}", p.perm));
                }
                p.perm.iter().map(|axis| x[*axis]).collect()
            }
            OperatorKind::ReduceSum(p) => {
                expect_inputs(self, inputs, 1)?;
                let x = inputs[0];
                if p.axes.iter().any(|a| *a >= x.len()) {
                    return Err(anyhow!("reduce axes {:?} out of range", p.axes));
                }
                let mut dims = Vec::new();
                for (i, d) in x.iter().enumerate() {
                    if !p.axes.contains(&i) {
                        dims.push(*d);
                    } else if p.keepdims {
                        dims.push(fresh(1));
                    }
                }
                if dims.is_empty() {
                    dims.push(fresh(1));
                }
                dims
            }
            OperatorKind::Aggregate(p) => {
                // gate preds, gate assign, gate assign topk, full gate preds, n expert preds
                expect_inputs(self, inputs, p.n + 4)?;
                let gate_preds = inputs[0];
                let exp_pred = inputs[4];
                if gate_preds.len() < 2 || exp_pred.is_empty() {
                    return Err(anyhow!("aggregate expects rank >= 2 gate predictions"));
                }
                if inputs[1].len() != gate_preds.len() || inputs[1][0].size != gate_preds[0].size {
                    return Err(anyhow!("gate assignment does not match gate predictions"));
                }
                if inputs[4..]
                    .iter()
                    .any(|e| e.is_empty() || e[0].size != exp_pred[0].size)
                {
                    return Err(anyhow!("expert predictions differ in size"));
                }
                let mut dims = vec![fresh(exp_pred[0].size)];
                dims.extend_from_slice(&gate_preds[1..]);
                dims
            }
        };
        Ok(vec![out])
    }

    /// Output dims of a parallel operator, replica axis included.
    pub fn infer_parallel_dims(&self, input: &[ParallelDim]) -> Result<Vec<ParallelDim>> {
        let mut dims = input.to_vec();
        match self {
            OperatorKind::Repartition(p) => {
                let d = dims
                    .get_mut(p.dim)
                    .filter(|d| !d.is_replica_dim)
                    .ok_or(anyhow!("repartition dim {} out of range", p.dim))?;
                d.degree *= p.degree;
                if d.size % d.degree != 0 {
                    return Err(anyhow!(
                        "size {} is not divisible by degree {}",
                        d.size,
                        d.degree
                    ));
                }
            }
            OperatorKind::Combine(p) => {
                let d = dims
                    .get_mut(p.dim)
                    .filter(|d| !d.is_replica_dim)
                    .ok_or(anyhow!("combine dim {} out of range", p.dim))?;
                if d.degree % p.degree != 0 {
                    return Err(anyhow!(
                        "cannot combine degree {} by {}",
                        d.degree,
                        p.degree
                    ));
                }
                d.degree /= p.degree;
            }
            OperatorKind::Replicate(p) => {
                let d = dims
                    .iter_mut()
                    .find(|d| d.is_replica_dim)
                    .ok_or(anyhow!("replicate needs a replica dim"))?;
                d.degree *= p.degree;
                d.size = d.degree;
            }
            OperatorKind::Reduction(p) => {
                let d = dims
                    .iter_mut()
                    .find(|d| d.is_replica_dim)
                    .ok_or(anyhow!("reduction needs a replica dim"))?;
                if d.degree % p.degree != 0 {
                    return Err(anyhow!(
                        "cannot reduce replica degree {} by {}",
                        d.degree,
                        p.degree
                    ));
                }
                d.degree /= p.degree;
                d.size = d.degree;
            }
            _ => return Err(anyhow!("{} is not a parallel op", self.op_type())),
        }
        crate::parallel::assign_parallel_idx(&mut dims);
        Ok(dims)
    }

    pub fn output_data_types(&self, inputs: &[DataType], layer_type: DataType) -> Vec<DataType> {
        let first = inputs.first().copied().unwrap_or(layer_type);
        match self {
            OperatorKind::Cast(p) => vec![p.dtype],
            OperatorKind::Embedding(_) | OperatorKind::Aggregate(_) => vec![layer_type],
            OperatorKind::Split(p) => vec![first; p.splits.len()],
            _ => vec![first],
        }
    }

    /// Weight shapes from the inputs' replica-free sizes.
    pub fn weight_specs(&self, inputs: &[&[ParallelDim]], seed: u64) -> Vec<WeightSpec> {
        let kernel = |dims: Vec<usize>| WeightSpec {
            dims,
            initializer: Initializer::Glorot { seed },
        };
        let filled = |dims: Vec<usize>, value: f32| WeightSpec {
            dims,
            initializer: if value == 0.0 {
                Initializer::Zero
            } else {
                Initializer::Constant(value)
            },
        };
        match self {
            OperatorKind::Linear(p) => {
                let mut specs = vec![kernel(vec![inputs[0][0].size, p.out_channels])];
                if p.use_bias {
                    specs.push(filled(vec![p.out_channels], 0.0));
                }
                specs
            }
            OperatorKind::Conv2D(p) => {
                let c = inputs[0][2].size / p.groups;
                let mut specs = vec![kernel(vec![p.kernel_w, p.kernel_h, c, p.out_channels])];
                if p.use_bias {
                    specs.push(filled(vec![p.out_channels], 0.0));
                }
                specs
            }
            OperatorKind::Embedding(p) => vec![WeightSpec {
                dims: vec![p.out_channels, p.num_entries],
                initializer: Initializer::Uniform {
                    seed,
                    min: -0.05,
                    max: 0.05,
                },
            }],
            OperatorKind::MultiHeadAttention(p) => {
                let head_dim = p.embed_dim / p.num_heads;
                let per_head = (inputs[0][0].size + inputs[1][0].size + inputs[2][0].size)
                    * head_dim
                    + head_dim * p.embed_dim;
                vec![kernel(vec![per_head, p.num_heads])]
            }
            OperatorKind::BatchNorm(_) => {
                let c = inputs[0][2].size;
                vec![filled(vec![c], 1.0), filled(vec![c], 0.0)]
            }
            OperatorKind::LayerNorm(p) if p.elementwise_affine => {
                let size = p.axes.iter().map(|a| inputs[0][*a].size).product::<usize>();
                vec![filled(vec![size], 1.0), filled(vec![size], 0.0)]
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
fn dims(sizes: &[usize]) -> Vec<ParallelDim> {
    sizes.iter().map(|s| ParallelDim::new(*s)).collect()
}

#[test]
fn test_linear_keeps_sample_degree() -> anyhow::Result<()> {
    let kind = OperatorKind::Linear(LinearParams {
        out_channels: 32,
        use_bias: true,
        activation: ActiMode::Relu,
    });
    let mut x = dims(&[16, 64]);
    x[1].degree = 4;
    let out = kind.infer_output_dims(&[&x])?;
    assert_eq!(out[0][0], ParallelDim::new(32));
    assert_eq!(out[0][1].degree, 4);
    let weights = kind.weight_specs(&[&x], 7);
    assert_eq!(weights[0].dims, vec![16, 32]);
    assert_eq!(weights[1].dims, vec![32]);
    assert_eq!(weights[1].initializer, Initializer::Zero);
    Ok(())
}

#[test]
fn test_conv_and_flat_shapes() -> anyhow::Result<()> {
    let conv = OperatorKind::Conv2D(Conv2DParams {
        out_channels: 64,
        kernel_h: 3,
        kernel_w: 3,
        stride_h: 1,
        stride_w: 1,
        padding_h: 1,
        padding_w: 1,
        groups: 1,
        activation: ActiMode::None,
        use_bias: false,
    });
    let x = dims(&[32, 32, 3, 8]);
    let out = conv.infer_output_dims(&[&x])?;
    let sizes: Vec<usize> = out[0].iter().map(|d| d.size).collect();
    assert_eq!(sizes, vec![32, 32, 64, 8]);
    assert_eq!(conv.weight_specs(&[&x], 0)[0].dims, vec![3, 3, 3, 64]);

    let flat = OperatorKind::Flat.infer_output_dims(&[&out[0]])?;
    assert_eq!(flat[0].len(), 2);
    assert_eq!(flat[0][0].size, 32 * 32 * 64);
    assert!(OperatorKind::Flat.infer_output_dims(&[&dims(&[4, 4])]).is_err());
    Ok(())
}

#[test]
fn test_broadcast_and_reshape() -> anyhow::Result<()> {
    let add = OperatorKind::ElementBinary(ElementBinaryParams {
        op: BinaryOp::Add,
        inplace_a: false,
    });
    let out = add.infer_output_dims(&[&dims(&[8, 1, 4]), &dims(&[8, 5])])?;
    let sizes: Vec<usize> = out[0].iter().map(|d| d.size).collect();
    assert_eq!(sizes, vec![8, 5, 4]);
    assert!(add
        .infer_output_dims(&[&dims(&[8, 3]), &dims(&[8, 5])])
        .is_err());

    let reshape = OperatorKind::Reshape(ReshapeParams { shape: vec![4, 4, 8] });
    let mut x = dims(&[16, 8]);
    x[1].degree = 2;
    let out = reshape.infer_output_dims(&[&x])?;
    assert_eq!(out[0][2].degree, 2);
    let bad = OperatorKind::Reshape(ReshapeParams { shape: vec![3, 8] });
    assert!(bad.infer_output_dims(&[&x]).is_err());
    Ok(())
}

#[test]
fn test_parallel_op_dims() -> anyhow::Result<()> {
    let mut x = dims(&[16, 64]);
    x.push(ParallelDim::replica(1));
    let repartition = OperatorKind::Repartition(ParallelOpParams { dim: 1, degree: 4 });
    let out = repartition.infer_parallel_dims(&x)?;
    assert_eq!(out[1].degree, 4);
    assert_eq!(out[1].parallel_idx, 1);
    assert_eq!(out[0].parallel_idx, 0);

    let combine = OperatorKind::Combine(ParallelOpParams { dim: 1, degree: 2 });
    assert_eq!(combine.infer_parallel_dims(&out)?[1].degree, 2);
    let replicate = OperatorKind::Replicate(ParallelOpParams { dim: 2, degree: 2 });
    let replicated = replicate.infer_parallel_dims(&out)?;
    assert_eq!(replicated[2], ParallelDim { parallel_idx: 2, ..ParallelDim::replica(2) });
    let reduction = OperatorKind::Reduction(ParallelOpParams { dim: 2, degree: 2 });
    assert_eq!(reduction.infer_parallel_dims(&replicated)?[2].degree, 1);
    assert!(OperatorKind::Repartition(ParallelOpParams { dim: 1, degree: 3 })
        .infer_parallel_dims(&x)
        .is_err());
    Ok(())
}

#[test]
fn test_params_checks() -> anyhow::Result<()> {
    let dropout = OperatorKind::Dropout(DropoutParams { rate: 1.0, seed: 0 });
    assert!(dropout.check_params().is_err());
    let dropout = OperatorKind::Dropout(DropoutParams { rate: 0.5, seed: 0 });
    assert!(dropout.check_params().is_ok());
    assert!(dropout.get_op_parameters().is_some());
    assert!(OperatorKind::Flat.get_op_parameters().is_none());
    assert!(OperatorKind::Repartition(ParallelOpParams { dim: 0, degree: 2 }).is_parallel_op());
    Ok(())
}
