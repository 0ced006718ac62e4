use std::hash::{Hash, Hasher};

use serde::Serialize;

use crate::parallel::DataType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[derive(strum_macros::Display)]
pub enum ActiMode {
    #[default]
    None,
    Relu,
    Sigmoid,
    Tanh,
    Gelu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[derive(strum_macros::Display)]
pub enum PoolType {
    Max,
    Avg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[derive(strum_macros::Display)]
pub enum AggrMode {
    None,
    Sum,
    Avg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[derive(strum_macros::Display)]
pub enum UnaryOp {
    Relu,
    Sigmoid,
    Tanh,
    Gelu,
    Elu,
    Exp,
    Sin,
    Cos,
    Identity,
    ScalarMultiply,
    ScalarAdd,
    ScalarSub,
    ScalarTrueDiv,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[derive(strum_macros::Display)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinearParams {
    pub out_channels: usize,
    pub use_bias: bool,
    pub activation: ActiMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Conv2DParams {
    pub out_channels: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub padding_h: usize,
    pub padding_w: usize,
    pub groups: usize,
    pub activation: ActiMode,
    pub use_bias: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pool2DParams {
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub padding_h: usize,
    pub padding_w: usize,
    pub pool_type: PoolType,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EmbeddingParams {
    pub num_entries: usize,
    pub out_channels: usize,
    pub aggr: AggrMode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultiHeadAttentionParams {
    pub embed_dim: usize,
    pub num_heads: usize,
    pub dropout: f32,
    pub bias: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchNormParams {
    pub relu: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerNormParams {
    /// Normalized axes, internal order.
    pub axes: Vec<usize>,
    pub elementwise_affine: bool,
    pub eps: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElementUnaryParams {
    pub op: UnaryOp,
    pub scalar: f32,
    pub inplace: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementBinaryParams {
    pub op: BinaryOp,
    pub inplace_a: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SoftmaxParams {
    pub dim: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DropoutParams {
    pub rate: f32,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReshapeParams {
    /// Target shape, internal order.
    pub shape: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConcatParams {
    pub axis: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SplitParams {
    pub splits: Vec<usize>,
    pub axis: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransposeParams {
    pub perm: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CastParams {
    pub dtype: DataType,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReduceParams {
    pub axes: Vec<usize>,
    pub keepdims: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateParams {
    pub n: usize,
    pub lambda_bal: f32,
}

/// Shared by repartition, combine, replicate and reduction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParallelOpParams {
    pub dim: usize,
    pub degree: usize,
}

impl Eq for MultiHeadAttentionParams {}
impl Hash for MultiHeadAttentionParams {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.embed_dim.hash(state);
        self.num_heads.hash(state);
        self.dropout.to_bits().hash(state);
        self.bias.hash(state);
    }
}

impl Eq for LayerNormParams {}
impl Hash for LayerNormParams {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.axes.hash(state);
        self.elementwise_affine.hash(state);
        self.eps.to_bits().hash(state);
    }
}

impl Eq for ElementUnaryParams {}
impl Hash for ElementUnaryParams {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.op.hash(state);
        self.scalar.to_bits().hash(state);
        self.inplace.hash(state);
    }
}

impl Eq for DropoutParams {}
impl Hash for DropoutParams {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rate.to_bits().hash(state);
        self.seed.hash(state);
    }
}

impl Eq for AggregateParams {}
impl Hash for AggregateParams {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.n.hash(state);
        self.lambda_bal.to_bits().hash(state);
    }
}
