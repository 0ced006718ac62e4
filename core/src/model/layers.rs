use anyhow::{anyhow, Result};

use super::{FFModel, Layer, LayerId, TensorId};
use crate::ops::params::*;
use crate::ops::OperatorKind;
use crate::parallel::{DataType, ParallelDim};

impl FFModel {
    fn rank_of(&self, t: TensorId) -> usize {
        self.tensors[t.0].dims.len()
    }

    /// Natural axis to internal axis.
    fn internal_axis(&self, t: TensorId, axis: usize) -> Result<usize> {
        let rank = self.rank_of(t);
        if axis >= rank {
            return Err(anyhow!("axis {} out of range for rank {}", axis, rank));
        }
        Ok(rank - 1 - axis)
    }

    pub(crate) fn add_layer(
        &mut self,
        kind: OperatorKind,
        data_type: DataType,
        name: Option<&str>,
        inputs: &[TensorId],
    ) -> Result<(LayerId, Vec<TensorId>)> {
        kind.check_params()?;
        let input_dims: Vec<Vec<ParallelDim>> = inputs
            .iter()
            .map(|t| {
                self.tensors[t.0]
                    .dims
                    .iter()
                    .map(|s| ParallelDim::new(*s))
                    .collect()
            })
            .collect();
        let refs: Vec<&[ParallelDim]> = input_dims.iter().map(|d| d.as_slice()).collect();
        let output_dims = kind.infer_output_dims(&refs)?;
        let input_types: Vec<DataType> = inputs.iter().map(|t| self.tensors[t.0].data_type).collect();
        let output_types = kind.output_data_types(&input_types, data_type);
        let layer_guid = self.guids.next_layer();
        let weight_specs = kind.weight_specs(&refs, layer_guid);
        let weight_type = output_types.first().copied().unwrap_or(data_type);

        let name = match name {
            Some(name) => name.to_string(),
            None => format!("{}_{}", kind.op_type().as_ref().to_lowercase(), layer_guid),
        };
        let mut layer = Layer::new(layer_guid, kind, weight_type, name);
        layer.inputs = inputs.to_vec();
        self.layers.push(layer);
        let id = LayerId(self.layers.len() - 1);

        let mut outputs = Vec::with_capacity(output_dims.len());
        for (idx, (dims, dtype)) in output_dims.iter().zip(output_types).enumerate() {
            let sizes: Vec<usize> = dims.iter().map(|d| d.size).collect();
            let out = self.create_tensor_legion_ordering(&sizes, dtype, Some(id), idx, true)?;
            outputs.push(out);
        }
        self.layers[id.0].outputs = outputs.clone();
        let sync_type = self.config.parameter_sync;
        for spec in weight_specs {
            self.create_weight_legion_ordering(
                &spec.dims,
                weight_type,
                Some(id),
                true,
                Some(spec.initializer),
                sync_type,
            )?;
        }
        Ok((id, outputs))
    }

    fn single(&mut self, kind: OperatorKind, name: Option<&str>, inputs: &[TensorId]) -> Result<TensorId> {
        let data_type = inputs
            .first()
            .map(|t| self.tensors[t.0].data_type)
            .unwrap_or(DataType::Float);
        let (_, outputs) = self.add_layer(kind, data_type, name, inputs)?;
        outputs
            .first()
            .copied()
            .ok_or(anyhow!("layer produced no output"))
    }

    /// Declares a model input, dims in natural order.
    pub fn input(&mut self, dims: &[usize], data_type: DataType) -> Result<TensorId> {
        self.create_tensor(dims, data_type, None, 0, true)
    }

    pub fn dense(
        &mut self,
        input: TensorId,
        out_dim: usize,
        activation: ActiMode,
        use_bias: bool,
        name: Option<&str>,
    ) -> Result<TensorId> {
        let kind = OperatorKind::Linear(LinearParams {
            out_channels: out_dim,
            use_bias,
            activation,
        });
        self.single(kind, name, &[input])
    }

    #[allow(clippy::too_many_arguments)]
    pub fn conv2d(
        &mut self,
        input: TensorId,
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        activation: ActiMode,
        groups: usize,
        use_bias: bool,
        name: Option<&str>,
    ) -> Result<TensorId> {
        let kind = OperatorKind::Conv2D(Conv2DParams {
            out_channels,
            kernel_h: kernel.0,
            kernel_w: kernel.1,
            stride_h: stride.0,
            stride_w: stride.1,
            padding_h: padding.0,
            padding_w: padding.1,
            groups,
            activation,
            use_bias,
        });
        self.single(kind, name, &[input])
    }

    pub fn pool2d(
        &mut self,
        input: TensorId,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        pool_type: PoolType,
        name: Option<&str>,
    ) -> Result<TensorId> {
        let kind = OperatorKind::Pool2D(Pool2DParams {
            kernel_h: kernel.0,
            kernel_w: kernel.1,
            stride_h: stride.0,
            stride_w: stride.1,
            padding_h: padding.0,
            padding_w: padding.1,
            pool_type,
        });
        self.single(kind, name, &[input])
    }

    pub fn embedding(
        &mut self,
        input: TensorId,
        num_entries: usize,
        out_dim: usize,
        aggr: AggrMode,
        name: Option<&str>,
    ) -> Result<TensorId> {
        let kind = OperatorKind::Embedding(EmbeddingParams {
            num_entries,
            out_channels: out_dim,
            aggr,
        });
        let (_, outputs) = self.add_layer(kind, DataType::Float, name, &[input])?;
        Ok(outputs[0])
    }

    #[allow(clippy::too_many_arguments)]
    pub fn multihead_attention(
        &mut self,
        query: TensorId,
        key: TensorId,
        value: TensorId,
        embed_dim: usize,
        num_heads: usize,
        dropout: f32,
        bias: bool,
        name: Option<&str>,
    ) -> Result<TensorId> {
        let kind = OperatorKind::MultiHeadAttention(MultiHeadAttentionParams {
            embed_dim,
            num_heads,
            dropout,
            bias,
        });
        self.single(kind, name, &[query, key, value])
    }

    pub fn batch_norm(&mut self, input: TensorId, relu: bool, name: Option<&str>) -> Result<TensorId> {
        self.single(OperatorKind::BatchNorm(BatchNormParams { relu }), name, &[input])
    }

    /// `axes` in natural order.
    pub fn layer_norm(
        &mut self,
        input: TensorId,
        axes: &[usize],
        elementwise_affine: bool,
        eps: f32,
        name: Option<&str>,
    ) -> Result<TensorId> {
        let axes = axes
            .iter()
            .map(|a| self.internal_axis(input, *a))
            .collect::<Result<Vec<_>>>()?;
        let kind = OperatorKind::LayerNorm(LayerNormParams {
            axes,
            elementwise_affine,
            eps,
        });
        self.single(kind, name, &[input])
    }

    pub fn batch_matmul(&mut self, a: TensorId, b: TensorId, name: Option<&str>) -> Result<TensorId> {
        self.single(OperatorKind::BatchMatmul, name, &[a, b])
    }

    pub fn unary(
        &mut self,
        op: UnaryOp,
        input: TensorId,
        scalar: f32,
        inplace: bool,
        name: Option<&str>,
    ) -> Result<TensorId> {
        let kind = OperatorKind::ElementUnary(ElementUnaryParams {
            op,
            scalar,
            inplace,
        });
        self.single(kind, name, &[input])
    }

    pub fn relu(&mut self, input: TensorId, inplace: bool) -> Result<TensorId> {
        self.unary(UnaryOp::Relu, input, 0.0, inplace, None)
    }

    pub fn binary(
        &mut self,
        op: BinaryOp,
        a: TensorId,
        b: TensorId,
        inplace_a: bool,
        name: Option<&str>,
    ) -> Result<TensorId> {
        let kind = OperatorKind::ElementBinary(ElementBinaryParams { op, inplace_a });
        self.single(kind, name, &[a, b])
    }

    pub fn add(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        self.binary(BinaryOp::Add, a, b, false, None)
    }

    /// `dim` in natural order.
    pub fn softmax(&mut self, input: TensorId, dim: usize, name: Option<&str>) -> Result<TensorId> {
        let dim = self.internal_axis(input, dim)?;
        self.single(OperatorKind::Softmax(SoftmaxParams { dim }), name, &[input])
    }

    pub fn dropout(&mut self, input: TensorId, rate: f32, seed: u64, name: Option<&str>) -> Result<TensorId> {
        self.single(OperatorKind::Dropout(DropoutParams { rate, seed }), name, &[input])
    }

    /// `shape` in natural order.
    pub fn reshape(&mut self, input: TensorId, shape: &[usize], name: Option<&str>) -> Result<TensorId> {
        let shape = shape.iter().rev().copied().collect();
        self.single(OperatorKind::Reshape(ReshapeParams { shape }), name, &[input])
    }

    pub fn flat(&mut self, input: TensorId, name: Option<&str>) -> Result<TensorId> {
        self.single(OperatorKind::Flat, name, &[input])
    }

    /// `axis` in natural order.
    pub fn concat(&mut self, inputs: &[TensorId], axis: usize, name: Option<&str>) -> Result<TensorId> {
        let first = *inputs.first().ok_or(anyhow!("concat needs inputs"))?;
        let axis = self.internal_axis(first, axis)?;
        self.single(OperatorKind::Concat(ConcatParams { axis }), name, inputs)
    }

    /// `axis` in natural order.
    pub fn split(
        &mut self,
        input: TensorId,
        splits: &[usize],
        axis: usize,
        name: Option<&str>,
    ) -> Result<Vec<TensorId>> {
        let axis = self.internal_axis(input, axis)?;
        let data_type = self.tensors[input.0].data_type;
        let kind = OperatorKind::Split(SplitParams {
            splits: splits.to_vec(),
            axis,
        });
        let (_, outputs) = self.add_layer(kind, data_type, name, &[input])?;
        Ok(outputs)
    }

    /// `perm` in natural order, output axis `i` takes input axis `perm[i]`.
    pub fn transpose(&mut self, input: TensorId, perm: &[usize], name: Option<&str>) -> Result<TensorId> {
        let rank = self.rank_of(input);
        if perm.len() != rank || perm.iter().any(|p| *p >= rank) {
            return Err(anyhow!("invalid permutation {:?} for rank {}", perm, rank));
        }
        let perm = (0..rank).map(|i| rank - 1 - perm[rank - 1 - i]).collect();
        self.single(OperatorKind::Transpose(TransposeParams { perm }), name, &[input])
    }

    pub fn cast(&mut self, input: TensorId, dtype: DataType, name: Option<&str>) -> Result<TensorId> {
        let (_, outputs) = self.add_layer(
            OperatorKind::Cast(CastParams { dtype }),
            dtype,
            name,
            &[input],
        )?;
        Ok(outputs[0])
    }

    /// `axes` in natural order.
    pub fn reduce_sum(
        &mut self,
        input: TensorId,
        axes: &[usize],
        keepdims: bool,
        name: Option<&str>,
    ) -> Result<TensorId> {
        let axes = axes
            .iter()
            .map(|a| self.internal_axis(input, *a))
            .collect::<Result<Vec<_>>>()?;
        self.single(OperatorKind::ReduceSum(ReduceParams { axes, keepdims }), name, &[input])
    }

    /// Mixture of experts aggregation. `inputs` holds the gate predictions,
    /// gate assignment, top-k gate assignment, full gate predictions and then
    /// `n` expert predictions.
    pub fn aggregate(
        &mut self,
        inputs: &[TensorId],
        n: usize,
        lambda_bal: f32,
        name: Option<&str>,
    ) -> Result<TensorId> {
        let kind = OperatorKind::Aggregate(AggregateParams { n, lambda_bal });
        let (layer, outputs) = self.add_layer(kind, DataType::Float, name, inputs)?;
        let layer = &mut self.layers[layer.0];
        layer.add_int_property("n", n as i64);
        layer.add_float_property("lambda_bal", lambda_bal);
        Ok(outputs[0])
    }
}
