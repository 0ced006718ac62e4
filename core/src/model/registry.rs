use anyhow::{anyhow, Result};

use super::{FFModel, Layer, LayerId, OpId, ParallelTensor, ParallelTensorId, Tensor, TensorId};
use crate::common::config::ParameterSyncType;
use crate::ops::{Operator, OperatorKind};
use crate::parallel::{reversed, DataType, ParallelDim, ParallelTensorShape, MAX_TENSOR_DIM};
use crate::runtime::Initializer;

fn check_rank(len: usize) -> Result<()> {
    if len == 0 || len > MAX_TENSOR_DIM {
        return Err(anyhow!(
            "tensor rank {} outside of [1, {}]",
            len,
            MAX_TENSOR_DIM
        ));
    }
    Ok(())
}

impl FFModel {
    /// Creates a logical tensor from dims in natural (outer to inner) order.
    /// Without an owner an input layer is synthesized to own it.
    pub fn create_tensor(
        &mut self,
        dims: &[usize],
        data_type: DataType,
        owner_layer: Option<LayerId>,
        owner_idx: usize,
        create_grad: bool,
    ) -> Result<TensorId> {
        check_rank(dims.len())?;
        let id = TensorId(self.tensors.len());
        let guid = self.guids.next_tensor();
        let (owner, idx) = match owner_layer {
            Some(layer) => (layer, owner_idx),
            None => {
                let layer_guid = self.guids.next_layer();
                let mut input = Layer::new(
                    layer_guid,
                    OperatorKind::Input,
                    data_type,
                    format!("input_{}", layer_guid),
                );
                input.outputs.push(id);
                self.layers.push(input);
                (LayerId(self.layers.len() - 1), 0)
            }
        };
        self.tensors.push(Tensor {
            guid,
            data_type,
            dims: reversed(dims),
            owner_layer: Some(owner),
            owner_idx: idx,
            create_gradients: create_grad,
            initializer: None,
            sync_type: self.config.parameter_sync,
            parallel_tensor: None,
        });
        Ok(id)
    }

    /// Same as [`FFModel::create_tensor`] with dims already in internal order.
    pub fn create_tensor_legion_ordering(
        &mut self,
        dims: &[usize],
        data_type: DataType,
        owner_layer: Option<LayerId>,
        owner_idx: usize,
        create_grad: bool,
    ) -> Result<TensorId> {
        self.create_tensor(&reversed(dims), data_type, owner_layer, owner_idx, create_grad)
    }

    pub fn create_constant(&mut self, dims: &[usize], value: f32, data_type: DataType) -> Result<TensorId> {
        let id = self.create_tensor(dims, data_type, None, 0, false)?;
        self.tensors[id.0].initializer = Some(Initializer::Constant(value));
        Ok(id)
    }

    pub fn create_weight(
        &mut self,
        dims: &[usize],
        data_type: DataType,
        owner_layer: Option<LayerId>,
        create_grad: bool,
        initializer: Option<Initializer>,
        sync_type: ParameterSyncType,
    ) -> Result<TensorId> {
        let owner = owner_layer.ok_or(anyhow!("a weight must be owned by a layer"))?;
        check_rank(dims.len())?;
        if dims.iter().product::<usize>() == 0 {
            return Err(anyhow!("weight with zero volume:{:?}", dims));
        }
        let layer = self
            .layers
            .get_mut(owner.0)
            .ok_or(anyhow!("unknown layer:{:?}", owner))?;
        let id = TensorId(self.tensors.len());
        let owner_idx = layer.weights.len();
        layer.weights.push(id);
        let guid = self.guids.next_tensor();
        self.tensors.push(Tensor {
            guid,
            data_type,
            dims: reversed(dims),
            owner_layer: Some(owner),
            owner_idx,
            create_gradients: create_grad,
            initializer,
            sync_type,
            parallel_tensor: None,
        });
        Ok(id)
    }

    pub fn create_weight_legion_ordering(
        &mut self,
        dims: &[usize],
        data_type: DataType,
        owner_layer: Option<LayerId>,
        create_grad: bool,
        initializer: Option<Initializer>,
        sync_type: ParameterSyncType,
    ) -> Result<TensorId> {
        self.create_weight(
            &reversed(dims),
            data_type,
            owner_layer,
            create_grad,
            initializer,
            sync_type,
        )
    }

    /// Pushes a parallel tensor into the arena without touching any operator.
    pub(crate) fn alloc_parallel_tensor(
        &mut self,
        shape: ParallelTensorShape,
        owner_op: Option<OpId>,
        owner_idx: i32,
        create_grad: bool,
    ) -> Result<ParallelTensorId> {
        shape.check_valid()?;
        let guid = self.guids.next_parallel_tensor();
        let machine_view = shape.machine_view();
        self.parallel_tensors.push(ParallelTensor {
            guid,
            shape,
            owner_op,
            owner_idx,
            create_gradients: create_grad,
            initializer: None,
            sync_type: self.config.parameter_sync,
            machine_view,
            parallel_is: None,
            region: None,
            part: None,
            region_grad: None,
            part_grad: None,
        });
        Ok(ParallelTensorId(self.parallel_tensors.len() - 1))
    }

    fn push_noop(&mut self, kind: OperatorKind, output: ParallelTensorId) -> OpId {
        let guid = self.guids.next_op();
        let name = format!("{}_{}", kind.op_type().as_ref().to_lowercase(), guid);
        let mut op = Operator::new(guid, kind, name);
        op.outputs.push(output);
        self.ops.push(op);
        let id = OpId(self.ops.len() - 1);
        self.operators.push(id);
        id
    }

    /// Creates a parallel tensor from dims in natural order. Without an
    /// owner an input operator is appended to the operator list.
    pub fn create_parallel_tensor(
        &mut self,
        dims: &[ParallelDim],
        data_type: DataType,
        owner_op: Option<OpId>,
        owner_idx: usize,
        create_grad: bool,
        input_tensor_guid: Option<u64>,
    ) -> Result<ParallelTensorId> {
        let shape = ParallelTensorShape::new(reversed(dims), data_type);
        let id = self.alloc_parallel_tensor(shape, owner_op, owner_idx as i32, create_grad)?;
        if owner_op.is_none() {
            let op = self.push_noop(OperatorKind::Input, id);
            self.ops[op.0].input_tensor_guid = input_tensor_guid;
            let tensor = &mut self.parallel_tensors[id.0];
            tensor.owner_op = Some(op);
            tensor.owner_idx = 0;
        }
        Ok(id)
    }

    pub fn create_parallel_tensor_legion_ordering(
        &mut self,
        dims: &[ParallelDim],
        data_type: DataType,
        owner_op: Option<OpId>,
        owner_idx: usize,
        create_grad: bool,
        input_tensor_guid: Option<u64>,
    ) -> Result<ParallelTensorId> {
        self.create_parallel_tensor(
            &reversed(dims),
            data_type,
            owner_op,
            owner_idx,
            create_grad,
            input_tensor_guid,
        )
    }

    /// Without an owner a weight operator is appended to the operator list.
    pub fn create_parallel_weight(
        &mut self,
        dims: &[ParallelDim],
        data_type: DataType,
        owner_op: Option<OpId>,
        create_grad: bool,
        initializer: Option<Initializer>,
        sync_type: ParameterSyncType,
    ) -> Result<ParallelTensorId> {
        if dims.iter().map(|d| d.size).product::<usize>() == 0 {
            return Err(anyhow!("weight with zero volume:{:?}", dims));
        }
        let shape = ParallelTensorShape::new(reversed(dims), data_type);
        let id = self.alloc_parallel_tensor(shape, owner_op, -1, create_grad)?;
        let tensor = &mut self.parallel_tensors[id.0];
        tensor.initializer = initializer;
        tensor.sync_type = sync_type;
        match owner_op {
            Some(op) => {
                self.ops
                    .get_mut(op.0)
                    .ok_or(anyhow!("unknown operator:{:?}", op))?
                    .weights
                    .push(id);
            }
            None => {
                let op = self.push_noop(OperatorKind::Weight, id);
                let tensor = &mut self.parallel_tensors[id.0];
                tensor.owner_op = Some(op);
                tensor.owner_idx = 0;
            }
        }
        Ok(id)
    }

    pub fn create_parallel_weight_legion_ordering(
        &mut self,
        dims: &[ParallelDim],
        data_type: DataType,
        owner_op: Option<OpId>,
        create_grad: bool,
        initializer: Option<Initializer>,
        sync_type: ParameterSyncType,
    ) -> Result<ParallelTensorId> {
        self.create_parallel_weight(
            &reversed(dims),
            data_type,
            owner_op,
            create_grad,
            initializer,
            sync_type,
        )
    }

    /// Resolves the parallel counterpart of a logical tensor.
    pub fn get_parallel_tensor_from_tensor(&self, id: TensorId) -> Result<ParallelTensorId> {
        let tensor = self
            .tensors
            .get(id.0)
            .ok_or(anyhow!("unknown tensor:{:?}", id))?;
        if let Some(pt) = tensor.parallel_tensor {
            return Ok(pt);
        }
        let layer = tensor
            .owner_layer
            .map(|l| &self.layers[l.0])
            .ok_or(anyhow!("tensor {} has no owner layer", tensor.guid))?;
        let candidates: Vec<_> = self
            .operators
            .iter()
            .filter(|op| {
                let op = &self.ops[op.0];
                match layer.kind {
                    OperatorKind::Input => {
                        op.kind == OperatorKind::Input && op.input_tensor_guid == Some(tensor.guid)
                    }
                    _ => op.layer_guid == Some(layer.guid),
                }
            })
            .collect();
        match candidates.as_slice() {
            [op] => self.ops[op.0]
                .outputs
                .get(tensor.owner_idx)
                .copied()
                .ok_or(anyhow!(
                    "operator {} has no output {}",
                    self.ops[op.0].name,
                    tensor.owner_idx
                )),
            [] => Err(anyhow!(
                "no operator was created for layer {} owning tensor {}",
                layer.name,
                tensor.guid
            )),
            _ => Err(anyhow!(
                "{} operators were created for layer {}",
                candidates.len(),
                layer.name
            )),
        }
    }
}
