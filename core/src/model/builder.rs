use std::collections::HashMap;

use anyhow::{anyhow, Result};

use super::{FFModel, LayerId, OpId, ParallelTensorId, TensorId};
use crate::graph::Graph;
use crate::ops::params::{AggregateParams, ParallelOpParams};
use crate::ops::{Operator, OperatorKind};
use crate::parallel::{assign_parallel_idx, DataType, ParallelDim};

fn split_replica(dims: &[ParallelDim]) -> (Vec<ParallelDim>, Option<ParallelDim>) {
    let data = dims.iter().filter(|d| !d.is_replica_dim).copied().collect();
    let replica = dims.iter().find(|d| d.is_replica_dim).copied();
    (data, replica)
}

impl FFModel {
    /// Appends a compute or parallel operator consuming `inputs` and creates
    /// its outputs and weights.
    pub fn create_operator(
        &mut self,
        kind: OperatorKind,
        name: Option<String>,
        layer_guid: Option<u64>,
        layer_type: DataType,
        inputs: &[ParallelTensorId],
    ) -> Result<OpId> {
        kind.check_params()?;
        if kind.is_input_or_weight() || kind == OperatorKind::Fused {
            return Err(anyhow!(
                "{} operators are not built from inputs",
                kind.op_type()
            ));
        }
        let input_dims: Vec<Vec<ParallelDim>> = inputs
            .iter()
            .map(|t| self.parallel_tensors[t.0].shape.dims.clone())
            .collect();
        let input_types: Vec<DataType> = inputs
            .iter()
            .map(|t| self.parallel_tensors[t.0].data_type())
            .collect();

        let guid = self.guids.next_op();
        let (output_dims, weight_specs) = if kind.is_parallel_op() {
            let [input] = input_dims.as_slice() else {
                return Err(anyhow!("{} takes exactly one input", kind.op_type()));
            };
            (vec![kind.infer_parallel_dims(input)?], Vec::new())
        } else {
            let split: Vec<_> = input_dims.iter().map(|d| split_replica(d)).collect();
            let data: Vec<&[ParallelDim]> = split.iter().map(|(d, _)| d.as_slice()).collect();
            let replica = split
                .first()
                .and_then(|(_, r)| *r)
                .map(|r| ParallelDim {
                    parallel_idx: ParallelDim::UNPARTITIONED,
                    ..r
                })
                .unwrap_or(ParallelDim::replica(1));
            let outputs = kind
                .infer_output_dims(&data)?
                .into_iter()
                .map(|mut dims| {
                    dims.push(replica);
                    assign_parallel_idx(&mut dims);
                    dims
                })
                .collect();
            (outputs, kind.weight_specs(&data, guid))
        };
        let output_types = kind.output_data_types(&input_types, layer_type);
        let weight_type = output_types.first().copied().unwrap_or(layer_type);

        let name = name.unwrap_or_else(|| {
            format!("{}_{}", kind.op_type().as_ref().to_lowercase(), guid)
        });
        let mut op = Operator::new(guid, kind, name);
        op.layer_guid = layer_guid;
        op.inputs = inputs.to_vec();
        op.trainable_inputs = vec![true; inputs.len()];
        self.ops.push(op);
        let id = OpId(self.ops.len() - 1);
        self.operators.push(id);

        for (idx, (dims, data_type)) in output_dims.iter().zip(output_types).enumerate() {
            let out = self.create_parallel_tensor_legion_ordering(
                dims,
                data_type,
                Some(id),
                idx,
                true,
                None,
            )?;
            self.ops[id.0].outputs.push(out);
        }
        let sync_type = self.config.parameter_sync;
        for spec in weight_specs {
            let dims: Vec<ParallelDim> = spec.dims.iter().map(|s| ParallelDim::new(*s)).collect();
            self.create_parallel_weight_legion_ordering(
                &dims,
                weight_type,
                Some(id),
                true,
                Some(spec.initializer),
                sync_type,
            )?;
        }
        Ok(id)
    }

    /// Builds the operator for `layer`. Returns the last operator created,
    /// which for inputs may be an inserted repartition.
    pub fn create_operator_from_layer(
        &mut self,
        layer_id: LayerId,
        inputs: &[ParallelTensorId],
    ) -> Result<OpId> {
        let layer = self.layers[layer_id.0].clone();
        match layer.kind {
            OperatorKind::Input => {
                if !inputs.is_empty() {
                    return Err(anyhow!("input layer {} cannot have inputs", layer.name));
                }
                let tensor_id = *layer
                    .outputs
                    .first()
                    .ok_or(anyhow!("input layer {} has no output", layer.name))?;
                let tensor = self.tensors[tensor_id.0].clone();
                let mut dims: Vec<ParallelDim> =
                    tensor.dims.iter().map(|s| ParallelDim::new(*s)).collect();
                dims.push(ParallelDim::replica(1));
                assign_parallel_idx(&mut dims);
                let pt = self.create_parallel_tensor_legion_ordering(
                    &dims,
                    tensor.data_type,
                    None,
                    0,
                    tensor.create_gradients,
                    Some(tensor.guid),
                )?;
                self.parallel_tensors[pt.0].initializer = tensor.initializer;
                let input_op = self.parallel_tensors[pt.0]
                    .owner_op
                    .ok_or(anyhow!("input tensor {} has no owner", tensor.guid))?;
                self.ops[input_op.0].layer_guid = Some(layer.guid);
                self.ops[input_op.0].name = layer.name.clone();
                if !self.config.only_data_parallel {
                    return Ok(input_op);
                }
                let degree = self.config.total_workers();
                let outer = tensor.dims.len() - 1;
                self.create_operator(
                    OperatorKind::Repartition(ParallelOpParams { dim: outer, degree }),
                    Some(format!("{}_repartition", layer.name)),
                    None,
                    tensor.data_type,
                    &[pt],
                )
            }
            OperatorKind::Weight | OperatorKind::Fused => Err(anyhow!(
                "layer {} of type {} cannot become an operator",
                layer.name,
                layer.kind.op_type()
            )),
            OperatorKind::Aggregate(_) => {
                let n = layer
                    .get_int_property("n")
                    .ok_or(anyhow!("aggregate layer {} has no property n", layer.name))?;
                let lambda_bal = layer.get_float_property("lambda_bal").ok_or(anyhow!(
                    "aggregate layer {} has no property lambda_bal",
                    layer.name
                ))?;
                let kind = OperatorKind::Aggregate(AggregateParams {
                    n: n as usize,
                    lambda_bal,
                });
                self.create_operator(
                    kind,
                    Some(layer.name.clone()),
                    Some(layer.guid),
                    layer.data_type,
                    inputs,
                )
            }
            kind => self.create_operator(
                kind,
                Some(layer.name.clone()),
                Some(layer.guid),
                layer.data_type,
                inputs,
            ),
        }
    }

    /// Walks layers in declaration order; every input must already have a
    /// parallel counterpart.
    pub fn create_operators_from_layers(&mut self) -> Result<()> {
        let mut tensors_to_parallel: HashMap<TensorId, ParallelTensorId> = HashMap::new();
        for idx in 0..self.layers.len() {
            let layer = &self.layers[idx];
            let mut inputs = Vec::with_capacity(layer.inputs.len());
            for t in &layer.inputs {
                let pt = tensors_to_parallel.get(t).ok_or(anyhow!(
                    "tensor {} consumed by layer {} has no parallel tensor, layers must be declared in topological order",
                    self.tensors[t.0].guid,
                    layer.name
                ))?;
                inputs.push(*pt);
            }
            let outputs = layer.outputs.clone();
            let op = self.create_operator_from_layer(LayerId(idx), &inputs)?;
            let op_outputs = self.ops[op.0].outputs.clone();
            if op_outputs.len() != outputs.len() {
                return Err(anyhow!(
                    "operator {} has {} outputs, its layer declares {}",
                    self.ops[op.0].name,
                    op_outputs.len(),
                    outputs.len()
                ));
            }
            for (t, pt) in outputs.iter().zip(op_outputs) {
                tensors_to_parallel.insert(*t, pt);
                self.tensors[t.0].parallel_tensor = Some(pt);
            }
        }
        tracing::info!(
            "created {} operators from {} layers",
            self.operators.len(),
            self.layers.len()
        );
        Ok(())
    }

    /// Parallel computation graph over the current operator list.
    pub fn build_graph(&mut self) -> Graph {
        let mut graph = Graph::new();
        for op in self.operators.clone() {
            graph.add_node(op, self.guids.next_node());
        }
        for dst in &self.operators {
            for (slot, input) in self.ops[dst.0].inputs.iter().enumerate() {
                let tensor = &self.parallel_tensors[input.0];
                let Some(src) = tensor.owner_op else {
                    continue;
                };
                if tensor.owner_idx >= 0 && graph.contains_node(src) {
                    graph.add_edge(src, *dst, tensor.owner_idx as usize, slot);
                }
            }
        }
        graph
    }
}
