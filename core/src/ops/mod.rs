mod fused;
mod kind;
pub mod params;

pub use fused::{FusedOp, SourceType, MAX_NUM_FUSED_OPERATORS, MAX_NUM_FUSED_TENSORS};
pub use kind::{OperatorKind, OperatorType, WeightSpec};

use crate::model::{OpId, ParallelTensorId};
use crate::runtime::{IndexSpace, LogicalPartition};

#[derive(Debug, Clone)]
pub struct Operator {
    pub guid: u64,
    pub kind: OperatorKind,
    pub name: String,
    /// Guid of the layer this operator was created from.
    pub layer_guid: Option<u64>,
    /// For input operators, the guid of the logical tensor they feed.
    pub input_tensor_guid: Option<u64>,
    pub inputs: Vec<ParallelTensorId>,
    pub weights: Vec<ParallelTensorId>,
    pub outputs: Vec<ParallelTensorId>,
    pub trainable_inputs: Vec<bool>,
    pub parallel_is: Option<IndexSpace>,
    pub inplace_output: bool,
    /// Partitions of the inputs built by parallel operators.
    pub input_partitions: Vec<LogicalPartition>,
    pub fused: Option<FusedOp>,
}

impl Operator {
    pub fn new(guid: u64, kind: OperatorKind, name: String) -> Self {
        Self {
            guid,
            kind,
            name,
            layer_guid: None,
            input_tensor_guid: None,
            inputs: Vec::new(),
            weights: Vec::new(),
            outputs: Vec::new(),
            trainable_inputs: Vec::new(),
            parallel_is: None,
            inplace_output: false,
            input_partitions: Vec::new(),
            fused: None,
        }
    }

    pub fn op_type(&self) -> OperatorType {
        self.kind.op_type()
    }

    pub fn is_parallel_op(&self) -> bool {
        self.kind.is_parallel_op()
    }

    /// Operators that never get a fused or searched configuration.
    pub fn is_structural(&self) -> bool {
        self.kind.is_input_or_weight() || self.kind.is_parallel_op()
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }
    pub fn num_weights(&self) -> usize {
        self.weights.len()
    }
    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn constituents(&self) -> Vec<OpId> {
        match &self.fused {
            Some(fused) => fused.ops.clone(),
            None => Vec::new(),
        }
    }
}
