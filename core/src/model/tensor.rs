use std::collections::HashMap;

use crate::common::config::ParameterSyncType;
use crate::ops::OperatorKind;
use crate::parallel::{DataType, MachineView, ParallelTensorShape};
use crate::runtime::{IndexSpace, Initializer, LogicalPartition, LogicalRegion};

use super::{LayerId, OpId, ParallelTensorId, TensorId};

/// A logical tensor as declared by the user, dims in internal order.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub guid: u64,
    pub data_type: DataType,
    pub dims: Vec<usize>,
    pub owner_layer: Option<LayerId>,
    pub owner_idx: usize,
    pub create_gradients: bool,
    pub initializer: Option<Initializer>,
    pub sync_type: ParameterSyncType,
    pub parallel_tensor: Option<ParallelTensorId>,
}

impl Tensor {
    pub fn volume(&self) -> usize {
        self.dims.iter().product()
    }
}

#[derive(Debug, Clone)]
pub struct ParallelTensor {
    pub guid: u64,
    pub shape: ParallelTensorShape,
    pub owner_op: Option<OpId>,
    /// -1 when the owner does not produce this tensor as an output.
    pub owner_idx: i32,
    pub create_gradients: bool,
    pub initializer: Option<Initializer>,
    pub sync_type: ParameterSyncType,
    pub machine_view: MachineView,
    pub parallel_is: Option<IndexSpace>,
    pub region: Option<LogicalRegion>,
    pub part: Option<LogicalPartition>,
    pub region_grad: Option<LogicalRegion>,
    pub part_grad: Option<LogicalPartition>,
}

impl ParallelTensor {
    pub fn num_dims(&self) -> usize {
        self.shape.num_dims()
    }
    pub fn data_type(&self) -> DataType {
        self.shape.data_type
    }
    pub fn get_volume(&self) -> usize {
        self.shape.volume()
    }
    /// Sizes of the non-replica axes, internal order.
    pub fn data_sizes(&self) -> Vec<usize> {
        self.shape
            .dims
            .iter()
            .filter(|d| !d.is_replica_dim)
            .map(|d| d.size)
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Layer {
    pub guid: u64,
    pub kind: OperatorKind,
    pub data_type: DataType,
    pub name: String,
    pub inputs: Vec<TensorId>,
    pub weights: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    int_properties: HashMap<String, i64>,
    float_properties: HashMap<String, f32>,
}

impl Layer {
    pub fn new(guid: u64, kind: OperatorKind, data_type: DataType, name: String) -> Self {
        Self {
            guid,
            kind,
            data_type,
            name,
            inputs: Vec::new(),
            weights: Vec::new(),
            outputs: Vec::new(),
            int_properties: HashMap::new(),
            float_properties: HashMap::new(),
        }
    }

    pub fn add_int_property(&mut self, key: &str, value: i64) {
        self.int_properties.insert(key.to_string(), value);
    }
    pub fn add_float_property(&mut self, key: &str, value: f32) {
        self.float_properties.insert(key.to_string(), value);
    }
    pub fn get_int_property(&self, key: &str) -> Option<i64> {
        self.int_properties.get(key).copied()
    }
    pub fn get_float_property(&self, key: &str) -> Option<f32> {
        self.float_properties.get(key).copied()
    }
}
