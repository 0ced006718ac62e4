use std::collections::HashMap;

use anyhow::{anyhow, Result};

mod builder;
mod compile;
mod fusion;
mod layers;
mod partition;
mod registry;
mod tensor;
#[cfg(test)]
mod test;

pub use tensor::{Layer, ParallelTensor, Tensor};

use crate::common::config::FFConfig;
use crate::graph::Graph;
use crate::ops::Operator;
use crate::parallel::{GuidGenerator, MachineView, ParallelConfig};
use crate::runtime::{CommunicatorId, IndexSpace, LocalRuntime, LogicalRegion, RegionRuntime};
use crate::search::SearchReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParallelTensorId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub usize);

/// Owns every layer, tensor and operator of one model in id-indexed arenas.
pub struct FFModel {
    pub(crate) config: FFConfig,
    pub(crate) guids: GuidGenerator,
    pub(crate) layers: Vec<Layer>,
    pub(crate) tensors: Vec<Tensor>,
    pub(crate) parallel_tensors: Vec<ParallelTensor>,
    pub(crate) ops: Vec<Operator>,
    /// The current operator list in execution order.
    pub(crate) operators: Vec<OpId>,
    pub(crate) parameters: Vec<ParallelTensorId>,
    pub(crate) runtime: Box<dyn RegionRuntime>,
    pub(crate) task_is: HashMap<MachineView, IndexSpace>,
    pub(crate) view_hash_to_comms: HashMap<u64, CommunicatorId>,
    pub(crate) label_tensor: Option<ParallelTensorId>,
    pub(crate) graph: Option<Graph>,
    pub(crate) search_report: Option<SearchReport>,
    pub(crate) best_strategy: Option<HashMap<OpId, ParallelConfig>>,
}

impl FFModel {
    pub fn new(config: FFConfig) -> Self {
        Self::with_runtime(config, Box::new(LocalRuntime::new()))
    }

    pub fn with_runtime(config: FFConfig, runtime: Box<dyn RegionRuntime>) -> Self {
        Self {
            config,
            guids: GuidGenerator::new(),
            layers: Vec::new(),
            tensors: Vec::new(),
            parallel_tensors: Vec::new(),
            ops: Vec::new(),
            operators: Vec::new(),
            parameters: Vec::new(),
            runtime,
            task_is: HashMap::new(),
            view_hash_to_comms: HashMap::new(),
            label_tensor: None,
            graph: None,
            search_report: None,
            best_strategy: None,
        }
    }

    pub fn config(&self) -> &FFConfig {
        &self.config
    }
    pub fn layer(&self, id: LayerId) -> &Layer {
        &self.layers[id.0]
    }
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }
    pub fn tensor(&self, id: TensorId) -> &Tensor {
        &self.tensors[id.0]
    }
    pub fn parallel_tensor(&self, id: ParallelTensorId) -> &ParallelTensor {
        &self.parallel_tensors[id.0]
    }
    pub fn op(&self, id: OpId) -> &Operator {
        &self.ops[id.0]
    }
    pub fn operators(&self) -> &[OpId] {
        &self.operators
    }
    pub fn parameters(&self) -> &[ParallelTensorId] {
        &self.parameters
    }
    pub fn label_tensor(&self) -> Option<ParallelTensorId> {
        self.label_tensor
    }
    pub fn graph(&self) -> Option<&Graph> {
        self.graph.as_ref()
    }
    pub fn search_report(&self) -> Option<&SearchReport> {
        self.search_report.as_ref()
    }
    pub fn best_strategy(&self) -> Option<&HashMap<OpId, ParallelConfig>> {
        self.best_strategy.as_ref()
    }
    pub fn runtime(&self) -> &dyn RegionRuntime {
        self.runtime.as_ref()
    }

    pub fn region_of(&self, id: ParallelTensorId) -> Option<LogicalRegion> {
        self.parallel_tensors.get(id.0).and_then(|t| t.region)
    }

    /// View of an operator, the grid its first output is mapped onto.
    pub fn op_view(&self, id: OpId) -> MachineView {
        match self.ops[id.0].outputs.first() {
            Some(out) => self.parallel_tensors[out.0].shape.machine_view(),
            None => MachineView::new(vec![1]),
        }
    }

    /// Position in `operators` of the operator owning `tensor`, either
    /// directly or as a constituent of a fused node.
    pub(crate) fn producer_position(&self, operators: &[OpId], tensor: ParallelTensorId) -> Option<usize> {
        let owner = self.parallel_tensors[tensor.0].owner_op?;
        operators.iter().position(|op| {
            *op == owner
                || self.ops[op.0]
                    .fused
                    .as_ref()
                    .is_some_and(|f| f.ops.contains(&owner))
        })
    }

    /// Operator in the current list producing `tensor`.
    pub fn find_producer(&self, tensor: ParallelTensorId) -> Option<(usize, OpId)> {
        let idx = self.producer_position(&self.operators, tensor)?;
        Some((idx, self.operators[idx]))
    }

    pub fn get_final_operator(&self) -> Result<OpId> {
        let last = self
            .operators
            .iter()
            .rev()
            .find(|op| !self.ops[op.0].kind.is_input_or_weight())
            .copied()
            .ok_or(anyhow!("model has no compute operator"))?;
        if self.ops[last.0].num_outputs() != 1 {
            return Err(anyhow!(
                "final operator {} must have exactly one output",
                self.ops[last.0].name
            ));
        }
        Ok(last)
    }
}
