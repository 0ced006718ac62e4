use std::collections::HashMap;

use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use super::{FFModel, OpId, ParallelTensorId};
use crate::common::config::{CompMode, LossType, ParameterSyncType};
use crate::ops::OperatorKind;
use crate::parallel::{assign_parallel_idx, DataType, MachineView, ParallelConfig};
use crate::runtime::{CommunicatorId, LogicalPartition};
use crate::search::{CostSimulator, Simulator, StrategyReport};

impl FFModel {
    /// Builds, optionally searches, maps and fuses the operator graph with
    /// the simulator and seed from the config.
    pub fn compile(&mut self, loss_type: LossType, comp_mode: CompMode) -> Result<()> {
        let mut simulator = Simulator::from_config(&self.config);
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        self.compile_with(loss_type, comp_mode, &mut simulator, &mut rng)
    }

    pub fn compile_with(
        &mut self,
        loss_type: LossType,
        comp_mode: CompMode,
        simulator: &mut dyn CostSimulator,
        rng: &mut dyn RngCore,
    ) -> Result<()> {
        if self.config.total_workers() == 0 {
            return Err(anyhow!(
                "invalid machine model, num_nodes:{} workers_per_node:{}",
                self.config.num_nodes,
                self.config.workers_per_node
            ));
        }
        self.config.comp_mode = comp_mode;
        if self.operators.is_empty() {
            if self.config.only_data_parallel {
                tracing::info!("only data parallel, inputs are repartitioned over all workers");
            }
            self.create_operators_from_layers()?;
        }
        let graph = self.build_graph();
        tracing::info!("parallel computation graph with {} nodes", graph.num_nodes());
        self.graph = Some(graph);

        if self.config.search_budget > 0 {
            let mut best = self.data_parallel_strategy();
            let report = self.mcmc_optimize(
                &mut best,
                self.config.search_budget,
                self.config.search_alpha,
                comp_mode,
                self.config.enable_propagation,
                simulator,
                rng,
            )?;
            tracing::info!(
                "search finished, runtime {:.4} -> {:.4} after {} accepted moves",
                report.initial_runtime,
                report.best_runtime,
                report.accepted
            );
            self.apply_strategy(&best)?;
            if let Some(path) = self.config.export_strategy_file() {
                StrategyReport::from_strategy(self, &best).export(path)?;
            }
            self.search_report = Some(report);
            self.best_strategy = Some(best);
        }

        if self.config.enable_inplace_optimizations {
            self.apply_inplace_optimizations();
        }
        for op in self.operators.clone() {
            self.map_operator(op)?;
        }
        self.check_operators()?;

        if self.config.perform_fusion {
            let merges = self.perform_fusion()?;
            tracing::info!("{} fusions applied", merges);
        }

        let final_op = self.get_final_operator()?;
        self.create_label_tensor(final_op, loss_type)?;
        if comp_mode == CompMode::Training {
            self.init_communicators()?;
        }
        tracing::info!(
            "compiled {} operators, {} parameters",
            self.operators.len(),
            self.parameters.len()
        );
        Ok(())
    }

    /// Sets output degrees of every configured operator to its config.
    pub fn apply_strategy(&mut self, strategy: &HashMap<OpId, ParallelConfig>) -> Result<()> {
        for op in self.operators.clone() {
            let Some(pc) = strategy.get(&op) else {
                continue;
            };
            if self.ops[op.0].is_parallel_op() {
                continue;
            }
            if !self.is_valid_parallel_config(op, pc) {
                return Err(anyhow!(
                    "config {:?} does not fit operator {}",
                    pc.dims,
                    self.ops[op.0].name
                ));
            }
            for out in self.ops[op.0].outputs.clone() {
                let tensor = &mut self.parallel_tensors[out.0];
                for (dim, degree) in tensor
                    .shape
                    .dims
                    .iter_mut()
                    .filter(|d| !d.is_replica_dim)
                    .zip(&pc.dims)
                {
                    dim.degree = *degree;
                }
                assign_parallel_idx(&mut tensor.shape.dims);
                tensor.shape.check_valid()?;
                tensor.machine_view = tensor.shape.machine_view();
            }
        }
        Ok(())
    }

    /// Lets an operator overwrite its input when nobody else reads it.
    fn apply_inplace_optimizations(&mut self) {
        for l in 1..self.operators.len() {
            let op = self.operators[l];
            if !self.ops[op.0].kind.can_inplace_output() || self.ops[op.0].num_outputs() != 1 {
                continue;
            }
            let Some(input) = self.ops[op.0].inputs.first().copied() else {
                continue;
            };
            let source = &self.parallel_tensors[input.0];
            if source.owner_op.is_none() || source.shape.machine_view() != self.op_view(op) {
                continue;
            }
            let (owner, owner_idx) = (source.owner_op, source.owner_idx);
            let shared = self.operators.iter().enumerate().any(|(i, other)| {
                i != l
                    && self.ops[other.0].inputs.iter().any(|t| {
                        let t = &self.parallel_tensors[t.0];
                        t.owner_op == owner && t.owner_idx == owner_idx
                    })
            });
            if !shared {
                tracing::debug!("{} runs in place", self.ops[op.0].name);
                self.ops[op.0].inplace_output = true;
            }
        }
    }

    fn map_operator(&mut self, op: OpId) -> Result<()> {
        for input in &self.ops[op.0].inputs {
            if self.parallel_tensors[input.0].owner_op.is_none() {
                return Err(anyhow!(
                    "input {} of {} has no owner",
                    self.parallel_tensors[input.0].guid,
                    self.ops[op.0].name
                ));
            }
        }
        self.map_output_tensors(op)?;
        for weight in self.ops[op.0].weights.clone() {
            self.map_weight(weight, op)?;
            self.parameters.push(weight);
        }
        if self.ops[op.0].kind == OperatorKind::Weight {
            self.parameters.extend(self.ops[op.0].outputs.clone());
        }
        if self.ops[op.0].is_parallel_op() {
            let lp = self.create_input_partition(op)?;
            self.ops[op.0].input_partitions.push(lp);
        }
        Ok(())
    }

    fn create_input_partition(&mut self, op: OpId) -> Result<LogicalPartition> {
        let operator = &self.ops[op.0];
        let (input, output) = match (operator.inputs.as_slice(), operator.outputs.as_slice()) {
            ([input], [output]) => (*input, *output),
            _ => {
                return Err(anyhow!(
                    "parallel operator {} needs one input and one output",
                    operator.name
                ))
            }
        };
        let part_is = operator
            .parallel_is
            .ok_or(anyhow!("operator {} is not mapped", operator.name))?;
        let region = self.parallel_tensors[input.0]
            .region
            .ok_or(anyhow!("input of {} is not mapped", operator.name))?;
        let out_dims = self.parallel_tensors[output.0].shape.dims.clone();
        let kind = operator.kind.clone();
        match kind {
            OperatorKind::Repartition(_) | OperatorKind::Combine(_) => {
                self.create_disjoint_partition(&out_dims, part_is, region)
            }
            OperatorKind::Replicate(_) => {
                let replica = self.parallel_tensors[output.0]
                    .shape
                    .replica_dim()
                    .ok_or(anyhow!("replicate output has no replica dim"))?;
                self.create_aliased_partition(&out_dims, replica, part_is, region)
            }
            OperatorKind::Reduction(_) => {
                let in_dims = self.parallel_tensors[input.0].shape.dims.clone();
                let input_is = self.get_or_create_task_is_for_tensor(input);
                self.create_disjoint_partition(&in_dims, input_is, region)
            }
            _ => Err(anyhow!("{} is not a parallel operator", self.ops[op.0].name)),
        }
    }

    /// Outputs are owned by their operator at their index; inputs fed by
    /// input operators are not trainable.
    fn check_operators(&mut self) -> Result<()> {
        for op in self.operators.clone() {
            for (idx, out) in self.ops[op.0].outputs.iter().enumerate() {
                let tensor = &self.parallel_tensors[out.0];
                if tensor.owner_op != Some(op) || tensor.owner_idx != idx as i32 || tensor.guid == 0 {
                    return Err(anyhow!(
                        "output {} of {} is owned by {:?} at {}",
                        idx,
                        self.ops[op.0].name,
                        tensor.owner_op,
                        tensor.owner_idx
                    ));
                }
            }
            let from_input: Vec<bool> = self.ops[op.0]
                .inputs
                .iter()
                .map(|t| {
                    self.parallel_tensors[t.0]
                        .owner_op
                        .is_some_and(|o| self.ops[o.0].kind == OperatorKind::Input)
                })
                .collect();
            let operator = &mut self.ops[op.0];
            operator.trainable_inputs.resize(from_input.len(), true);
            for (trainable, is_data) in operator.trainable_inputs.iter_mut().zip(from_input) {
                if is_data {
                    *trainable = false;
                }
            }
        }
        Ok(())
    }

    fn create_label_tensor(&mut self, final_op: OpId, loss_type: LossType) -> Result<ParallelTensorId> {
        let output = *self.ops[final_op.0]
            .outputs
            .first()
            .ok_or(anyhow!("final operator has no output"))?;
        let mut shape = self.parallel_tensors[output.0].shape.clone();
        if loss_type == LossType::SparseCategoricalCrossEntropy {
            let inner = shape
                .dims
                .first_mut()
                .ok_or(anyhow!("final output has no dims"))?;
            if inner.degree != 1 {
                return Err(anyhow!(
                    "sparse labels need an unsplit class dim, got degree {}",
                    inner.degree
                ));
            }
            inner.size = 1;
            shape.data_type = DataType::Int32;
        } else {
            shape.data_type = DataType::Float;
        }
        let label = self.alloc_parallel_tensor(shape, None, 0, false)?;
        self.map_tensor(label, None)?;
        let dims = self.parallel_tensors[label.0].shape.dims.clone();
        let region = self.parallel_tensors[label.0]
            .region
            .ok_or(anyhow!("label tensor is not mapped"))?;
        let part_is = self.get_or_create_task_is_for_tensor(label);
        let part = self.create_disjoint_partition(&dims, part_is, region)?;
        let tensor = &mut self.parallel_tensors[label.0];
        tensor.part = Some(part);
        tensor.parallel_is = Some(part_is);
        tracing::info!(
            "label tensor {} dims:{:?} type:{}",
            tensor.guid,
            tensor.shape.sizes(),
            tensor.data_type()
        );
        self.label_tensor = Some(label);
        Ok(label)
    }

    /// One communicator group per distinct view syncing weights.
    fn init_communicators(&mut self) -> Result<()> {
        let mut views: Vec<MachineView> = self
            .operators
            .iter()
            .filter(|op| self.ops[op.0].kind == OperatorKind::Weight)
            .map(|op| self.op_view(*op))
            .collect();
        views.extend(
            self.parameters
                .iter()
                .map(|p| &self.parallel_tensors[p.0])
                .filter(|p| p.sync_type == ParameterSyncType::Nccl)
                .map(|p| p.machine_view.clone()),
        );
        for view in views {
            if self.view_hash_to_comms.contains_key(&view.hash()) {
                continue;
            }
            self.get_or_create_task_is(&view);
            let comm = self.runtime.create_communicator(&view)?;
            tracing::debug!("communicator {:?} for view {:?}", comm, view.dims);
            self.view_hash_to_comms.insert(view.hash(), comm);
        }
        Ok(())
    }

    /// Communicator of `view`; a missing one is only legal in inference.
    pub fn find_nccl_comms(&self, view: &MachineView) -> Result<Option<CommunicatorId>> {
        match self.view_hash_to_comms.get(&view.hash()) {
            Some(comm) => Ok(Some(*comm)),
            None if self.config.comp_mode == CompMode::Inference => Ok(None),
            None => Err(anyhow!("no communicator for view {:?} in training", view.dims)),
        }
    }
}
