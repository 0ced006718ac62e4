use std::collections::HashMap;
use std::fmt::Write as _;

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::common::config::{CompMode, FFConfig};
use crate::model::{FFModel, OpId};
use crate::ops::{OperatorKind, OperatorType};
use crate::parallel::ParallelConfig;

/// Cost in ms of a task whose shard does not fit in device memory.
pub const MAXIMUM_TASK_RUN_TIME: f32 = 1e7;

pub trait CostSimulator {
    /// Estimated time in ms of one iteration under `configs`. Operators
    /// without an entry keep the layout of their outputs.
    fn simulate_runtime(
        &mut self,
        model: &FFModel,
        configs: &HashMap<OpId, ParallelConfig>,
        comp_mode: CompMode,
        export_path: Option<&str>,
    ) -> Result<f32>;
}

/// Homogeneous cluster of `num_nodes` nodes with `workers_per_node` GPUs each.
#[derive(Debug, Clone, Serialize)]
pub struct MachineModel {
    pub num_nodes: usize,
    pub workers_per_node: usize,
    /// Sustained TFLOP/s of one GPU.
    pub gpu_tflops: f32,
    /// GB/s between GPUs of one node.
    pub intra_node_bandwidth: f32,
    /// GB/s between nodes.
    pub inter_node_bandwidth: f32,
    /// ms per kernel launch.
    pub kernel_launch_overhead: f32,
}

impl MachineModel {
    pub fn new(num_nodes: usize, workers_per_node: usize) -> Self {
        Self {
            num_nodes,
            workers_per_node,
            gpu_tflops: 14.0,
            intra_node_bandwidth: 20.0,
            inter_node_bandwidth: 12.0,
            kernel_launch_overhead: 0.01,
        }
    }

    pub fn total_devices(&self) -> usize {
        self.num_nodes * self.workers_per_node
    }

    pub fn node_of(&self, device: usize) -> usize {
        device / self.workers_per_node.max(1)
    }

    pub fn compute_time(&self, flops: f64) -> f32 {
        (flops / (self.gpu_tflops as f64 * 1e12) * 1e3) as f32 + self.kernel_launch_overhead
    }

    /// ms to move `bytes` from `src` to `dst`; free on the same device.
    pub fn transfer_time(&self, bytes: usize, src: usize, dst: usize) -> f32 {
        if src == dst || bytes == 0 {
            return 0.0;
        }
        let bandwidth = if self.node_of(src) == self.node_of(dst) {
            self.intra_node_bandwidth
        } else {
            self.inter_node_bandwidth
        };
        (bytes as f64 / (bandwidth as f64 * 1e9) * 1e3) as f32
    }

    /// Ring all-reduce of `bytes` over `devices`.
    pub fn allreduce_time(&self, bytes: usize, devices: &[usize]) -> f32 {
        let n = devices.len();
        if n <= 1 {
            return 0.0;
        }
        let spans_nodes = devices
            .iter()
            .any(|d| self.node_of(*d) != self.node_of(devices[0]));
        let bandwidth = if spans_nodes {
            self.inter_node_bandwidth
        } else {
            self.intra_node_bandwidth
        };
        let moved = 2.0 * (n as f64 - 1.0) / n as f64 * bytes as f64;
        (moved / (bandwidth as f64 * 1e9) * 1e3) as f32
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct CostMetrics {
    forward_time: f32,
    backward_time: f32,
    weight_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CostKey {
    op_type: OperatorType,
    params: Option<OperatorKind>,
    input_sizes: Vec<Vec<usize>>,
    training: bool,
    pc: ParallelConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskKind {
    Forward,
    Backward,
    Transfer,
    AllReduce,
}

#[derive(Debug, Clone)]
struct SimTask {
    name: String,
    kind: TaskKind,
    /// Devices occupy lanes `0..n`, incoming links of device `d` lane `n + d`.
    lane: usize,
    run_time: f32,
    deps: Vec<usize>,
    ready_time: f32,
    finish_time: f32,
}

#[derive(Default)]
struct TaskGraph {
    tasks: Vec<SimTask>,
}

impl TaskGraph {
    fn add(&mut self, name: String, kind: TaskKind, lane: usize, run_time: f32, deps: Vec<usize>) -> usize {
        self.tasks.push(SimTask {
            name,
            kind,
            lane,
            run_time,
            deps,
            ready_time: 0.0,
            finish_time: 0.0,
        });
        self.tasks.len() - 1
    }

    /// Tasks are created after their dependencies, so one pass in creation
    /// order is a valid list schedule. Returns the makespan.
    fn schedule(&mut self, num_lanes: usize) -> f32 {
        let mut lane_free = vec![0.0f32; num_lanes];
        let mut makespan = 0.0f32;
        for i in 0..self.tasks.len() {
            let ready = self.tasks[i]
                .deps
                .iter()
                .map(|d| self.tasks[*d].finish_time)
                .fold(0.0f32, f32::max);
            let task = &mut self.tasks[i];
            let start = ready.max(lane_free[task.lane]);
            task.ready_time = start;
            task.finish_time = start + task.run_time;
            lane_free[task.lane] = task.finish_time;
            makespan = makespan.max(task.finish_time);
        }
        makespan
    }

    fn to_dot(&self) -> String {
        let mut dot = String::from("digraph taskgraph {\n");
        for (i, t) in self.tasks.iter().enumerate() {
            let shape = match t.kind {
                TaskKind::Forward => "box",
                TaskKind::Backward => "box3d",
                TaskKind::Transfer => "ellipse",
                TaskKind::AllReduce => "diamond",
            };
            let _ = writeln!(
                dot,
                "  t{} [shape={}, label=\"{}\\nlane {} | {:.4}ms | start {:.4}\"];",
                i, shape, t.name, t.lane, t.run_time, t.ready_time
            );
        }
        for (i, t) in self.tasks.iter().enumerate() {
            for d in &t.deps {
                let _ = writeln!(dot, "  t{} -> t{};", d, i);
            }
        }
        dot.push_str("}\n");
        dot
    }
}

/// Analytic simulator over a [`MachineModel`]. Per-operator costs are
/// measured once per configuration and cached.
pub struct Simulator {
    machine: MachineModel,
    work_space_size: usize,
    cache: HashMap<CostKey, CostMetrics>,
}

impl Simulator {
    pub fn new(machine: MachineModel, work_space_size: usize) -> Self {
        Self {
            machine,
            work_space_size,
            cache: HashMap::new(),
        }
    }

    pub fn from_config(config: &FFConfig) -> Self {
        Self::new(
            MachineModel::new(config.num_nodes, config.workers_per_node),
            config.simulator_work_space_size,
        )
    }

    pub fn machine(&self) -> &MachineModel {
        &self.machine
    }

    pub fn num_cached(&self) -> usize {
        self.cache.len()
    }

    /// The config an operator runs with: its searched one, else the layout
    /// of its first output.
    fn config_of(model: &FFModel, op: OpId, configs: &HashMap<OpId, ParallelConfig>) -> ParallelConfig {
        if let Some(pc) = configs.get(&op) {
            return pc.clone();
        }
        let view = model.op_view(op);
        let parts = view.num_parts();
        ParallelConfig {
            n_dims: view.ndims(),
            dims: view.dims,
            device_ids: (0..parts).collect(),
        }
    }

    fn measure(&mut self, model: &FFModel, op: OpId, pc: &ParallelConfig, training: bool) -> CostMetrics {
        let operator = model.op(op);
        let input_sizes: Vec<Vec<usize>> = operator
            .inputs
            .iter()
            .map(|t| model.parallel_tensor(*t).shape.sizes())
            .collect();
        let key = CostKey {
            op_type: operator.op_type(),
            params: operator.kind.get_op_parameters(),
            input_sizes,
            training,
            pc: pc.clone(),
        };
        if let Some(cost) = self.cache.get(&key) {
            return *cost;
        }
        let cost = self.estimate(model, op, pc, training);
        self.cache.insert(key, cost);
        cost
    }

    fn estimate(&self, model: &FFModel, op: OpId, pc: &ParallelConfig, training: bool) -> CostMetrics {
        let operator = model.op(op);
        let parts = pc.num_parts().max(1);
        let shard = |sizes: &[usize]| -> usize {
            sizes
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    let d = pc.dims.get(i).copied().unwrap_or(1).max(1);
                    (s + d - 1) / d
                })
                .product()
        };
        let mut out_elems = 0usize;
        let mut out_bytes = 0usize;
        for t in &operator.outputs {
            let tensor = model.parallel_tensor(*t);
            let sizes: Vec<usize> = tensor
                .shape
                .dims
                .iter()
                .filter(|d| !d.is_replica_dim)
                .map(|d| d.size)
                .collect();
            let elems = shard(&sizes);
            out_elems += elems;
            out_bytes += elems * tensor.data_type().size();
        }
        let in_bytes: usize = operator
            .inputs
            .iter()
            .map(|t| {
                let tensor = model.parallel_tensor(*t);
                tensor.get_volume() / parts * tensor.data_type().size()
            })
            .sum();
        let channel_degree = pc.dims.first().copied().unwrap_or(1).max(1);
        let weight_bytes: usize = operator
            .weights
            .iter()
            .map(|t| {
                let tensor = model.parallel_tensor(*t);
                tensor.get_volume() / channel_degree * tensor.data_type().size()
            })
            .sum();

        let inner = |idx: usize| -> usize {
            operator
                .inputs
                .get(idx)
                .and_then(|t| model.parallel_tensor(*t).shape.dims.first())
                .map(|d| d.size)
                .unwrap_or(1)
        };
        let out = out_elems as f64;
        let flops = match &operator.kind {
            OperatorKind::Linear(_) | OperatorKind::BatchMatmul => 2.0 * out * inner(0) as f64,
            OperatorKind::Conv2D(p) => {
                let channels = operator
                    .inputs
                    .first()
                    .and_then(|t| model.parallel_tensor(*t).shape.dims.get(2))
                    .map(|d| d.size)
                    .unwrap_or(1);
                2.0 * out * (channels / p.groups.max(1)) as f64 * (p.kernel_h * p.kernel_w) as f64
            }
            OperatorKind::Pool2D(p) => out * (p.kernel_h * p.kernel_w) as f64,
            OperatorKind::MultiHeadAttention(p) => 8.0 * out * p.embed_dim as f64,
            OperatorKind::Embedding(_) | OperatorKind::Dropout(_) => out,
            OperatorKind::Softmax(_) | OperatorKind::LayerNorm(_) | OperatorKind::BatchNorm(_) => {
                5.0 * out
            }
            OperatorKind::Aggregate(p) => 2.0 * out * p.n as f64,
            OperatorKind::Input | OperatorKind::Weight | OperatorKind::NoOp => 0.0,
            _ => out,
        };
        let mut memory = out_bytes + in_bytes + weight_bytes;
        if training {
            memory *= 2;
        }
        if memory > self.work_space_size {
            tracing::warn!(
                "{} does not fit with dims {:?}: {} bytes over a {} byte workspace",
                operator.name,
                pc.dims,
                memory,
                self.work_space_size
            );
            return CostMetrics {
                forward_time: MAXIMUM_TASK_RUN_TIME,
                backward_time: MAXIMUM_TASK_RUN_TIME,
                weight_bytes,
            };
        }
        if flops == 0.0 {
            return CostMetrics::default();
        }
        let forward_time = self.machine.compute_time(flops);
        CostMetrics {
            forward_time,
            backward_time: 2.0 * forward_time,
            weight_bytes,
        }
    }
}

impl CostSimulator for Simulator {
    fn simulate_runtime(
        &mut self,
        model: &FFModel,
        configs: &HashMap<OpId, ParallelConfig>,
        comp_mode: CompMode,
        export_path: Option<&str>,
    ) -> Result<f32> {
        let training = comp_mode == CompMode::Training;
        let devices = self.machine.total_devices();
        let mut graph = TaskGraph::default();
        let mut forward: HashMap<OpId, Vec<usize>> = HashMap::new();
        let mut resolved: HashMap<OpId, ParallelConfig> = HashMap::new();
        let mut costs: HashMap<OpId, CostMetrics> = HashMap::new();

        for op in model.operators() {
            let operator = model.op(*op);
            if operator.kind.is_input_or_weight() {
                continue;
            }
            let pc = Self::config_of(model, *op, configs);
            if pc.device_ids.iter().any(|d| *d >= devices) {
                return Err(anyhow!(
                    "{} is placed on devices {:?} outside a {} device machine",
                    operator.name,
                    pc.device_ids,
                    devices
                ));
            }
            let cost = self.measure(model, *op, &pc, training);
            let mut parts: Vec<Vec<usize>> = vec![Vec::new(); pc.device_ids.len()];
            for input in &operator.inputs {
                let tensor = model.parallel_tensor(*input);
                let Some(src) = tensor.owner_op else {
                    continue;
                };
                let (Some(src_tasks), Some(src_pc)) = (forward.get(&src), resolved.get(&src)) else {
                    continue;
                };
                if src_pc.dims == pc.dims && src_pc.device_ids == pc.device_ids {
                    for (k, deps) in parts.iter_mut().enumerate() {
                        deps.push(src_tasks[k]);
                    }
                    continue;
                }
                let bytes = tensor.get_volume() * tensor.data_type().size() / pc.device_ids.len().max(1);
                for (k, deps) in parts.iter_mut().enumerate() {
                    let dst = pc.device_ids[k];
                    let from = src_pc.device_ids[k % src_pc.device_ids.len()];
                    let t = graph.add(
                        format!("xfer {} -> {}", model.op(src).name, operator.name),
                        TaskKind::Transfer,
                        devices + dst,
                        self.machine.transfer_time(bytes, from, dst),
                        src_tasks.clone(),
                    );
                    deps.push(t);
                }
            }
            let tasks: Vec<usize> = parts
                .into_iter()
                .enumerate()
                .map(|(k, deps)| {
                    graph.add(
                        format!("fwd {}[{}]", operator.name, k),
                        TaskKind::Forward,
                        pc.device_ids[k],
                        cost.forward_time,
                        deps,
                    )
                })
                .collect();
            forward.insert(*op, tasks);
            resolved.insert(*op, pc);
            costs.insert(*op, cost);
        }

        if training {
            let mut backward: HashMap<OpId, Vec<usize>> = HashMap::new();
            let consumers = model.get_bwd_edge_map();
            for op in model.operators().iter().rev() {
                let (Some(fwd), Some(pc), Some(cost)) = (forward.get(op), resolved.get(op), costs.get(op))
                else {
                    continue;
                };
                let downstream: Vec<usize> = consumers
                    .get(op)
                    .map(|c| c.as_slice())
                    .unwrap_or(&[])
                    .iter()
                    .filter_map(|(dst, _)| backward.get(dst))
                    .flatten()
                    .copied()
                    .collect();
                let operator = model.op(*op);
                let tasks: Vec<usize> = fwd
                    .iter()
                    .enumerate()
                    .map(|(k, f)| {
                        let mut deps = vec![*f];
                        deps.extend(&downstream);
                        graph.add(
                            format!("bwd {}[{}]", operator.name, k),
                            TaskKind::Backward,
                            pc.device_ids[k],
                            cost.backward_time,
                            deps,
                        )
                    })
                    .collect();
                let channel_degree = pc.dims.first().copied().unwrap_or(1).max(1);
                let replicas = pc.num_parts() / channel_degree;
                if cost.weight_bytes > 0 && replicas > 1 {
                    let time = self.machine.allreduce_time(cost.weight_bytes, &pc.device_ids);
                    for (k, b) in tasks.iter().enumerate() {
                        graph.add(
                            format!("allreduce {}[{}]", operator.name, k),
                            TaskKind::AllReduce,
                            devices + pc.device_ids[k],
                            time,
                            vec![*b],
                        );
                    }
                }
                backward.insert(*op, tasks);
            }
        }

        let runtime = graph.schedule(2 * devices);
        metrics::histogram!("flexpar_simulated_runtime").record(runtime as f64);
        if let Some(path) = export_path {
            std::fs::write(path, graph.to_dot())?;
            tracing::info!("task graph with {} tasks written to {}", graph.tasks.len(), path);
        }
        Ok(runtime)
    }
}
