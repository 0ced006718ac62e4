use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Result};
use rand::{Rng, RngCore};
use rand_distr::{Distribution, WeightedIndex};

use super::{reset_span, CostSimulator, SearchReport, StrategyReport};
use crate::common::config::CompMode;
use crate::model::{FFModel, OpId, ParallelTensorId};
use crate::ops::OperatorType;
use crate::parallel::ParallelConfig;

pub const PROPAGATION_CHANCE: f32 = 0.25;
pub const CONTINUE_PROPAGATION_CHANCE: f32 = 0.75;
pub const PROPAGATION_SIZE_WEIGHT: f32 = 1.0;

fn divisors(n: usize) -> Vec<usize> {
    (1..=n).filter(|i| n % i == 0).collect()
}

fn prime_factors(mut n: usize) -> Vec<usize> {
    let mut factors = Vec::new();
    let mut p = 2;
    while p * p <= n {
        while n % p == 0 {
            factors.push(p);
            n /= p;
        }
        p += 1;
    }
    if n > 1 {
        factors.push(n);
    }
    factors
}

impl FFModel {
    /// Replica-free output sizes of `op` in internal order.
    fn output_sizes(&self, op: OpId, idx: usize) -> Vec<usize> {
        self.ops[op.0]
            .outputs
            .get(idx)
            .map(|t| {
                self.parallel_tensors[t.0]
                    .shape
                    .dims
                    .iter()
                    .filter(|d| !d.is_replica_dim)
                    .map(|d| d.size)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of axes a configuration of `op` describes.
    pub fn get_dimension(&self, op: OpId) -> usize {
        self.output_sizes(op, 0).len().max(1)
    }

    /// Operators the search assigns a configuration to.
    pub fn is_searchable(&self, op: OpId) -> bool {
        let op = &self.ops[op.0];
        !op.is_structural() && op.fused.is_none() && !op.outputs.is_empty()
    }

    /// Sample axis split over the largest worker count dividing the batch.
    pub fn get_data_parallel_config(&self, op: OpId) -> ParallelConfig {
        let n_dims = self.get_dimension(op);
        let batch = self.output_sizes(op, 0).last().copied().unwrap_or(1);
        let parts = divisors(self.config.total_workers())
            .into_iter()
            .filter(|d| batch % d == 0)
            .max()
            .unwrap_or(1);
        ParallelConfig::data_parallel(n_dims, parts)
    }

    pub fn data_parallel_strategy(&self) -> HashMap<OpId, ParallelConfig> {
        self.operators
            .iter()
            .filter(|op| self.is_searchable(**op))
            .map(|op| (*op, self.get_data_parallel_config(*op)))
            .collect()
    }

    fn splittable_axes(&self, n_dims: usize) -> Vec<usize> {
        let mut axes = Vec::new();
        if self.config.enable_sample_parallel {
            axes.push(n_dims - 1);
        }
        if self.config.enable_parameter_parallel && n_dims > 1 {
            axes.push(0);
        }
        if self.config.enable_attribute_parallel {
            axes.extend(1..n_dims.saturating_sub(1));
        }
        axes
    }

    /// Random configuration over a worker count reachable on the machine
    /// model. Degrees only land on the axes the config allows and always
    /// divide the output sizes.
    pub fn get_random_parallel_config(&self, op: OpId, rng: &mut dyn RngCore) -> ParallelConfig {
        let n_dims = self.get_dimension(op);
        let sizes = self.output_sizes(op, 0);
        let wpn = self.config.workers_per_node;
        let total = self.config.total_workers();
        let axes = self.splittable_axes(n_dims);

        let mut candidates: Vec<usize> = divisors(wpn);
        candidates.extend(
            divisors(self.config.num_nodes)
                .into_iter()
                .filter(|i| *i > 1)
                .map(|i| i * wpn),
        );
        let mut dims = vec![1; n_dims];
        while !candidates.is_empty() {
            let parts = candidates.swap_remove(rng.gen_range(0..candidates.len()));
            if let Some(placed) = self.place_factors(&sizes, n_dims, &axes, parts, rng) {
                dims = placed;
                break;
            }
        }
        let parts: usize = dims.iter().product();
        let start = rng.gen_range(0..=total.saturating_sub(parts));
        ParallelConfig {
            n_dims,
            dims,
            device_ids: (start..start + parts).collect(),
        }
    }

    fn place_factors(
        &self,
        sizes: &[usize],
        n_dims: usize,
        axes: &[usize],
        parts: usize,
        rng: &mut dyn RngCore,
    ) -> Option<Vec<usize>> {
        let mut dims = vec![1; n_dims];
        for factor in prime_factors(parts) {
            let open: Vec<usize> = axes
                .iter()
                .copied()
                .filter(|a| {
                    sizes
                        .get(*a)
                        .is_some_and(|s| s % (dims[*a] * factor) == 0)
                })
                .collect();
            if open.is_empty() {
                return None;
            }
            let axis = open[rng.gen_range(0..open.len())];
            dims[axis] *= factor;
        }
        Some(dims)
    }

    /// Degrees fit every output and the weights of `op`, devices exist.
    pub fn is_valid_parallel_config(&self, op: OpId, pc: &ParallelConfig) -> bool {
        let total = self.config.total_workers();
        if pc.n_dims != self.get_dimension(op)
            || pc.dims.len() != pc.n_dims
            || pc.dims.iter().any(|d| *d == 0)
        {
            return false;
        }
        let parts = pc.num_parts();
        if parts > total
            || pc.device_ids.len() != parts
            || pc.device_ids.iter().any(|d| *d >= total)
        {
            return false;
        }
        for idx in 0..self.ops[op.0].num_outputs() {
            let sizes = self.output_sizes(op, idx);
            if sizes.len() != pc.n_dims || sizes.iter().zip(&pc.dims).any(|(s, d)| s % d != 0) {
                return false;
            }
        }
        let weights = &self.ops[op.0].weights;
        match self.ops[op.0].op_type() {
            OperatorType::Linear | OperatorType::Embedding | OperatorType::MultiHeadAttention => {
                weights.iter().all(|w| {
                    let sizes = self.parallel_tensors[w.0].shape.sizes();
                    sizes.last().is_some_and(|outer| outer % pc.dims[0] == 0)
                })
            }
            OperatorType::Conv2D | OperatorType::BatchNorm => {
                weights.is_empty() || (pc.n_dims == 4 && pc.dims[2] == 1)
            }
            _ => true,
        }
    }

    pub fn is_adoptable_parallel_config(&self, op: OpId, pc: &ParallelConfig) -> bool {
        if self.is_valid_parallel_config(op, pc) {
            return true;
        }
        pc.is_data_parallel()
            && self.is_valid_parallel_config(
                op,
                &pc.change_data_parallel_dimensionality(self.get_dimension(op)),
            )
    }

    /// Producer to its consumers, with the volume of the tensor between them.
    pub fn get_bwd_edge_map(&self) -> HashMap<OpId, Vec<(OpId, usize)>> {
        let mut map: HashMap<OpId, Vec<(OpId, usize)>> = HashMap::new();
        for op in &self.operators {
            for input in &self.ops[op.0].inputs {
                let tensor = &self.parallel_tensors[input.0];
                if let Some(src) = tensor.owner_op {
                    map.entry(src).or_default().push((*op, tensor.get_volume()));
                }
            }
        }
        map
    }

    fn volume_of(&self, t: ParallelTensorId) -> usize {
        self.parallel_tensors[t.0].get_volume()
    }

    /// Random walk from a random operator copying its data parallel degree
    /// to neighbours that can adopt it.
    fn propagate(&self, next: &mut HashMap<OpId, ParallelConfig>, rng: &mut dyn RngCore) {
        if self.operators.len() < 2 {
            return;
        }
        let op_id = rng.gen_range(0..self.operators.len() - 1);
        let bwd_edges = self.get_bwd_edge_map();
        let mut seen: HashSet<OpId> = HashSet::new();
        let mut selected = self.operators[op_id];
        loop {
            seen.insert(selected);
            let Some(current) = next.get(&selected).cloned() else {
                break;
            };
            let mut edges: Vec<(OpId, usize)> = Vec::new();
            for input in &self.ops[selected.0].inputs {
                let Some(dst) = self.parallel_tensors[input.0].owner_op else {
                    continue;
                };
                if seen.contains(&dst)
                    || !next.contains_key(&dst)
                    || !self.is_adoptable_parallel_config(dst, &current)
                {
                    continue;
                }
                edges.push((dst, self.volume_of(*input)));
            }
            for (dst, volume) in bwd_edges.get(&selected).map(|v| v.as_slice()).unwrap_or(&[]) {
                if seen.contains(dst)
                    || !next.contains_key(dst)
                    || !self.is_adoptable_parallel_config(*dst, &current)
                {
                    continue;
                }
                edges.push((*dst, *volume));
            }
            if edges.is_empty() {
                break;
            }
            let avg = edges.iter().map(|(_, v)| *v as f32).sum::<f32>() / edges.len() as f32;
            let weights: Vec<f32> = edges
                .iter()
                .map(|(_, v)| {
                    PROPAGATION_SIZE_WEIGHT * *v as f32 + avg * (1.0 - PROPAGATION_SIZE_WEIGHT)
                })
                .collect();
            let chosen = match WeightedIndex::new(&weights) {
                Ok(dist) => edges[dist.sample(rng)].0,
                Err(_) => edges[rng.gen_range(0..edges.len())].0,
            };
            if current.is_data_parallel() {
                let adopted = current.change_data_parallel_dimensionality(self.get_dimension(chosen));
                if self.is_valid_parallel_config(chosen, &adopted) {
                    next.insert(chosen, adopted);
                }
            }
            selected = chosen;
            if rng.gen::<f32>() >= CONTINUE_PROPAGATION_CHANCE {
                break;
            }
        }
    }

    /// Proposes the next state. The last operator keeps its configuration.
    pub fn rewrite(
        &self,
        current: &HashMap<OpId, ParallelConfig>,
        use_propagation: bool,
        rng: &mut dyn RngCore,
    ) -> HashMap<OpId, ParallelConfig> {
        let mut next = current.clone();
        if self.operators.is_empty() {
            return next;
        }
        let propagate_chance = if use_propagation {
            PROPAGATION_CHANCE
        } else {
            0.0
        };
        if rng.gen::<f32>() < propagate_chance {
            self.propagate(&mut next, rng);
        } else {
            let op_id = rng.gen_range(0..self.operators.len());
            if op_id == self.operators.len() - 1 {
                return next;
            }
            let op = self.operators[op_id];
            if next.contains_key(&op) {
                next.insert(op, self.get_random_parallel_config(op, rng));
            }
        }
        next
    }

    /// Simulated annealing over per-operator configurations, starting from
    /// `best` and leaving the best state found in it.
    #[allow(clippy::too_many_arguments)]
    pub fn mcmc_optimize(
        &self,
        best: &mut HashMap<OpId, ParallelConfig>,
        budget: usize,
        alpha: f32,
        comp_mode: CompMode,
        use_propagation: bool,
        simulator: &mut dyn CostSimulator,
        rng: &mut dyn RngCore,
    ) -> Result<SearchReport> {
        if self.config.total_workers() == 0 {
            return Err(anyhow!("cannot search on a machine without workers"));
        }
        for (op, pc) in best.iter() {
            if !self.is_valid_parallel_config(*op, pc) {
                return Err(anyhow!(
                    "initial config {:?} of {} is not valid",
                    pc.dims,
                    self.ops[op.0].name
                ));
            }
        }
        let mut best_runtime = simulator.simulate_runtime(self, best, comp_mode, None)?;
        let mut current = best.clone();
        let mut current_runtime = best_runtime;
        let span = reset_span(budget);
        let mut report = SearchReport {
            budget,
            reset_span: span,
            initial_runtime: best_runtime,
            ..Default::default()
        };
        let mut last_reset_iter = 0;
        for iter in 0..=budget {
            if iter - last_reset_iter >= span {
                current = best.clone();
                current_runtime = best_runtime;
                last_reset_iter = iter;
                report.reset_iterations.push(iter);
                metrics::counter!("flexpar_search_resets").increment(1);
            }
            let next = self.rewrite(&current, use_propagation, rng);
            let next_runtime = simulator.simulate_runtime(self, &next, comp_mode, None)?;
            metrics::counter!("flexpar_search_iterations").increment(1);
            if iter % 1000 == 0 {
                tracing::info!(
                    "iteration({}) current_strategy({:.4}) best_strategy({:.4})",
                    iter,
                    current_runtime,
                    best_runtime
                );
            }
            let rn: f32 = rng.gen();
            let diff = next_runtime - current_runtime;
            if next_runtime < best_runtime {
                best_runtime = next_runtime;
                *best = next.clone();
                report.improvements += 1;
            }
            if next_runtime < current_runtime || rn < (-alpha * diff).exp() {
                current = next;
                current_runtime = next_runtime;
                report.accepted += 1;
                metrics::counter!("flexpar_search_accepted").increment(1);
            }
        }
        report.best_runtime = best_runtime;
        metrics::gauge!("flexpar_best_runtime").set(best_runtime as f64);

        tracing::info!("=========== Best Discovered Strategy ==========");
        simulator.simulate_runtime(self, best, comp_mode, self.config.export_taskgraph_file())?;
        StrategyReport::from_strategy(self, best).log();
        tracing::info!("============= MCMC Search Finished ============");
        Ok(report)
    }
}
