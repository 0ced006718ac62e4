use std::collections::HashMap;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{FFModel, OpId, ParallelTensorId, TensorId};
use crate::common::config::{CompMode, FFConfig, LossType, ParameterSyncType};
use crate::ops::params::{ActiMode, ParallelOpParams, PoolType, UnaryOp};
use crate::ops::{OperatorKind, OperatorType};
use crate::parallel::{
    assign_parallel_idx, reversed, DataType, MachineView, ParallelConfig, ParallelDim,
};
use crate::runtime::{Rect, RegionRuntime};
use crate::search::{CostSimulator, MachineModel, Simulator, MAXIMUM_TASK_RUN_TIME};

struct ConstantSimulator {
    runtime: f32,
    calls: usize,
}

impl CostSimulator for ConstantSimulator {
    fn simulate_runtime(
        &mut self,
        _model: &FFModel,
        _configs: &HashMap<OpId, ParallelConfig>,
        _comp_mode: CompMode,
        _export_path: Option<&str>,
    ) -> Result<f32> {
        self.calls += 1;
        Ok(self.runtime)
    }
}

fn owner_of(model: &FFModel, t: TensorId) -> OpId {
    let pt = model.tensor(t).parallel_tensor.unwrap();
    model.parallel_tensor(pt).owner_op.unwrap()
}

fn output_of(model: &FFModel, op: OpId) -> ParallelTensorId {
    model.op(op).outputs[0]
}

/// input -> dense(relu) -> dense -> softmax
fn mlp(config: FFConfig) -> Result<FFModel> {
    let mut model = FFModel::new(config);
    let x = model.input(&[64, 32], DataType::Float)?;
    let h = model.dense(x, 64, ActiMode::Relu, true, Some("hidden"))?;
    let y = model.dense(h, 16, ActiMode::None, false, Some("logits"))?;
    model.softmax(y, 1, Some("probs"))?;
    Ok(model)
}

#[test]
fn test_partition_shards_inner_axis() -> anyhow::Result<()> {
    let mut model = FFModel::new(FFConfig::new(1, 4));
    let dims = vec![ParallelDim::with_degree(64, 4, 0), ParallelDim::new(128)];
    let pt = model.create_parallel_tensor_legion_ordering(&dims, DataType::Float, None, 0, false, None)?;
    let owner = model.parallel_tensor(pt).owner_op;
    assert_eq!(model.op(owner.unwrap()).op_type(), OperatorType::Input);
    model.map_tensor(pt, owner)?;

    let tensor = model.parallel_tensor(pt);
    assert_eq!(tensor.machine_view, MachineView::new(vec![4]));
    let part = tensor.part.unwrap();
    let rt = model.runtime();
    assert!(rt.is_index_partition_disjoint(part.index_partition)?);
    assert!(rt.is_index_partition_complete(part.index_partition)?);
    for c in 0..4i64 {
        let shard = rt.get_index_subspace(part.index_partition, &[c])?;
        assert_eq!(shard, Rect::new(vec![16 * c, 0], vec![16 * c + 15, 127]));
        assert_eq!(reversed(&shard.extents()), vec![128, 16]);
    }
    Ok(())
}

#[test]
fn test_partitions_disjoint_and_complete_for_every_rank() -> anyhow::Result<()> {
    let sizes = [4usize, 6, 2, 4, 2];
    for rank in 1..=sizes.len() {
        for mask in 0..(1usize << rank) {
            let mut model = FFModel::new(FFConfig::new(1, 4));
            let mut dims: Vec<ParallelDim> = sizes[..rank]
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    let degree = if mask & (1 << i) != 0 { 2 } else { 1 };
                    ParallelDim::with_degree(*s, degree, -1)
                })
                .collect();
            assign_parallel_idx(&mut dims);
            let pt =
                model.create_parallel_tensor_legion_ordering(&dims, DataType::Float, None, 0, false, None)?;
            let owner = model.parallel_tensor(pt).owner_op;
            model.map_tensor(pt, owner)?;

            let tensor = model.parallel_tensor(pt);
            let ip = tensor.part.unwrap().index_partition;
            let colors = model.runtime().index_space_domain(tensor.parallel_is.unwrap())?;
            assert_eq!(colors.volume() as usize, tensor.shape.total_degree());
            let expected: Vec<usize> = dims.iter().map(|d| d.size / d.degree).collect();
            for color in colors.points() {
                let shard = model.runtime().get_index_subspace(ip, &color)?;
                assert_eq!(shard.extents(), expected, "rank {} mask {}", rank, mask);
            }
            assert!(model.runtime().is_index_partition_disjoint(ip)?);
            assert!(model.runtime().is_index_partition_complete(ip)?);
        }
    }
    Ok(())
}

#[test]
fn test_uneven_partition_clips_last_shard() -> anyhow::Result<()> {
    let mut model = FFModel::new(FFConfig::new(1, 4));
    let is = model.runtime.create_index_space(Rect::from_sizes(&[10, 3]));
    let fs = model.runtime.create_field_space(4);
    let region = model.runtime.create_logical_region(is, fs)?;
    let part_is = model.get_or_create_task_is(&MachineView::new(vec![4]));
    let dims = vec![ParallelDim::with_degree(10, 4, 0), ParallelDim::new(3)];
    let lp = model.create_disjoint_partition(&dims, part_is, region)?;
    let rt = model.runtime();
    assert_eq!(
        rt.get_index_subspace(lp.index_partition, &[0])?,
        Rect::new(vec![0, 0], vec![2, 2])
    );
    assert_eq!(
        rt.get_index_subspace(lp.index_partition, &[3])?,
        Rect::new(vec![9, 0], vec![9, 2])
    );
    assert!(rt.is_index_partition_complete(lp.index_partition)?);
    Ok(())
}

#[test]
fn test_legion_ordering_is_reversed_storage() -> anyhow::Result<()> {
    let mut model = FFModel::new(FFConfig::new(1, 1));
    let all = [7usize, 5, 3, 2, 11];
    for rank in 1..=all.len() {
        let dims = &all[..rank];
        let natural = model.create_tensor(dims, DataType::Float, None, 0, false)?;
        let internal = model.create_tensor_legion_ordering(dims, DataType::Float, None, 0, false)?;
        assert_eq!(model.tensor(natural).dims, reversed(dims));
        assert_eq!(model.tensor(internal).dims, dims.to_vec());
        assert_eq!(reversed(&reversed(dims)), dims.to_vec());
    }
    assert!(model.create_tensor(&[], DataType::Float, None, 0, false).is_err());
    assert!(model
        .create_tensor(&[1, 1, 1, 1, 1, 1], DataType::Float, None, 0, false)
        .is_err());
    Ok(())
}

#[test]
fn test_guids_strictly_increasing() -> anyhow::Result<()> {
    let mut model = mlp(FFConfig::new(1, 4))?;
    model.create_operators_from_layers()?;
    let check = |guids: Vec<u64>| assert!(guids.windows(2).all(|w| w[0] < w[1]), "{:?}", guids);
    check(model.layers().iter().map(|l| l.guid).collect());
    check(model.tensors.iter().map(|t| t.guid).collect());
    check(model.parallel_tensors.iter().map(|t| t.guid).collect());
    check(model.operators().iter().map(|op| model.op(*op).guid).collect());
    Ok(())
}

#[test]
fn test_weight_needs_owner_and_volume() -> anyhow::Result<()> {
    let mut model = FFModel::new(FFConfig::new(1, 1));
    let sync = ParameterSyncType::Ps;
    assert!(model
        .create_weight(&[4, 4], DataType::Float, None, true, None, sync)
        .is_err());
    let x = model.input(&[8, 4], DataType::Float)?;
    let layer = model.tensor(x).owner_layer;
    assert!(model
        .create_weight(&[4, 0], DataType::Float, layer, true, None, sync)
        .is_err());
    let w = model.create_weight(&[4, 4], DataType::Float, layer, true, None, sync)?;
    assert_eq!(model.layer(layer.unwrap()).weights, vec![w]);
    Ok(())
}

#[test]
fn test_unsupported_weight_layout() -> anyhow::Result<()> {
    let mut model = FFModel::new(FFConfig::new(1, 4));
    let x = model.input(&[64, 32], DataType::Float)?;
    model.layer_norm(x, &[1], true, 1e-5, None)?;
    let err = model
        .compile(LossType::MeanSquaredError, CompMode::Training)
        .unwrap_err();
    assert!(err.to_string().contains("unsupported weight layout"), "{}", err);
    Ok(())
}

#[test]
fn test_only_data_parallel_inserts_repartition() -> anyhow::Result<()> {
    let config = FFConfig::new(1, 4).with_only_data_parallel(true);
    let mut model = FFModel::new(config);
    let x = model.input(&[64, 32], DataType::Float)?;
    let y = model.dense(x, 16, ActiMode::None, true, None)?;
    model.compile(LossType::MeanSquaredError, CompMode::Training)?;

    let ops = model.operators();
    assert_eq!(model.op(ops[0]).op_type(), OperatorType::Input);
    assert_eq!(model.op(ops[1]).op_type(), OperatorType::Repartition);
    let repart = model.parallel_tensor(output_of(&model, ops[1]));
    assert_eq!(repart.shape.dims[1].degree, 4);
    assert!(!model.op(ops[1]).input_partitions.is_empty());

    let dense = owner_of(&model, y);
    assert_eq!(model.op_view(dense), MachineView::new(vec![1, 4]));
    assert_eq!(model.op(dense).trainable_inputs, vec![true]);
    Ok(())
}

#[test]
fn test_fusion_of_a_chain() -> anyhow::Result<()> {
    let mut model = FFModel::new(FFConfig::new(1, 1));
    let x = model.input(&[16, 8], DataType::Float)?;
    let a = model.unary(UnaryOp::Relu, x, 0.0, false, Some("a"))?;
    let b = model.unary(UnaryOp::Sigmoid, a, 0.0, false, Some("b"))?;
    let c = model.unary(UnaryOp::Tanh, b, 0.0, false, Some("c"))?;
    model.compile(LossType::MeanSquaredError, CompMode::Inference)?;

    let (op_a, op_b, op_c) = (owner_of(&model, a), owner_of(&model, b), owner_of(&model, c));
    let chain = vec![op_a, op_b, op_c];
    let b_region = model.region_of(output_of(&model, op_b));
    assert!(b_region.is_some());

    let next = model.apply_fusion(&chain)?.unwrap();
    assert_eq!(next.len(), chain.len() - 1);
    assert_eq!(next[1], op_c);
    let fused = model.op(next[0]);
    assert_eq!(fused.op_type(), OperatorType::Fused);
    let tables = fused.fused.as_ref().unwrap();
    assert_eq!(tables.ops, vec![op_a, op_b]);
    assert!(tables.is_consistent());
    let b_slot = tables.op_output_idx[tables.op_num_outputs[0]];
    assert_eq!(model.region_of(fused.outputs[b_slot]), b_region);
    assert_eq!(model.region_of(model.op(op_c).inputs[0]), b_region);

    model.check_no_cycles(&next)?;
    model.check_fused_integrity(&next, &chain)?;
    assert!(model.apply_fusion(&next)?.is_none());
    Ok(())
}

#[test]
fn test_perform_fusion_on_mlp() -> anyhow::Result<()> {
    let config = FFConfig::new(1, 1).with_fusion(true);
    let mut model = mlp(config)?;
    model.compile(LossType::SparseCategoricalCrossEntropy, CompMode::Training)?;

    let ops = model.operators();
    assert_eq!(ops.len(), 3);
    assert_eq!(model.op(ops[0]).op_type(), OperatorType::Input);
    assert_eq!(model.op(ops[1]).op_type(), OperatorType::Fused);
    assert_eq!(model.op(ops[2]).op_type(), OperatorType::Softmax);
    assert_eq!(model.op(ops[1]).constituents().len(), 2);
    // Fused nodes report the weights of their constituents.
    assert_eq!(model.op(ops[1]).num_weights(), 3);
    model.check_no_cycles(ops)?;

    let label = model.parallel_tensor(model.label_tensor().unwrap());
    assert_eq!(label.data_type(), DataType::Int32);
    assert_eq!(label.shape.dims[0].size, 1);
    assert_eq!(label.shape.dims[1].size, 64);
    assert!(label.part.is_some());
    Ok(())
}

#[test]
fn test_inplace_optimization_aliases_input() -> anyhow::Result<()> {
    let config = FFConfig::new(1, 1).with_inplace_optimizations(true);
    let mut model = FFModel::new(config);
    let x = model.input(&[32, 16], DataType::Float)?;
    let h = model.dense(x, 16, ActiMode::None, true, None)?;
    let r = model.relu(h, true)?;
    model.dense(r, 8, ActiMode::None, true, None)?;
    model.compile(LossType::MeanSquaredError, CompMode::Inference)?;

    let relu = owner_of(&model, r);
    assert!(model.op(relu).inplace_output);
    let dense = owner_of(&model, h);
    assert_eq!(
        model.region_of(output_of(&model, relu)),
        model.region_of(output_of(&model, dense))
    );
    Ok(())
}

#[test]
fn test_communicators_follow_sync_type() -> anyhow::Result<()> {
    let config = FFConfig::new(1, 4).with_parameter_sync(ParameterSyncType::Nccl);
    let mut model = mlp(config)?;
    model.compile(LossType::SparseCategoricalCrossEntropy, CompMode::Training)?;
    assert_eq!(model.parameters().len(), 3);
    for p in model.parameters() {
        let view = model.parallel_tensor(*p).machine_view.clone();
        assert!(model.find_nccl_comms(&view)?.is_some());
    }
    assert!(model.find_nccl_comms(&MachineView::new(vec![3, 3])).is_err());

    let mut ps = mlp(FFConfig::new(1, 4))?;
    ps.compile(LossType::SparseCategoricalCrossEntropy, CompMode::Inference)?;
    assert!(ps.find_nccl_comms(&MachineView::new(vec![1, 1]))?.is_none());
    Ok(())
}

#[test]
fn test_compile_cnn_with_search() -> anyhow::Result<()> {
    let config = FFConfig::new(1, 4)
        .with_batch_size(8)
        .with_search(40, 1.2, 3)
        .with_parameter_sync(ParameterSyncType::Nccl);
    let mut model = FFModel::new(config);
    let x = model.input(&[8, 3, 16, 16], DataType::Float)?;
    let c = model.conv2d(x, 8, (3, 3), (1, 1), (1, 1), ActiMode::Relu, 1, true, None)?;
    let p = model.pool2d(c, (2, 2), (2, 2), (0, 0), PoolType::Max, None)?;
    let b = model.batch_norm(p, true, None)?;
    let f = model.flat(b, None)?;
    let d = model.dense(f, 10, ActiMode::None, true, None)?;
    model.softmax(d, 1, None)?;
    model.compile(LossType::SparseCategoricalCrossEntropy, CompMode::Training)?;

    let report = model.search_report().unwrap();
    assert!(report.best_runtime <= report.initial_runtime);
    let strategy = model.best_strategy().unwrap();
    for (op, pc) in strategy {
        assert!(model.is_valid_parallel_config(*op, pc));
        assert_eq!(model.op_view(*op).dims, pc.dims);
    }
    assert!(model.graph().unwrap().num_nodes() >= model.operators().len());
    Ok(())
}

#[test]
fn test_mcmc_resets_on_schedule() -> anyhow::Result<()> {
    let mut model = mlp(FFConfig::new(1, 4))?;
    model.create_operators_from_layers()?;
    let mut best = model.data_parallel_strategy();
    let seed = best.clone();
    let mut sim = ConstantSimulator {
        runtime: 1.0,
        calls: 0,
    };
    let mut rng = StdRng::seed_from_u64(11);
    let report = model.mcmc_optimize(&mut best, 250, 1.2, CompMode::Training, true, &mut sim, &mut rng)?;
    assert_eq!(report.reset_span, 2);
    let expected: Vec<usize> = (1..=125).map(|i| 2 * i).collect();
    assert_eq!(report.reset_iterations, expected);
    assert_eq!(report.improvements, 0);
    assert_eq!(best, seed);
    assert_eq!(sim.calls, 253);
    Ok(())
}

#[test]
fn test_mcmc_never_worse_than_seed() -> anyhow::Result<()> {
    let mut model = mlp(FFConfig::new(2, 2))?;
    model.create_operators_from_layers()?;
    for budget in [0usize, 1, 10, 60] {
        let mut best = model.data_parallel_strategy();
        let mut sim = Simulator::from_config(model.config());
        let mut rng = StdRng::seed_from_u64(budget as u64);
        let report =
            model.mcmc_optimize(&mut best, budget, 1.2, CompMode::Training, budget % 2 == 0, &mut sim, &mut rng)?;
        assert!(report.best_runtime <= report.initial_runtime, "budget {}", budget);
        for (op, pc) in &best {
            assert!(model.is_valid_parallel_config(*op, pc));
        }
    }
    let mut best = HashMap::new();
    let first = model.operators()[1];
    best.insert(first, ParallelConfig::data_parallel(model.get_dimension(first), 3));
    let mut sim = Simulator::from_config(model.config());
    let mut rng = StdRng::seed_from_u64(0);
    assert!(model
        .mcmc_optimize(&mut best, 10, 1.2, CompMode::Training, false, &mut sim, &mut rng)
        .is_err());
    Ok(())
}

#[test]
fn test_rewrite_keeps_last_operator() -> anyhow::Result<()> {
    let mut model = mlp(FFConfig::new(1, 4))?;
    model.create_operators_from_layers()?;
    let current = model.data_parallel_strategy();
    let last = *model.operators().last().unwrap();
    let mut rng = StdRng::seed_from_u64(5);
    for _ in 0..200 {
        let next = model.rewrite(&current, true, &mut rng);
        assert_eq!(next.len(), current.len());
        assert_eq!(next.get(&last), current.get(&last));
        for (op, pc) in &next {
            assert!(model.is_valid_parallel_config(*op, pc));
        }
    }
    for op in model.operators() {
        if model.is_searchable(*op) {
            for _ in 0..50 {
                let pc = model.get_random_parallel_config(*op, &mut rng);
                assert!(model.is_valid_parallel_config(*op, &pc), "{:?}", pc);
            }
        }
    }
    Ok(())
}

#[test]
fn test_simulator_cache_and_oom() -> anyhow::Result<()> {
    let mut model = mlp(FFConfig::new(1, 4))?;
    model.create_operators_from_layers()?;
    let strategy = model.data_parallel_strategy();

    let mut sim = Simulator::new(MachineModel::new(1, 4), 2 << 30);
    let first = sim.simulate_runtime(&model, &strategy, CompMode::Training, None)?;
    let cached = sim.num_cached();
    let second = sim.simulate_runtime(&model, &strategy, CompMode::Training, None)?;
    assert_eq!(first, second);
    assert_eq!(sim.num_cached(), cached);
    assert!(first > 0.0 && first < MAXIMUM_TASK_RUN_TIME);

    let mut tiny = Simulator::new(MachineModel::new(1, 4), 16);
    let oom = tiny.simulate_runtime(&model, &strategy, CompMode::Training, None)?;
    assert!(oom >= MAXIMUM_TASK_RUN_TIME);

    let mut off_machine = strategy.clone();
    let op = model.operators()[1];
    off_machine.insert(
        op,
        ParallelConfig {
            device_ids: vec![4, 5, 6, 7],
            ..strategy[&op].clone()
        },
    );
    assert!(sim
        .simulate_runtime(&model, &off_machine, CompMode::Training, None)
        .is_err());
    Ok(())
}

#[test]
fn test_simulator_exports_task_graph() -> anyhow::Result<()> {
    let mut model = mlp(FFConfig::new(1, 2))?;
    model.create_operators_from_layers()?;
    let strategy = model.data_parallel_strategy();
    let path = std::env::temp_dir().join(format!("flexpar_taskgraph_{}.dot", std::process::id()));
    let path = path.to_string_lossy().to_string();
    let mut sim = Simulator::from_config(model.config());
    sim.simulate_runtime(&model, &strategy, CompMode::Training, Some(&path))?;
    let dot = std::fs::read_to_string(&path)?;
    std::fs::remove_file(&path)?;
    assert!(dot.starts_with("digraph"));
    assert!(dot.contains("fwd hidden"));
    assert!(dot.contains("bwd hidden"));
    Ok(())
}

#[test]
fn test_parallel_tensor_lookup() -> anyhow::Result<()> {
    let mut model = mlp(FFConfig::new(1, 4))?;
    let x = TensorId(0);
    assert!(model.get_parallel_tensor_from_tensor(x).is_err());
    model.create_operators_from_layers()?;
    let pt = model.get_parallel_tensor_from_tensor(x)?;
    let owner = model.parallel_tensor(pt).owner_op.unwrap();
    assert_eq!(model.op(owner).kind, OperatorKind::Input);
    assert_eq!(model.find_producer(pt), Some((0, owner)));
    Ok(())
}

/// A mapped, unsplit tensor of internal dims `dims`.
fn mapped_tensor(model: &mut FFModel, dims: &[usize]) -> Result<ParallelTensorId> {
    let dims: Vec<ParallelDim> = dims.iter().map(|s| ParallelDim::new(*s)).collect();
    let pt = model.create_parallel_tensor_legion_ordering(&dims, DataType::Float, None, 0, true, None)?;
    let owner = model.parallel_tensor(pt).owner_op;
    model.map_tensor(pt, owner)?;
    Ok(pt)
}

#[test]
fn test_same_rank_partition() -> anyhow::Result<()> {
    let mut model = FFModel::new(FFConfig::new(1, 6));
    let pt = mapped_tensor(&mut model, &[8, 6])?;
    let part_is = model.get_or_create_task_is(&MachineView::new(vec![2, 3]));
    let lp = model.create_disjoint_partition_same_rank(pt, part_is)?;
    let ip = lp.index_partition;
    let rt = model.runtime();
    assert_eq!(rt.get_index_subspace(ip, &[0, 0])?, Rect::new(vec![0, 0], vec![3, 1]));
    assert_eq!(rt.get_index_subspace(ip, &[1, 2])?, Rect::new(vec![4, 4], vec![7, 5]));
    assert!(rt.is_index_partition_disjoint(ip)?);
    assert!(rt.is_index_partition_complete(ip)?);
    assert_eq!(model.parallel_tensor(pt).part, Some(lp));

    let wrong_rank = model.get_or_create_task_is(&MachineView::new(vec![2, 3, 1]));
    assert!(model.create_disjoint_partition_same_rank(pt, wrong_rank).is_err());
    Ok(())
}

#[test]
fn test_data_parallel_partition_with_diff_dims() -> anyhow::Result<()> {
    let mut model = FFModel::new(FFConfig::new(1, 4));
    let pt = mapped_tensor(&mut model, &[8, 6])?;
    let part_is = model.get_or_create_task_is(&MachineView::new(vec![1, 2]));
    let lp = model.create_data_parallel_partition_with_diff_dims(pt, part_is)?;
    let ip = lp.index_partition;
    let rt = model.runtime();
    assert_eq!(rt.get_index_subspace(ip, &[0, 0])?, Rect::new(vec![0, 0], vec![7, 2]));
    assert_eq!(rt.get_index_subspace(ip, &[0, 1])?, Rect::new(vec![0, 3], vec![7, 5]));
    assert!(rt.is_index_partition_disjoint(ip)?);
    assert!(rt.is_index_partition_complete(ip)?);

    let split_inner = model.get_or_create_task_is(&MachineView::new(vec![2, 2]));
    assert!(model
        .create_data_parallel_partition_with_diff_dims(pt, split_inner)
        .is_err());
    Ok(())
}

#[test]
fn test_linear_replica_shards() -> anyhow::Result<()> {
    let mut model = FFModel::new(FFConfig::new(1, 2));
    let task_is = model.get_or_create_task_is(&MachineView::new(vec![1, 2]));
    let replica = model.create_linear_replica(&[6, 4, 2], task_is, DataType::Float)?;
    let tensor = model.parallel_tensor(replica);
    assert!(tensor.region.is_none());
    let ip = tensor.part_grad.unwrap().index_partition;
    let rt = model.runtime();
    assert_eq!(
        rt.get_index_subspace(ip, &[0, 0])?,
        Rect::new(vec![0, 0, 0], vec![5, 1, 1])
    );
    assert_eq!(
        rt.get_index_subspace(ip, &[0, 1])?,
        Rect::new(vec![0, 2, 0], vec![5, 3, 1])
    );
    assert!(rt.is_index_partition_disjoint(ip)?);
    assert!(rt.is_index_partition_complete(ip)?);

    let config = FFConfig::new(1, 2).with_comp_mode(CompMode::Inference);
    let mut inference = FFModel::new(config);
    let task_is = inference.get_or_create_task_is(&MachineView::new(vec![1, 2]));
    assert!(inference
        .create_linear_replica(&[6, 4, 2], task_is, DataType::Float)
        .is_err());
    Ok(())
}

#[test]
fn test_replicate_input_partition_is_aliased() -> anyhow::Result<()> {
    let mut model = FFModel::new(FFConfig::new(1, 2));
    let mut dims = vec![ParallelDim::new(32), ParallelDim::new(16), ParallelDim::replica(1)];
    assign_parallel_idx(&mut dims);
    let x = model.create_parallel_tensor_legion_ordering(&dims, DataType::Float, None, 0, false, None)?;
    let replicate = model.create_operator(
        OperatorKind::Replicate(ParallelOpParams { dim: 2, degree: 2 }),
        None,
        None,
        DataType::Float,
        &[x],
    )?;
    model.compile(LossType::MeanSquaredError, CompMode::Inference)?;

    assert_eq!(model.op_view(replicate), MachineView::new(vec![1, 1, 2]));
    let lp = model.op(replicate).input_partitions[0];
    assert_eq!(Some(lp.region), model.region_of(x));
    let ip = lp.index_partition;
    let rt = model.runtime();
    let whole = Rect::new(vec![0, 0, 0], vec![31, 15, 0]);
    assert_eq!(rt.get_index_subspace(ip, &[0, 0, 0])?, whole);
    assert_eq!(rt.get_index_subspace(ip, &[0, 0, 1])?, whole);
    assert!(rt.is_index_partition_complete(ip)?);
    assert!(!rt.is_index_partition_disjoint(ip)?);
    Ok(())
}

/// input -> a -> b -> c -> d, all element-wise.
fn unary_chain(model: &mut FFModel, inplace_b: bool) -> Result<Vec<TensorId>> {
    let x = model.input(&[64, 32], DataType::Float)?;
    let a = model.unary(UnaryOp::Relu, x, 0.0, false, Some("a"))?;
    let b = model.unary(UnaryOp::Sigmoid, a, 0.0, inplace_b, Some("b"))?;
    let c = model.unary(UnaryOp::Tanh, b, 0.0, false, Some("c"))?;
    let d = model.unary(UnaryOp::Exp, c, 0.0, false, Some("d"))?;
    Ok(vec![a, b, c, d])
}

#[test]
fn test_fusion_refuses_different_views() -> anyhow::Result<()> {
    let mut model = FFModel::new(FFConfig::new(1, 4));
    let outs = unary_chain(&mut model, false)?;
    model.create_operators_from_layers()?;
    let chain: Vec<OpId> = outs[..3].iter().map(|t| owner_of(&model, *t)).collect();
    let mut strategy = HashMap::new();
    strategy.insert(chain[1], model.get_data_parallel_config(chain[1]));
    model.apply_strategy(&strategy)?;
    assert_ne!(model.op_view(chain[0]), model.op_view(chain[1]));

    let num_ops = model.ops.len();
    assert!(model.apply_fusion(&chain)?.is_none());
    assert_eq!(model.ops.len(), num_ops);
    Ok(())
}

#[test]
fn test_fusion_refuses_inplace_operators() -> anyhow::Result<()> {
    let config = FFConfig::new(1, 1).with_inplace_optimizations(true);
    let mut model = FFModel::new(config);
    let outs = unary_chain(&mut model, true)?;
    model.compile(LossType::MeanSquaredError, CompMode::Inference)?;
    let ops: Vec<OpId> = outs.iter().map(|t| owner_of(&model, *t)).collect();
    assert!(model.op(ops[1]).inplace_output);

    // in place as the operator being merged
    assert!(model.apply_fusion(&ops[..3])?.is_none());
    // in place as the merge target
    assert!(model.apply_fusion(&ops[1..])?.is_none());
    Ok(())
}

#[test]
fn test_fusion_refuses_parallel_operators() -> anyhow::Result<()> {
    let config = FFConfig::new(1, 4).with_only_data_parallel(true);
    let mut model = FFModel::new(config);
    let x = model.input(&[64, 32], DataType::Float)?;
    let a = model.unary(UnaryOp::Relu, x, 0.0, false, None)?;
    model.unary(UnaryOp::Tanh, a, 0.0, false, None)?;
    model.create_operators_from_layers()?;

    let ops = model.operators().to_vec();
    assert_eq!(model.op(ops[1]).op_type(), OperatorType::Repartition);
    assert_eq!(model.op_view(ops[1]), model.op_view(ops[2]));
    assert!(model.apply_fusion(&ops)?.is_none());
    assert_eq!(model.operators(), ops.as_slice());
    Ok(())
}

#[test]
fn test_compile_rejects_empty_machine() -> anyhow::Result<()> {
    let mut model = mlp(FFConfig::new(0, 4).with_search(20, 1.2, 0))?;
    assert!(model
        .compile(LossType::SparseCategoricalCrossEntropy, CompMode::Training)
        .is_err());

    let mut model = mlp(FFConfig::new(1, 4))?;
    model.create_operators_from_layers()?;
    model.config.num_nodes = 0;
    let mut best = HashMap::new();
    let mut sim = ConstantSimulator {
        runtime: 1.0,
        calls: 0,
    };
    let mut rng = StdRng::seed_from_u64(0);
    assert!(model
        .mcmc_optimize(&mut best, 10, 1.2, CompMode::Training, false, &mut sim, &mut rng)
        .is_err());
    assert_eq!(sim.calls, 0);
    Ok(())
}
