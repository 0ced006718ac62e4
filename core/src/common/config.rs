use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, ValueEnum, Serialize)]
#[derive(strum_macros::Display)]
pub enum CompMode {
    #[default]
    Training,
    Inference,
}

/// How replicated weights are kept in sync across the devices of a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, ValueEnum, Serialize)]
#[derive(strum_macros::Display)]
pub enum ParameterSyncType {
    #[default]
    Ps,
    Nccl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, ValueEnum)]
#[derive(strum_macros::Display)]
pub enum LossType {
    #[default]
    SparseCategoricalCrossEntropy,
    CategoricalCrossEntropy,
    MeanSquaredError,
}

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct ModelArgs {
    #[clap(default_value = "64", long, help = "global batch size")]
    batch_size: usize,
    #[clap(default_value = "1", long, help = "number of nodes in the machine model")]
    num_nodes: usize,
    #[clap(default_value = "4", long, help = "number of GPUs per node")]
    workers_per_node: usize,
    #[clap(
        default_value = "2048",
        long,
        help = "per-GPU memory budget (MiB) of the cost simulator"
    )]
    simulator_work_space_size: usize,

    // search
    #[clap(
        default_value = "0",
        long,
        help = "number of MCMC iterations, 0 disables the search"
    )]
    search_budget: usize,
    #[clap(default_value = "1.2", long, help = "MCMC acceptance temperature")]
    search_alpha: f32,
    #[clap(default_value = "0", long, help = "random seed of the search")]
    seed: u64,
    #[clap(long, help = "also propose propagation moves during the search")]
    enable_propagation: bool,
    #[clap(long, help = "only data parallel strategies, inserts input repartitions")]
    only_data_parallel: bool,
    #[clap(long, help = "forbid splitting the sample dimension")]
    disable_sample_parallel: bool,
    #[clap(long, help = "allow splitting the channel dimension")]
    enable_parameter_parallel: bool,
    #[clap(long, help = "allow splitting the remaining (attribute) dimensions")]
    enable_attribute_parallel: bool,

    // compile
    #[clap(long, help = "run operators in place when possible")]
    enable_inplace_optimizations: bool,
    #[clap(long, help = "fuse chains of operators sharing a machine view")]
    perform_fusion: bool,
    #[clap(value_enum, default_value = "ps", long, help = "weight synchronization")]
    parameter_sync: ParameterSyncType,
    #[clap(value_enum, default_value = "training", long)]
    comp_mode: CompMode,

    #[clap(long, help = "write the best strategy as json to this file")]
    export_strategy: Option<String>,
    #[clap(long, help = "write the simulated task graph as graphviz dot to this file")]
    export_taskgraph: Option<String>,
}

impl ModelArgs {
    pub fn create_config(&self) -> Result<FFConfig> {
        if self.batch_size == 0 {
            return Err(anyhow!("batch_size must be positive"));
        }
        if self.num_nodes == 0 || self.workers_per_node == 0 {
            return Err(anyhow!(
                "invalid machine model, num_nodes:{} workers_per_node:{}",
                self.num_nodes,
                self.workers_per_node
            ));
        }
        if !(self.search_alpha > 0.0) {
            return Err(anyhow!("search_alpha must be positive, got {}", self.search_alpha));
        }
        let cfg = FFConfig {
            batch_size: self.batch_size,
            num_nodes: self.num_nodes,
            workers_per_node: self.workers_per_node,
            simulator_work_space_size: self.simulator_work_space_size << 20,
            search_budget: self.search_budget,
            search_alpha: self.search_alpha,
            seed: self.seed,
            enable_propagation: self.enable_propagation,
            only_data_parallel: self.only_data_parallel,
            enable_sample_parallel: !self.disable_sample_parallel,
            enable_parameter_parallel: self.enable_parameter_parallel,
            enable_attribute_parallel: self.enable_attribute_parallel,
            enable_inplace_optimizations: self.enable_inplace_optimizations,
            perform_fusion: self.perform_fusion,
            parameter_sync: self.parameter_sync,
            comp_mode: self.comp_mode,
            export_strategy_file: self.export_strategy.clone(),
            export_taskgraph_file: self.export_taskgraph.clone(),
        };
        tracing::info!("{:?}", cfg);
        Ok(cfg)
    }
}

#[derive(Debug, Clone)]
pub struct FFConfig {
    pub(crate) batch_size: usize,
    pub(crate) num_nodes: usize,
    pub(crate) workers_per_node: usize,
    pub(crate) simulator_work_space_size: usize,
    pub(crate) search_budget: usize,
    pub(crate) search_alpha: f32,
    pub(crate) seed: u64,
    pub(crate) enable_propagation: bool,
    pub(crate) only_data_parallel: bool,
    pub(crate) enable_sample_parallel: bool,
    pub(crate) enable_parameter_parallel: bool,
    pub(crate) enable_attribute_parallel: bool,
    pub(crate) enable_inplace_optimizations: bool,
    pub(crate) perform_fusion: bool,
    pub(crate) parameter_sync: ParameterSyncType,
    pub(crate) comp_mode: CompMode,
    pub(crate) export_strategy_file: Option<String>,
    pub(crate) export_taskgraph_file: Option<String>,
}

impl Default for FFConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            num_nodes: 1,
            workers_per_node: 4,
            simulator_work_space_size: 2 << 30,
            search_budget: 0,
            search_alpha: 1.2,
            seed: 0,
            enable_propagation: false,
            only_data_parallel: false,
            enable_sample_parallel: true,
            enable_parameter_parallel: false,
            enable_attribute_parallel: false,
            enable_inplace_optimizations: false,
            perform_fusion: false,
            parameter_sync: ParameterSyncType::Ps,
            comp_mode: CompMode::Training,
            export_strategy_file: None,
            export_taskgraph_file: None,
        }
    }
}

impl FFConfig {
    pub fn new(num_nodes: usize, workers_per_node: usize) -> Self {
        Self {
            num_nodes,
            workers_per_node,
            ..Default::default()
        }
    }
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
    pub fn with_search(mut self, budget: usize, alpha: f32, seed: u64) -> Self {
        self.search_budget = budget;
        self.search_alpha = alpha;
        self.seed = seed;
        self
    }
    pub fn with_fusion(mut self, perform_fusion: bool) -> Self {
        self.perform_fusion = perform_fusion;
        self
    }
    pub fn with_only_data_parallel(mut self, only_data_parallel: bool) -> Self {
        self.only_data_parallel = only_data_parallel;
        self
    }
    pub fn with_inplace_optimizations(mut self, enable: bool) -> Self {
        self.enable_inplace_optimizations = enable;
        self
    }
    pub fn with_parameter_sync(mut self, sync: ParameterSyncType) -> Self {
        self.parameter_sync = sync;
        self
    }
    pub fn with_comp_mode(mut self, comp_mode: CompMode) -> Self {
        self.comp_mode = comp_mode;
        self
    }
    pub fn with_propagation(mut self, enable: bool) -> Self {
        self.enable_propagation = enable;
        self
    }
    /// Axes the search may split: sample, parameter (innermost) and attribute (the rest).
    pub fn with_parallel_axes(mut self, sample: bool, parameter: bool, attribute: bool) -> Self {
        self.enable_sample_parallel = sample;
        self.enable_parameter_parallel = parameter;
        self.enable_attribute_parallel = attribute;
        self
    }
    pub fn with_simulator_work_space_size(mut self, bytes: usize) -> Self {
        self.simulator_work_space_size = bytes;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
    pub fn total_workers(&self) -> usize {
        self.num_nodes * self.workers_per_node
    }
    pub fn comp_mode(&self) -> CompMode {
        self.comp_mode
    }
    pub fn seed(&self) -> u64 {
        self.seed
    }
    pub fn search_budget(&self) -> usize {
        self.search_budget
    }
    pub fn search_alpha(&self) -> f32 {
        self.search_alpha
    }
    pub fn export_strategy_file(&self) -> Option<&str> {
        self.export_strategy_file.as_deref()
    }
    pub fn export_taskgraph_file(&self) -> Option<&str> {
        self.export_taskgraph_file.as_deref()
    }
}

#[test]
fn test_create_config() -> anyhow::Result<()> {
    let args = ModelArgs::parse_from([
        "flexpar",
        "--workers-per-node",
        "8",
        "--search-budget",
        "100",
        "--parameter-sync",
        "nccl",
        "--comp-mode",
        "inference",
    ]);
    let cfg = args.create_config()?;
    assert_eq!(cfg.total_workers(), 8);
    assert_eq!(cfg.search_budget, 100);
    assert_eq!(cfg.parameter_sync, ParameterSyncType::Nccl);
    assert_eq!(cfg.comp_mode, CompMode::Inference);
    assert_eq!(cfg.simulator_work_space_size, 2 << 30);
    assert!(cfg.enable_sample_parallel);

    let args = ModelArgs::parse_from(["flexpar", "--num-nodes", "0"]);
    assert!(args.create_config().is_err());
    Ok(())
}
