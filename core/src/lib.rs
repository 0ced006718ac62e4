mod common;
mod graph;
mod model;
mod ops;
mod parallel;
mod runtime;
mod search;

pub use common::config::{CompMode, FFConfig, LossType, ModelArgs, ParameterSyncType};
pub use graph::{Edge, EdgeQuery, Graph};
pub use model::{FFModel, Layer, LayerId, OpId, ParallelTensor, ParallelTensorId, Tensor, TensorId};
pub use ops::params;
pub use ops::{
    FusedOp, Operator, OperatorKind, OperatorType, SourceType, WeightSpec, MAX_NUM_FUSED_OPERATORS,
    MAX_NUM_FUSED_TENSORS,
};
pub use parallel::{
    assign_parallel_idx, machine_view_of, reversed, DataType, GuidGenerator, MachineView,
    ParallelConfig, ParallelDim, ParallelTensorShape, LAYER_GUID_FIRST_VALID, MAX_TENSOR_DIM,
    NODE_GUID_FIRST_VALID, OP_GUID_FIRST_VALID, PARALLEL_TENSOR_GUID_FIRST_VALID,
    TENSOR_GUID_FIRST_VALID,
};
pub use runtime::{
    CommunicatorId, FieldSpace, IndexPartition, IndexSpace, Initializer, LocalRuntime,
    LogicalPartition, LogicalRegion, Rect, RegionRuntime, Transform,
};
pub use search::{
    reset_span, CostSimulator, CONTINUE_PROPAGATION_CHANCE, PROPAGATION_CHANCE,
    PROPAGATION_SIZE_WEIGHT, MachineModel, SearchReport, Simulator, StrategyEntry, StrategyReport,
    MAXIMUM_TASK_RUN_TIME,
};
