mod guid;
mod machine_view;
mod shape;

pub use guid::GuidGenerator;
pub use guid::{
    LAYER_GUID_FIRST_VALID, NODE_GUID_FIRST_VALID, OP_GUID_FIRST_VALID,
    PARALLEL_TENSOR_GUID_FIRST_VALID, TENSOR_GUID_FIRST_VALID,
};
pub use machine_view::{MachineView, ParallelConfig};
pub use shape::{
    assign_parallel_idx, machine_view_of, reversed, DataType, ParallelDim, ParallelTensorShape,
    MAX_TENSOR_DIM,
};
