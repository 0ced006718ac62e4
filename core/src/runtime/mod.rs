use anyhow::Result;

mod domain;
mod local;

pub use domain::{Rect, Transform};
pub use local::LocalRuntime;

use crate::parallel::MachineView;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexSpace(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldSpace(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexPartition(pub usize);

/// Handle of a physical region; two tensors alias iff their handles are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalRegion {
    pub index_space: IndexSpace,
    pub field_space: FieldSpace,
    pub tree_id: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalPartition {
    pub region: LogicalRegion,
    pub index_partition: IndexPartition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommunicatorId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Initializer {
    Zero,
    Constant(f32),
    Uniform { seed: u64, min: f32, max: f32 },
    Glorot { seed: u64 },
    Norm { seed: u64, mean: f32, stddev: f32 },
}

/// The distributed tasking substrate regions and partitions are created on.
///
/// Every call is a blocking round-trip from the single controller thread.
pub trait RegionRuntime {
    fn create_index_space(&mut self, rect: Rect) -> IndexSpace;
    fn index_space_domain(&self, is: IndexSpace) -> Result<Rect>;
    fn create_field_space(&mut self, field_size: usize) -> FieldSpace;
    fn create_logical_region(&mut self, is: IndexSpace, fs: FieldSpace) -> Result<LogicalRegion>;
    /// Shard for color `c` is `(transform * c + extent) ∩ parent`.
    fn create_partition_by_restriction(
        &mut self,
        parent: IndexSpace,
        color_space: IndexSpace,
        transform: &Transform,
        extent: &Rect,
    ) -> Result<IndexPartition>;
    fn is_index_partition_disjoint(&self, ip: IndexPartition) -> Result<bool>;
    fn is_index_partition_complete(&self, ip: IndexPartition) -> Result<bool>;
    fn get_logical_partition(
        &mut self,
        region: LogicalRegion,
        ip: IndexPartition,
    ) -> Result<LogicalPartition>;
    fn get_index_subspace(&self, ip: IndexPartition, color: &[i64]) -> Result<Rect>;
    fn initialize_region(&mut self, region: LogicalRegion, initializer: &Initializer) -> Result<()>;
    fn create_communicator(&mut self, view: &MachineView) -> Result<CommunicatorId>;
}
