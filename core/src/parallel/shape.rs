use anyhow::{anyhow, Result};
use serde::Serialize;

use super::machine_view::MachineView;

/// Upper bound on the rank of any tensor, replica dimension included.
pub const MAX_TENSOR_DIM: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[derive(strum_macros::Display, strum_macros::EnumString)]
pub enum DataType {
    Boolean,
    Int32,
    Int64,
    Half,
    Float,
    Double,
}

impl DataType {
    pub fn size(&self) -> usize {
        match self {
            DataType::Boolean => 1,
            DataType::Half => 2,
            DataType::Int32 | DataType::Float => 4,
            DataType::Int64 | DataType::Double => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParallelDim {
    pub size: usize,
    pub degree: usize,
    pub parallel_idx: i32,
    pub is_replica_dim: bool,
}

impl ParallelDim {
    pub const UNPARTITIONED: i32 = -1;

    pub fn new(size: usize) -> Self {
        Self {
            size,
            degree: 1,
            parallel_idx: Self::UNPARTITIONED,
            is_replica_dim: false,
        }
    }
    pub fn with_degree(size: usize, degree: usize, parallel_idx: i32) -> Self {
        Self {
            size,
            degree,
            parallel_idx,
            is_replica_dim: false,
        }
    }
    /// A replica axis holds one copy per shard, its size always equals its degree.
    pub fn replica(degree: usize) -> Self {
        Self {
            size: degree,
            degree,
            parallel_idx: Self::UNPARTITIONED,
            is_replica_dim: true,
        }
    }
    pub fn is_valid(&self) -> bool {
        self.size >= 1 && self.degree >= 1 && self.size % self.degree == 0
    }
}

/// Dimensions are kept in internal order: index 0 is the innermost axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParallelTensorShape {
    pub dims: Vec<ParallelDim>,
    pub data_type: DataType,
}

impl ParallelTensorShape {
    pub fn new(dims: Vec<ParallelDim>, data_type: DataType) -> Self {
        Self { dims, data_type }
    }

    pub fn num_dims(&self) -> usize {
        self.dims.len()
    }

    pub fn is_valid(&self) -> bool {
        if self.dims.is_empty() || self.dims.len() > MAX_TENSOR_DIM {
            return false;
        }
        let replicas = self.dims.iter().filter(|d| d.is_replica_dim).count();
        replicas <= 1 && self.dims.iter().all(|d| d.is_valid())
    }

    pub fn check_valid(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(anyhow!("invalid parallel tensor shape:{:?}", self.dims))
        }
    }

    /// Number of elements of the logical tensor, replica copies excluded.
    pub fn volume(&self) -> usize {
        self.dims
            .iter()
            .filter(|d| !d.is_replica_dim)
            .map(|d| d.size)
            .product()
    }

    /// Number of elements held by a single shard.
    pub fn piece_volume(&self) -> usize {
        self.dims
            .iter()
            .filter(|d| !d.is_replica_dim)
            .map(|d| (d.size + d.degree - 1) / d.degree)
            .product()
    }

    pub fn num_replica_free_dims(&self) -> usize {
        self.dims.iter().filter(|d| !d.is_replica_dim).count()
    }

    pub fn replica_dim(&self) -> Option<usize> {
        self.dims.iter().position(|d| d.is_replica_dim)
    }

    pub fn total_degree(&self) -> usize {
        self.dims.iter().map(|d| d.degree).product()
    }

    pub fn machine_view(&self) -> MachineView {
        machine_view_of(&self.dims)
    }

    pub fn sizes(&self) -> Vec<usize> {
        self.dims.iter().map(|d| d.size).collect()
    }
}

/// The grid spanned by the axes a tensor is mapped onto, `[1]` when none are.
pub fn machine_view_of(dims: &[ParallelDim]) -> MachineView {
    let mut mapped: Vec<(i32, usize)> = dims
        .iter()
        .filter(|d| d.parallel_idx >= 0)
        .map(|d| (d.parallel_idx, d.degree))
        .collect();
    if mapped.is_empty() {
        return MachineView::new(vec![1]);
    }
    mapped.sort();
    MachineView::new(mapped.into_iter().map(|(_, degree)| degree).collect())
}

/// Maps every non-replica axis `i` onto view axis `i`; a split replica axis comes last.
pub fn assign_parallel_idx(dims: &mut [ParallelDim]) {
    let mut next = 0;
    for dim in dims.iter_mut().filter(|d| !d.is_replica_dim) {
        dim.parallel_idx = next;
        next += 1;
    }
    for dim in dims.iter_mut().filter(|d| d.is_replica_dim) {
        dim.parallel_idx = if dim.degree > 1 {
            next
        } else {
            ParallelDim::UNPARTITIONED
        };
    }
}

pub fn reversed<T: Clone>(dims: &[T]) -> Vec<T> {
    dims.iter().rev().cloned().collect()
}

#[test]
fn test_shape_validity() -> anyhow::Result<()> {
    let shape = ParallelTensorShape::new(
        vec![
            ParallelDim::new(128),
            ParallelDim::with_degree(64, 4, 0),
            ParallelDim::replica(1),
        ],
        DataType::Float,
    );
    assert!(shape.is_valid());
    assert_eq!(shape.volume(), 128 * 64);
    assert_eq!(shape.piece_volume(), 128 * 16);
    assert_eq!(shape.replica_dim(), Some(2));
    assert_eq!(shape.machine_view().dims, vec![4]);

    let uneven = ParallelTensorShape::new(
        vec![ParallelDim::with_degree(10, 4, 0)],
        DataType::Float,
    );
    assert!(!uneven.is_valid());
    assert!(uneven.check_valid().is_err());

    let two_replicas = ParallelTensorShape::new(
        vec![ParallelDim::new(8), ParallelDim::replica(2), ParallelDim::replica(2)],
        DataType::Half,
    );
    assert!(!two_replicas.is_valid());

    let too_deep = ParallelTensorShape::new(vec![ParallelDim::new(2); 6], DataType::Float);
    assert!(!too_deep.is_valid());
    Ok(())
}

#[test]
fn test_assign_parallel_idx() -> anyhow::Result<()> {
    let mut dims = vec![
        ParallelDim::new(16),
        ParallelDim::with_degree(8, 2, ParallelDim::UNPARTITIONED),
        ParallelDim::replica(1),
    ];
    assert_eq!(machine_view_of(&dims).dims, vec![1]);
    assign_parallel_idx(&mut dims);
    assert_eq!(dims[0].parallel_idx, 0);
    assert_eq!(dims[1].parallel_idx, 1);
    assert_eq!(dims[2].parallel_idx, -1);
    assert_eq!(machine_view_of(&dims).dims, vec![1, 2]);

    dims[2] = ParallelDim::replica(4);
    assign_parallel_idx(&mut dims);
    assert_eq!(dims[2].parallel_idx, 2);
    assert_eq!(machine_view_of(&dims).dims, vec![1, 2, 4]);
    Ok(())
}

#[test]
fn test_reversal_is_involution() -> anyhow::Result<()> {
    for len in 1..=MAX_TENSOR_DIM {
        let dims: Vec<usize> = (0..len).map(|i| 3 * i + 1).collect();
        let once = reversed(&dims);
        assert_eq!(once.first(), dims.last());
        assert_eq!(reversed(&once), dims);
    }
    Ok(())
}
