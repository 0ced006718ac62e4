use std::collections::{BTreeSet, HashMap};

use anyhow::{anyhow, Result};

use super::{
    CommunicatorId, FieldSpace, IndexPartition, IndexSpace, Initializer, LogicalPartition,
    LogicalRegion, Rect, RegionRuntime, Transform,
};
use crate::parallel::MachineView;

struct PartitionRecord {
    parent: IndexSpace,
    color_space: IndexSpace,
    subspaces: Vec<(Vec<i64>, Rect)>,
}

/// Single process substrate computing exact shard rectangles.
#[derive(Default)]
pub struct LocalRuntime {
    index_spaces: Vec<Rect>,
    field_sizes: Vec<usize>,
    regions: Vec<LogicalRegion>,
    partitions: Vec<PartitionRecord>,
    initialized: HashMap<LogicalRegion, Initializer>,
    communicators: Vec<MachineView>,
}

impl LocalRuntime {
    pub fn new() -> Self {
        Default::default()
    }

    fn partition(&self, ip: IndexPartition) -> Result<&PartitionRecord> {
        self.partitions
            .get(ip.0)
            .ok_or(anyhow!("unknown index partition:{:?}", ip))
    }

    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }
    pub fn initializer_of(&self, region: &LogicalRegion) -> Option<&Initializer> {
        self.initialized.get(region)
    }
    pub fn field_size(&self, fs: FieldSpace) -> Option<usize> {
        self.field_sizes.get(fs.0).copied()
    }
    pub fn communicator_view(&self, comm: CommunicatorId) -> Option<&MachineView> {
        self.communicators.get(comm.0)
    }
}

/// Whether the union of `pieces` covers `parent`, tested cell by cell over the
/// grid induced by every piece boundary.
fn covers(parent: &Rect, pieces: &[&Rect]) -> bool {
    if parent.is_empty() {
        return true;
    }
    let rank = parent.dim();
    let mut cuts: Vec<Vec<i64>> = Vec::with_capacity(rank);
    for axis in 0..rank {
        let mut axis_cuts = BTreeSet::new();
        axis_cuts.insert(parent.lo[axis]);
        for piece in pieces.iter().filter(|p| !p.is_empty()) {
            if piece.lo[axis] > parent.lo[axis] && piece.lo[axis] <= parent.hi[axis] {
                axis_cuts.insert(piece.lo[axis]);
            }
            if piece.hi[axis] >= parent.lo[axis] && piece.hi[axis] < parent.hi[axis] {
                axis_cuts.insert(piece.hi[axis] + 1);
            }
        }
        cuts.push(axis_cuts.into_iter().collect());
    }
    let cell_grid = Rect::from_sizes(&cuts.iter().map(|c| c.len()).collect::<Vec<_>>());
    cell_grid.points().into_iter().all(|cell| {
        let corner: Vec<i64> = cell
            .iter()
            .enumerate()
            .map(|(axis, idx)| cuts[axis][*idx as usize])
            .collect();
        pieces.iter().any(|p| p.contains_point(&corner))
    })
}

impl RegionRuntime for LocalRuntime {
    fn create_index_space(&mut self, rect: Rect) -> IndexSpace {
        self.index_spaces.push(rect);
        IndexSpace(self.index_spaces.len() - 1)
    }

    fn index_space_domain(&self, is: IndexSpace) -> Result<Rect> {
        self.index_spaces
            .get(is.0)
            .cloned()
            .ok_or(anyhow!("unknown index space:{:?}", is))
    }

    fn create_field_space(&mut self, field_size: usize) -> FieldSpace {
        self.field_sizes.push(field_size);
        FieldSpace(self.field_sizes.len() - 1)
    }

    fn create_logical_region(&mut self, is: IndexSpace, fs: FieldSpace) -> Result<LogicalRegion> {
        if is.0 >= self.index_spaces.len() {
            return Err(anyhow!("unknown index space:{:?}", is));
        }
        if fs.0 >= self.field_sizes.len() {
            return Err(anyhow!("unknown field space:{:?}", fs));
        }
        let region = LogicalRegion {
            index_space: is,
            field_space: fs,
            tree_id: self.regions.len() + 1,
        };
        self.regions.push(region);
        Ok(region)
    }

    fn create_partition_by_restriction(
        &mut self,
        parent: IndexSpace,
        color_space: IndexSpace,
        transform: &Transform,
        extent: &Rect,
    ) -> Result<IndexPartition> {
        let parent_rect = self.index_space_domain(parent)?;
        let colors = self.index_space_domain(color_space)?;
        if transform.rows() != parent_rect.dim() || extent.dim() != parent_rect.dim() {
            return Err(anyhow!(
                "restriction rank mismatch, parent:{} transform:{} extent:{}",
                parent_rect.dim(),
                transform.rows(),
                extent.dim()
            ));
        }
        if transform.cols() != colors.dim() {
            return Err(anyhow!(
                "transform has {} columns but the color space has rank {}",
                transform.cols(),
                colors.dim()
            ));
        }
        let mut subspaces = Vec::new();
        for color in colors.points() {
            let offset = transform.apply(&color)?;
            let lo = offset.iter().zip(extent.lo.iter()).map(|(o, l)| o + l).collect();
            let hi = offset.iter().zip(extent.hi.iter()).map(|(o, h)| o + h).collect();
            let shard = Rect::new(lo, hi).intersection(&parent_rect);
            subspaces.push((color, shard));
        }
        self.partitions.push(PartitionRecord {
            parent,
            color_space,
            subspaces,
        });
        Ok(IndexPartition(self.partitions.len() - 1))
    }

    fn is_index_partition_disjoint(&self, ip: IndexPartition) -> Result<bool> {
        let record = self.partition(ip)?;
        for (i, (_, a)) in record.subspaces.iter().enumerate() {
            for (_, b) in record.subspaces.iter().skip(i + 1) {
                if a.overlaps(b) {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn is_index_partition_complete(&self, ip: IndexPartition) -> Result<bool> {
        let record = self.partition(ip)?;
        let parent = self.index_space_domain(record.parent)?;
        let pieces: Vec<&Rect> = record.subspaces.iter().map(|(_, r)| r).collect();
        Ok(covers(&parent, &pieces))
    }

    fn get_logical_partition(
        &mut self,
        region: LogicalRegion,
        ip: IndexPartition,
    ) -> Result<LogicalPartition> {
        let record = self.partition(ip)?;
        if record.parent != region.index_space {
            return Err(anyhow!(
                "partition {:?} is not a partition of the index space of {:?}",
                ip,
                region
            ));
        }
        Ok(LogicalPartition {
            region,
            index_partition: ip,
        })
    }

    fn get_index_subspace(&self, ip: IndexPartition, color: &[i64]) -> Result<Rect> {
        let record = self.partition(ip)?;
        let colors = self.index_space_domain(record.color_space)?;
        if !colors.contains_point(color) {
            return Err(anyhow!("color {:?} outside of {:?}", color, colors));
        }
        record
            .subspaces
            .iter()
            .find(|(c, _)| c.as_slice() == color)
            .map(|(_, r)| r.clone())
            .ok_or(anyhow!("no subspace for color {:?}", color))
    }

    fn initialize_region(&mut self, region: LogicalRegion, initializer: &Initializer) -> Result<()> {
        if region.tree_id == 0 || region.tree_id > self.regions.len() {
            return Err(anyhow!("unknown region:{:?}", region));
        }
        self.initialized.insert(region, *initializer);
        Ok(())
    }

    fn create_communicator(&mut self, view: &MachineView) -> Result<CommunicatorId> {
        if view.num_parts() == 0 {
            return Err(anyhow!("empty machine view:{:?}", view));
        }
        self.communicators.push(view.clone());
        Ok(CommunicatorId(self.communicators.len() - 1))
    }
}

#[cfg(test)]
fn restrict(
    rt: &mut LocalRuntime,
    parent: &[usize],
    colors: &[usize],
    transform: Transform,
    extent: Rect,
) -> Result<IndexPartition> {
    let parent = rt.create_index_space(Rect::from_sizes(parent));
    let colors = rt.create_index_space(Rect::from_sizes(colors));
    rt.create_partition_by_restriction(parent, colors, &transform, &extent)
}

#[test]
fn test_restriction_shards() -> anyhow::Result<()> {
    let mut rt = LocalRuntime::new();
    let mut t = Transform::zeros(2, 1);
    t.set(1, 0, 16);
    let ip = restrict(
        &mut rt,
        &[128, 64],
        &[4],
        t,
        Rect::new(vec![0, 0], vec![127, 15]),
    )?;
    assert!(rt.is_index_partition_disjoint(ip)?);
    assert!(rt.is_index_partition_complete(ip)?);
    assert_eq!(
        rt.get_index_subspace(ip, &[2])?,
        Rect::new(vec![0, 32], vec![127, 47])
    );
    assert!(rt.get_index_subspace(ip, &[4]).is_err());
    Ok(())
}

#[test]
fn test_aliased_and_incomplete() -> anyhow::Result<()> {
    let mut rt = LocalRuntime::new();
    // every color sees the whole space
    let aliased = restrict(
        &mut rt,
        &[8, 8],
        &[2],
        Transform::zeros(2, 1),
        Rect::from_sizes(&[8, 8]),
    )?;
    assert!(!rt.is_index_partition_disjoint(aliased)?);
    assert!(rt.is_index_partition_complete(aliased)?);

    // shards of 3 starting every 4 leave holes
    let mut t = Transform::zeros(1, 1);
    t.set(0, 0, 4);
    let holes = restrict(&mut rt, &[8], &[2], t, Rect::new(vec![0], vec![2]))?;
    assert!(rt.is_index_partition_disjoint(holes)?);
    assert!(!rt.is_index_partition_complete(holes)?);
    Ok(())
}

#[test]
fn test_overlapping_cover() -> anyhow::Result<()> {
    let parent = Rect::from_sizes(&[10, 10]);
    let a = Rect::new(vec![0, 0], vec![6, 9]);
    let b = Rect::new(vec![4, 0], vec![9, 5]);
    let c = Rect::new(vec![4, 5], vec![9, 9]);
    assert!(covers(&parent, &[&a, &b, &c]));
    assert!(!covers(&parent, &[&a, &b]));
    Ok(())
}
