use anyhow::{anyhow, Result};

use super::{FFModel, OpId, ParallelTensorId};
use crate::common::config::{CompMode, ParameterSyncType};
use crate::ops::OperatorType;
use crate::parallel::{DataType, MachineView, ParallelConfig, ParallelDim, ParallelTensorShape};
use crate::runtime::{
    FieldSpace, IndexSpace, LogicalPartition, LogicalRegion, Rect, Transform,
};

/// Restriction transform and extent splitting each axis `i` of `dims` into
/// `degree_i` pieces of `ceil(size_i / degree_i)` along view axis `parallel_idx_i`.
pub fn compute_transform(dims: &[ParallelDim], color_rank: usize) -> Result<(Transform, Rect)> {
    let mut transform = Transform::zeros(dims.len(), color_rank);
    let mut hi = Vec::with_capacity(dims.len());
    for (i, dim) in dims.iter().enumerate() {
        if dim.degree == 0 {
            return Err(anyhow!("axis {} has degree 0", i));
        }
        let extent = (dim.size + dim.degree - 1) / dim.degree;
        hi.push(extent as i64 - 1);
        if dim.parallel_idx >= 0 {
            let j = dim.parallel_idx as usize;
            if j >= color_rank {
                return Err(anyhow!(
                    "axis {} maps to view axis {} but the view has rank {}",
                    i,
                    j,
                    color_rank
                ));
            }
            transform.set(i, j, extent as i64);
        } else if dim.degree != 1 {
            return Err(anyhow!("axis {} has degree {} but no view axis", i, dim.degree));
        }
    }
    Ok((transform, Rect::new(vec![0; dims.len()], hi)))
}

fn activation_field_size(data_type: DataType) -> Result<usize> {
    match data_type {
        DataType::Half | DataType::Float | DataType::Double | DataType::Int32 | DataType::Int64 => {
            Ok(data_type.size())
        }
        _ => Err(anyhow!("unsupported data type for a region:{}", data_type)),
    }
}

fn weight_field_size(data_type: DataType) -> Result<usize> {
    match data_type {
        DataType::Float | DataType::Double | DataType::Int32 => Ok(data_type.size()),
        _ => Err(anyhow!("unsupported data type for a weight:{}", data_type)),
    }
}

impl FFModel {
    fn is_training(&self) -> bool {
        self.config.comp_mode == CompMode::Training
    }

    pub fn get_or_create_task_is(&mut self, view: &MachineView) -> IndexSpace {
        if let Some(is) = self.task_is.get(view) {
            return *is;
        }
        let is = self.runtime.create_index_space(Rect::from_sizes(&view.dims));
        tracing::debug!("create task index space {:?} for view {:?}", is, view.dims);
        self.task_is.insert(view.clone(), is);
        is
    }

    pub fn get_task_is(&self, view: &MachineView) -> Result<IndexSpace> {
        self.task_is
            .get(view)
            .copied()
            .ok_or(anyhow!("no task index space for view {:?}", view.dims))
    }

    pub fn get_or_create_task_is_for_config(&mut self, pc: &ParallelConfig) -> IndexSpace {
        self.get_or_create_task_is(&pc.view())
    }

    pub fn get_or_create_task_is_for_tensor(&mut self, id: ParallelTensorId) -> IndexSpace {
        let view = self.parallel_tensors[id.0].shape.machine_view();
        self.get_or_create_task_is(&view)
    }

    pub fn get_or_create_task_is_for_domain(&mut self, domain: &Rect) -> IndexSpace {
        self.get_or_create_task_is(&MachineView::new(domain.extents()))
    }

    /// Partitions `region` by restriction, failing when the result does not
    /// cover the region or, if requested, when shards overlap.
    fn restrict(
        &mut self,
        region: LogicalRegion,
        part_is: IndexSpace,
        transform: &Transform,
        extent: &Rect,
        require_disjoint: bool,
    ) -> Result<LogicalPartition> {
        let ip = self.runtime.create_partition_by_restriction(
            region.index_space,
            part_is,
            transform,
            extent,
        )?;
        if require_disjoint && !self.runtime.is_index_partition_disjoint(ip)? {
            return Err(anyhow!("partition of {:?} is not disjoint", region));
        }
        if !self.runtime.is_index_partition_complete(ip)? {
            return Err(anyhow!("partition of {:?} is not complete", region));
        }
        self.runtime.get_logical_partition(region, ip)
    }

    pub fn create_disjoint_partition(
        &mut self,
        dims: &[ParallelDim],
        part_is: IndexSpace,
        region: LogicalRegion,
    ) -> Result<LogicalPartition> {
        let color_rank = self.runtime.index_space_domain(part_is)?.dim();
        let (transform, extent) = compute_transform(dims, color_rank)?;
        self.restrict(region, part_is, &transform, &extent, true)
    }

    /// Like a disjoint partition except `aliased_dim` stays whole in every shard.
    pub fn create_aliased_partition(
        &mut self,
        dims: &[ParallelDim],
        aliased_dim: usize,
        part_is: IndexSpace,
        region: LogicalRegion,
    ) -> Result<LogicalPartition> {
        let mut dims = dims.to_vec();
        let aliased = dims
            .get_mut(aliased_dim)
            .ok_or(anyhow!("aliased dim {} out of range", aliased_dim))?;
        aliased.degree = 1;
        aliased.parallel_idx = ParallelDim::UNPARTITIONED;
        let color_rank = self.runtime.index_space_domain(part_is)?.dim();
        let (transform, extent) = compute_transform(&dims, color_rank)?;
        self.restrict(region, part_is, &transform, &extent, false)
    }

    /// Creates the regions of `id` and, when `op` is given, its partition
    /// over the tensor's own task space. Runs the initializer last.
    pub fn map_tensor(&mut self, id: ParallelTensorId, op: Option<OpId>) -> Result<()> {
        let training = self.is_training();
        let tensor = &mut self.parallel_tensors[id.0];
        match (tensor.owner_op, op) {
            (None, Some(op)) => {
                tensor.owner_op = Some(op);
                tensor.owner_idx = -1;
            }
            (Some(owner), Some(op)) if owner != op => {
                return Err(anyhow!(
                    "tensor {} is owned by {:?}, cannot be mapped by {:?}",
                    tensor.guid,
                    owner,
                    op
                ));
            }
            _ => {}
        }
        if tensor.region.is_some() {
            return Err(anyhow!("tensor {} is already mapped", tensor.guid));
        }
        let dims = tensor.shape.dims.clone();
        let field_size = activation_field_size(tensor.data_type())?;
        let with_grad = tensor.create_gradients && training;
        let initializer = tensor.initializer;

        let is = self.runtime.create_index_space(Rect::from_sizes(
            &dims.iter().map(|d| d.size).collect::<Vec<_>>(),
        ));
        let fs = self.runtime.create_field_space(field_size);
        let region = self.runtime.create_logical_region(is, fs)?;
        let region_grad = if with_grad {
            Some(self.runtime.create_logical_region(is, fs)?)
        } else {
            None
        };
        let mut parallel_is = None;
        let mut part = None;
        let mut part_grad = None;
        if op.is_some() {
            let part_is = self.get_or_create_task_is_for_tensor(id);
            let lp = self.create_disjoint_partition(&dims, part_is, region)?;
            if let Some(grad) = region_grad {
                part_grad = Some(self.runtime.get_logical_partition(grad, lp.index_partition)?);
            }
            parallel_is = Some(part_is);
            part = Some(lp);
        }
        if let Some(init) = initializer {
            self.runtime.initialize_region(region, &init)?;
        }
        let tensor = &mut self.parallel_tensors[id.0];
        tensor.region = Some(region);
        tensor.region_grad = region_grad;
        tensor.part = part;
        tensor.part_grad = part_grad;
        tensor.parallel_is = parallel_is;
        tensor.machine_view = tensor.shape.machine_view();
        tracing::debug!(
            "map tensor {} dims:{:?} region:{:?} part:{:?}",
            tensor.guid,
            tensor.shape.sizes(),
            region,
            part
        );
        Ok(())
    }

    /// Maps every output of `op`; in-place outputs alias the first input.
    pub fn map_output_tensors(&mut self, op: OpId) -> Result<()> {
        let outputs = self.ops[op.0].outputs.clone();
        if self.ops[op.0].inplace_output {
            let input = *self.ops[op.0]
                .inputs
                .first()
                .ok_or(anyhow!("in-place operator {} has no input", self.ops[op.0].name))?;
            let src = self.parallel_tensors[input.0].clone();
            if src.region.is_none() {
                return Err(anyhow!(
                    "input of in-place operator {} is not mapped",
                    self.ops[op.0].name
                ));
            }
            for out in &outputs {
                let tensor = &mut self.parallel_tensors[out.0];
                tensor.region = src.region;
                tensor.part = src.part;
                tensor.region_grad = src.region_grad;
                tensor.part_grad = src.part_grad;
                tensor.parallel_is = src.parallel_is;
                tensor.machine_view = tensor.shape.machine_view();
            }
        } else {
            for out in &outputs {
                self.map_tensor(*out, Some(op))?;
            }
        }
        let parallel_is = match outputs.first() {
            Some(out) => match self.parallel_tensors[out.0].parallel_is {
                Some(is) => is,
                None => self.get_or_create_task_is_for_tensor(*out),
            },
            None => self.get_or_create_task_is(&MachineView::new(vec![1])),
        };
        self.ops[op.0].parallel_is = Some(parallel_is);
        Ok(())
    }

    /// Partition of a mapped tensor over a color space of the same rank,
    /// axis `i` split across color axis `i`.
    pub fn create_disjoint_partition_same_rank(
        &mut self,
        id: ParallelTensorId,
        part_is: IndexSpace,
    ) -> Result<LogicalPartition> {
        let colors = self.runtime.index_space_domain(part_is)?;
        let tensor = &self.parallel_tensors[id.0];
        let region = tensor
            .region
            .ok_or(anyhow!("tensor {} is not mapped", tensor.guid))?;
        let sizes = tensor.shape.sizes();
        if colors.dim() != sizes.len() {
            return Err(anyhow!(
                "color space rank {} differs from tensor rank {}",
                colors.dim(),
                sizes.len()
            ));
        }
        let region_grad = tensor.region_grad;
        let mut transform = Transform::zeros(sizes.len(), sizes.len());
        let mut hi = Vec::with_capacity(sizes.len());
        for (i, (size, parts)) in sizes.iter().zip(colors.extents()).enumerate() {
            let extent = (size + parts - 1) / parts;
            transform.set(i, i, extent as i64);
            hi.push(extent as i64 - 1);
        }
        let extent = Rect::new(vec![0; sizes.len()], hi);
        let lp = self.restrict(region, part_is, &transform, &extent, true)?;
        let part_grad = match region_grad {
            Some(grad) => Some(self.runtime.get_logical_partition(grad, lp.index_partition)?),
            None => None,
        };
        let tensor = &mut self.parallel_tensors[id.0];
        tensor.part = Some(lp);
        tensor.part_grad = part_grad;
        Ok(lp)
    }

    /// Splits only the outermost non-replica axis, across the last color axis.
    pub fn create_data_parallel_partition_with_diff_dims(
        &mut self,
        id: ParallelTensorId,
        part_is: IndexSpace,
    ) -> Result<LogicalPartition> {
        let colors = self.runtime.index_space_domain(part_is)?;
        let extents = colors.extents();
        let (last, rest) = extents
            .split_last()
            .ok_or(anyhow!("empty color space"))?;
        if rest.iter().any(|e| *e != 1) {
            return Err(anyhow!(
                "data parallel partition expects only the last view axis split, got {:?}",
                extents
            ));
        }
        let tensor = &self.parallel_tensors[id.0];
        let region = tensor
            .region
            .ok_or(anyhow!("tensor {} is not mapped", tensor.guid))?;
        let region_grad = tensor.region_grad;
        let dims = &tensor.shape.dims;
        let outer = dims
            .iter()
            .rposition(|d| !d.is_replica_dim)
            .ok_or(anyhow!("tensor {} has no data axis", tensor.guid))?;
        let mut transform = Transform::zeros(dims.len(), extents.len());
        let mut hi: Vec<i64> = dims.iter().map(|d| d.size as i64 - 1).collect();
        let extent = (dims[outer].size + last - 1) / last;
        transform.set(outer, extents.len() - 1, extent as i64);
        hi[outer] = extent as i64 - 1;
        let extent = Rect::new(vec![0; dims.len()], hi);
        let lp = self.restrict(region, part_is, &transform, &extent, true)?;
        let part_grad = match region_grad {
            Some(grad) => Some(self.runtime.get_logical_partition(grad, lp.index_partition)?),
            None => None,
        };
        let tensor = &mut self.parallel_tensors[id.0];
        tensor.part = Some(lp);
        tensor.part_grad = part_grad;
        Ok(lp)
    }

    pub fn map_weight(&mut self, weight: ParallelTensorId, op: OpId) -> Result<()> {
        match self.ops[op.0].op_type() {
            OperatorType::Linear | OperatorType::Embedding | OperatorType::MultiHeadAttention => {
                self.map_linear_weight(weight, op)
            }
            OperatorType::Conv2D | OperatorType::BatchNorm => self.map_conv_weight(weight, op),
            other => Err(anyhow!(
                "unsupported weight layout for operator {} of type {}",
                self.ops[op.0].name,
                other
            )),
        }
    }

    fn op_task_extents(&mut self, op: OpId) -> Result<(IndexSpace, Vec<usize>)> {
        let part_is = self.ops[op.0]
            .parallel_is
            .ok_or(anyhow!("operator {} is not mapped", self.ops[op.0].name))?;
        Ok((part_is, self.runtime.index_space_domain(part_is)?.extents()))
    }

    /// Region whose outermost axis holds one exclusive copy per device.
    fn nccl_weight_layout(
        &mut self,
        sizes: &[usize],
        transform_row: &[i64],
        outer_parts: usize,
        outer_extent: usize,
        fs: FieldSpace,
        part_is: IndexSpace,
    ) -> Result<(LogicalRegion, LogicalPartition)> {
        let outer = sizes.len() - 1;
        let mut region_sizes = sizes.to_vec();
        region_sizes[outer] = sizes[outer] * outer_parts;
        let is = self.runtime.create_index_space(Rect::from_sizes(&region_sizes));
        let region = self.runtime.create_logical_region(is, fs)?;
        let mut transform = Transform::zeros(sizes.len(), transform_row.len());
        for (j, v) in transform_row.iter().enumerate() {
            transform.set(outer, j, *v);
        }
        let mut hi: Vec<i64> = sizes.iter().map(|s| *s as i64 - 1).collect();
        hi[outer] = outer_extent as i64 - 1;
        let extent = Rect::new(vec![0; sizes.len()], hi);
        let part = self.restrict(region, part_is, &transform, &extent, true)?;
        Ok((region, part))
    }

    fn finish_weight(
        &mut self,
        weight: ParallelTensorId,
        part_is: IndexSpace,
        view: MachineView,
        mapped: (LogicalRegion, LogicalPartition),
        grad: Option<(LogicalRegion, LogicalPartition)>,
    ) -> Result<()> {
        let tensor = &self.parallel_tensors[weight.0];
        let initializer = tensor
            .initializer
            .ok_or(anyhow!("weight {} has no initializer", tensor.guid))?;
        self.runtime.initialize_region(mapped.0, &initializer)?;
        let tensor = &mut self.parallel_tensors[weight.0];
        tensor.region = Some(mapped.0);
        tensor.part = Some(mapped.1);
        tensor.region_grad = grad.map(|g| g.0);
        tensor.part_grad = grad.map(|g| g.1);
        tensor.parallel_is = Some(part_is);
        tensor.machine_view = view;
        tracing::debug!(
            "map weight {} dims:{:?} sync:{} region:{:?}",
            tensor.guid,
            tensor.shape.sizes(),
            tensor.sync_type,
            tensor.region
        );
        Ok(())
    }

    /// Linear style weights: the outermost axis is the output channel and is
    /// split across view axis 0.
    fn map_linear_weight(&mut self, weight: ParallelTensorId, op: OpId) -> Result<()> {
        let (part_is, num_parts) = self.op_task_extents(op)?;
        let tensor = &self.parallel_tensors[weight.0];
        if tensor.initializer.is_none() {
            return Err(anyhow!("weight {} has no initializer", tensor.guid));
        }
        let sizes = tensor.shape.sizes();
        let sync_type = tensor.sync_type;
        let with_grad = tensor.create_gradients && self.is_training();
        let field_size = weight_field_size(tensor.data_type())?;
        let outer = sizes.len() - 1;
        let out_channels = sizes[outer];
        if out_channels % num_parts[0] != 0 {
            return Err(anyhow!(
                "output channels {} not divisible by {} parts",
                out_channels,
                num_parts[0]
            ));
        }
        let piece = out_channels / num_parts[0];
        let fs = self.runtime.create_field_space(field_size);

        let mut nccl_row = vec![0i64; num_parts.len()];
        nccl_row[0] = piece as i64;
        for i in 1..num_parts.len() {
            nccl_row[i] = nccl_row[i - 1] * num_parts[i - 1] as i64;
        }
        let replicas: usize = num_parts[1..].iter().product();

        let mapped = match sync_type {
            ParameterSyncType::Ps => {
                let is = self.runtime.create_index_space(Rect::from_sizes(&sizes));
                let region = self.runtime.create_logical_region(is, fs)?;
                let mut transform = Transform::zeros(sizes.len(), num_parts.len());
                transform.set(outer, 0, piece as i64);
                let mut hi: Vec<i64> = sizes.iter().map(|s| *s as i64 - 1).collect();
                hi[outer] = piece as i64 - 1;
                let extent = Rect::new(vec![0; sizes.len()], hi);
                let part = self.restrict(region, part_is, &transform, &extent, false)?;
                (region, part)
            }
            ParameterSyncType::Nccl => {
                self.nccl_weight_layout(&sizes, &nccl_row, replicas, piece, fs, part_is)?
            }
        };
        let grad = if with_grad {
            Some(self.nccl_weight_layout(&sizes, &nccl_row, replicas, piece, fs, part_is)?)
        } else {
            None
        };
        self.finish_weight(weight, part_is, MachineView::new(num_parts), mapped, grad)
    }

    /// Convolution style weights over a 4-D (w, h, c, n) view; the channel
    /// axis of the view must not be split.
    fn map_conv_weight(&mut self, weight: ParallelTensorId, op: OpId) -> Result<()> {
        let (part_is, num_parts) = self.op_task_extents(op)?;
        let [num_par_w, num_par_h, num_par_c, num_par_n] = num_parts[..] else {
            return Err(anyhow!(
                "conv weight of {} needs a 4-D view, got {:?}",
                self.ops[op.0].name,
                num_parts
            ));
        };
        if num_par_c != 1 {
            return Err(anyhow!(
                "conv weight of {} cannot be split along channels ({} parts)",
                self.ops[op.0].name,
                num_par_c
            ));
        }
        let tensor = &self.parallel_tensors[weight.0];
        if tensor.initializer.is_none() {
            return Err(anyhow!("weight {} has no initializer", tensor.guid));
        }
        let sizes = tensor.shape.sizes();
        let sync_type = tensor.sync_type;
        let with_grad = tensor.create_gradients && self.is_training();
        let field_size = weight_field_size(tensor.data_type())?;
        let out_channels = sizes[sizes.len() - 1];
        let fs = self.runtime.create_field_space(field_size);

        let (w, h, c) = (num_par_w as i64, num_par_h as i64, num_par_c as i64);
        let out = out_channels as i64;
        let nccl_row = [out, out * w, out * w * h, out * w * h * c];
        let replicas = num_par_n * num_par_h * num_par_w;

        let mapped = match sync_type {
            ParameterSyncType::Ps => {
                let rect = Rect::from_sizes(&sizes);
                let is = self.runtime.create_index_space(rect.clone());
                let region = self.runtime.create_logical_region(is, fs)?;
                let transform = Transform::zeros(sizes.len(), 4);
                let part = self.restrict(region, part_is, &transform, &rect, false)?;
                (region, part)
            }
            ParameterSyncType::Nccl => {
                self.nccl_weight_layout(&sizes, &nccl_row, replicas, out_channels, fs, part_is)?
            }
        };
        let grad = if with_grad {
            Some(self.nccl_weight_layout(&sizes, &nccl_row, replicas, out_channels, fs, part_is)?)
        } else {
            None
        };
        self.finish_weight(weight, part_is, MachineView::new(num_parts), mapped, grad)
    }

    /// Gradient replica of a linear input: the outermost axis is split by the
    /// first view axis and the sample axis by the last one.
    pub fn create_linear_replica(
        &mut self,
        dims: &[usize],
        task_is: IndexSpace,
        data_type: DataType,
    ) -> Result<ParallelTensorId> {
        if !self.is_training() {
            return Err(anyhow!("linear replicas only exist in training mode"));
        }
        let colors = self.runtime.index_space_domain(task_is)?.extents();
        if dims.len() < 2 || colors.len() < 2 {
            return Err(anyhow!(
                "linear replica needs rank >= 2 dims and view, got {:?} and {:?}",
                dims,
                colors
            ));
        }
        let field_size = activation_field_size(data_type)?;
        let n = dims.len();
        let k = colors.len();
        let shape = ParallelTensorShape::new(
            dims.iter().map(|s| ParallelDim::new(*s)).collect(),
            data_type,
        );
        let id = self.alloc_parallel_tensor(shape, None, -1, true)?;

        let is = self.runtime.create_index_space(Rect::from_sizes(dims));
        let fs = self.runtime.create_field_space(field_size);
        let region_grad = self.runtime.create_logical_region(is, fs)?;
        let mut transform = Transform::zeros(n, k);
        let mut hi: Vec<i64> = dims.iter().map(|s| *s as i64 - 1).collect();
        let replica_extent = (dims[n - 1] + colors[0] - 1) / colors[0];
        let sample_extent = (dims[n - 2] + colors[k - 1] - 1) / colors[k - 1];
        transform.set(n - 1, 0, replica_extent as i64);
        transform.set(n - 2, k - 1, sample_extent as i64);
        hi[n - 1] = replica_extent as i64 - 1;
        hi[n - 2] = sample_extent as i64 - 1;
        let extent = Rect::new(vec![0; n], hi);
        let part_grad = self.restrict(region_grad, task_is, &transform, &extent, true)?;

        let tensor = &mut self.parallel_tensors[id.0];
        tensor.region_grad = Some(region_grad);
        tensor.part_grad = Some(part_grad);
        tensor.parallel_is = Some(task_is);
        Ok(id)
    }
}

#[test]
fn test_compute_transform_uneven() -> anyhow::Result<()> {
    let dims = vec![
        ParallelDim::with_degree(10, 4, 0),
        ParallelDim::new(3),
    ];
    let (transform, extent) = compute_transform(&dims, 1)?;
    assert_eq!(transform.get(0, 0), 3);
    assert_eq!(transform.get(1, 0), 0);
    assert_eq!(extent, Rect::new(vec![0, 0], vec![2, 2]));

    let bad = vec![ParallelDim::with_degree(8, 2, 1)];
    assert!(compute_transform(&bad, 1).is_err());
    let unmapped = vec![ParallelDim::with_degree(8, 2, -1)];
    assert!(compute_transform(&unmapped, 1).is_err());
    Ok(())
}
