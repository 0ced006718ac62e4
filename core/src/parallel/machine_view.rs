use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MachineView {
    pub dims: Vec<usize>,
}

impl MachineView {
    pub fn new(dims: Vec<usize>) -> Self {
        Self { dims }
    }
    pub fn ndims(&self) -> usize {
        self.dims.len()
    }
    pub fn num_parts(&self) -> usize {
        self.dims.iter().product()
    }
    /// Stable across runs, used to key communicator groups.
    pub fn hash(&self) -> u64 {
        let mut h: u64 = 17;
        h = h.wrapping_mul(31).wrapping_add(self.dims.len() as u64);
        for d in &self.dims {
            h = h.wrapping_mul(31).wrapping_add(*d as u64);
        }
        h
    }
}

/// Per-operator parallelization decision mutated by the search.
///
/// `dims[i]` is the split degree of output axis `i` in internal order, so
/// `dims[n_dims - 1]` is the sample axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ParallelConfig {
    pub n_dims: usize,
    pub dims: Vec<usize>,
    pub device_ids: Vec<usize>,
}

impl ParallelConfig {
    pub fn data_parallel(n_dims: usize, num_parts: usize) -> Self {
        let mut dims = vec![1; n_dims];
        if let Some(sample) = dims.last_mut() {
            *sample = num_parts;
        }
        Self {
            n_dims,
            dims,
            device_ids: (0..num_parts).collect(),
        }
    }

    pub fn num_parts(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_data_parallel(&self) -> bool {
        self.dims
            .iter()
            .take(self.n_dims.saturating_sub(1))
            .all(|d| *d == 1)
    }

    /// Keeps the sample degree and the devices, every other axis becomes 1.
    pub fn change_data_parallel_dimensionality(&self, n_dims: usize) -> ParallelConfig {
        let sample = self.dims.last().copied().unwrap_or(1);
        let mut dims = vec![1; n_dims];
        if let Some(last) = dims.last_mut() {
            *last = sample;
        }
        ParallelConfig {
            n_dims,
            dims,
            device_ids: self.device_ids.clone(),
        }
    }

    pub fn view(&self) -> MachineView {
        MachineView::new(self.dims.clone())
    }
}

#[test]
fn test_view_hash_and_eq() -> anyhow::Result<()> {
    let a = MachineView::new(vec![2, 4]);
    let b = MachineView::new(vec![2, 4]);
    let c = MachineView::new(vec![4, 2]);
    let d = MachineView::new(vec![2, 4, 1]);
    assert_eq!(a, b);
    assert_eq!(a.hash(), b.hash());
    assert_ne!(a, c);
    assert_ne!(a.hash(), c.hash());
    assert_ne!(a, d);
    assert_eq!(d.num_parts(), 8);
    Ok(())
}

#[test]
fn test_parallel_config() -> anyhow::Result<()> {
    let pc = ParallelConfig::data_parallel(3, 4);
    assert_eq!(pc.dims, vec![1, 1, 4]);
    assert_eq!(pc.device_ids, vec![0, 1, 2, 3]);
    assert!(pc.is_data_parallel());
    assert_eq!(pc.num_parts(), 4);

    let changed = pc.change_data_parallel_dimensionality(5);
    assert_eq!(changed.dims, vec![1, 1, 1, 1, 4]);
    assert_eq!(changed.device_ids, pc.device_ids);

    let model_parallel = ParallelConfig {
        n_dims: 2,
        dims: vec![2, 2],
        device_ids: vec![0, 1, 2, 3],
    };
    assert!(!model_parallel.is_data_parallel());
    assert_eq!(model_parallel.view(), MachineView::new(vec![2, 2]));
    Ok(())
}
