use super::{Operator, OperatorKind};
use crate::model::{OpId, ParallelTensorId};
use crate::runtime::LogicalRegion;

pub const MAX_NUM_FUSED_OPERATORS: usize = 64;
pub const MAX_NUM_FUSED_TENSORS: usize = 64;

/// Which consolidated array of the fused node a constituent slot reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Input,
    Weight,
    Output,
}

/// Offset tables of a fused node. Entries for constituent `k` start at the
/// sum of the counts of constituents `0..k`.
#[derive(Debug, Clone, Default)]
pub struct FusedOp {
    pub ops: Vec<OpId>,
    pub op_num_inputs: Vec<usize>,
    pub op_num_weights: Vec<usize>,
    pub op_num_outputs: Vec<usize>,
    pub op_input_source: Vec<SourceType>,
    pub op_input_idx: Vec<usize>,
    pub op_weight_source: Vec<SourceType>,
    pub op_weight_idx: Vec<usize>,
    pub op_output_source: Vec<SourceType>,
    pub op_output_idx: Vec<usize>,
}

impl FusedOp {
    pub fn num_operators(&self) -> usize {
        self.ops.len()
    }

    /// Counts per constituent add up to the table lengths.
    pub fn is_consistent(&self) -> bool {
        let n = self.ops.len();
        self.op_num_inputs.len() == n
            && self.op_num_weights.len() == n
            && self.op_num_outputs.len() == n
            && self.op_num_inputs.iter().sum::<usize>() == self.op_input_idx.len()
            && self.op_num_weights.iter().sum::<usize>() == self.op_weight_idx.len()
            && self.op_num_outputs.iter().sum::<usize>() == self.op_output_idx.len()
            && self.op_input_source.len() == self.op_input_idx.len()
            && self.op_weight_source.len() == self.op_weight_idx.len()
            && self.op_output_source.len() == self.op_output_idx.len()
    }
}

fn same_tensor<F>(a: ParallelTensorId, b: ParallelTensorId, region_of: &F) -> bool
where
    F: Fn(ParallelTensorId) -> Option<LogicalRegion>,
{
    if a == b {
        return true;
    }
    matches!((region_of(a), region_of(b)), (Some(x), Some(y)) if x == y)
}

impl Operator {
    /// Wraps `first` into a new fused node holding only it.
    pub fn new_fused(guid: u64, first_id: OpId, first: &Operator) -> Operator {
        let mut fused = Operator::new(guid, OperatorKind::Fused, format!("fused_{}", guid));
        fused.inputs = first.inputs.clone();
        fused.weights = first.weights.clone();
        fused.outputs = first.outputs.clone();
        fused.trainable_inputs = first.trainable_inputs.clone();
        fused.parallel_is = first.parallel_is;
        let (ni, nw, no) = (first.num_inputs(), first.num_weights(), first.num_outputs());
        fused.fused = Some(FusedOp {
            ops: vec![first_id],
            op_num_inputs: vec![ni],
            op_num_weights: vec![nw],
            op_num_outputs: vec![no],
            op_input_source: vec![SourceType::Input; ni],
            op_input_idx: (0..ni).collect(),
            op_weight_source: vec![SourceType::Weight; nw],
            op_weight_idx: (0..nw).collect(),
            op_output_source: vec![SourceType::Output; no],
            op_output_idx: (0..no).collect(),
        });
        fused
    }

    /// Appends `op` to this fused node. Returns false and leaves the node
    /// untouched when a capacity limit would be exceeded.
    pub fn add_operator<F>(&mut self, op_id: OpId, op: &Operator, region_of: F) -> bool
    where
        F: Fn(ParallelTensorId) -> Option<LogicalRegion>,
    {
        let Some(tables) = self.fused.as_mut() else {
            return false;
        };
        if tables.ops.len() + 1 > MAX_NUM_FUSED_OPERATORS
            || self.inputs.len() + op.inputs.len() > MAX_NUM_FUSED_TENSORS
            || self.weights.len() + op.weights.len() > MAX_NUM_FUSED_TENSORS
            || self.outputs.len() + op.outputs.len() > MAX_NUM_FUSED_TENSORS
        {
            return false;
        }

        for (i, input) in op.inputs.iter().enumerate() {
            if let Some(j) = self
                .inputs
                .iter()
                .position(|t| same_tensor(*t, *input, &region_of))
            {
                tables.op_input_source.push(SourceType::Input);
                tables.op_input_idx.push(j);
            } else if let Some(j) = self
                .outputs
                .iter()
                .position(|t| same_tensor(*t, *input, &region_of))
            {
                tables.op_input_source.push(SourceType::Output);
                tables.op_input_idx.push(j);
            } else {
                tables.op_input_source.push(SourceType::Input);
                tables.op_input_idx.push(self.inputs.len());
                self.inputs.push(*input);
                self.trainable_inputs
                    .push(op.trainable_inputs.get(i).copied().unwrap_or(true));
            }
        }
        for weight in &op.weights {
            tables.op_weight_source.push(SourceType::Weight);
            tables.op_weight_idx.push(self.weights.len());
            self.weights.push(*weight);
        }
        for output in &op.outputs {
            if let Some(j) = self
                .outputs
                .iter()
                .position(|t| same_tensor(*t, *output, &region_of))
            {
                tables.op_output_source.push(SourceType::Output);
                tables.op_output_idx.push(j);
            } else {
                tables.op_output_source.push(SourceType::Output);
                tables.op_output_idx.push(self.outputs.len());
                self.outputs.push(*output);
            }
        }
        tables.ops.push(op_id);
        tables.op_num_inputs.push(op.num_inputs());
        tables.op_num_weights.push(op.num_weights());
        tables.op_num_outputs.push(op.num_outputs());
        true
    }
}

#[cfg(test)]
fn op_with(
    guid: u64,
    inputs: &[usize],
    weights: &[usize],
    outputs: &[usize],
) -> Operator {
    let mut op = Operator::new(guid, OperatorKind::NoOp, format!("op_{}", guid));
    op.inputs = inputs.iter().map(|i| ParallelTensorId(*i)).collect();
    op.weights = weights.iter().map(|i| ParallelTensorId(*i)).collect();
    op.outputs = outputs.iter().map(|i| ParallelTensorId(*i)).collect();
    op.trainable_inputs = vec![true; inputs.len()];
    op
}

#[test]
fn test_add_operator_tables() -> anyhow::Result<()> {
    // a: t0 -> t2 with weight t1, b: (t2, t3) -> t5 with weight t4
    let a = op_with(1, &[0], &[1], &[2]);
    let b = op_with(2, &[2, 3], &[4], &[5]);
    let mut fused = Operator::new_fused(10, OpId(0), &a);
    assert!(fused.add_operator(OpId(1), &b, |_| None));

    let tables = fused.fused.as_ref().unwrap();
    assert!(tables.is_consistent());
    assert_eq!(tables.ops, vec![OpId(0), OpId(1)]);
    assert_eq!(fused.inputs, vec![ParallelTensorId(0), ParallelTensorId(3)]);
    assert_eq!(fused.weights, vec![ParallelTensorId(1), ParallelTensorId(4)]);
    assert_eq!(fused.outputs, vec![ParallelTensorId(2), ParallelTensorId(5)]);
    assert_eq!(
        tables.op_input_source,
        vec![SourceType::Input, SourceType::Output, SourceType::Input]
    );
    assert_eq!(tables.op_input_idx, vec![0, 0, 1]);
    assert_eq!(tables.op_weight_idx, vec![0, 1]);
    assert_eq!(tables.op_output_idx, vec![0, 1]);
    Ok(())
}

#[test]
fn test_add_operator_respects_limits() -> anyhow::Result<()> {
    let first = op_with(1, &[0], &[], &[1]);
    let mut fused = Operator::new_fused(10, OpId(0), &first);
    let wide_inputs: Vec<usize> = (100..100 + MAX_NUM_FUSED_TENSORS).collect();
    let wide = op_with(2, &wide_inputs, &[], &[2]);
    assert!(!fused.add_operator(OpId(1), &wide, |_| None));
    assert_eq!(fused.inputs.len(), 1);
    assert_eq!(fused.fused.as_ref().unwrap().num_operators(), 1);

    for k in 1..MAX_NUM_FUSED_OPERATORS {
        let next = op_with(k as u64 + 1, &[k], &[], &[k + 1]);
        assert!(fused.add_operator(OpId(k), &next, |_| None));
    }
    let one_more = op_with(999, &[MAX_NUM_FUSED_OPERATORS], &[], &[5000]);
    assert!(!fused.add_operator(OpId(999), &one_more, |_| None));
    Ok(())
}
