use anyhow::{anyhow, Result};

use super::{FFModel, OpId, ParallelTensorId};
use crate::ops::{Operator, OperatorKind, SourceType};

impl FFModel {
    fn same_region(&self, a: ParallelTensorId, b: ParallelTensorId) -> bool {
        a == b || matches!((self.region_of(a), self.region_of(b)), (Some(x), Some(y)) if x == y)
    }

    /// Operators whose outputs a fused node `op` stands for.
    fn owners_of(&self, op: OpId) -> Vec<OpId> {
        let mut owners = vec![op];
        owners.extend(self.ops[op.0].constituents());
        owners
    }

    /// Merges one more operator into a fused node. Returns the new operator
    /// list, one shorter than `operators`, or `None` when nothing can be fused.
    pub fn apply_fusion(&mut self, operators: &[OpId]) -> Result<Option<Vec<OpId>>> {
        if operators.len() < 3 {
            return Ok(None);
        }
        for l in 1..operators.len() - 1 {
            let opl = &self.ops[operators[l].0];
            if opl.is_structural() || opl.kind == OperatorKind::Fused || opl.inplace_output {
                continue;
            }
            let mut start = 0;
            for input in &opl.inputs {
                match self.producer_position(&operators[..l], *input) {
                    Some(i) => start = start.max(i),
                    None if self.parallel_tensors[input.0].owner_op.is_none() => {}
                    None => {
                        return Err(anyhow!(
                            "input {} of {} is not produced before it",
                            self.parallel_tensors[input.0].guid,
                            opl.name
                        ))
                    }
                }
            }
            let view_l = self.op_view(operators[l]);
            for i in start..l {
                if self.op_view(operators[i]) != view_l {
                    continue;
                }
                let opi = &self.ops[operators[i].0];
                let fused_id = if opi.kind == OperatorKind::Fused {
                    operators[i]
                } else {
                    if opi.inplace_output || opi.is_structural() {
                        continue;
                    }
                    let guid = self.guids.next_op();
                    let fused = Operator::new_fused(guid, operators[i], &self.ops[operators[i].0]);
                    self.ops.push(fused);
                    OpId(self.ops.len() - 1)
                };
                let candidate = self.ops[operators[l].0].clone();
                let mut fused = self.ops[fused_id.0].clone();
                let added = fused.add_operator(operators[l], &candidate, |t| self.region_of(t));
                if !added {
                    tracing::debug!(
                        "fused node {} is full, cannot take {}",
                        fused.name,
                        candidate.name
                    );
                    continue;
                }
                self.ops[fused_id.0] = fused;

                let mut stale = self.owners_of(operators[l]);
                stale.extend(self.owners_of(operators[i]));
                let mut next = Vec::with_capacity(operators.len() - 1);
                next.extend_from_slice(&operators[..i]);
                next.push(fused_id);
                for (j, op) in operators.iter().enumerate().skip(i + 1) {
                    if j == l {
                        continue;
                    }
                    self.rewire_inputs(*op, fused_id, &stale)?;
                    next.push(*op);
                }
                if next.len() + 1 != operators.len() {
                    return Err(anyhow!(
                        "fusion produced {} operators from {}",
                        next.len(),
                        operators.len()
                    ));
                }
                tracing::debug!(
                    "fuse {} into {}",
                    self.ops[operators[l].0].name,
                    self.ops[fused_id.0].name
                );
                return Ok(Some(next));
            }
        }
        Ok(None)
    }

    /// Points inputs of `op` owned by any of `stale` at the matching output of `fused`.
    fn rewire_inputs(&mut self, op: OpId, fused: OpId, stale: &[OpId]) -> Result<()> {
        for idx in 0..self.ops[op.0].inputs.len() {
            let input = self.ops[op.0].inputs[idx];
            let owned = matches!(self.parallel_tensors[input.0].owner_op, Some(o) if stale.contains(&o));
            if !owned {
                continue;
            }
            let matches: Vec<ParallelTensorId> = self.ops[fused.0]
                .outputs
                .iter()
                .filter(|out| self.same_region(**out, input))
                .copied()
                .collect();
            let [found] = matches.as_slice() else {
                return Err(anyhow!(
                    "{} outputs of {} match input {} of {}",
                    matches.len(),
                    self.ops[fused.0].name,
                    idx,
                    self.ops[op.0].name
                ));
            };
            self.ops[op.0].inputs[idx] = *found;
        }
        Ok(())
    }

    /// No operator may consume a tensor produced later in the list.
    pub(crate) fn check_no_cycles(&self, operators: &[OpId]) -> Result<()> {
        for (p, op) in operators.iter().enumerate() {
            for input in &self.ops[op.0].inputs {
                if let Some(q) = self.producer_position(operators, *input) {
                    if q > p {
                        return Err(anyhow!(
                            "{} consumes a tensor produced later by {}",
                            self.ops[op.0].name,
                            self.ops[operators[q].0].name
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Replays the offset tables of every fused node and compares each slot
    /// with the region the constituent recorded.
    pub(crate) fn check_fused_integrity(&self, operators: &[OpId], before: &[OpId]) -> Result<()> {
        for op in operators {
            let node = &self.ops[op.0];
            let Some(tables) = node.fused.as_ref() else {
                if !before.contains(op) {
                    return Err(anyhow!("operator {} appeared during fusion", node.name));
                }
                continue;
            };
            if !tables.is_consistent() {
                return Err(anyhow!("offset tables of {} are inconsistent", node.name));
            }
            let (mut ioff, mut woff, mut ooff) = (0, 0, 0);
            for (k, old) in tables.ops.iter().enumerate() {
                let old = &self.ops[old.0];
                for (i, input) in old.inputs.iter().enumerate() {
                    let slot = tables.op_input_idx[ioff + i];
                    let held = match tables.op_input_source[ioff + i] {
                        SourceType::Input => node.inputs.get(slot),
                        SourceType::Output => node.outputs.get(slot),
                        SourceType::Weight => None,
                    };
                    self.check_slot(&node.name, &old.name, "input", held, *input)?;
                }
                for (i, weight) in old.weights.iter().enumerate() {
                    let held = match tables.op_weight_source[woff + i] {
                        SourceType::Weight => node.weights.get(tables.op_weight_idx[woff + i]),
                        _ => None,
                    };
                    self.check_slot(&node.name, &old.name, "weight", held, *weight)?;
                }
                for (i, output) in old.outputs.iter().enumerate() {
                    let held = match tables.op_output_source[ooff + i] {
                        SourceType::Output => node.outputs.get(tables.op_output_idx[ooff + i]),
                        _ => None,
                    };
                    self.check_slot(&node.name, &old.name, "output", held, *output)?;
                }
                ioff += tables.op_num_inputs[k];
                woff += tables.op_num_weights[k];
                ooff += tables.op_num_outputs[k];
            }
        }
        Ok(())
    }

    fn check_slot(
        &self,
        fused: &str,
        old: &str,
        what: &str,
        held: Option<&ParallelTensorId>,
        expected: ParallelTensorId,
    ) -> Result<()> {
        match held {
            Some(t) if self.same_region(*t, expected) => Ok(()),
            _ => Err(anyhow!(
                "{} slot of {} inside {} does not hold its original region",
                what,
                old,
                fused
            )),
        }
    }

    fn log_operators(&self, stage: &str) {
        tracing::info!("{} operators {}", self.operators.len(), stage);
        for (i, op) in self.operators.iter().enumerate() {
            let op = &self.ops[op.0];
            let regions = |ids: &[ParallelTensorId]| -> Vec<String> {
                ids.iter()
                    .map(|t| match self.region_of(*t) {
                        Some(r) => format!("({},{},{})", r.index_space.0, r.field_space.0, r.tree_id),
                        None => "unmapped".to_string(),
                    })
                    .collect()
            };
            tracing::debug!(
                "operator[{}]: type({}) guid({}) inputs{:?} outputs{:?} weights{:?}",
                i,
                op.op_type(),
                op.guid,
                regions(&op.inputs),
                regions(&op.outputs),
                regions(&op.weights)
            );
        }
    }

    /// Fuses until no merge is found. Returns the number of merges.
    pub fn perform_fusion(&mut self) -> Result<usize> {
        self.log_operators("before fusion");
        let before = self.operators.clone();
        let mut merges = 0;
        loop {
            let current = self.operators.clone();
            let Some(next) = self.apply_fusion(&current)? else {
                break;
            };
            self.check_no_cycles(&next)?;
            self.operators = next;
            merges += 1;
            metrics::counter!("flexpar_fusions").increment(1);
        }
        self.check_fused_integrity(&self.operators, &before)?;
        self.log_operators("after fusion");
        Ok(merges)
    }
}
