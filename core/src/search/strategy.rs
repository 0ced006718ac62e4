use std::collections::HashMap;

use anyhow::Result;
use serde::Serialize;

use crate::model::{FFModel, OpId};
use crate::parallel::ParallelConfig;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyEntry {
    pub name: String,
    pub guid: u64,
    pub n_dims: usize,
    pub dims: Vec<usize>,
    pub device_ids: Vec<usize>,
}

/// Per-operator configurations in operator list order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StrategyReport {
    pub strategies: Vec<StrategyEntry>,
}

impl StrategyReport {
    pub fn from_strategy(model: &FFModel, strategy: &HashMap<OpId, ParallelConfig>) -> Self {
        let strategies = model
            .operators()
            .iter()
            .filter_map(|op| {
                let pc = strategy.get(op)?;
                let op = model.op(*op);
                Some(StrategyEntry {
                    name: op.name.clone(),
                    guid: op.guid,
                    n_dims: pc.n_dims,
                    dims: pc.dims.clone(),
                    device_ids: pc.device_ids.clone(),
                })
            })
            .collect();
        Self { strategies }
    }

    pub fn log(&self) {
        for s in &self.strategies {
            tracing::info!(
                "[{}] num_dims({}) dims{:?} device_ids{:?}",
                s.name,
                s.n_dims,
                s.dims,
                s.device_ids
            );
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn export(&self, path: &str) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        tracing::info!("strategy of {} operators written to {}", self.strategies.len(), path);
        Ok(())
    }
}

#[test]
fn test_strategy_json_layout() -> anyhow::Result<()> {
    let report = StrategyReport {
        strategies: vec![StrategyEntry {
            name: "dense_1".to_string(),
            guid: 2_000_003,
            n_dims: 2,
            dims: vec![1, 4],
            device_ids: vec![0, 1, 2, 3],
        }],
    };
    let value: serde_json::Value = serde_json::from_str(&report.to_json()?)?;
    let entry = &value["strategies"][0];
    assert_eq!(entry["name"], "dense_1");
    assert_eq!(entry["n_dims"], 2);
    assert_eq!(entry["dims"], serde_json::json!([1, 4]));
    assert_eq!(entry["device_ids"].as_array().map(|a| a.len()), Some(4));
    Ok(())
}
