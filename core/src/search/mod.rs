use serde::Serialize;

mod mcmc;
mod simulator;
mod strategy;

pub use mcmc::{CONTINUE_PROPAGATION_CHANCE, PROPAGATION_CHANCE, PROPAGATION_SIZE_WEIGHT};
pub use simulator::{CostSimulator, MachineModel, Simulator, MAXIMUM_TASK_RUN_TIME};
pub use strategy::{StrategyEntry, StrategyReport};

/// Outcome of one simulated annealing run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchReport {
    pub budget: usize,
    pub reset_span: usize,
    pub initial_runtime: f32,
    pub best_runtime: f32,
    /// Iterations at which the current state was reset to the best one.
    pub reset_iterations: Vec<usize>,
    pub accepted: usize,
    pub improvements: usize,
}

/// `clamp(budget / 100, 1, 1000)`
pub fn reset_span(budget: usize) -> usize {
    (budget / 100).clamp(1, 1000)
}

#[test]
fn test_reset_span() -> anyhow::Result<()> {
    assert_eq!(reset_span(0), 1);
    assert_eq!(reset_span(99), 1);
    assert_eq!(reset_span(250), 2);
    assert_eq!(reset_span(1_000_000), 1000);
    Ok(())
}
