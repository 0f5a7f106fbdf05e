//! Sparse nonlinear least squares over named parameter blocks.
//!
//! A thin builder that validates blocks and residuals, evaluates costs itself and hands the
//! problem to the `tiny-solver` Levenberg-Marquardt optimizer.

use crate::error::{EstimateError, Result};
use crate::io::config::{LossConfig, SolverConfig};
use crate::solver::costs::CostFunction;
use log::{debug, trace};
use nalgebra::DVector;
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;
use tiny_solver::loss_functions::{CauchyLoss, HuberLoss, Loss};
use tiny_solver::optimizer::{Optimizer, OptimizerOptions};
use tiny_solver::{LevenbergMarquardtOptimizer, linear::sparse::LinearSolverType};

const MIN_DIAGONAL: f64 = 1e-6;
const MAX_DIAGONAL: f64 = 1e32;
const INITIAL_TRUST_REGION_RADIUS: f64 = 1e4;
const MAX_TRUST_REGION_RADIUS: f64 = 1e16;
const MIN_TRUST_REGION_RADIUS: f64 = 1e-32;
/// Costs this far below the initial cost count as an exact fit.
const COST_FLOOR: f64 = 1e-24;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverOptions {
    pub max_iterations: usize,
    /// Relative cost decrease under which the optimizer stops.
    pub function_tolerance: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self::from(&SolverConfig::default())
    }
}

impl From<&SolverConfig> for SolverOptions {
    fn from(config: &SolverConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            function_tolerance: config.function_tolerance,
        }
    }
}

#[derive(Debug, Clone)]
struct ParameterBlock {
    initial: DVector<f64>,
    fixed: bool,
    bounds: Vec<(usize, f64, f64)>,
}

#[derive(Debug, Clone)]
struct ResidualBlock {
    cost: CostFunction,
    blocks: Vec<String>,
    loss: LossConfig,
}

/// Outcome of one solve. Costs are `½ Σ ρ(‖r‖²)` with the robust loss applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveSummary {
    pub parameter_blocks: usize,
    pub residual_blocks: usize,
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    /// The last accepted step decreased the cost by less than the function tolerance, or the
    /// fit is exact. Hitting the iteration cap or a collapsed trust region leaves this false.
    pub converged: bool,
    pub seconds: f64,
}

impl SolveSummary {
    pub fn brief_report(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SolveSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LM: {} parameter blocks, {} residual blocks, {} iterations, cost {:.6e} -> {:.6e}, {} ({:.2}s)",
            self.parameter_blocks,
            self.residual_blocks,
            self.iterations,
            self.initial_cost,
            self.final_cost,
            if self.converged { "CONVERGENCE" } else { "NO_CONVERGENCE" },
            self.seconds
        )
    }
}

/// Optimized parameters plus the summary.
#[derive(Debug, Clone)]
pub struct Solution {
    pub parameters: HashMap<String, DVector<f64>>,
    pub summary: SolveSummary,
}

impl Solution {
    pub fn get(&self, name: &str) -> Option<&DVector<f64>> {
        self.parameters.get(name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Problem {
    blocks: HashMap<String, ParameterBlock>,
    order: Vec<String>,
    residuals: Vec<ResidualBlock>,
}

impl Problem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_parameter_blocks(&self) -> usize {
        self.order.len()
    }

    pub fn num_residual_blocks(&self) -> usize {
        self.residuals.len()
    }

    /// Adds a block; re-adding a name with the same size keeps the first initial value.
    pub fn add_parameter_block(&mut self, name: impl Into<String>, initial: &[f64]) -> Result<()> {
        let name = name.into();
        if let Some(existing) = self.blocks.get(&name) {
            if existing.initial.len() != initial.len() {
                return Err(EstimateError::Solver(format!(
                    "block '{name}' re-added with size {} (was {})",
                    initial.len(),
                    existing.initial.len()
                )));
            }
            return Ok(());
        }
        self.blocks.insert(
            name.clone(),
            ParameterBlock {
                initial: DVector::from_row_slice(initial),
                fixed: false,
                bounds: Vec::new(),
            },
        );
        self.order.push(name);
        Ok(())
    }

    fn block_mut(&mut self, name: &str) -> Result<&mut ParameterBlock> {
        self.blocks
            .get_mut(name)
            .ok_or_else(|| EstimateError::Solver(format!("unknown parameter block '{name}'")))
    }

    pub fn fix_parameter_block(&mut self, name: &str) -> Result<()> {
        self.block_mut(name)?.fixed = true;
        Ok(())
    }

    pub fn set_parameter_bounds(&mut self, name: &str, index: usize, lower: f64, upper: f64) -> Result<()> {
        let block = self.block_mut(name)?;
        if index >= block.initial.len() || lower > upper {
            return Err(EstimateError::Solver(format!(
                "invalid bounds [{lower}, {upper}] for '{name}'[{index}]"
            )));
        }
        block.bounds.push((index, lower, upper));
        Ok(())
    }

    pub fn add_residual_block(
        &mut self,
        cost: impl Into<CostFunction>,
        blocks: &[&str],
        loss: LossConfig,
    ) -> Result<()> {
        let cost = cost.into();
        let dims = cost.block_dims();
        if dims.len() != blocks.len() {
            return Err(EstimateError::Solver(format!(
                "cost takes {} blocks, {} given",
                dims.len(),
                blocks.len()
            )));
        }
        for (&name, &dim) in blocks.iter().zip(dims) {
            match self.blocks.get(name) {
                None => {
                    return Err(EstimateError::Solver(format!(
                        "unknown parameter block '{name}'"
                    )));
                }
                Some(block) if block.initial.len() != dim => {
                    return Err(EstimateError::Solver(format!(
                        "block '{name}' has size {}, cost expects {dim}",
                        block.initial.len()
                    )));
                }
                Some(_) => {}
            }
        }
        self.residuals.push(ResidualBlock {
            cost,
            blocks: blocks.iter().map(|s| s.to_string()).collect(),
            loss,
        });
        Ok(())
    }

    /// Total robust cost at `values`.
    pub fn cost(&self, values: &HashMap<String, DVector<f64>>) -> f64 {
        self.residuals
            .iter()
            .map(|residual| {
                let params: Vec<DVector<f64>> = residual
                    .blocks
                    .iter()
                    .map(|name| values[name].clone())
                    .collect();
                robust_cost(residual.loss, residual.cost.evaluate(&params).norm_squared())
            })
            .sum::<f64>()
            * 0.5
    }

    pub fn solve(&self, options: &SolverOptions) -> Result<Solution> {
        let started = Instant::now();
        let mut parameters: HashMap<String, DVector<f64>> = self
            .blocks
            .iter()
            .map(|(name, block)| (name.clone(), block.initial.clone()))
            .collect();
        let initial_cost = self.cost(&parameters);

        // 1. Compile. Fixed blocks become constants of their factors.
        let mut problem = tiny_solver::problem::Problem::new();
        let mut free: HashMap<String, DVector<f64>> = HashMap::new();
        for residual in &self.residuals {
            let mut names = Vec::new();
            let mut constants = Vec::with_capacity(residual.blocks.len());
            for name in &residual.blocks {
                let block = &self.blocks[name];
                if block.fixed {
                    constants.push(Some(block.initial.clone()));
                } else {
                    constants.push(None);
                    names.push(name.as_str());
                    free.entry(name.clone()).or_insert_with(|| block.initial.clone());
                }
            }
            if names.is_empty() {
                continue;
            }
            problem.add_residual_block(
                residual.cost.residual_dim(),
                &names,
                residual.cost.into_factor(constants),
                compile_loss(residual.loss)?,
            );
        }
        for name in free.keys() {
            for &(index, lower, upper) in &self.blocks[name].bounds {
                problem.set_variable_bounds(name, index, lower, upper);
            }
        }

        // 2. Optimize, one damped step per call.
        let mut cost = initial_cost;
        let mut iterations = 0;
        let mut converged = free.is_empty() || cost <= COST_FLOOR * initial_cost;
        let mut radius = INITIAL_TRUST_REGION_RADIUS;
        let step_options = OptimizerOptions {
            max_iteration: 1,
            linear_solver_type: LinearSolverType::SparseCholesky,
            ..OptimizerOptions::default()
        };
        while !converged && iterations < options.max_iterations && radius >= MIN_TRUST_REGION_RADIUS {
            iterations += 1;
            let candidate = LevenbergMarquardtOptimizer::new(MIN_DIAGONAL, MAX_DIAGONAL, radius)
                .optimize(&problem, &free, Some(step_options.clone()))
                .ok_or_else(|| EstimateError::Solver("optimizer returned no solution".into()))?;
            let mut trial = parameters.clone();
            trial.extend(candidate.iter().map(|(k, v)| (k.clone(), v.clone())));
            let trial_cost = self.cost(&trial);
            if trial_cost.is_finite() && trial_cost < cost {
                let decrease = (cost - trial_cost) / cost;
                free = candidate;
                parameters = trial;
                cost = trial_cost;
                radius = (radius * 3.0).min(MAX_TRUST_REGION_RADIUS);
                converged = decrease < options.function_tolerance || cost <= COST_FLOOR * initial_cost;
            } else {
                radius *= 0.5;
            }
            trace!("iteration {iterations}: cost {cost:.6e}, radius {radius:.3e}");
        }

        // 3. Summarize
        let summary = SolveSummary {
            parameter_blocks: self.num_parameter_blocks(),
            residual_blocks: self.num_residual_blocks(),
            iterations,
            initial_cost,
            final_cost: cost,
            converged: converged && cost.is_finite(),
            seconds: started.elapsed().as_secs_f64(),
        };
        debug!("{summary}");
        Ok(Solution {
            parameters,
            summary,
        })
    }
}

fn compile_loss(loss: LossConfig) -> Result<Option<Box<dyn Loss + Send>>> {
    match loss {
        LossConfig::None => Ok(None),
        LossConfig::Huber { scale } if scale > 0.0 => Ok(Some(Box::new(HuberLoss::new(scale)))),
        LossConfig::Cauchy { scale } if scale > 0.0 => Ok(Some(Box::new(CauchyLoss::new(scale)))),
        other => Err(EstimateError::Solver(format!(
            "loss scale must be positive: {other:?}"
        ))),
    }
}

/// `ρ(s)` for a squared residual norm `s`.
fn robust_cost(loss: LossConfig, s: f64) -> f64 {
    match loss {
        LossConfig::None => s,
        LossConfig::Huber { scale } => {
            let delta_sq = scale * scale;
            if s <= delta_sq {
                s
            } else {
                2.0 * scale * s.sqrt() - delta_sq
            }
        }
        LossConfig::Cauchy { scale } => {
            let c = scale * scale;
            c * (1.0 + s / c).ln()
        }
    }
}
