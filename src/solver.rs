pub mod costs;
pub mod problem;

pub use costs::{CostFunction, ExposureCost, IntensityCost};
pub use problem::{Problem, Solution, SolveSummary, SolverOptions};
