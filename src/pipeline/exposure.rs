//! Per-frame exposure calibration from vertex observations.

use crate::error::Result;
use crate::io::config::SolverConfig;
use crate::pipeline::correspondence::{Selection, observation_confidence};
use crate::solver::{ExposureCost, Problem, SolveSummary, SolverOptions};
use log::{info, warn};

/// Lower bound on solved exposures; the radiance kernels divide by them.
pub const MIN_EXPOSURE: f64 = 1e-6;

#[derive(Debug, Clone)]
pub struct ExposureSolution {
    /// Linear exposure per frame. Frames without observations keep 1.0.
    pub exposures: Vec<f64>,
    /// Observations per frame.
    pub observations: Vec<usize>,
    /// Radiance per selected vertex, NaN for vertices never observed.
    pub radiance: Vec<[f64; 3]>,
    /// Frame whose exposure was held at 1.0.
    pub anchor: Option<usize>,
    pub summary: SolveSummary,
}

impl ExposureSolution {
    /// Whether any observation informed frame `f`'s exposure.
    pub fn is_constrained(&self, f: usize) -> bool {
        self.observations.get(f).is_some_and(|&n| n > 0)
    }
}

fn exposure_block(f: usize) -> String {
    format!("e{f}")
}

fn radiance_block(v: usize) -> String {
    format!("r{v}")
}

/// Jointly estimates frame exposures and vertex radiance.
///
/// Residual per observation: `(exposure_f · radiance_v − observation) · confidence`. The first
/// frame with an observation is the anchor and is held at exactly 1.0; the others are bounded
/// below by [`MIN_EXPOSURE`].
pub fn solve_exposure(selection: &Selection, config: &SolverConfig) -> Result<ExposureSolution> {
    let frames = selection.frame_count;
    let mut problem = Problem::new();
    let mut observations = vec![0usize; frames];
    let mut observed_vertices = Vec::new();

    // 1. Blocks & residuals
    for f in 0..frames {
        problem.add_parameter_block(exposure_block(f), &[1.0])?;
    }
    for v in 0..selection.vertex_count() {
        let samples: Vec<(usize, [f32; 3])> = (0..frames)
            .filter_map(|f| selection.observation(v, f).map(|s| (f, s)))
            .collect();
        if samples.is_empty() {
            continue;
        }
        let mut mean = [0.0f64; 3];
        for (_, s) in &samples {
            for c in 0..3 {
                mean[c] += s[c] as f64 / samples.len() as f64;
            }
        }
        let name = radiance_block(v);
        problem.add_parameter_block(&name, &mean)?;
        for (f, sample) in samples {
            observations[f] += 1;
            let cost = ExposureCost {
                observation: sample.map(f64::from),
                weight: observation_confidence(&sample) as f64,
            };
            problem.add_residual_block(cost, &[&exposure_block(f), &name], config.loss)?;
        }
        observed_vertices.push(v);
    }

    // 2. Gauge & bounds
    let anchor = observations.iter().position(|&n| n > 0);
    if let Some(anchor) = anchor {
        problem.fix_parameter_block(&exposure_block(anchor))?;
    }
    for f in (0..frames).filter(|&f| observations[f] > 0 && Some(f) != anchor) {
        problem.set_parameter_bounds(&exposure_block(f), 0, MIN_EXPOSURE, f64::MAX)?;
    }

    // 3. Solve
    let solution = problem.solve(&SolverOptions::from(config))?;
    info!("Exposure solve: {}", solution.summary.brief_report());
    if !solution.summary.converged {
        warn!("Exposure solve did not converge");
    }
    let unconstrained = observations.iter().filter(|&&n| n == 0).count();
    if unconstrained > 0 {
        warn!("{unconstrained} frames have no observations and keep exposure 1.0");
    }

    let exposures = (0..frames)
        .map(|f| match solution.get(&exposure_block(f)) {
            Some(e) if Some(f) != anchor => e[0].max(MIN_EXPOSURE),
            _ => 1.0,
        })
        .collect();
    let mut radiance = vec![[f64::NAN; 3]; selection.vertex_count()];
    for v in observed_vertices {
        if let Some(r) = solution.get(&radiance_block(v)) {
            radiance[v] = [r[0], r[1], r[2]];
        }
    }

    Ok(ExposureSolution {
        exposures,
        observations,
        radiance,
        anchor,
        summary: solution.summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const RADIANCE: [[f32; 3]; 4] = [
        [40.0, 30.0, 20.0],
        [20.0, 25.0, 30.0],
        [35.0, 10.0, 15.0],
        [12.0, 24.0, 36.0],
    ];

    /// Consistent observations `k · exposure_f · radiance_v`, frame 0 never sees vertex 3.
    fn synthetic(exposures: &[f32], k: f32) -> Selection {
        let frames = exposures.len();
        let mut observations = Vec::new();
        for (v, r) in RADIANCE.iter().enumerate() {
            for (f, e) in exposures.iter().enumerate() {
                if v == 3 && f == 0 {
                    observations.push([f32::NAN; 3]);
                } else {
                    observations.push(r.map(|c| c * e * k));
                }
            }
        }
        Selection {
            vertices: (0..RADIANCE.len()).collect(),
            frame_count: frames,
            observations,
        }
    }

    #[test]
    fn recovers_relative_exposures() {
        let solution = solve_exposure(&synthetic(&[1.0, 2.0, 0.5], 1.0), &SolverConfig::default()).unwrap();
        assert!(solution.summary.converged);
        assert_eq!(solution.anchor, Some(0));
        assert_eq!(solution.exposures[0], 1.0);
        assert!((solution.exposures[1] - 2.0).abs() < 1e-4);
        assert!((solution.exposures[2] - 0.5).abs() < 1e-4);
        assert!((solution.radiance[3][2] - 36.0).abs() < 1e-2);
        assert_eq!(solution.observations, vec![3, 4, 4]);
    }

    #[test]
    fn scaling_observations_scales_radiance_only() {
        let exposures = [1.0, 1.6, 0.8];
        let base = solve_exposure(&synthetic(&exposures, 1.0), &SolverConfig::default()).unwrap();
        let scaled = solve_exposure(&synthetic(&exposures, 1.5), &SolverConfig::default()).unwrap();
        for (a, b) in base.exposures.iter().zip(&scaled.exposures) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
        for (a, b) in base.radiance.iter().zip(&scaled.radiance) {
            for c in 0..3 {
                assert!((a[c] * 1.5 - b[c]).abs() < 1e-2);
            }
        }
    }

    #[test]
    fn unobserved_frames_keep_unit_exposure() {
        let mut selection = synthetic(&[1.0, 2.0, 3.0], 1.0);
        // Drop every observation of frames 0 and 2.
        for (i, sample) in selection.observations.iter_mut().enumerate() {
            if i % 3 != 1 {
                *sample = [f32::NAN; 3];
            }
        }
        let solution = solve_exposure(&selection, &SolverConfig::default()).unwrap();
        assert_eq!(solution.anchor, Some(1));
        assert_eq!(solution.exposures, vec![1.0, 1.0, 1.0]);
        assert!(!solution.is_constrained(0));
        assert!(solution.is_constrained(1));
        assert!(!solution.is_constrained(2));
    }

    #[test]
    fn dark_frames_stay_above_minimum_exposure() {
        let solution = solve_exposure(&synthetic(&[1.0, 2.0, 1e-9], 1.0), &SolverConfig::default()).unwrap();
        assert_eq!(solution.exposures[0], 1.0);
        assert!((solution.exposures[1] - 2.0).abs() < 1e-3);
        assert!(solution.exposures.iter().all(|&e| e >= MIN_EXPOSURE), "{:?}", solution.exposures);
    }

    #[test]
    fn empty_selection_is_trivial() {
        let selection = Selection {
            vertices: vec![],
            frame_count: 2,
            observations: vec![],
        };
        let solution = solve_exposure(&selection, &SolverConfig::default()).unwrap();
        assert_eq!(solution.anchor, None);
        assert_eq!(solution.exposures, vec![1.0, 1.0]);
    }
}
