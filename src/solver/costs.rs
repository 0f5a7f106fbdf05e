//! Residual blocks understood by [`Problem`](super::Problem).

use nalgebra::{DVector, RealField};
use tiny_solver::factors::{Factor, FactorImpl};

/// Photometric consistency of one vertex seen in one frame.
///
/// Parameters `[exposure (1), radiance (3)]`; residual `(exposure · radiance − observation) · weight`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureCost {
    pub observation: [f64; 3],
    pub weight: f64,
}

impl<T: RealField> Factor<T> for ExposureCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let exposure = params[0][0].clone();
        let weight: T = nalgebra::convert(self.weight);
        DVector::from_iterator(
            3,
            (0..3).map(|c| {
                let observed: T = nalgebra::convert(self.observation[c]);
                (exposure.clone() * params[1][c].clone() - observed) * weight.clone()
            }),
        )
    }
}

/// Spherical-Gaussian lobe fitted to one footprint pixel with the lobe shape held fixed.
///
/// Parameters `[amplitude (3)]`; residual `(amplitude · falloff − observation) · weight`, where
/// `falloff = exp(sharpness · (direction·axis − 1))` is precomputed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntensityCost {
    pub falloff: f64,
    pub observation: [f64; 3],
    pub weight: f64,
}

impl IntensityCost {
    pub fn new(direction_dot_axis: f64, sharpness: f64, observation: [f64; 3], weight: f64) -> Self {
        Self {
            falloff: (sharpness * (direction_dot_axis - 1.0)).exp(),
            observation,
            weight,
        }
    }
}

impl<T: RealField> Factor<T> for IntensityCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let falloff: T = nalgebra::convert(self.falloff);
        let weight: T = nalgebra::convert(self.weight);
        DVector::from_iterator(
            3,
            (0..3).map(|c| {
                let observed: T = nalgebra::convert(self.observation[c]);
                (params[0][c].clone() * falloff.clone() - observed) * weight.clone()
            }),
        )
    }
}

/// Closed set of costs a [`Problem`](super::Problem) can hold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CostFunction {
    Exposure(ExposureCost),
    Intensity(IntensityCost),
}

impl CostFunction {
    pub fn residual_dim(&self) -> usize {
        3
    }

    /// Expected sizes of the parameter blocks, in order.
    pub fn block_dims(&self) -> &'static [usize] {
        match self {
            CostFunction::Exposure(_) => &[1, 3],
            CostFunction::Intensity(_) => &[3],
        }
    }

    pub fn evaluate(&self, params: &[DVector<f64>]) -> DVector<f64> {
        self.residual(params)
    }

    fn residual<T: RealField>(&self, params: &[DVector<T>]) -> DVector<T> {
        match self {
            CostFunction::Exposure(cost) => cost.residual_func(params),
            CostFunction::Intensity(cost) => cost.residual_func(params),
        }
    }

    /// Optimizer factor over the free blocks only; `Some` slots are held at their value.
    pub(crate) fn into_factor(self, constants: Vec<Option<DVector<f64>>>) -> Box<dyn FactorImpl + Send> {
        Box::new(PinnedFactor {
            cost: self,
            constants,
        })
    }
}

struct PinnedFactor {
    cost: CostFunction,
    constants: Vec<Option<DVector<f64>>>,
}

impl<T: RealField> Factor<T> for PinnedFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let mut free = params.iter();
        let full: Vec<DVector<T>> = self
            .constants
            .iter()
            .map(|constant| match constant {
                Some(values) => values.map(|x| nalgebra::convert::<f64, T>(x)),
                None => free.next().cloned().unwrap_or_else(|| DVector::zeros(0)),
            })
            .collect();
        self.cost.residual(&full)
    }
}

impl From<ExposureCost> for CostFunction {
    fn from(cost: ExposureCost) -> Self {
        CostFunction::Exposure(cost)
    }
}

impl From<IntensityCost> for CostFunction {
    fn from(cost: IntensityCost) -> Self {
        CostFunction::Intensity(cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposure_residual_is_weighted_difference() {
        let cost = ExposureCost {
            observation: [100.0, 50.0, 10.0],
            weight: 0.5,
        };
        let r = CostFunction::from(cost).evaluate(&[
            DVector::from_element(1, 2.0),
            DVector::from_vec(vec![50.0, 30.0, 5.0]),
        ]);
        assert_eq!(r.as_slice(), &[0.0, 5.0, 0.0]);
    }

    #[test]
    fn intensity_residual_peaks_on_axis() {
        let on_axis = IntensityCost::new(1.0, 20.0, [4.0, 2.0, 1.0], 1.0);
        assert_eq!(on_axis.falloff, 1.0);
        let r = CostFunction::from(on_axis).evaluate(&[DVector::from_vec(vec![4.0, 2.0, 1.0])]);
        assert!(r.norm() < 1e-12);

        let off_axis = IntensityCost::new(0.9, 20.0, [0.0; 3], 1.0);
        assert!((off_axis.falloff - (-2.0f64).exp()).abs() < 1e-12);
    }

    #[test]
    fn pinned_exposure_only_sees_radiance() {
        let cost = CostFunction::from(ExposureCost {
            observation: [100.0, 50.0, 10.0],
            weight: 1.0,
        });
        let factor = cost.into_factor(vec![Some(DVector::from_element(1, 2.0)), None]);
        let radiance = DVector::from_vec(vec![50.0, 30.0, 5.0]);
        let r = factor.residual_func_f64(&[radiance]);
        assert_eq!(r.as_slice(), &[0.0, 10.0, 0.0]);
    }
}
