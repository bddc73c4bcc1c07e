//! Configuration of the iterative smoother: inversion scheme, subspace
//! truncation and the step-length schedule.

use std::path::PathBuf;

use crate::ies::IesError;

/// Linear-algebra scheme used to form the update gain. The variants trade off
/// numerical stability against cost and against how `R` is represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inversion {
    /// Direct Cholesky solve against the full measurement-error covariance.
    Exact,
    /// Truncated SVD of the predicted anomalies, explicit `R` rotated into
    /// the retained subspace.
    SubspaceExactR,
    /// Like [`Inversion::SubspaceExactR`] but with `R` approximated by the
    /// sample covariance `E Eᵀ/(N-1)` of the stored perturbations.
    SubspaceEeR,
    /// Reduced form built from a second SVD of the scaled perturbations
    /// rotated into the retained subspace. Most stable variant.
    SubspaceRe,
}

#[derive(Debug, Clone)]
pub struct IesConfig {
    pub inversion: Inversion,
    /// Energy fraction of the singular spectrum to retain, in `(0, 1]`.
    pub truncation: f64,
    /// Optional hard cap on the retained subspace rank.
    pub rank_cap: Option<usize>,
    pub max_steplength: f64,
    pub min_steplength: f64,
    pub dec_steplength: f64,
    /// Project the innovation onto the column space of the state anomalies
    /// when the ensemble is under-determined in state space.
    pub projection: bool,
    /// Optional per-iteration diagnostic log. Truncated on the first
    /// iteration, appended to afterwards.
    pub log_path: Option<PathBuf>,
}

impl Default for IesConfig {
    fn default() -> Self {
        Self {
            inversion: Inversion::SubspaceExactR,
            truncation: 0.98,
            rank_cap: None,
            max_steplength: 0.60,
            min_steplength: 0.30,
            dec_steplength: 2.5,
            projection: false,
            log_path: None,
        }
    }
}

impl IesConfig {
    /// Step length for outer iteration `k` (1-based). Starts at
    /// `max_steplength` and decays geometrically towards `min_steplength`:
    ///
    /// `gamma(k) = min + (max - min) * 2^(-(k-1)/(dec-1))`
    pub fn steplength(&self, iteration_nr: usize) -> f64 {
        let k = iteration_nr.max(1) as f64;
        let dec = self.dec_steplength.max(1.0 + f64::EPSILON);
        self.min_steplength
            + (self.max_steplength - self.min_steplength) * (-(k - 1.0) / (dec - 1.0)).exp2()
    }

    pub fn validate(&self) -> Result<(), IesError> {
        if !(self.truncation > 0.0 && self.truncation <= 1.0) {
            return Err(IesError::InvalidConfig(format!(
                "truncation must be in (0, 1], got {}",
                self.truncation
            )));
        }
        if self.min_steplength > self.max_steplength {
            return Err(IesError::InvalidConfig(format!(
                "min_steplength {} exceeds max_steplength {}",
                self.min_steplength, self.max_steplength
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steplength_starts_at_max_and_decays() {
        let config = IesConfig::default();
        let first = config.steplength(1);
        assert!((first - config.max_steplength).abs() < 1e-12);

        let mut previous = first;
        for k in 2..12 {
            let gamma = config.steplength(k);
            assert!(gamma <= previous);
            assert!(gamma >= config.min_steplength);
            previous = gamma;
        }
        assert!((config.steplength(200) - config.min_steplength).abs() < 1e-6);
    }

    #[test]
    fn constant_schedule_when_bounds_coincide() {
        let config = IesConfig {
            max_steplength: 1.0,
            min_steplength: 1.0,
            ..IesConfig::default()
        };
        for k in 1..8 {
            assert_eq!(config.steplength(k), 1.0);
        }
    }

    #[test]
    fn validate_rejects_bad_truncation() {
        let config = IesConfig {
            truncation: 0.0,
            ..IesConfig::default()
        };
        assert!(config.validate().is_err());
        let config = IesConfig {
            truncation: 1.5,
            ..IesConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
