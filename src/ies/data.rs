//! Persistent per-analysis state carried across outer iterations: the
//! coefficient matrix `W`, the stored prior ensemble `A0`, the stored initial
//! observation perturbations `E`, the activity masks and the iteration
//! counter.

use ndarray::Array2;

use crate::ies::IesError;
use crate::ies::mask::ActiveMask;

/// Fill value for rows of the stored perturbation matrix that have never been
/// active; such entries must not participate in any computation.
pub const INACTIVE_FILL: f64 = -999.9;

#[derive(Default)]
pub struct IesData {
    iteration_nr: usize,
    state_size: Option<usize>,
    ens_mask: Option<ActiveMask>,
    /// Observation mask frozen at the first iteration, widened by
    /// [`IesData::augment_initial_perturbations`] when observations activate
    /// later.
    obs_mask0: Option<ActiveMask>,
    /// Observation mask of the current iteration.
    obs_mask: Option<ActiveMask>,
    /// Coefficient matrix at full ensemble size, zero at inactive indices.
    w: Option<Array2<f64>>,
    /// Prior ensemble, `state_size x active_ens`, written once.
    a0: Option<Array2<f64>>,
    /// Initial observation perturbations at full `obs x ens` size; only
    /// entries indicated by `obs_mask0` and `ens_mask` are meaningful.
    e: Option<Array2<f64>>,
}

impl IesData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iteration_nr(&self) -> usize {
        self.iteration_nr
    }

    /// Advances the outer iteration counter and returns the new value.
    /// Called exactly once per smoother step.
    pub fn advance_iteration(&mut self) -> usize {
        self.iteration_nr += 1;
        self.iteration_nr
    }

    pub fn ens_mask(&self) -> Option<&ActiveMask> {
        self.ens_mask.as_ref()
    }

    pub fn obs_mask(&self) -> Option<&ActiveMask> {
        self.obs_mask.as_ref()
    }

    pub fn obs_mask0(&self) -> Option<&ActiveMask> {
        self.obs_mask0.as_ref()
    }

    pub fn stored_prior(&self) -> Option<&Array2<f64>> {
        self.a0.as_ref()
    }

    pub fn stored_perturbations(&self) -> Option<&Array2<f64>> {
        self.e.as_ref()
    }

    pub fn active_ens_count(&self) -> usize {
        self.ens_mask.as_ref().map_or(0, ActiveMask::active_count)
    }

    pub fn active_obs_count(&self) -> usize {
        self.obs_mask.as_ref().map_or(0, ActiveMask::active_count)
    }

    /// Reconciles the masks supplied for a new outer iteration with the
    /// stored state. Realizations may not vanish (or appear) once the prior
    /// has been stored; observations may come and go, subject to the
    /// `current => initial` invariant maintained by augmentation.
    pub fn init_update(
        &mut self,
        ens_mask: &ActiveMask,
        obs_mask: &ActiveMask,
    ) -> Result<(), IesError> {
        if let Some(stored) = &self.ens_mask {
            if stored != ens_mask {
                return Err(IesError::MaskInconsistency(
                    "ensemble mask changed after the first iteration; realizations may not \
                     vanish or appear mid-assimilation"
                        .to_string(),
                ));
            }
        } else {
            self.ens_mask = Some(ens_mask.clone());
        }
        if self.obs_mask0.is_none() {
            self.obs_mask0 = Some(obs_mask.clone());
        }
        self.obs_mask = Some(obs_mask.clone());
        Ok(())
    }

    /// Records the state dimension on first use; later calls are ignored.
    pub fn update_state_size(&mut self, state_size: usize) {
        self.state_size.get_or_insert(state_size);
    }

    pub fn state_size(&self) -> Option<usize> {
        self.state_size
    }

    /// Stores the prior ensemble on the first iteration; immutable afterwards.
    pub fn store_initial_prior(&mut self, a: &Array2<f64>) {
        if self.a0.is_none() {
            self.a0 = Some(a.clone());
        }
    }

    /// Scatters the first iteration's perturbations `e0` (shaped
    /// `active_obs x active_ens`) into full-size storage. Rows never active
    /// keep the sentinel fill. Write-once; later calls are no-ops.
    pub fn store_initial_perturbations(&mut self, e0: &Array2<f64>) {
        if self.e.is_some() {
            return;
        }
        let (Some(obs_mask0), Some(ens_mask)) = (&self.obs_mask0, &self.ens_mask) else {
            return;
        };
        let mut full = Array2::from_elem((obs_mask0.len(), ens_mask.len()), INACTIVE_FILL);
        let mut row = 0;
        for iobs in 0..obs_mask0.len() {
            if !obs_mask0.is_active(iobs) {
                continue;
            }
            let mut col = 0;
            for iens in 0..ens_mask.len() {
                if ens_mask.is_active(iens) {
                    full[(iobs, iens)] = e0[(row, col)];
                    col += 1;
                }
            }
            row += 1;
        }
        self.e = Some(full);
    }

    /// Adds perturbation rows for observations that activated after the
    /// first iteration, widening `obs_mask0` so that
    /// `obs_mask[i] => obs_mask0[i]` holds afterwards. `e0` is shaped by the
    /// current observation mask.
    pub fn augment_initial_perturbations(&mut self, e0: &Array2<f64>) {
        let Some(full) = &mut self.e else {
            return;
        };
        let (Some(obs_mask0), Some(obs_mask), Some(ens_mask)) =
            (&mut self.obs_mask0, &self.obs_mask, &self.ens_mask)
        else {
            return;
        };
        let mut row = 0;
        for iobs in 0..obs_mask.len() {
            if obs_mask.is_active(iobs) && !obs_mask0.is_active(iobs) {
                let mut col = 0;
                for iens in 0..ens_mask.len() {
                    if ens_mask.is_active(iens) {
                        full[(iobs, iens)] = e0[(row, col)];
                        col += 1;
                    }
                }
                obs_mask0.set_active(iobs);
            }
            if obs_mask.is_active(iobs) {
                row += 1;
            }
        }
    }

    /// Gathers the stored perturbations for the currently active
    /// observations and realizations.
    pub fn active_perturbations(&self) -> Option<Array2<f64>> {
        let full = self.e.as_ref()?;
        let obs_mask = self.obs_mask.as_ref()?;
        let ens_mask = self.ens_mask.as_ref()?;
        let rows = obs_mask.active_indices();
        let cols = ens_mask.active_indices();
        let mut out = Array2::zeros((rows.len(), cols.len()));
        for (i, &iobs) in rows.iter().enumerate() {
            for (j, &iens) in cols.iter().enumerate() {
                out[(i, j)] = full[(iobs, iens)];
            }
        }
        Some(out)
    }

    /// Allocates the coefficient matrix at full ensemble size, zero filled.
    pub fn allocate_coefficients(&mut self) {
        if self.w.is_none() {
            if let Some(ens_mask) = &self.ens_mask {
                self.w = Some(Array2::zeros((ens_mask.len(), ens_mask.len())));
            }
        }
    }

    /// Active block of the coefficient matrix, `active_ens x active_ens`.
    pub fn active_coefficients(&self) -> Option<Array2<f64>> {
        let w = self.w.as_ref()?;
        let idx = self.ens_mask.as_ref()?.active_indices();
        let mut out = Array2::zeros((idx.len(), idx.len()));
        for (i, &row) in idx.iter().enumerate() {
            for (j, &col) in idx.iter().enumerate() {
                out[(i, j)] = w[(row, col)];
            }
        }
        Some(out)
    }

    /// Scatters an updated active coefficient block back into full-size
    /// storage; inactive indices stay zero.
    pub fn store_active_coefficients(&mut self, w_active: &Array2<f64>) {
        let Some(ens_mask) = &self.ens_mask else {
            return;
        };
        let idx = ens_mask.active_indices();
        let Some(w) = &mut self.w else {
            return;
        };
        for (i, &row) in idx.iter().enumerate() {
            for (j, &col) in idx.iter().enumerate() {
                w[(row, col)] = w_active[(i, j)];
            }
        }
    }
}
