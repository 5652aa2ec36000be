// This Source Code Form is subject to the terms of the GNU General Public
// License, version 2 or (at your option) any later version.

//! Cross-section preparation pipeline, grounded in the original engine's
//! `XsConvolution`/`XsInterpolation`/`ANALYSE_Orthogonal`/`ANALYSE_Normalize`
//! reachable from `analyse.c`, re-expressed as one explicitly-ordered
//! function instead of a loop over per-symbol flags — the eight steps
//! have a strict data dependency (Pukite before orthogonalisation,
//! molecular-Ring before orthogonalisation, orthogonalisation before
//! normalisation) that a flag-driven loop would leave implicit.

use std::collections::HashMap;

use ndarray::Array1;
use thiserror::Error;

use crate::numeric::spline::{self, SplineMode};
use crate::numeric::vector;
use crate::slit::{Slit, SlitError};
use crate::workspace::Workspace;

#[derive(Error, Debug)]
pub enum CrossSectionError {
    #[error("workspace symbol {0} referenced by a cross-reference does not exist")]
    MissingSymbol(usize),
    #[error("symbol {0} has no high-resolution cross section loaded")]
    NoHighResolutionData(usize),
    #[error(transparent)]
    Slit(#[from] SlitError),
    #[error(transparent)]
    Spline(#[from] crate::numeric::spline::SplineError),
    #[error("Pukite term for cross-reference {0} references a source index out of range")]
    PukiteSourceOutOfRange(usize),
    #[error("orthogonalisation base member {0} is referenced before it is defined")]
    OrthogonalisationOrder(usize),
    #[error("normalisation factor is zero for cross-reference {0} (RMS over fit range is zero)")]
    NormaliseZero(usize),
}

/// How a symbol's orthogonal basis membership is handled in step 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orthogonalisation {
    /// Orthogonalise against the basis member at this earlier index.
    Against(usize),
    /// This vector is itself a base member of the orthogonal basis.
    BaseMember,
    /// Skip orthogonalisation entirely.
    Skip,
}

/// Static per-symbol configuration, grounded in `_crossReference`.
#[derive(Debug, Clone)]
pub struct CrossReference {
    pub comp: usize,
    pub fit_from_previous: bool,
    pub xs_to_convolute: bool,
    pub xs_to_convolute_i0: bool,
    pub i0_concentration: f64,
    pub pukite_sources: Option<(usize, usize)>,
    pub lambda0_pukite: Option<f64>,
    pub molecular_correction: bool,
    pub subtract_from: Option<usize>,
    pub orthogonalisation: Orthogonalisation,
}

/// Pre-molecular-Ring-correction snapshot of a column (step 5), kept so
/// the correction can be rebuilt from this point if the reference
/// spectrum (and therefore the Raman kernel) changes, without re-running
/// the resampling/Pukite steps that came before it.
#[derive(Debug, Clone)]
pub struct RingBackup {
    pub vector: Array1<f64>,
    pub deriv2: Array1<f64>,
}

/// The prepared column for one symbol, ready to enter the forward
/// model's design matrix.
#[derive(Debug, Clone)]
pub struct CrossResults {
    pub vector: Array1<f64>,
    pub deriv2: Array1<f64>,
    /// RMS normalisation factor from step 8; fitted slant columns must
    /// be scaled back by this factor.
    pub fact: f64,
    /// Set only for symbols with `molecular_correction` enabled.
    pub ring_backup: Option<RingBackup>,
}

/// Runs the eight-step preparation pipeline, producing one [`CrossResults`]
/// per entry of `cross_refs`, in the same order.
pub fn prepare_window(
    workspace: &Workspace,
    cross_refs: &[CrossReference],
    lambda: &[f64],
    slit: &Slit,
    raman_kernel: Option<&[f64]>,
    lambda0: f64,
    fit_range: std::ops::Range<usize>,
) -> Result<Vec<CrossResults>, CrossSectionError> {
    // Steps 1-3: select the HR source, convolve or interpolate onto the
    // working grid.
    let mut vectors: Vec<Array1<f64>> = Vec::with_capacity(cross_refs.len());
    for (i, cr) in cross_refs.iter().enumerate() {
        let symbol = workspace
            .get(cr.comp)
            .ok_or(CrossSectionError::MissingSymbol(cr.comp))?;
        let hr = symbol
            .xs
            .as_ref()
            .ok_or(CrossSectionError::NoHighResolutionData(cr.comp))?;

        let resampled = if cr.xs_to_convolute_i0 {
            let sigma: Vec<f64> = hr.y.column(0).to_vec();
            slit.convolve_i0(hr, &sigma, cr.i0_concentration, lambda)?
        } else if cr.xs_to_convolute {
            slit.convolve(hr, lambda)?
        } else {
            let y: Vec<f64> = hr.y.column(0).to_vec();
            let x: Vec<f64> = hr.x.to_vec();
            let deriv2 = hr
                .deriv2
                .as_ref()
                .map(|d| d.column(0).to_vec())
                .unwrap_or_else(|| spline::deriv2(&x, &y).unwrap_or_else(|_| vec![0.0; x.len()]));
            spline::vector(&x, &y, &deriv2, lambda, SplineMode::Cubic)
                .map_err(|_| CrossSectionError::MissingSymbol(i))?
        };
        vectors.push(Array1::from(resampled));
    }

    // Step 4: Pukite terms, built from already-resampled source vectors.
    for (i, cr) in cross_refs.iter().enumerate() {
        if let Some((src_i, src_j)) = cr.pukite_sources {
            if src_i >= vectors.len() || src_j >= vectors.len() {
                return Err(CrossSectionError::PukiteSourceOutOfRange(i));
            }
            let l0 = cr.lambda0_pukite.unwrap_or(lambda0);
            let sigma_i = vectors[src_i].clone();
            let sigma_j = vectors[src_j].clone();
            // sigma_P1 = (lambda - lambda0) * sigma_i ; sigma_P2 = sigma_i * sigma_j.
            // Consumers distinguish the two roles via `pukite_sources`
            // ordering: (i, i) requests sigma_P1, (i, j) with i != j
            // requests sigma_P2.
            vectors[i] = if src_i == src_j {
                Array1::from_iter(
                    lambda
                        .iter()
                        .zip(sigma_i.iter())
                        .map(|(&l, &s)| (l - l0) * s),
                )
            } else {
                &sigma_i * &sigma_j
            };
        }
    }

    // Step 5: molecular-Ring correction, with a backup of the
    // pre-correction vector (and its second derivative) so it can be
    // rebuilt if the reference changes.
    let mut backups: HashMap<usize, RingBackup> = HashMap::new();
    for (i, cr) in cross_refs.iter().enumerate() {
        if cr.molecular_correction {
            if let Some(kernel) = raman_kernel {
                let backup_y: Vec<f64> = vectors[i].to_vec();
                let backup_deriv2 =
                    spline::deriv2(lambda, &backup_y).unwrap_or_else(|_| vec![0.0; lambda.len()]);
                backups.insert(
                    i,
                    RingBackup {
                        vector: vectors[i].clone(),
                        deriv2: Array1::from(backup_deriv2),
                    },
                );
                let raman = convolve_same_length(&vectors[i], kernel);
                vectors[i] = &vectors[i] - &raman;
            }
        }
    }

    // Step 6: subtraction.
    for (i, cr) in cross_refs.iter().enumerate() {
        if let Some(target) = cr.subtract_from {
            let source = vectors[i].clone();
            vectors[target] = &vectors[target] - &source;
        }
    }

    // Step 7: Gram-Schmidt orthogonalisation, in `IndOrthog` order.
    let mut orthogonal_basis: Vec<Array1<f64>> = Vec::new();
    let mut basis_index_of: HashMap<usize, usize> = HashMap::new();
    for (i, cr) in cross_refs.iter().enumerate() {
        match cr.orthogonalisation {
            Orthogonalisation::Skip => {}
            Orthogonalisation::BaseMember => {
                basis_index_of.insert(i, orthogonal_basis.len());
                orthogonal_basis.push(vectors[i].clone());
            }
            Orthogonalisation::Against(base) => {
                let &basis_idx = basis_index_of
                    .get(&base)
                    .ok_or(CrossSectionError::OrthogonalisationOrder(base))?;
                let basis_vec = &orthogonal_basis[basis_idx];
                vectors[i] = gram_schmidt_remove_projection(&vectors[i], basis_vec);
            }
        }
    }

    // Step 8: RMS normalisation over the fit range.
    let mut results = Vec::with_capacity(vectors.len());
    for (i, v) in vectors.into_iter().enumerate() {
        let windowed: Vec<f64> = fit_range.clone().map(|p| v[p]).collect();
        let rms = (windowed.iter().map(|x| x * x).sum::<f64>() / windowed.len().max(1) as f64)
            .sqrt();
        if rms == 0.0 {
            return Err(CrossSectionError::NormaliseZero(i));
        }
        let normalised = v.mapv(|x| x / rms);
        let x_slice = lambda.to_vec();
        let y_slice: Vec<f64> = normalised.to_vec();
        let deriv2 = spline::deriv2(&x_slice, &y_slice).unwrap_or_else(|_| vec![0.0; x_slice.len()]);
        results.push(CrossResults {
            vector: normalised,
            deriv2: Array1::from(deriv2),
            fact: rms,
            ring_backup: backups.remove(&i),
        });
    }

    Ok(results)
}

fn convolve_same_length(signal: &Array1<f64>, kernel: &[f64]) -> Array1<f64> {
    let n = signal.len() as isize;
    let half = (kernel.len() / 2) as isize;
    let mut out = Array1::zeros(signal.len());
    for i in 0..signal.len() as isize {
        let mut acc = 0.0;
        for (k, &w) in kernel.iter().enumerate() {
            let offset = k as isize - half;
            let idx = (i + offset).clamp(0, n - 1) as usize;
            acc += w * signal[idx];
        }
        out[i as usize] = acc;
    }
    out
}

fn gram_schmidt_remove_projection(v: &Array1<f64>, basis: &Array1<f64>) -> Array1<f64> {
    let basis_norm_sq = basis.iter().map(|x| x * x).sum::<f64>();
    if basis_norm_sq == 0.0 {
        return v.clone();
    }
    let dot = v.iter().zip(basis.iter()).map(|(a, b)| a * b).sum::<f64>();
    let coeff = dot / basis_norm_sq;
    v - &(basis * coeff)
}
