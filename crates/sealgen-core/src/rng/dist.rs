//! Distributions built on [`DrawCursor`].
//!
//! | primitive          | blocks              | draws               |
//! |--------------------|---------------------|---------------------|
//! | `standard_normal`  | 1                   | 2 (Box–Muller)      |
//! | `gamma(a >= 1)`    | 2 per attempt       | 3 per attempt       |
//! | `gamma(a < 1)`     | gamma(a+1) + 1      | gamma(a+1) + 1      |
//! | `dirichlet(alpha)` | sum of the gammas   | sum of the gammas   |
//!
//! Gamma uses Marsaglia–Tsang with the `U^(1/a)` boost for shapes below one.

use super::substream::DrawCursor;
use crate::error::{CoreError, CoreResult, ErrorCode};
use std::f64::consts::TAU;

/// Upper bound on Marsaglia–Tsang attempts for one variate.
pub const MAX_GAMMA_ATTEMPTS: u32 = 1_000;

impl DrawCursor {
    /// Standard normal via Box–Muller (cosine branch only).
    pub fn standard_normal(&mut self) -> CoreResult<f64> {
        let (u1, u2) = self.uniform_pair()?;
        Ok((-2.0 * u1.ln()).sqrt() * (TAU * u2).cos())
    }

    /// Gamma(shape, 1).
    pub fn gamma(&mut self, shape: f64) -> CoreResult<f64> {
        if !(shape.is_finite() && shape > 0.0) {
            return Err(CoreError::new(
                ErrorCode::DirichletDegenerate,
                format!("gamma shape must be finite and > 0, got {}", shape),
            )
            .with_subject(self.subject().to_string()));
        }
        if shape < 1.0 {
            let g = self.gamma_marsaglia_tsang(shape + 1.0)?;
            let u = self.uniform()?;
            return Ok(g * u.powf(1.0 / shape));
        }
        self.gamma_marsaglia_tsang(shape)
    }

    fn gamma_marsaglia_tsang(&mut self, shape: f64) -> CoreResult<f64> {
        let d = shape - 1.0 / 3.0;
        let c = 1.0 / (9.0 * d).sqrt();
        for _ in 0..MAX_GAMMA_ATTEMPTS {
            let z = self.standard_normal()?;
            let u = self.uniform()?;
            let v = 1.0 + c * z;
            if v <= 0.0 {
                continue;
            }
            let v = v * v * v;
            if u.ln() < 0.5 * z * z + d - d * v + d * v.ln() {
                return Ok(d * v);
            }
        }
        Err(CoreError::new(
            ErrorCode::RngBudget,
            format!(
                "gamma({}) rejected {} consecutive proposals",
                shape, MAX_GAMMA_ATTEMPTS
            ),
        )
        .with_subject(self.subject().to_string()))
    }

    /// Dirichlet(alpha) as normalized independent gammas.
    ///
    /// Empty or non-positive `alpha`, or a gamma sum that is not a positive
    /// finite number, fails with `E_DIRICHLET_DEGENERATE`.
    pub fn dirichlet(&mut self, alpha: &[f64]) -> CoreResult<Vec<f64>> {
        if alpha.is_empty() {
            return Err(CoreError::new(
                ErrorCode::DirichletDegenerate,
                "dirichlet requires at least one component",
            )
            .with_subject(self.subject().to_string()));
        }
        let mut gammas = Vec::with_capacity(alpha.len());
        for &a in alpha {
            gammas.push(self.gamma(a)?);
        }
        let sum: f64 = gammas.iter().sum();
        if !(sum.is_finite() && sum > 0.0) {
            return Err(CoreError::new(
                ErrorCode::DirichletDegenerate,
                format!("gamma sum is not positive: {}", sum),
            )
            .with_subject(self.subject().to_string()));
        }
        Ok(gammas.into_iter().map(|g| g / sum).collect())
    }
}

#[cfg(test)]
mod tests {
    use crate::error::ErrorCode;
    use crate::rng::key::SubstreamKey;
    use crate::rng::philox::Counter;
    use crate::rng::substream::Substream;

    fn stream() -> Substream {
        Substream::new(
            SubstreamKey::new("1A", "dist").with(9_u64),
            0xfeed_beef,
            Counter::new(0, 0),
            None,
        )
    }

    #[test]
    fn test_normal_moments() {
        let mut s = stream();
        let n = 50_000;
        let (samples, rec) = s
            .draw_group(|c| (0..n).map(|_| c.standard_normal()).collect::<Result<Vec<_>, _>>())
            .unwrap();
        assert_eq!(rec.blocks, n as u64);
        assert_eq!(rec.draws, 2 * n as u64);
        let mean = samples.iter().sum::<f64>() / n as f64;
        let var = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.03, "mean={}", mean);
        assert!((var - 1.0).abs() < 0.05, "var={}", var);
    }

    #[test]
    fn test_gamma_mean_matches_shape() {
        for shape in [0.5, 1.0, 2.5, 7.0] {
            let mut s = stream();
            let n = 20_000;
            let (samples, _) = s
                .draw_group(|c| (0..n).map(|_| c.gamma(shape)).collect::<Result<Vec<_>, _>>())
                .unwrap();
            let mean = samples.iter().sum::<f64>() / n as f64;
            assert!(samples.iter().all(|&g| g > 0.0));
            assert!(
                (mean - shape).abs() < 0.05 * shape.max(1.0),
                "shape={} mean={}",
                shape,
                mean
            );
        }
    }

    #[test]
    fn test_gamma_draw_accounting_is_consistent() {
        let mut s = stream();
        let (_, rec) = s.draw_group(|c| c.gamma(2.0)).unwrap();
        // Each attempt: one normal block (2 draws) + one uniform block (1 draw).
        assert_eq!(rec.blocks % 2, 0);
        assert_eq!(rec.draws, rec.blocks / 2 * 3);
    }

    #[test]
    fn test_dirichlet_sums_to_one() {
        let mut s = stream();
        let (shares, _) = s.draw_group(|c| c.dirichlet(&[2.0, 3.0, 0.4])).unwrap();
        assert_eq!(shares.len(), 3);
        assert!((shares.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(shares.iter().all(|&x| x > 0.0 && x < 1.0));
    }

    #[test]
    fn test_dirichlet_rejects_bad_alpha() {
        let mut s = stream();
        for alpha in [vec![], vec![1.0, 0.0], vec![1.0, f64::NAN], vec![-1.0]] {
            let err = s.draw_group(|c| c.dirichlet(&alpha)).unwrap_err();
            assert_eq!(err.code, ErrorCode::DirichletDegenerate);
        }
        assert_eq!(s.blocks_total(), 0);
    }
}
