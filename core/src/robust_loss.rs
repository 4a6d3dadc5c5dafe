//! Robust loss functions for outlier-aware estimation
//!
//! The control parameter of each loss can be changed at runtime, which is what
//! graduated non-convexity relies on: start with a wide (nearly convex) kernel
//! and shrink it step by step.

use serde::{Deserialize, Serialize};

/// Robust loss with its current control parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RobustLoss {
    /// Geman-McClure: ρ(r) = (μ r²) / (μ + r²)
    GemanMcClure { mu: f64 },
    /// Welsch/Leclerc: ρ(r) = μ (1 - exp(-r²/μ))
    Welsch { mu: f64 },
    /// Truncated Least Squares: ρ(r) = min(r², c²)
    TruncatedLeastSquares { c: f64 },
}

/// Loss family selector used in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RobustLossType {
    #[default]
    GemanMcClure,
    Welsch,
    TruncatedLeastSquares,
}

impl RobustLossType {
    /// Build a loss whose control parameter corresponds to a residual scale of
    /// `scale` (μ = scale² for the smooth kernels, c = scale for TLS).
    pub fn with_scale(self, scale: f64) -> RobustLoss {
        match self {
            RobustLossType::GemanMcClure => RobustLoss::GemanMcClure { mu: scale * scale },
            RobustLossType::Welsch => RobustLoss::Welsch { mu: scale * scale },
            RobustLossType::TruncatedLeastSquares => {
                RobustLoss::TruncatedLeastSquares { c: scale }
            }
        }
    }
}

impl RobustLoss {
    /// Evaluate ρ(r).
    pub fn evaluate(&self, residual: f64) -> f64 {
        let r2 = residual * residual;
        match self {
            RobustLoss::GemanMcClure { mu } => (mu * r2) / (mu + r2),
            RobustLoss::Welsch { mu } => mu * (1.0 - (-r2 / mu).exp()),
            RobustLoss::TruncatedLeastSquares { c } => r2.min(c * c),
        }
    }

    /// IRLS weight in [0, 1].
    pub fn weight(&self, residual: f64) -> f64 {
        let r2 = residual * residual;
        match self {
            RobustLoss::GemanMcClure { mu } => {
                let s = mu / (mu + r2);
                s * s
            }
            RobustLoss::Welsch { mu } => (-r2 / mu).exp(),
            RobustLoss::TruncatedLeastSquares { c } => {
                if r2 < c * c {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// Residual scale implied by the control parameter.
    pub fn scale(&self) -> f64 {
        match self {
            RobustLoss::GemanMcClure { mu } | RobustLoss::Welsch { mu } => mu.sqrt(),
            RobustLoss::TruncatedLeastSquares { c } => *c,
        }
    }

    /// Replace the control parameter, expressed as a residual scale.
    pub fn set_scale(&mut self, scale: f64) {
        match self {
            RobustLoss::GemanMcClure { mu } | RobustLoss::Welsch { mu } => *mu = scale * scale,
            RobustLoss::TruncatedLeastSquares { c } => *c = scale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geman_mcclure_loss() {
        let loss = RobustLoss::GemanMcClure { mu: 1.0 };

        assert!(loss.evaluate(0.1) < 0.011);
        assert!(loss.evaluate(10.0) < 1.0);

        let w_small = loss.weight(0.1);
        let w_large = loss.weight(10.0);
        assert!(w_large < w_small);
        assert!((loss.weight(0.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_tls_loss() {
        let loss = RobustLoss::TruncatedLeastSquares { c: 1.0 };
        assert_eq!(loss.evaluate(0.5), 0.25);
        assert_eq!(loss.evaluate(2.0), 1.0);
        assert_eq!(loss.weight(2.0), 0.0);
        assert_eq!(loss.weight(0.5), 1.0);
    }

    #[test]
    fn test_scale_roundtrip() {
        let mut loss = RobustLossType::Welsch.with_scale(2.0);
        assert!((loss.scale() - 2.0).abs() < 1e-12);
        loss.set_scale(0.5);
        assert_eq!(loss, RobustLoss::Welsch { mu: 0.25 });
    }
}
