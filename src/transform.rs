//! Elementwise bijections between the unconstrained sampling space and the
//! support of a latent variable.
//!
//! All methods take the unconstrained value `z` unless the name says otherwise.

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Transform {
    /// `(-inf, inf) -> (-inf, inf)`
    #[default]
    Identity,
    /// `(-inf, inf) -> (0, inf)`, `theta = exp(z)`
    Exp,
    /// `(-inf, inf) -> (lower, inf)`, `theta = lower + exp(z)`
    LowerBound(f64),
    /// `(-inf, inf) -> (-inf, upper)`, `theta = upper - exp(z)`
    UpperBound(f64),
    /// `(-inf, inf) -> (lower, upper)`, `theta = lower + (upper - lower) * sigmoid(z)`
    Interval(f64, f64),
}

#[inline]
fn sigmoid(z: f64) -> f64 {
    if z >= 0. {
        1. / (1. + (-z).exp())
    } else {
        let e = z.exp();
        e / (1. + e)
    }
}

#[inline]
fn softplus(x: f64) -> f64 {
    x.max(0.) + (-x.abs()).exp().ln_1p()
}

#[inline]
fn log_sigmoid(z: f64) -> f64 {
    -softplus(-z)
}

impl Transform {
    /// The interval transform with `lower < upper`, or `None` for a degenerate interval.
    pub fn interval(lower: f64, upper: f64) -> Option<Transform> {
        if lower < upper && lower.is_finite() && upper.is_finite() {
            Some(Transform::Interval(lower, upper))
        } else {
            None
        }
    }

    /// Map unconstrained -> constrained.
    pub fn forward(&self, z: f64) -> f64 {
        match *self {
            Transform::Identity => z,
            Transform::Exp => z.exp(),
            Transform::LowerBound(lower) => lower + z.exp(),
            Transform::UpperBound(upper) => upper - z.exp(),
            Transform::Interval(lower, upper) => lower + (upper - lower) * sigmoid(z),
        }
    }

    /// Map constrained -> unconstrained.
    ///
    /// Values outside the support map to a non-finite number.
    pub fn inverse(&self, theta: f64) -> f64 {
        match *self {
            Transform::Identity => theta,
            Transform::Exp => theta.ln(),
            Transform::LowerBound(lower) => (theta - lower).ln(),
            Transform::UpperBound(upper) => (upper - theta).ln(),
            Transform::Interval(lower, upper) => {
                let u = (theta - lower) / (upper - lower);
                u.ln() - (-u).ln_1p()
            }
        }
    }

    /// `dtheta/dz`
    pub fn jacobian(&self, z: f64) -> f64 {
        match *self {
            Transform::Identity => 1.,
            Transform::Exp | Transform::LowerBound(_) => z.exp(),
            Transform::UpperBound(_) => -z.exp(),
            Transform::Interval(lower, upper) => {
                let s = sigmoid(z);
                (upper - lower) * s * (1. - s)
            }
        }
    }

    /// `log|dtheta/dz|`
    pub fn log_abs_det_jacobian(&self, z: f64) -> f64 {
        match *self {
            Transform::Identity => 0.,
            Transform::Exp | Transform::LowerBound(_) | Transform::UpperBound(_) => z,
            Transform::Interval(lower, upper) => {
                (upper - lower).ln() + log_sigmoid(z) + log_sigmoid(-z)
            }
        }
    }

    /// `d/dz log|dtheta/dz|`
    pub fn grad_log_abs_det_jacobian(&self, z: f64) -> f64 {
        match *self {
            Transform::Identity => 0.,
            Transform::Exp | Transform::LowerBound(_) | Transform::UpperBound(_) => 1.,
            Transform::Interval(..) => 1. - 2. * sigmoid(z),
        }
    }

    /// Whether `theta` lies strictly inside the support.
    pub fn contains(&self, theta: f64) -> bool {
        match *self {
            Transform::Identity => theta.is_finite(),
            Transform::Exp => theta > 0. && theta.is_finite(),
            Transform::LowerBound(lower) => theta > lower && theta.is_finite(),
            Transform::UpperBound(upper) => theta < upper && theta.is_finite(),
            Transform::Interval(lower, upper) => theta > lower && theta < upper,
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Transform::Identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn transforms() -> [Transform; 5] {
        [
            Transform::Identity,
            Transform::Exp,
            Transform::LowerBound(-3.),
            Transform::UpperBound(2.5),
            Transform::Interval(-1., 4.),
        ]
    }

    proptest! {
        #[test]
        fn inverse_undoes_forward(z in -8f64..8f64) {
            for transform in transforms() {
                let theta = transform.forward(z);
                prop_assert!(transform.contains(theta));
                prop_assert!((transform.inverse(theta) - z).abs() < 1e-6);
            }
        }

        #[test]
        fn jacobian_matches_finite_difference(z in -5f64..5f64) {
            let h = 1e-6;
            for transform in transforms() {
                let numeric = (transform.forward(z + h) - transform.forward(z - h)) / (2. * h);
                let analytic = transform.jacobian(z);
                prop_assert!((numeric - analytic).abs() < 1e-5 * (1. + analytic.abs()));

                let log_jac = transform.log_abs_det_jacobian(z);
                prop_assert!((log_jac - analytic.abs().ln()).abs() < 1e-8);

                let numeric = (transform.log_abs_det_jacobian(z + h)
                    - transform.log_abs_det_jacobian(z - h))
                    / (2. * h);
                prop_assert!((numeric - transform.grad_log_abs_det_jacobian(z)).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn interval_support() {
        let transform = Transform::interval(0., 1.).expect("valid interval");
        assert_relative_eq!(transform.forward(0.), 0.5);
        assert!(transform.contains(0.999));
        assert!(!transform.contains(1.));
        assert!(!transform.inverse(1.5).is_finite());
        assert!(Transform::interval(1., 1.).is_none());
    }

    #[test]
    fn interval_log_jacobian_in_tails() {
        let transform = Transform::Interval(0., 1.);
        let value = transform.log_abs_det_jacobian(-800.);
        assert!(value.is_finite());
        assert_relative_eq!(value, -800., max_relative = 1e-12);
    }
}
