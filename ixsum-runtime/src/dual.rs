//! Dual numbers for the `grad = dual` strategy.
//!
//! A generated pullback re-evaluates the right-hand side with the target
//! array access perturbed and every other leaf held constant; the epsilon
//! slot of the result is the partial derivative with respect to that access.

use num_traits::Float;
use std::ops::{Add, Div, Mul, Neg, Sub};

/// `re + eps * ε` with `ε² = 0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dual<T> {
    pub re: T,
    pub eps: T,
}

impl<T: Float> Dual<T> {
    /// Lift a value with no derivative.
    pub fn constant(re: T) -> Self {
        Dual {
            re,
            eps: T::zero(),
        }
    }

    /// Lift the differentiation target: unit perturbation.
    pub fn perturbed(re: T) -> Self {
        Dual { re, eps: T::one() }
    }

    pub fn exp(self) -> Self {
        let e = self.re.exp();
        Dual {
            re: e,
            eps: self.eps * e,
        }
    }

    pub fn ln(self) -> Self {
        Dual {
            re: self.re.ln(),
            eps: self.eps / self.re,
        }
    }

    pub fn sin(self) -> Self {
        Dual {
            re: self.re.sin(),
            eps: self.eps * self.re.cos(),
        }
    }

    pub fn cos(self) -> Self {
        Dual {
            re: self.re.cos(),
            eps: -self.eps * self.re.sin(),
        }
    }

    pub fn sqrt(self) -> Self {
        let s = self.re.sqrt();
        Dual {
            re: s,
            eps: self.eps / ((s + s).max(T::min_positive_value())),
        }
    }

    pub fn tanh(self) -> Self {
        let t = self.re.tanh();
        Dual {
            re: t,
            eps: self.eps * (T::one() - t * t),
        }
    }

    pub fn powi(self, n: i32) -> Self {
        let lower = self.re.powi(n - 1);
        Dual {
            re: lower * self.re,
            eps: self.eps * T::from(n).unwrap() * lower,
        }
    }

    pub fn powf(self, e: Self) -> Self {
        // f = a^b, f' = f * (b' ln a + b a' / a)
        let f = self.re.powf(e.re);
        Dual {
            re: f,
            eps: f * (e.eps * self.re.ln() + e.re * self.eps / self.re),
        }
    }
}

impl<T: Float> Add for Dual<T> {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Dual {
            re: self.re + rhs.re,
            eps: self.eps + rhs.eps,
        }
    }
}

impl<T: Float> Sub for Dual<T> {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Dual {
            re: self.re - rhs.re,
            eps: self.eps - rhs.eps,
        }
    }
}

impl<T: Float> Mul for Dual<T> {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Dual {
            re: self.re * rhs.re,
            eps: self.eps * rhs.re + self.re * rhs.eps,
        }
    }
}

impl<T: Float> Div for Dual<T> {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        Dual {
            re: self.re / rhs.re,
            eps: (self.eps * rhs.re - self.re * rhs.eps) / (rhs.re * rhs.re),
        }
    }
}

impl<T: Float> Neg for Dual<T> {
    type Output = Self;
    fn neg(self) -> Self {
        Dual {
            re: -self.re,
            eps: -self.eps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-12, "{a} vs {b}");
    }

    #[test]
    fn product_rule() {
        // d/dx (x * c) = c at x = 3, c = 5
        let d = Dual::perturbed(3.0) * Dual::constant(5.0);
        close(d.re, 15.0);
        close(d.eps, 5.0);
    }

    #[test]
    fn quotient_rule() {
        // d/dx (c / x) = -c / x^2 at x = 2, c = 1
        let d = Dual::constant(1.0) / Dual::perturbed(2.0);
        close(d.eps, -0.25);
    }

    #[test]
    fn chain_rule() {
        // d/dx exp(2x) = 2 exp(2x) at x = 0.5
        let x = Dual::perturbed(0.5);
        let d = (Dual::constant(2.0) * x).exp();
        close(d.eps, 2.0 * 1.0f64.exp());
    }

    #[test]
    fn powers() {
        let d = Dual::perturbed(3.0f64).powi(3);
        close(d.re, 27.0);
        close(d.eps, 27.0); // 3 * 3^2
        let d = Dual::perturbed(4.0f64).powf(Dual::constant(0.5));
        close(d.re, 2.0);
        close(d.eps, 0.25); // 1 / (2 sqrt 4)
    }
}
