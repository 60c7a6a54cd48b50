//! Time offsets: the affine (scale, offset) transforms that map a layer's
//! local timeline into its owning stack's timeline.

use std::fmt;
use std::ops::Mul;

/// Fallback time-codes-per-second rate used when neither a TCPS nor an FPS
/// opinion is authored on a layer.
pub const FALLBACK_TIME_CODES_PER_SECOND: f64 = 24.0;

/// An affine time transform `t -> t * scale + offset`.
#[derive(Debug, Clone, Copy)]
pub struct TimeOffset {
    /// Multiplicative part of the transform.
    pub scale: f64,
    /// Additive part of the transform.
    pub offset: f64,
}

impl Default for TimeOffset {
    fn default() -> Self {
        TimeOffset { scale: 1.0, offset: 0.0 }
    }
}

impl TimeOffset {
    /// Creates a transform from an offset and scale.
    pub fn new(offset: f64, scale: f64) -> Self {
        TimeOffset { scale, offset }
    }

    /// The identity transform.
    pub fn identity() -> Self {
        TimeOffset::default()
    }

    /// True if both parts are finite and the transform is invertible.
    pub fn is_valid(&self) -> bool {
        self.scale.is_finite() && self.offset.is_finite() && self.scale != 0.0
    }

    /// True for the exact identity transform.
    pub fn is_identity(&self) -> bool {
        self.scale == 1.0 && self.offset == 0.0
    }

    /// The inverse transform. The transform must be valid.
    pub fn inverse(&self) -> TimeOffset {
        TimeOffset {
            scale: 1.0 / self.scale,
            offset: -self.offset / self.scale,
        }
    }

    /// Applies the transform to a time value.
    pub fn apply(&self, time: f64) -> f64 {
        time * self.scale + self.offset
    }
}

/// Composition: `(a * b).apply(t) == a.apply(b.apply(t))`.
impl Mul for TimeOffset {
    type Output = TimeOffset;

    fn mul(self, rhs: TimeOffset) -> TimeOffset {
        TimeOffset {
            scale: self.scale * rhs.scale,
            offset: rhs.offset * self.scale + self.offset,
        }
    }
}

impl PartialEq for TimeOffset {
    fn eq(&self, other: &Self) -> bool {
        self.scale.to_bits() == other.scale.to_bits()
            && self.offset.to_bits() == other.offset.to_bits()
    }
}

impl Eq for TimeOffset {}

impl std::hash::Hash for TimeOffset {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.scale.to_bits().hash(state);
        self.offset.to_bits().hash(state);
    }
}

impl fmt::Display for TimeOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(offset={}, scale={})", self.offset, self.scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose() {
        let a = TimeOffset::new(10.0, 2.0);
        let b = TimeOffset::new(1.0, 3.0);
        let ab = a * b;
        assert_eq!(ab.apply(5.0), a.apply(b.apply(5.0)));
    }

    #[test]
    fn test_inverse() {
        let a = TimeOffset::new(7.0, 0.5);
        let inv = a.inverse();
        assert!((inv.apply(a.apply(3.0)) - 3.0).abs() < 1e-12);
        assert!((a * inv).is_identity() || ((a * inv).apply(1.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_validity() {
        assert!(!TimeOffset::new(0.0, 0.0).is_valid());
        assert!(!TimeOffset::new(f64::NAN, 1.0).is_valid());
        assert!(TimeOffset::identity().is_valid());
    }
}
