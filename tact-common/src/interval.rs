use crate::Time;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum IntervalError {
    #[error("invalid interval bounds [{lo}, {hi}]")]
    InvalidBounds { lo: Time, hi: Time },
    #[error("empty interval union")]
    Empty,
    #[error("constraints are disjoint: gap of width {gap} inside [{lo}, {hi}]")]
    DisjointConstraints { gap: Time, lo: Time, hi: Time },
}

/// A closed interval of times, `lo <= hi`. Zero-width intervals are allowed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interval {
    pub lo: Time,
    pub hi: Time,
}

impl Interval {
    pub fn new(lo: Time, hi: Time) -> Result<Self, IntervalError> {
        if lo.is_finite() && hi.is_finite() && lo <= hi {
            Ok(Self { lo, hi })
        } else {
            Err(IntervalError::InvalidBounds { lo, hi })
        }
    }

    pub fn width(&self) -> Time {
        self.hi - self.lo
    }

    pub fn contains(&self, t: Time) -> bool {
        self.lo <= t && t <= self.hi
    }

    pub fn intersect(&self, other: &Interval) -> Option<Interval> {
        let lo = self.lo.max(other.lo);
        let hi = self.hi.min(other.hi);
        if lo <= hi {
            Some(Interval { lo, hi })
        } else {
            None
        }
    }
}

/// A union of disjoint closed intervals, kept sorted by lower bound.
/// Inserted intervals that overlap or touch are merged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntervalUnion {
    parts: Vec<Interval>,
}

impl IntervalUnion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_interval(iv: Interval) -> Self {
        Self { parts: vec![iv] }
    }

    pub fn parts(&self) -> &[Interval] {
        &self.parts
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn min(&self) -> Option<Time> {
        self.parts.first().map(|iv| iv.lo)
    }

    pub fn max(&self) -> Option<Time> {
        self.parts.last().map(|iv| iv.hi)
    }

    pub fn contains(&self, t: Time) -> bool {
        self.parts.iter().any(|iv| iv.contains(t))
    }

    /// Insert one interval, merging with any parts it overlaps or touches.
    pub fn insert(&mut self, iv: Interval) {
        let mut merged = iv;
        let mut out = Vec::with_capacity(self.parts.len() + 1);
        let mut placed = false;
        for part in self.parts.drain(..) {
            if part.hi < merged.lo {
                out.push(part);
            } else if part.lo > merged.hi {
                if !placed {
                    out.push(merged);
                    placed = true;
                }
                out.push(part);
            } else {
                merged = Interval {
                    lo: merged.lo.min(part.lo),
                    hi: merged.hi.max(part.hi),
                };
            }
        }
        if !placed {
            out.push(merged);
        }
        let sorted = out.windows(2).all(|w| w[0].hi < w[1].lo);
        assert!(sorted);
        self.parts = out;
    }

    /// Restrict the union to `window`.
    pub fn intersect(&self, window: &Interval) -> IntervalUnion {
        let parts = self
            .parts
            .iter()
            .filter_map(|iv| iv.intersect(window))
            .collect();
        IntervalUnion { parts }
    }

    /// The parts of `bound` not covered by this union.
    pub fn complement(&self, bound: &Interval) -> IntervalUnion {
        let mut out = IntervalUnion::new();
        let mut cursor = bound.lo;
        for iv in &self.parts {
            if iv.lo > bound.hi {
                break;
            }
            if iv.lo > cursor {
                out.insert(Interval {
                    lo: cursor,
                    hi: iv.lo.min(bound.hi),
                });
            }
            cursor = cursor.max(iv.hi);
        }
        if cursor < bound.hi {
            out.insert(Interval {
                lo: cursor,
                hi: bound.hi,
            });
        }
        out
    }

    /// Convex hull of the union, ignoring any internal gaps.
    pub fn hull(&self) -> Option<Interval> {
        match (self.min(), self.max()) {
            (Some(lo), Some(hi)) => Some(Interval { lo, hi }),
            _ => None,
        }
    }

    /// Reduce the union to its hull `[min, max]` provided no internal gap is
    /// at least `min_gap` wide. A wide gap means the constraints that built
    /// this union cannot be satisfied by a single time on the hull.
    pub fn atomic_hull(&self, min_gap: Time) -> Result<Interval, IntervalError> {
        let hull = self.hull().ok_or(IntervalError::Empty)?;
        let mut widest: Time = 0.0;
        for w in self.parts.windows(2) {
            widest = widest.max(w[1].lo - w[0].hi);
        }
        if widest >= min_gap {
            return Err(IntervalError::DisjointConstraints {
                gap: widest,
                lo: hull.lo,
                hi: hull.hi,
            });
        }
        Ok(hull)
    }
}


#[cfg(test)]
mod properties {
    use super::*;
    use proptest::prelude::*;

    fn unions() -> impl Strategy<Value = IntervalUnion> {
        proptest::collection::vec((0.0f64..100.0, 0.0f64..10.0), 1..8).prop_map(|pairs| {
            let mut u = IntervalUnion::new();
            for (lo, w) in pairs {
                u.insert(Interval::new(lo, lo + w).unwrap());
            }
            u
        })
    }

    proptest! {
        #[test]
        fn atomic_hull_is_hull_or_gap_exists(u in unions(), min_gap in 1e-3f64..10.0) {
            let widest = u
                .parts()
                .windows(2)
                .map(|w| w[1].lo - w[0].hi)
                .fold(0.0f64, f64::max);
            match u.atomic_hull(min_gap) {
                Ok(hull) => {
                    prop_assert!(widest < min_gap);
                    prop_assert_eq!(hull.lo, u.min().unwrap());
                    prop_assert_eq!(hull.hi, u.max().unwrap());
                }
                Err(IntervalError::DisjointConstraints { gap, .. }) => {
                    prop_assert!(gap >= min_gap);
                    prop_assert_eq!(gap, widest);
                }
                Err(e) => prop_assert!(false, "unexpected error {:?}", e),
            }
        }

        #[test]
        fn complement_partitions_bound(u in unions()) {
            let bound = Interval::new(-1.0, 120.0).unwrap();
            let c = u.complement(&bound);
            for iv in u.parts() {
                let mid = 0.5 * (iv.lo + iv.hi);
                prop_assert!(!c.contains(mid) || iv.width() == 0.0);
            }
            for iv in c.parts() {
                if iv.width() > 0.0 {
                    let mid = 0.5 * (iv.lo + iv.hi);
                    prop_assert!(!u.contains(mid));
                }
            }
        }
    }
}
