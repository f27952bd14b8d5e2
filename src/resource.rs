//! Named resource quantities and time-sampled usage curves.
//!
//! A [`Resource`] maps a name ("cpu", "mem", ...) to a scalar or a
//! fixed-length vector (e.g. per-core load). Arithmetic is element-wise and
//! broadcasts a scalar operand against every slot of a vector operand.
//!
//! A [`Usage`] is a piecewise-linear draw over time: a map from tick
//! (milliseconds relative to an anchor, typically a task's `created`) to the
//! [`Resource`] drawn at that instant. Values between samples are linearly
//! interpolated; outside the sampled range the draw is undefined and callers
//! treat it as zero.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// A scalar or fixed-length vector quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Quantity {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl Quantity {
    fn zip(a: &Quantity, b: &Quantity, f: impl Fn(f64, f64) -> f64) -> Quantity {
        match (a, b) {
            (Quantity::Scalar(a), Quantity::Scalar(b)) => Quantity::Scalar(f(*a, *b)),
            (Quantity::Vector(a), Quantity::Scalar(b)) => {
                Quantity::Vector(a.iter().map(|x| f(*x, *b)).collect())
            }
            (Quantity::Scalar(a), Quantity::Vector(b)) => {
                Quantity::Vector(b.iter().map(|y| f(*a, *y)).collect())
            }
            (Quantity::Vector(a), Quantity::Vector(b)) => {
                let len = a.len().max(b.len());
                Quantity::Vector(
                    (0..len)
                        .map(|i| {
                            f(
                                a.get(i).copied().unwrap_or(0.0),
                                b.get(i).copied().unwrap_or(0.0),
                            )
                        })
                        .collect(),
                )
            }
        }
    }

    fn scale(&self, k: f64) -> Quantity {
        match self {
            Quantity::Scalar(v) => Quantity::Scalar(v * k),
            Quantity::Vector(v) => Quantity::Vector(v.iter().map(|x| x * k).collect()),
        }
    }

    fn non_negative(&self) -> bool {
        match self {
            Quantity::Scalar(v) => *v >= 0.0,
            Quantity::Vector(v) => v.iter().all(|x| *x >= 0.0),
        }
    }
}

/// A set of named quantities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource {
    parts: BTreeMap<String, Quantity>,
}

impl Resource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, quantity: Quantity) -> Self {
        self.parts.insert(name.to_string(), quantity);
        self
    }

    pub fn scalar(name: &str, value: f64) -> Self {
        Self::new().with(name, Quantity::Scalar(value))
    }

    pub fn get(&self, name: &str) -> Option<&Quantity> {
        self.parts.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    fn zip(&self, other: &Resource, f: impl Fn(f64, f64) -> f64 + Copy) -> Resource {
        let zero = Quantity::Scalar(0.0);
        let names: BTreeSet<&String> = self.parts.keys().chain(other.parts.keys()).collect();
        let parts = names
            .into_iter()
            .map(|name| {
                let a = self.parts.get(name).unwrap_or(&zero);
                let b = other.parts.get(name).unwrap_or(&zero);
                (name.clone(), Quantity::zip(a, b, f))
            })
            .collect();
        Resource { parts }
    }

    pub fn add(&self, other: &Resource) -> Resource {
        self.zip(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &Resource) -> Resource {
        self.zip(other, |a, b| a - b)
    }

    pub fn mul(&self, k: f64) -> Resource {
        let parts = self
            .parts
            .iter()
            .map(|(name, q)| (name.clone(), q.scale(k)))
            .collect();
        Resource { parts }
    }

    /// True iff every component, scalar or vector element, is >= 0.
    pub fn valid(&self) -> bool {
        self.parts.values().all(Quantity::non_negative)
    }
}

/// A piecewise-linear resource draw: tick (ms) -> draw at that instant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Usage {
    samples: BTreeMap<i64, Resource>,
}

impl Usage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tick: i64, res: Resource) -> Self {
        self.samples.insert(tick, res);
        self
    }

    pub fn insert(&mut self, tick: i64, res: Resource) {
        self.samples.insert(tick, res);
    }

    pub fn remove(&mut self, tick: i64) -> Option<Resource> {
        self.samples.remove(&tick)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn ticks(&self) -> impl Iterator<Item = i64> + '_ {
        self.samples.keys().copied()
    }

    pub fn samples(&self) -> impl Iterator<Item = (i64, &Resource)> {
        self.samples.iter().map(|(t, r)| (*t, r))
    }

    /// Draw at `time`: the stored sample if one exists, otherwise the linear
    /// interpolation between the bracketing samples with weight
    /// `k = (time - t0) / (t1 - t0)` applied to the right sample
    /// (`r0*(1-k) + r1*k`). `None` outside the sampled range; callers treat
    /// that as zero.
    pub fn at(&self, time: i64) -> Option<Resource> {
        if let Some(exact) = self.samples.get(&time) {
            return Some(exact.clone());
        }
        let (t0, r0) = self.samples.range(..time).next_back()?;
        let (t1, r1) = self.samples.range(time..).next()?;
        let k = (time - t0) as f64 / (t1 - t0) as f64;
        Some(r0.mul(1.0 - k).add(&r1.mul(k)))
    }

    /// Shift every tick by `delta` (e.g. task-relative -> wall-clock ticks).
    pub fn offset(&self, delta: i64) -> Usage {
        Usage {
            samples: self
                .samples
                .iter()
                .map(|(t, r)| (t + delta, r.clone()))
                .collect(),
        }
    }

    /// Union-of-ticks sum: the result samples at every operand tick, and each
    /// sample is the sum of every operand's interpolated draw there.
    pub fn merge<'a>(parts: impl IntoIterator<Item = &'a Usage>) -> Usage {
        let parts: Vec<&Usage> = parts.into_iter().collect();
        let ticks: BTreeSet<i64> = parts.iter().flat_map(|u| u.ticks()).collect();
        let samples = ticks
            .into_iter()
            .map(|tick| {
                let sum = parts
                    .iter()
                    .filter_map(|u| u.at(tick))
                    .fold(Resource::new(), |acc, r| acc.add(&r));
                (tick, sum)
            })
            .collect();
        Usage { samples }
    }

    /// True iff `capacity - sample` is valid at every one of this usage's own
    /// sample points.
    pub fn below(&self, capacity: &Resource) -> bool {
        self.samples.values().all(|s| capacity.sub(s).valid())
    }
}
