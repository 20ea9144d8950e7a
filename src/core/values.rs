//! Variable estimates keyed by [`Key`].
//!
//! [`Values`] stores heterogeneous manifold elements behind the [`Value`] tagged union and
//! offers typed access through [`VariableValue`]. Retraction never mutates in place: every
//! `retract*` call returns a new container so that a rejected optimizer step leaves the
//! current estimate untouched.
//!
//! # Example
//!
//! ```
//! use sextant::core::values::{Values, VectorValues};
//! use sextant::manifold::se2::SE2;
//! use nalgebra::DVector;
//! # use sextant::error::SextantResult;
//! # fn example() -> SextantResult<()> {
//! let mut values = Values::new();
//! values.insert(1, SE2::from_xy_angle(1.0, 0.0, 0.0))?;
//!
//! let mut delta = VectorValues::new();
//! delta.insert(1, DVector::from_vec(vec![0.5, 0.0, 0.0]));
//! let moved = values.retract(&delta)?;
//! assert!((moved.get::<SE2>(1)?.x() - 1.5).abs() < 1e-12);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use std::collections::BTreeMap;
use std::{
    fmt,
    fmt::{Display, Formatter},
};

use faer::MatRef;
use nalgebra::DVector;

use crate::core::{
    CoreError, CoreResult,
    key::{Key, format_key},
    ordering::Ordering,
};
use crate::manifold::{
    LieGroup, ManifoldError, ManifoldType, Tangent, rn::Rn, se2::SE2, so2::SO2,
};

/// A single variable estimate.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Pose2(SE2),
    Rot2(SO2),
    Vector(Rn),
}

impl Value {
    pub fn manifold_type(&self) -> ManifoldType {
        match self {
            Value::Pose2(_) => ManifoldType::SE2,
            Value::Rot2(_) => ManifoldType::SO2,
            Value::Vector(_) => ManifoldType::RN,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Pose2(_) => SE2::TYPE_NAME,
            Value::Rot2(_) => SO2::TYPE_NAME,
            Value::Vector(_) => Rn::TYPE_NAME,
        }
    }

    /// Tangent space dimension.
    pub fn dim(&self) -> usize {
        match self {
            Value::Pose2(v) => v.tangent_dim(),
            Value::Rot2(v) => v.tangent_dim(),
            Value::Vector(v) => v.tangent_dim(),
        }
    }

    /// `self ⊞ delta`.
    pub fn retract(&self, delta: &[f64]) -> Result<Value, ManifoldError> {
        Ok(match self {
            Value::Pose2(v) => Value::Pose2(retract_group(v, delta)?),
            Value::Rot2(v) => Value::Rot2(retract_group(v, delta)?),
            Value::Vector(v) => Value::Vector(retract_group(v, delta)?),
        })
    }

    /// `Log(self⁻¹ ∘ other)`, or `None` when the two values live on different manifolds.
    pub fn local_coordinates(&self, other: &Value) -> Option<DVector<f64>> {
        match (self, other) {
            (Value::Pose2(a), Value::Pose2(b)) => Some(a.local_coordinates(b)),
            (Value::Rot2(a), Value::Rot2(b)) => Some(a.local_coordinates(b)),
            (Value::Vector(a), Value::Vector(b)) if a.dim() == b.dim() => {
                Some(a.local_coordinates(b))
            }
            _ => None,
        }
    }
}

fn retract_group<G: LieGroup>(value: &G, delta: &[f64]) -> Result<G, ManifoldError> {
    let tangent = G::TangentVector::from_slice_like(value, delta)?;
    Ok(value.plus(&tangent, None, None))
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Pose2(v) => write!(f, "{v}"),
            Value::Rot2(v) => write!(f, "{v}"),
            Value::Vector(v) => write!(f, "{v}"),
        }
    }
}

/// A manifold type that can be stored in [`Values`].
pub trait VariableValue: LieGroup + Display {
    /// Name used in diagnostics, e.g. `"Pose2"`.
    const TYPE_NAME: &'static str;

    fn into_value(self) -> Value;

    fn from_value(value: &Value) -> Option<&Self>;
}

impl VariableValue for SE2 {
    const TYPE_NAME: &'static str = "Pose2";

    fn into_value(self) -> Value {
        Value::Pose2(self)
    }

    fn from_value(value: &Value) -> Option<&Self> {
        match value {
            Value::Pose2(v) => Some(v),
            _ => None,
        }
    }
}

impl VariableValue for SO2 {
    const TYPE_NAME: &'static str = "Rot2";

    fn into_value(self) -> Value {
        Value::Rot2(self)
    }

    fn from_value(value: &Value) -> Option<&Self> {
        match value {
            Value::Rot2(v) => Some(v),
            _ => None,
        }
    }
}

impl VariableValue for Rn {
    const TYPE_NAME: &'static str = "Vector";

    fn into_value(self) -> Value {
        Value::Vector(self)
    }

    fn from_value(value: &Value) -> Option<&Self> {
        match value {
            Value::Vector(v) => Some(v),
            _ => None,
        }
    }
}

impl From<SE2> for Value {
    fn from(v: SE2) -> Self {
        Value::Pose2(v)
    }
}

impl From<SO2> for Value {
    fn from(v: SO2) -> Self {
        Value::Rot2(v)
    }
}

impl From<Rn> for Value {
    fn from(v: Rn) -> Self {
        Value::Vector(v)
    }
}

/// Ordered map from key to variable estimate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Values {
    values: BTreeMap<Key, Value>,
}

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a new variable. Fails with `DuplicateKey` if `key` already has a value.
    pub fn insert(&mut self, key: Key, value: impl Into<Value>) -> CoreResult<()> {
        if self.values.contains_key(&key) {
            return Err(CoreError::DuplicateKey { key }.log());
        }
        self.values.insert(key, value.into());
        Ok(())
    }

    /// Replaces an existing value of the same type.
    pub fn update(&mut self, key: Key, value: impl Into<Value>) -> CoreResult<()> {
        let value = value.into();
        let slot = self
            .values
            .get_mut(&key)
            .ok_or_else(|| CoreError::KeyNotFound { key }.log())?;
        if slot.manifold_type() != value.manifold_type() {
            return Err(CoreError::TypeMismatch {
                key,
                expected: slot.type_name(),
                actual: value.type_name(),
            }
            .log());
        }
        *slot = value;
        Ok(())
    }

    /// Inserts or overwrites, regardless of the previous type.
    pub fn insert_or_assign(&mut self, key: Key, value: impl Into<Value>) {
        self.values.insert(key, value.into());
    }

    pub fn erase(&mut self, key: Key) -> CoreResult<Value> {
        self.values
            .remove(&key)
            .ok_or_else(|| CoreError::KeyNotFound { key }.log())
    }

    pub fn at(&self, key: Key) -> CoreResult<&Value> {
        self.values
            .get(&key)
            .ok_or_else(|| CoreError::KeyNotFound { key }.log())
    }

    /// Typed access; fails with `TypeMismatch` when the stored variant differs from `T`.
    pub fn get<T: VariableValue>(&self, key: Key) -> CoreResult<&T> {
        let value = self.at(key)?;
        T::from_value(value).ok_or_else(|| {
            CoreError::TypeMismatch {
                key,
                expected: T::TYPE_NAME,
                actual: value.type_name(),
            }
            .log()
        })
    }

    pub fn exists(&self, key: Key) -> bool {
        self.values.contains_key(&key)
    }

    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.values.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Key, &Value)> {
        self.values.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Sum of tangent dimensions of all variables.
    pub fn dim(&self) -> usize {
        self.values.values().map(Value::dim).sum()
    }

    /// Per-key `x ⊞ δ`. Keys without an increment are copied unchanged.
    pub fn retract(&self, delta: &VectorValues) -> CoreResult<Values> {
        let mut result = self.clone();
        for (key, increment) in delta.iter() {
            let current = self.at(key)?;
            let updated = retract_value(key, current, increment.as_slice())?;
            result.values.insert(key, updated);
        }
        Ok(result)
    }

    /// Retracts along a flat step vector laid out by `ordering`.
    pub fn retract_ordered(&self, step: MatRef<'_, f64>, ordering: &Ordering) -> CoreResult<Values> {
        if step.nrows() != ordering.total_dim() {
            return Err(CoreError::dimension_mismatch(
                "retract step",
                ordering.total_dim(),
                step.nrows(),
            )
            .log());
        }

        let mut result = self.clone();
        for (key, offset, dim) in ordering.iter() {
            let current = self.at(key)?;
            let increment: Vec<f64> = (0..dim).map(|i| step[(offset + i, 0)]).collect();
            let updated = retract_value(key, current, &increment)?;
            result.values.insert(key, updated);
        }
        Ok(result)
    }

    /// Per-key `Log(self⁻¹ ∘ other)`. Both containers must hold the same keys and types.
    pub fn local_coordinates(&self, other: &Values) -> CoreResult<VectorValues> {
        if let Some(extra) = other.keys().find(|k| !self.exists(*k)) {
            return Err(CoreError::KeyNotFound { key: extra }.log());
        }

        let mut result = VectorValues::new();
        for (key, value) in self.iter() {
            let target = other.at(key)?;
            let local = value.local_coordinates(target).ok_or_else(|| {
                let error = if value.manifold_type() == target.manifold_type() {
                    CoreError::dimension_mismatch(
                        format!("local coordinates of {}", format_key(key)),
                        value.dim(),
                        target.dim(),
                    )
                } else {
                    CoreError::TypeMismatch {
                        key,
                        expected: value.type_name(),
                        actual: target.type_name(),
                    }
                };
                error.log()
            })?;
            result.insert(key, local);
        }
        Ok(result)
    }
}

fn retract_value(key: Key, value: &Value, increment: &[f64]) -> CoreResult<Value> {
    value.retract(increment).map_err(|e| {
        let error = match &e {
            ManifoldError::InvalidTangentDimension { expected, actual } => {
                CoreError::dimension_mismatch(
                    format!("retract {}", format_key(key)),
                    *expected,
                    *actual,
                )
            }
            ManifoldError::InvalidNumber | ManifoldError::InvalidElement(_) => {
                CoreError::NonFiniteValue { key }
            }
        };
        error.log_with_source(e)
    })
}

impl Display for Values {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Values with {} variables:", self.len())?;
        for (key, value) in self.iter() {
            writeln!(f, "  {}: {}", format_key(key), value)?;
        }
        Ok(())
    }
}

/// Ordered map from key to tangent-space increment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorValues {
    values: BTreeMap<Key, DVector<f64>>,
}

impl VectorValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the increment for `key`, returning the previous one.
    pub fn insert(&mut self, key: Key, delta: DVector<f64>) -> Option<DVector<f64>> {
        self.values.insert(key, delta)
    }

    pub fn get(&self, key: Key) -> Option<&DVector<f64>> {
        self.values.get(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Key, &DVector<f64>)> {
        self.values.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean norm of all increments stacked together.
    pub fn norm(&self) -> f64 {
        self.values
            .values()
            .map(|v| v.norm_squared())
            .sum::<f64>()
            .sqrt()
    }
}

impl FromIterator<(Key, DVector<f64>)> for VectorValues {
    fn from_iter<I: IntoIterator<Item = (Key, DVector<f64>)>>(iter: I) -> Self {
        VectorValues {
            values: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::key::symbol;
    use faer::Mat;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    const TOLERANCE: f64 = 1e-12;

    fn create_test_values() -> CoreResult<Values> {
        let mut values = Values::new();
        values.insert(1, SE2::from_xy_angle(0.5, 0.0, 0.2))?;
        values.insert(2, SO2::from_angle(0.3))?;
        values.insert(3, Rn::from_slice(&[1.0, 2.0]))?;
        Ok(values)
    }

    #[test]
    fn test_insert_rejects_duplicate_key() -> TestResult {
        let mut values = create_test_values()?;
        let err = values.insert(1, SE2::identity());
        assert_eq!(err, Err(CoreError::DuplicateKey { key: 1 }));
        assert_eq!(values.len(), 3);
        Ok(())
    }

    #[test]
    fn test_at_and_typed_get() -> TestResult {
        let values = create_test_values()?;
        assert_eq!(values.at(1)?.type_name(), "Pose2");
        assert!((values.get::<SO2>(2)?.angle() - 0.3).abs() < TOLERANCE);

        assert_eq!(
            values.at(9).map(|_| ()),
            Err(CoreError::KeyNotFound { key: 9 })
        );
        assert_eq!(
            values.get::<SE2>(3).map(|_| ()),
            Err(CoreError::TypeMismatch {
                key: 3,
                expected: "Pose2",
                actual: "Vector"
            })
        );
        Ok(())
    }

    #[test]
    fn test_update_and_erase() -> TestResult {
        let mut values = create_test_values()?;
        values.update(2, SO2::from_angle(1.0))?;
        assert!((values.get::<SO2>(2)?.angle() - 1.0).abs() < TOLERANCE);

        assert!(matches!(
            values.update(2, SE2::identity()),
            Err(CoreError::TypeMismatch { key: 2, .. })
        ));
        assert!(matches!(
            values.update(5, SE2::identity()),
            Err(CoreError::KeyNotFound { key: 5 })
        ));

        values.insert_or_assign(2, SE2::identity());
        assert!(values.get::<SE2>(2).is_ok());

        values.erase(3)?;
        assert!(!values.exists(3));
        assert_eq!(values.dim(), 6);
        Ok(())
    }

    #[test]
    fn test_retract_composes_on_the_manifold() -> TestResult {
        let mut values = Values::new();
        values.insert(1, SE2::from_xy_angle(1.0, 0.0, std::f64::consts::FRAC_PI_2))?;

        let delta: VectorValues = [(1, DVector::from_vec(vec![1.0, 0.0, 0.0]))]
            .into_iter()
            .collect();
        let moved = values.retract(&delta)?;
        let pose = moved.get::<SE2>(1)?;

        // Forward motion along the rotated x axis, not vector addition.
        assert!((pose.x() - 1.0).abs() < 1e-9);
        assert!((pose.y() - 1.0).abs() < 1e-9);
        // The original container is untouched.
        assert!((values.get::<SE2>(1)?.y()).abs() < TOLERANCE);
        Ok(())
    }

    #[test]
    fn test_retract_errors() -> TestResult {
        let values = create_test_values()?;

        let missing: VectorValues = [(7, DVector::zeros(3))].into_iter().collect();
        assert_eq!(
            values.retract(&missing),
            Err(CoreError::KeyNotFound { key: 7 })
        );

        let wrong_len: VectorValues = [(1, DVector::zeros(2))].into_iter().collect();
        assert!(matches!(
            values.retract(&wrong_len),
            Err(CoreError::DimensionMismatch {
                expected: 3,
                actual: 2,
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn test_local_coordinates_inverts_retract() -> TestResult {
        let values = create_test_values()?;
        let delta: VectorValues = [
            (1, DVector::from_vec(vec![0.01, -0.02, 0.03])),
            (2, DVector::from_vec(vec![-0.05])),
            (3, DVector::from_vec(vec![0.1, 0.2])),
        ]
        .into_iter()
        .collect();

        let moved = values.retract(&delta)?;
        let recovered = values.local_coordinates(&moved)?;
        for (key, d) in delta.iter() {
            let r = recovered.get(key).ok_or("missing key")?;
            assert!((r - d).norm() < 1e-9, "key {key}");
        }
        Ok(())
    }

    #[test]
    fn test_local_coordinates_structural_mismatch() -> TestResult {
        let values = create_test_values()?;
        let mut other = values.clone();
        other.insert_or_assign(2, Rn::from_slice(&[0.0]));
        assert!(matches!(
            values.local_coordinates(&other),
            Err(CoreError::TypeMismatch { key: 2, .. })
        ));

        let mut extra = values.clone();
        extra.insert(10, SO2::identity())?;
        assert_eq!(
            values.local_coordinates(&extra),
            Err(CoreError::KeyNotFound { key: 10 })
        );
        Ok(())
    }

    #[test]
    fn test_retract_ordered_uses_ordering_offsets() -> TestResult {
        let values = create_test_values()?;
        let ordering = Ordering::from_keys(&[3, 1], &values)?;
        let step = Mat::from_fn(5, 1, |i, _| i as f64 * 0.1);

        let moved = values.retract_ordered(step.as_ref(), &ordering)?;
        let v = moved.get::<Rn>(3)?;
        assert!((v.component(0) - 1.0).abs() < TOLERANCE);
        assert!((v.component(1) - 2.1).abs() < TOLERANCE);
        // Key 2 is not in the ordering and stays put.
        assert_eq!(moved.at(2)?, values.at(2)?);

        let short = Mat::<f64>::zeros(4, 1);
        assert!(matches!(
            values.retract_ordered(short.as_ref(), &ordering),
            Err(CoreError::DimensionMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_display_lists_keys() -> TestResult {
        let mut values = Values::new();
        values.insert(symbol('x', 1), SE2::identity())?;
        let text = values.to_string();
        assert!(text.starts_with("Values with 1 variables:"));
        assert!(text.contains("x1: Pose2(x: 0.000000"));
        Ok(())
    }
}
