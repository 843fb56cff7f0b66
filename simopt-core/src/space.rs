use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// A concrete value taken by a parameter.
///
/// Categorical parameters may take string, numeric or boolean values; equality
/// is value equality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    F64(f64),
    Str(String),
}

impl ParameterValue {
    /// The value as a real number, where one exists.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::F64(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Bool(_) | Self::Str(_) => None,
        }
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for ParameterValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// Values format as they are passed to subprocess models: floats use the
/// shortest round-tripping representation, integers decimal, booleans
/// lower-case and strings bare.
impl Display for ParameterValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::F64(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "{v}"),
        }
    }
}

/// A mapping from parameter name to concrete value.
///
/// The ordered map gives the canonical (lexicographic) dimension order used
/// by [`ParameterSpace::encode`] and [`ParameterSpace::decode`].
pub type ParameterVector = BTreeMap<String, ParameterValue>;

/// The admissible domain of a single named parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ParameterDomain {
    /// A closed real interval `[min, max]`.
    Continuous { min: f64, max: f64 },
    /// A closed integer interval `[min, max]`. A degenerate interval with a
    /// single integer is admissible and contributes a constant.
    Integer { min: i64, max: i64 },
    /// A non-empty, ordered sequence of values.
    Categorical { values: Vec<ParameterValue> },
}

/// A named variable in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    #[serde(flatten)]
    pub domain: ParameterDomain,
    /// Optional human description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ParameterSpec {
    pub fn new(domain: ParameterDomain) -> Self {
        Self {
            domain,
            description: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum SpaceError {
    #[error("parameter name `{0}` already exists")]
    DuplicateName(String),
    #[error("empty interval for parameter `{name}`")]
    EmptyInterval { name: String },
    #[error("non-finite bound for parameter `{name}`")]
    NonFiniteBound { name: String },
    #[error("no values defined for categorical parameter `{name}`")]
    EmptyCategories { name: String },
}

/// A single reason a [`ParameterVector`] fails validation against a space.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("parameter `{name}` is missing")]
    Missing { name: String },
    #[error("parameter `{name}` is not defined in the space")]
    Unknown { name: String },
    #[error("parameter `{name}` has the wrong type")]
    TypeMismatch { name: String },
    #[error("parameter `{name}` value {value} is outside [{min}, {max}]")]
    OutOfRange {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("parameter `{name}` integer value {value} is outside [{min}, {max}]")]
    IntegerOutOfRange {
        name: String,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("parameter `{name}` value is not one of the allowed categories")]
    NotInSet { name: String },
    #[error("parameter `{name}` value is not finite")]
    NonFinite { name: String },
}

#[derive(Error, Debug, PartialEq)]
pub enum EncodeError {
    #[error("parameter `{name}` is missing from the vector")]
    MissingParameter { name: String },
    #[error("value for parameter `{name}` has the wrong type")]
    TypeMismatch { name: String },
    #[error("value for parameter `{name}` is not a member of its categories")]
    NotInSet { name: String },
}

#[derive(Error, Debug, PartialEq)]
pub enum DecodeError {
    #[error("encoded vector has length {found}, expected {expected}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("encoded value for parameter `{name}` is not finite")]
    NonFinite { name: String },
}

/// The typed search space of an experiment.
///
/// Specs are keyed by name; iteration order (and therefore the encoded
/// dimension order) is lexicographic. A space is immutable once built.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSpace {
    specs: BTreeMap<String, ParameterSpec>,
}

impl ParameterSpace {
    pub fn builder() -> ParameterSpaceBuilder {
        ParameterSpaceBuilder::default()
    }

    /// Number of parameters in the space. This is also the length of the
    /// encoded representation; a single-valued categorical still occupies a
    /// dimension for symmetry.
    pub fn dimension(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ParameterSpec> {
        self.specs.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specs.keys().map(|n| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParameterSpec)> {
        self.specs.iter().map(|(n, s)| (n.as_str(), s))
    }

    /// Check every name is present, typed correctly and inside its domain.
    ///
    /// All failures are collected rather than stopping at the first.
    pub fn validate(&self, vector: &ParameterVector) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        for name in vector.keys() {
            if !self.specs.contains_key(name) {
                errors.push(ValidationError::Unknown { name: name.clone() });
            }
        }

        for (name, spec) in &self.specs {
            let value = match vector.get(name) {
                Some(v) => v,
                None => {
                    errors.push(ValidationError::Missing { name: name.clone() });
                    continue;
                }
            };

            match (&spec.domain, value) {
                (ParameterDomain::Continuous { min, max }, ParameterValue::F64(v)) => {
                    if !v.is_finite() {
                        errors.push(ValidationError::NonFinite { name: name.clone() });
                    } else if v < min || v > max {
                        errors.push(ValidationError::OutOfRange {
                            name: name.clone(),
                            value: *v,
                            min: *min,
                            max: *max,
                        });
                    }
                }
                (ParameterDomain::Integer { min, max }, ParameterValue::Int(v)) => {
                    if v < min || v > max {
                        errors.push(ValidationError::IntegerOutOfRange {
                            name: name.clone(),
                            value: *v,
                            min: *min,
                            max: *max,
                        });
                    }
                }
                (ParameterDomain::Categorical { values }, v) => {
                    if !values.contains(v) {
                        errors.push(ValidationError::NotInSet { name: name.clone() });
                    }
                }
                _ => errors.push(ValidationError::TypeMismatch { name: name.clone() }),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Flatten a vector into a dense real representation.
    ///
    /// Continuous values pass through, integers are cast, and categorical
    /// values encode as the index into their ordered list.
    pub fn encode(&self, vector: &ParameterVector) -> Result<Vec<f64>, EncodeError> {
        self.specs
            .iter()
            .map(|(name, spec)| {
                let value = vector.get(name).ok_or_else(|| EncodeError::MissingParameter {
                    name: name.clone(),
                })?;

                match &spec.domain {
                    ParameterDomain::Continuous { .. } => match value {
                        ParameterValue::F64(v) => Ok(*v),
                        _ => Err(EncodeError::TypeMismatch { name: name.clone() }),
                    },
                    ParameterDomain::Integer { .. } => match value {
                        ParameterValue::Int(v) => Ok(*v as f64),
                        _ => Err(EncodeError::TypeMismatch { name: name.clone() }),
                    },
                    ParameterDomain::Categorical { values } => values
                        .iter()
                        .position(|v| v == value)
                        .map(|idx| idx as f64)
                        .ok_or_else(|| EncodeError::NotInSet { name: name.clone() }),
                }
            })
            .collect()
    }

    /// Inverse of [`encode`](Self::encode).
    ///
    /// Continuous values clamp to their interval; integers round to the
    /// nearest (halves to even) and clamp; categorical indices truncate then
    /// clamp to `[0, len - 1]`.
    pub fn decode(&self, encoded: &[f64]) -> Result<ParameterVector, DecodeError> {
        if encoded.len() != self.specs.len() {
            return Err(DecodeError::DimensionMismatch {
                expected: self.specs.len(),
                found: encoded.len(),
            });
        }

        self.specs
            .iter()
            .zip(encoded.iter())
            .map(|((name, spec), raw)| {
                if !raw.is_finite() {
                    return Err(DecodeError::NonFinite { name: name.clone() });
                }

                let value = match &spec.domain {
                    ParameterDomain::Continuous { min, max } => {
                        ParameterValue::F64(raw.clamp(*min, *max))
                    }
                    ParameterDomain::Integer { min, max } => {
                        let rounded = round_ties_even(*raw) as i64;
                        ParameterValue::Int(rounded.clamp(*min, *max))
                    }
                    ParameterDomain::Categorical { values } => {
                        let idx = (raw.trunc() as i64).clamp(0, values.len() as i64 - 1);
                        values[idx as usize].clone()
                    }
                };

                Ok((name.clone(), value))
            })
            .collect()
    }

    /// Lower bound of each encoded dimension, in dimension order.
    pub fn lower_bounds(&self) -> Vec<f64> {
        self.specs
            .values()
            .map(|spec| match &spec.domain {
                ParameterDomain::Continuous { min, .. } => *min,
                ParameterDomain::Integer { min, .. } => *min as f64,
                ParameterDomain::Categorical { .. } => 0.0,
            })
            .collect()
    }

    /// Upper bound of each encoded dimension, in dimension order.
    pub fn upper_bounds(&self) -> Vec<f64> {
        self.specs
            .values()
            .map(|spec| match &spec.domain {
                ParameterDomain::Continuous { max, .. } => *max,
                ParameterDomain::Integer { max, .. } => *max as f64,
                ParameterDomain::Categorical { values } => (values.len() - 1) as f64,
            })
            .collect()
    }

    /// Draw a vector uniformly from the space.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> ParameterVector {
        self.specs
            .iter()
            .map(|(name, spec)| {
                let value = match &spec.domain {
                    ParameterDomain::Continuous { min, max } => {
                        ParameterValue::F64(rng.gen_range(*min..=*max))
                    }
                    ParameterDomain::Integer { min, max } => {
                        ParameterValue::Int(rng.gen_range(*min..=*max))
                    }
                    ParameterDomain::Categorical { values } => {
                        values[rng.gen_range(0..values.len())].clone()
                    }
                };
                (name.clone(), value)
            })
            .collect()
    }
}

/// Builder for [`ParameterSpace`] instances.
#[derive(Debug, Default)]
pub struct ParameterSpaceBuilder {
    specs: Vec<(String, ParameterSpec)>,
}

impl ParameterSpaceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_continuous(self, name: &str, min: f64, max: f64) -> Self {
        self.with_spec(name, ParameterSpec::new(ParameterDomain::Continuous { min, max }))
    }

    pub fn with_integer(self, name: &str, min: i64, max: i64) -> Self {
        self.with_spec(name, ParameterSpec::new(ParameterDomain::Integer { min, max }))
    }

    pub fn with_categorical<V: Into<ParameterValue> + Clone>(self, name: &str, values: &[V]) -> Self {
        let values = values.iter().map(|v| v.clone().into()).collect();
        self.with_spec(name, ParameterSpec::new(ParameterDomain::Categorical { values }))
    }

    pub fn with_spec(mut self, name: &str, spec: ParameterSpec) -> Self {
        self.specs.push((name.to_string(), spec));
        self
    }

    pub fn build(self) -> Result<ParameterSpace, SpaceError> {
        let mut specs = BTreeMap::new();

        for (name, spec) in self.specs {
            match &spec.domain {
                ParameterDomain::Continuous { min, max } => {
                    if !min.is_finite() || !max.is_finite() {
                        return Err(SpaceError::NonFiniteBound { name });
                    }
                    if min >= max {
                        return Err(SpaceError::EmptyInterval { name });
                    }
                }
                ParameterDomain::Integer { min, max } => {
                    if min > max {
                        return Err(SpaceError::EmptyInterval { name });
                    }
                }
                ParameterDomain::Categorical { values } => {
                    if values.is_empty() {
                        return Err(SpaceError::EmptyCategories { name });
                    }
                }
            }

            if specs.insert(name.clone(), spec).is_some() {
                return Err(SpaceError::DuplicateName(name));
            }
        }

        Ok(ParameterSpace { specs })
    }
}

/// Round to the nearest integer, breaking halves towards the even neighbour.
fn round_ties_even(x: f64) -> f64 {
    if (x.fract()).abs() == 0.5 {
        let floor = x.floor();
        if (floor as i64) % 2 == 0 {
            floor
        } else {
            floor + 1.0
        }
    } else {
        x.round()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn mixed_space() -> ParameterSpace {
        ParameterSpace::builder()
            .with_continuous("alpha", 0.0, 1.0)
            .with_integer("count", 1, 5)
            .with_categorical("mode", &["slow", "fast"])
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_rejects_duplicates() {
        let result = ParameterSpace::builder()
            .with_continuous("a", 0.0, 1.0)
            .with_integer("a", 0, 5)
            .build();
        assert_eq!(result.unwrap_err(), SpaceError::DuplicateName("a".to_string()));
    }

    #[test]
    fn test_builder_rejects_bad_domains() {
        let result = ParameterSpace::builder().with_continuous("a", 1.0, 1.0).build();
        assert_eq!(
            result.unwrap_err(),
            SpaceError::EmptyInterval { name: "a".to_string() }
        );

        let result = ParameterSpace::builder().with_continuous("a", 0.0, f64::NAN).build();
        assert_eq!(
            result.unwrap_err(),
            SpaceError::NonFiniteBound { name: "a".to_string() }
        );

        let values: &[&str] = &[];
        let result = ParameterSpace::builder().with_categorical("a", values).build();
        assert_eq!(
            result.unwrap_err(),
            SpaceError::EmptyCategories { name: "a".to_string() }
        );
    }

    #[test]
    fn test_degenerate_integer_interval_is_admissible() {
        let space = ParameterSpace::builder().with_integer("n", 3, 3).build().unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let vector = space.sample(&mut rng);
        assert_eq!(vector.get("n"), Some(&ParameterValue::Int(3)));
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let space = mixed_space();

        let mut vector = ParameterVector::new();
        vector.insert("alpha".to_string(), ParameterValue::F64(2.0));
        vector.insert("mode".to_string(), ParameterValue::Str("other".to_string()));
        vector.insert("extra".to_string(), ParameterValue::Int(1));

        let errors = space.validate(&vector).unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.contains(&ValidationError::Unknown {
            name: "extra".to_string()
        }));
        assert!(errors.contains(&ValidationError::Missing {
            name: "count".to_string()
        }));
        assert!(errors.contains(&ValidationError::NotInSet {
            name: "mode".to_string()
        }));
    }

    #[test]
    fn test_validate_rejects_nan() {
        let space = mixed_space();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut vector = space.sample(&mut rng);
        vector.insert("alpha".to_string(), ParameterValue::F64(f64::NAN));

        let errors = space.validate(&vector).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::NonFinite {
                name: "alpha".to_string()
            }]
        );
    }

    #[test]
    fn test_encode_dimension_order_is_lexicographic() {
        let space = mixed_space();

        let mut vector = ParameterVector::new();
        vector.insert("alpha".to_string(), ParameterValue::F64(0.25));
        vector.insert("count".to_string(), ParameterValue::Int(4));
        vector.insert("mode".to_string(), ParameterValue::Str("fast".to_string()));

        let encoded = space.encode(&vector).unwrap();
        assert_eq!(encoded, vec![0.25, 4.0, 1.0]);

        assert_eq!(space.lower_bounds(), vec![0.0, 1.0, 0.0]);
        assert_eq!(space.upper_bounds(), vec![1.0, 5.0, 1.0]);
    }

    #[test]
    fn test_decode_encode_round_trip_on_samples() {
        let space = mixed_space();
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        for _ in 0..200 {
            let vector = space.sample(&mut rng);
            assert!(space.validate(&vector).is_ok());

            let encoded = space.encode(&vector).unwrap();
            let decoded = space.decode(&encoded).unwrap();
            assert_eq!(decoded, vector);
        }
    }

    #[test]
    fn test_decode_rounds_integers_half_to_even() {
        let space = ParameterSpace::builder().with_integer("n", 0, 10).build().unwrap();

        let decoded = space.decode(&[2.5]).unwrap();
        assert_eq!(decoded.get("n"), Some(&ParameterValue::Int(2)));

        let decoded = space.decode(&[3.5]).unwrap();
        assert_eq!(decoded.get("n"), Some(&ParameterValue::Int(4)));

        let decoded = space.decode(&[3.2]).unwrap();
        assert_eq!(decoded.get("n"), Some(&ParameterValue::Int(3)));
    }

    #[test]
    fn test_decode_clamps() {
        let space = mixed_space();

        let decoded = space.decode(&[1.5, 9.0, 7.9]).unwrap();
        assert_eq!(decoded.get("alpha"), Some(&ParameterValue::F64(1.0)));
        assert_eq!(decoded.get("count"), Some(&ParameterValue::Int(5)));
        assert_eq!(decoded.get("mode"), Some(&ParameterValue::Str("fast".to_string())));
    }

    #[test]
    fn test_decode_rejects_nan() {
        let space = mixed_space();
        let result = space.decode(&[f64::NAN, 2.0, 0.0]);
        assert_eq!(
            result.unwrap_err(),
            DecodeError::NonFinite {
                name: "alpha".to_string()
            }
        );
    }

    #[test]
    fn test_single_valued_categorical_keeps_its_dimension() {
        let space = ParameterSpace::builder()
            .with_categorical("only", &["fixed"])
            .with_continuous("x", 0.0, 1.0)
            .build()
            .unwrap();

        assert_eq!(space.dimension(), 2);

        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let vector = space.sample(&mut rng);
        assert_eq!(vector.get("only"), Some(&ParameterValue::Str("fixed".to_string())));

        let encoded = space.encode(&vector).unwrap();
        assert_approx_eq!(f64, encoded[0], 0.0);
    }

    #[test]
    fn test_narrow_continuous_interval_samples_and_encodes() {
        let min = 1.0;
        let max = 1.0 + 1e-12;
        let space = ParameterSpace::builder().with_continuous("x", min, max).build().unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let vector = space.sample(&mut rng);
        assert!(space.validate(&vector).is_ok());

        let encoded = space.encode(&vector).unwrap();
        assert!(encoded[0] >= min && encoded[0] <= max);
    }
}
