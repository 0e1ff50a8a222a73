use serde::ser::Error as SerError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Tri-state field for PATCH-style request bodies.
///
/// The REST API distinguishes a key that is absent from a key that is
/// explicitly `null`. `Omitted` fields must be skipped at the struct level:
///
/// ```ignore
/// #[serde(default, skip_serializing_if = "Patch::is_omitted")]
/// topic: Patch<String>,
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Patch<T> {
    Omitted,
    Null,
    Value(T),
}

impl<T> Patch<T> {
    pub const fn is_omitted(&self) -> bool {
        matches!(self, Self::Omitted)
    }

    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub const fn is_value(&self) -> bool {
        matches!(self, Self::Value(_))
    }

    pub fn as_ref(&self) -> Patch<&T> {
        match self {
            Self::Omitted => Patch::Omitted,
            Self::Null => Patch::Null,
            Self::Value(v) => Patch::Value(v),
        }
    }

    /// `Value(v)` as `Some(v)`, everything else as `None`.
    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Maps `Some(v)` to `Value(v)` and `None` to `Null`.
    ///
    /// Use when an `Option`-shaped caller argument means "set or clear",
    /// never "leave untouched".
    pub fn set(value: Option<T>) -> Self {
        match value {
            Some(v) => Self::Value(v),
            None => Self::Null,
        }
    }
}

impl<T> Default for Patch<T> {
    fn default() -> Self {
        Self::Omitted
    }
}

impl<T> From<T> for Patch<T> {
    fn from(value: T) -> Self {
        Self::Value(value)
    }
}

impl<T> Serialize for Patch<T>
where
    T: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Omitted => Err(S::Error::custom(
                "Patch::Omitted must be skipped with #[serde(skip_serializing_if = \"Patch::is_omitted\")]",
            )),
            Self::Null => serializer.serialize_none(),
            Self::Value(v) => v.serialize(serializer),
        }
    }
}

impl<'de, T> Deserialize<'de> for Patch<T>
where
    T: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<T>::deserialize(deserializer)? {
            Some(v) => Self::Value(v),
            None => Self::Null,
        })
    }
}
