//! Snapshots of input values.

use crate::error::{BoxError, ExecutionError, Result};
use convenient_vfs::HashCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Immutable, comparable record of an input value.
///
/// Hashing is deterministic: every variant is tagged, strings and byte
/// arrays are length-prefixed and maps hash their entries in key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueSnapshot {
    /// Absent value.
    Null,
    /// Boolean.
    Boolean(bool),
    /// Any integer that fits 64 bits.
    Integer(i64),
    /// String.
    String(String),
    /// Ordered list.
    List(Vec<ValueSnapshot>),
    /// String-keyed map.
    Map(BTreeMap<String, ValueSnapshot>),
    /// A value of another type in serialized form.
    Serialized {
        /// Type the bytes belong to.
        type_name: String,
        /// Serialized value.
        bytes: Vec<u8>,
    },
}

impl ValueSnapshot {
    /// Snapshot a serde-serializable value as JSON bytes.
    ///
    /// # Errors
    ///
    /// Propagates the serialization error.
    pub fn serialized<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::Serialized {
            type_name: std::any::type_name::<T>().to_string(),
            bytes: serde_json::to_vec(value)?,
        })
    }

    /// Feed this value into `hasher`.
    pub fn append_to(&self, hasher: &mut Sha256) {
        match self {
            Self::Null => hasher.update([0u8]),
            Self::Boolean(value) => hasher.update([1u8, u8::from(*value)]),
            Self::Integer(value) => {
                hasher.update([2u8]);
                hasher.update(value.to_be_bytes());
            }
            Self::String(value) => {
                hasher.update([3u8]);
                append_bytes(hasher, value.as_bytes());
            }
            Self::List(values) => {
                hasher.update([4u8]);
                hasher.update((values.len() as u64).to_be_bytes());
                for value in values {
                    value.append_to(hasher);
                }
            }
            Self::Map(entries) => {
                hasher.update([5u8]);
                hasher.update((entries.len() as u64).to_be_bytes());
                for (key, value) in entries {
                    append_bytes(hasher, key.as_bytes());
                    value.append_to(hasher);
                }
            }
            Self::Serialized { type_name, bytes } => {
                hasher.update([6u8]);
                append_bytes(hasher, type_name.as_bytes());
                append_bytes(hasher, bytes);
            }
        }
    }

    /// Hash of this value.
    #[must_use]
    pub fn hash(&self) -> HashCode {
        let mut hasher = Sha256::new();
        self.append_to(&mut hasher);
        HashCode::from_digest(hasher)
    }
}

pub(crate) fn append_bytes(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

impl From<bool> for ValueSnapshot {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i64> for ValueSnapshot {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for ValueSnapshot {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<u32> for ValueSnapshot {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<&str> for ValueSnapshot {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for ValueSnapshot {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl<T: Into<ValueSnapshot>> From<Vec<T>> for ValueSnapshot {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<ValueSnapshot>> From<Option<T>> for ValueSnapshot {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Identifies the code of a unit of work.
///
/// Work whose implementation cannot be identified (no hash) may still run
/// but is never loaded from or stored in the build cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImplementationSnapshot {
    type_name: String,
    hash: Option<HashCode>,
}

impl ImplementationSnapshot {
    /// Implementation `type_name` at `version`.
    #[must_use]
    pub fn new(type_name: impl Into<String>, version: &str) -> Self {
        let type_name = type_name.into();
        let mut hasher = Sha256::new();
        append_bytes(&mut hasher, type_name.as_bytes());
        append_bytes(&mut hasher, version.as_bytes());
        Self {
            type_name,
            hash: Some(HashCode::from_digest(hasher)),
        }
    }

    /// Implementation identified by its Rust type and the crate version.
    #[must_use]
    pub fn of<T: ?Sized>() -> Self {
        Self::new(std::any::type_name::<T>(), env!("CARGO_PKG_VERSION"))
    }

    /// Implementation whose code cannot be identified.
    #[must_use]
    pub fn unknown(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            hash: None,
        }
    }

    /// Name of the implementation.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Hash of the implementation, if known.
    #[must_use]
    pub fn hash(&self) -> Option<HashCode> {
        self.hash
    }

    /// Whether the implementation can be identified.
    #[must_use]
    pub fn is_known(&self) -> bool {
        self.hash.is_some()
    }
}

impl fmt::Display for ImplementationSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hash {
            Some(hash) => write!(f, "{}@{}", self.type_name, &hash.to_hex()[..8]),
            None => write!(f, "{}@unknown", self.type_name),
        }
    }
}

type SerializeFn = Arc<dyn Fn(&dyn Any) -> std::result::Result<Vec<u8>, BoxError> + Send + Sync>;

/// Serializers for input value types that are not built in.
///
/// Booleans, integers, strings and options or vectors of those snapshot
/// without registration; anything else needs a serializer.
#[derive(Clone, Default)]
pub struct SerializerRegistry {
    serializers: HashMap<TypeId, (String, SerializeFn)>,
}

impl fmt::Debug for SerializerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.serializers.values().map(|(n, _)| n.as_str()).collect();
        names.sort_unstable();
        f.debug_struct("SerializerRegistry").field("types", &names).finish()
    }
}

impl SerializerRegistry {
    /// Registry without custom serializers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize `T` through serde as JSON.
    pub fn register<T: Any + Serialize>(&mut self) {
        self.register_with::<T>(|value| serde_json::to_vec(value).map_err(Into::into));
    }

    /// Serialize `T` with `serializer`.
    pub fn register_with<T: Any>(
        &mut self,
        serializer: impl Fn(&T) -> std::result::Result<Vec<u8>, BoxError> + Send + Sync + 'static,
    ) {
        let erased: SerializeFn = Arc::new(move |value: &dyn Any| match value.downcast_ref::<T>() {
            Some(value) => serializer(value),
            None => Err("serializer called with a value of another type".into()),
        });
        let _ = self.serializers.insert(
            TypeId::of::<T>(),
            (std::any::type_name::<T>().to_string(), erased),
        );
    }

    /// Whether values of `T` can be snapshotted.
    #[must_use]
    pub fn can_serialize<T: Any>(&self) -> bool {
        builtin(&Option::<T>::None as &dyn Any).is_some()
            || self.serializers.contains_key(&TypeId::of::<T>())
    }

    /// Snapshot `value`.
    ///
    /// # Errors
    ///
    /// `ExecutionError::NoSerializer` if the type is neither built in nor
    /// registered; otherwise the serializer's own failure.
    pub fn snapshot<T: Any>(&self, value: &T) -> Result<ValueSnapshot> {
        if let Some(snapshot) = builtin(value) {
            return Ok(snapshot);
        }
        let type_name = std::any::type_name::<T>();
        let Some((name, serializer)) = self.serializers.get(&TypeId::of::<T>()) else {
            return Err(ExecutionError::NoSerializer(type_name.to_string()));
        };
        let bytes = serializer(value).map_err(|source| ExecutionError::WorkFailed {
            work: format!("serializer for {name}"),
            source,
        })?;
        Ok(ValueSnapshot::Serialized {
            type_name: name.clone(),
            bytes,
        })
    }
}

// Option<T>::None of a built-in type answers `can_serialize` for T.
fn builtin(value: &dyn Any) -> Option<ValueSnapshot> {
    macro_rules! try_types {
        ($($ty:ty),*) => {
            $(
                if let Some(v) = value.downcast_ref::<$ty>() {
                    return Some(v.clone().into());
                }
                if value.downcast_ref::<Option<$ty>>().is_some() {
                    return Some(ValueSnapshot::Null);
                }
                if let Some(v) = value.downcast_ref::<Vec<$ty>>() {
                    return Some(v.clone().into());
                }
            )*
        };
    }
    try_types!(bool, i64, i32, u32, String);
    if let Some(v) = value.downcast_ref::<&str>() {
        return Some((*v).into());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct JvmTarget {
        release: u32,
        vendor: &'static str,
    }

    struct Opaque;

    #[test]
    fn test_builtin_values_need_no_serializer() {
        let registry = SerializerRegistry::new();
        assert_eq!(registry.snapshot(&true).unwrap(), ValueSnapshot::Boolean(true));
        assert_eq!(
            registry.snapshot(&"-g".to_string()).unwrap(),
            ValueSnapshot::String("-g".to_string())
        );
        assert_eq!(
            registry.snapshot(&vec![1i64, 2]).unwrap(),
            ValueSnapshot::List(vec![ValueSnapshot::Integer(1), ValueSnapshot::Integer(2)])
        );
        assert!(registry.can_serialize::<String>());
        assert!(!registry.can_serialize::<Opaque>());
    }

    #[test]
    fn test_unregistered_type_is_rejected() {
        let registry = SerializerRegistry::new();
        assert!(matches!(
            registry.snapshot(&Opaque),
            Err(ExecutionError::NoSerializer(name)) if name.ends_with("Opaque")
        ));
    }

    #[test]
    fn test_registered_type_is_serialized() {
        let mut registry = SerializerRegistry::new();
        registry.register::<JvmTarget>();
        let a = registry.snapshot(&JvmTarget { release: 17, vendor: "x" }).unwrap();
        let b = registry.snapshot(&JvmTarget { release: 17, vendor: "x" }).unwrap();
        let c = registry.snapshot(&JvmTarget { release: 21, vendor: "x" }).unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn test_hash_distinguishes_structure() {
        // ["ab"] and ["a", "b"] must not collide
        let joined = ValueSnapshot::from(vec!["ab"]);
        let split = ValueSnapshot::from(vec!["a", "b"]);
        assert_ne!(joined.hash(), split.hash());
        assert_ne!(ValueSnapshot::Null.hash(), ValueSnapshot::from(false).hash());
    }

    #[test]
    fn test_implementation_identity() {
        let v1 = ImplementationSnapshot::new("JavaCompile", "1");
        assert_eq!(v1, ImplementationSnapshot::new("JavaCompile", "1"));
        assert_ne!(v1, ImplementationSnapshot::new("JavaCompile", "2"));
        assert!(!ImplementationSnapshot::unknown("lambda").is_known());
    }
}
