// SPDX-License-Identifier: MIT OR Apache-2.0
//! Interface type registry: display metadata and registered value
//! conversions between type tags.

use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;

/// Value transform applied when a value crosses a connection between two
/// differently-tagged interfaces
pub type Conversion = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Display metadata for a registered interface type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeInfo {
    /// Display color for ports of this type
    pub color: [u8; 3],
}

/// Registry mapping interface type tags to display metadata and outgoing
/// conversions.
///
/// Conversions are one-directional; the identity conversion (equal tags) is
/// implicit and holds even for unregistered tags. Registries are independent
/// values — multiple may coexist for isolated engine instances.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    types: IndexMap<String, TypeInfo>,
    conversions: IndexMap<(String, String), Conversion>,
}

impl TypeRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an interface type. Re-registering the same tag overwrites the
    /// metadata; conversions registered against the tag are preserved.
    pub fn add_type(&mut self, tag: impl Into<String>, color: [u8; 3]) {
        self.types.insert(tag.into(), TypeInfo { color });
    }

    /// Get display metadata for a tag
    pub fn get(&self, tag: &str) -> Option<&TypeInfo> {
        self.types.get(tag)
    }

    /// Register a one-directional conversion. Overwrites any prior conversion
    /// for the same `(from, to)` pair.
    pub fn add_conversion<F>(
        &mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        transform: F,
    ) -> Result<(), UnknownTypeError>
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        let from = from.into();
        if !self.types.contains_key(&from) {
            return Err(UnknownTypeError(from));
        }
        self.conversions
            .insert((from, to.into()), Arc::new(transform));
        Ok(())
    }

    /// Whether a value tagged `from` can cross into an interface tagged `to`
    pub fn can_convert(&self, from: &str, to: &str) -> bool {
        from == to
            || self
                .conversions
                .contains_key(&(from.to_string(), to.to_string()))
    }

    /// Convert `value` from tag `from` to tag `to`. Equal tags return the
    /// value unchanged; otherwise the registered transform applies.
    pub fn convert(&self, from: &str, to: &str, value: Value) -> Result<Value, NoConversionError> {
        if from == to {
            return Ok(value);
        }
        match self.conversions.get(&(from.to_string(), to.to_string())) {
            Some(transform) => Ok(transform(value)),
            None => Err(NoConversionError {
                from: from.to_string(),
                to: to.to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.types)
            .field("conversions", &self.conversions.keys())
            .finish()
    }
}

/// A conversion was registered against an unregistered source type
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown interface type: {0}")]
pub struct UnknownTypeError(pub String);

/// A value crossed a connection between types with no registered conversion
#[derive(Debug, Clone, thiserror::Error)]
#[error("no conversion registered from '{from}' to '{to}'")]
pub struct NoConversionError {
    /// Source type tag
    pub from: String,
    /// Destination type tag
    pub to: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_conversion_always_available() {
        let registry = TypeRegistry::new();
        // Holds for unregistered tags too.
        assert!(registry.can_convert("ghost", "ghost"));
        assert_eq!(
            registry.convert("ghost", "ghost", json!("x")).unwrap(),
            json!("x")
        );
    }

    #[test]
    fn test_registered_conversion_applies() {
        let mut registry = TypeRegistry::new();
        registry.add_type("number", [80, 200, 80]);
        registry.add_type("string", [200, 180, 150]);
        registry
            .add_conversion("number", "string", |v| json!(v.to_string()))
            .unwrap();

        assert!(registry.can_convert("number", "string"));
        assert_eq!(
            registry.convert("number", "string", json!(5)).unwrap(),
            json!("5")
        );
    }

    #[test]
    fn test_missing_conversion_fails() {
        let mut registry = TypeRegistry::new();
        registry.add_type("a", [0, 0, 0]);
        registry.add_type("c", [0, 0, 0]);

        let err = registry.convert("a", "c", json!(1)).unwrap_err();
        assert_eq!(err.from, "a");
        assert_eq!(err.to, "c");
        assert!(!registry.can_convert("a", "c"));
    }

    #[test]
    fn test_conversion_from_unregistered_type_rejected() {
        let mut registry = TypeRegistry::new();
        let err = registry
            .add_conversion("missing", "other", |v| v)
            .unwrap_err();
        assert_eq!(err.0, "missing");
    }

    #[test]
    fn test_reregistering_type_preserves_conversions() {
        let mut registry = TypeRegistry::new();
        registry.add_type("number", [1, 1, 1]);
        registry
            .add_conversion("number", "string", |v| json!(v.to_string()))
            .unwrap();

        registry.add_type("number", [9, 9, 9]);
        assert_eq!(registry.get("number").unwrap().color, [9, 9, 9]);
        assert!(registry.can_convert("number", "string"));
    }

    #[test]
    fn test_conversion_overwrite_wins() {
        let mut registry = TypeRegistry::new();
        registry.add_type("n", [0, 0, 0]);
        registry.add_conversion("n", "m", |_| json!(1)).unwrap();
        registry.add_conversion("n", "m", |_| json!(2)).unwrap();

        assert_eq!(registry.convert("n", "m", json!(0)).unwrap(), json!(2));
    }
}
