//! Component identity.

use serde::{Deserialize, Serialize};

use crate::error::{LocationError, Result};

/// Kind of a component in the control framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentType {
    Container,
    Assembly,
    Hcd,
    Service,
    Sequencer,
}

impl ComponentType {
    pub const ALL: [ComponentType; 5] = [
        ComponentType::Container,
        ComponentType::Assembly,
        ComponentType::Hcd,
        ComponentType::Service,
        ComponentType::Sequencer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentType::Container => "container",
            ComponentType::Assembly => "assembly",
            ComponentType::Hcd => "hcd",
            ComponentType::Service => "service",
            ComponentType::Sequencer => "sequencer",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "container" => Some(ComponentType::Container),
            "assembly" => Some(ComponentType::Assembly),
            "hcd" => Some(ComponentType::Hcd),
            "service" => Some(ComponentType::Service),
            "sequencer" => Some(ComponentType::Sequencer),
            _ => None,
        }
    }
}

impl std::fmt::Display for ComponentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Name and kind of a component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentId {
    pub name: String,
    pub component_type: ComponentType,
}

impl ComponentId {
    /// Create a component id, rejecting blank names.
    pub fn new(name: impl Into<String>, component_type: ComponentType) -> Result<Self> {
        let id = Self {
            name: name.into(),
            component_type,
        };
        id.validate()?;
        Ok(id)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(LocationError::invalid_connection(
                "component name must not be empty",
            ));
        }
        Ok(())
    }
}

impl std::fmt::Display for ComponentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.name, self.component_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_type_roundtrip() {
        for kind in ComponentType::ALL {
            assert_eq!(ComponentType::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(ComponentType::from_str("HCD"), Some(ComponentType::Hcd));
        assert_eq!(ComponentType::from_str("gateway"), None);
    }

    #[test]
    fn test_component_id_rejects_blank_name() {
        assert!(matches!(
            ComponentId::new("", ComponentType::Hcd),
            Err(LocationError::InvalidConnection { .. })
        ));
        assert!(ComponentId::new("   ", ComponentType::Service).is_err());
    }

    #[test]
    fn test_component_id_structural_equality() {
        let a = ComponentId::new("hcd1", ComponentType::Hcd).unwrap();
        let b = ComponentId::new("hcd1", ComponentType::Hcd).unwrap();
        let c = ComponentId::new("hcd1", ComponentType::Assembly).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
