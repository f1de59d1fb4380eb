//! Slot definitions for operator inputs and outputs.
//!
//! A slot is one typed pipe of an operator. Definitions are declared by the
//! operator's metadata and instantiated by the graph whenever the operator is
//! added. Level 0 carries a single array, level `n > 0` carries an ordered
//! list of level `n - 1` sub-slots.

use crate::core::types::DType;
use serde::{Deserialize, Serialize};

/// Direction of a slot (input or output).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SlotDirection {
    Input,
    Output,
}

/// Definition of an operator slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlotDefinition {
    /// Unique name within the operator (e.g. "Input")
    pub name: String,
    /// Direction (input or output)
    pub direction: SlotDirection,
    /// Nesting level: 0 for a single array, 1 for a list of arrays
    pub level: usize,
    /// Whether the operator can be set up without this input
    pub optional: bool,
    /// Element types this input accepts; `None` accepts anything
    pub accepts: Option<Vec<DType>>,
    /// Description for documentation
    pub description: String,
}

impl SlotDefinition {
    fn new(name: impl Into<String>, direction: SlotDirection) -> Self {
        Self {
            name: name.into(),
            direction,
            level: 0,
            optional: false,
            accepts: None,
            description: String::new(),
        }
    }

    /// A level-0 input slot.
    pub fn input(name: impl Into<String>) -> Self {
        Self::new(name, SlotDirection::Input)
    }

    /// A level-0 output slot.
    pub fn output(name: impl Into<String>) -> Self {
        Self::new(name, SlotDirection::Output)
    }

    /// Set the nesting level.
    pub fn with_level(mut self, level: usize) -> Self {
        self.level = level;
        self
    }

    /// Mark the slot as optional.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Restrict the element types this slot accepts.
    pub fn accepting(mut self, dtypes: impl Into<Vec<DType>>) -> Self {
        self.accepts = Some(dtypes.into());
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Whether data of `dtype` may flow into this slot.
    pub fn accepts_dtype(&self, dtype: DType) -> bool {
        self.accepts
            .as_ref()
            .map_or(true, |allowed| allowed.contains(&dtype))
    }

    /// Whether this is a multi-slot.
    pub fn is_multi(&self) -> bool {
        self.level > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_builders() {
        let def = SlotDefinition::input("Images")
            .with_level(1)
            .optional()
            .accepting(vec![DType::U8, DType::F32]);
        assert_eq!(def.direction, SlotDirection::Input);
        assert!(def.is_multi());
        assert!(def.optional);
        assert!(def.accepts_dtype(DType::F32));
        assert!(!def.accepts_dtype(DType::U64));
    }

    #[test]
    fn test_unrestricted_slot_accepts_everything() {
        let def = SlotDefinition::output("Output");
        assert!(def.accepts_dtype(DType::I64));
        assert!(!def.is_multi());
    }
}
