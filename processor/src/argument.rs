use std::sync::Arc;

use tessera_core::{Memory, operand::Operand};

use crate::ExecutionError;

// ARGUMENT
// ================================================================================================

/// Where a bound execution argument lives.
#[derive(Debug, Clone)]
pub(crate) enum ArgumentState {
    Unspecified,
    NoValue,
    Memory { memory: Arc<Memory>, offset: u32, length: u32 },
}

/// One bound input or output of an execution (or of a single step).
///
/// Host-slice bindings are staged through an execution-owned memory region at
/// bind time, so by the time a request is built every live argument is a
/// memory window.
#[derive(Debug, Clone)]
pub(crate) struct Argument {
    pub state: ArgumentState,
    /// The operand's declared shape refined by any per-argument override.
    pub dimensions: Vec<u32>,
}

impl Argument {
    pub fn unspecified() -> Self {
        Self { state: ArgumentState::Unspecified, dimensions: Vec::new() }
    }

    pub fn no_value() -> Self {
        Self { state: ArgumentState::NoValue, dimensions: Vec::new() }
    }

    pub fn from_memory(
        operand: &Operand,
        memory: Arc<Memory>,
        offset: u32,
        length: u32,
        dimension_override: &[u32],
    ) -> Result<Self, ExecutionError> {
        let dimensions = merge_dimensions(&operand.dimensions, dimension_override)?;
        if offset.checked_add(length).is_none_or(|end| end > memory.size()) {
            return Err(ExecutionError::BadData(format!(
                "argument window ({offset} + {length}) exceeds memory region of {} bytes",
                memory.size()
            )));
        }
        Ok(Self {
            state: ArgumentState::Memory { memory, offset, length },
            dimensions,
        })
    }

    pub fn is_specified(&self) -> bool {
        !matches!(self.state, ArgumentState::Unspecified)
    }

    pub fn memory(&self) -> Option<(&Arc<Memory>, u32, u32)> {
        match &self.state {
            ArgumentState::Memory { memory, offset, length } => Some((memory, *offset, *length)),
            _ => None,
        }
    }
}

/// Reconciles a declared operand shape with a client override: unknown
/// declared dimensions take the override, fully-specified dimensions must not
/// change.
pub(crate) fn merge_dimensions(
    declared: &[u32],
    overridden: &[u32],
) -> Result<Vec<u32>, ExecutionError> {
    if overridden.is_empty() {
        return Ok(declared.to_vec());
    }
    if declared.is_empty() {
        return Ok(overridden.to_vec());
    }
    if declared.len() != overridden.len() {
        return Err(ExecutionError::BadData(format!(
            "dimension override {overridden:?} has a different rank than declared {declared:?}"
        )));
    }
    declared
        .iter()
        .zip(overridden)
        .map(|(&declared, &overridden)| match (declared, overridden) {
            (0, value) => Ok(value),
            (value, 0) => Ok(value),
            (declared, overridden) if declared == overridden => Ok(declared),
            (declared, overridden) => Err(ExecutionError::BadData(format!(
                "cannot override fully-specified dimension {declared} with {overridden}"
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_refines_unknown_dimensions() {
        assert_eq!(merge_dimensions(&[1, 0], &[1, 7]).unwrap(), vec![1, 7]);
        assert_eq!(merge_dimensions(&[2, 3], &[]).unwrap(), vec![2, 3]);
    }

    #[test]
    fn merge_rejects_conflicting_override() {
        assert!(merge_dimensions(&[1, 7], &[1, 6]).is_err());
        assert!(merge_dimensions(&[1, 7], &[1, 7, 1]).is_err());
    }
}
