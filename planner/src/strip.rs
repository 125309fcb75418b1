//! Removal of trailing operation arguments that are set to their default
//! values.
//!
//! Older back-ends predate the optional trailing arguments some operations
//! grew over time. When a trailing argument is an inline constant equal to
//! its documented default, dropping it does not change semantics but widens
//! the set of back-ends that will accept the step model. Only constant-copy
//! arguments are considered; by-reference constants would require mapping
//! memory during compilation and are left in place.

use tessera_core::{
    ModelBuilder,
    operand::{OperandLifetime, OperandType},
    operation::{Operation, OperationType},
};
use tracing::debug;

// TAIL SPECIFICATIONS
// ================================================================================================

/// A default value a trailing argument may redundantly restate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TailSpec {
    BoolFalse,
    Int32One,
    Int32NegativeOne,
}

fn matches_spec(builder: &ModelBuilder, operand_index: u32, spec: TailSpec) -> bool {
    let operand = builder.operand(operand_index);
    if operand.lifetime != OperandLifetime::ConstantCopy {
        return false;
    }
    let Some(bytes) = builder.operand_value(operand) else {
        return false;
    };
    match spec {
        TailSpec::BoolFalse => operand.ty == OperandType::Bool && bytes == [0],
        TailSpec::Int32One => operand.ty == OperandType::Int32 && bytes == 1i32.to_le_bytes(),
        TailSpec::Int32NegativeOne => {
            operand.ty == OperandType::Int32 && bytes == (-1i32).to_le_bytes()
        },
    }
}

/// Counts how many trailing inputs, read right to left from the end of the
/// input list down to `tail_start`, match the specification.
fn count_matching_trailing(
    builder: &ModelBuilder,
    operation: &Operation,
    tail_start: usize,
    tail: &[TailSpec],
) -> u32 {
    let mut count = 0;
    for position in (tail_start..operation.inputs.len()).rev() {
        if !matches_spec(builder, operation.inputs[position], tail[position - tail_start]) {
            break;
        }
        count += 1;
    }
    count
}

// PER-OPERATION RULES
// ================================================================================================

/// Returns the number of trailing inputs to remove from this operation.
fn trailing_arguments_to_remove(builder: &ModelBuilder, operation: &Operation) -> u32 {
    use TailSpec as TS;
    let input_count = operation.inputs.len();
    let input_ty = |position: usize| builder.operand(operation.inputs[position]).ty;
    let count = |tail_start: usize, tail: &[TS]| {
        count_matching_trailing(builder, operation, tail_start, tail)
    };
    match operation.ty {
        OperationType::AveragePool2d | OperationType::L2Pool2d | OperationType::MaxPool2d => {
            if input_count == 11 && input_ty(7) == OperandType::Int32 {
                // Explicit padding: 10 mandatory inputs plus the layout flag.
                count(10, &[TS::BoolFalse])
            } else if input_count == 8 && input_ty(7) == OperandType::Bool {
                // Implicit padding: 7 mandatory inputs plus the layout flag.
                count(7, &[TS::BoolFalse])
            } else {
                0
            }
        },
        OperationType::Conv2d => {
            if (11..=13).contains(&input_count) && input_ty(7) == OperandType::Int32 {
                let n = count(10, &[TS::BoolFalse, TS::Int32One, TS::Int32One]);
                // The two dilation factors must be removed together.
                if input_count as u32 - n == 12 { 0 } else { n }
            } else if (8..=10).contains(&input_count) && input_ty(7) == OperandType::Bool {
                let n = count(7, &[TS::BoolFalse, TS::Int32One, TS::Int32One]);
                if input_count as u32 - n == 9 { 0 } else { n }
            } else {
                0
            }
        },
        OperationType::DepthwiseConv2d => {
            if (12..=14).contains(&input_count) && input_ty(8) == OperandType::Int32 {
                let n = count(11, &[TS::BoolFalse, TS::Int32One, TS::Int32One]);
                if input_count as u32 - n == 13 { 0 } else { n }
            } else if (9..=11).contains(&input_count) && input_ty(8) == OperandType::Bool {
                let n = count(8, &[TS::BoolFalse, TS::Int32One, TS::Int32One]);
                if input_count as u32 - n == 10 { 0 } else { n }
            } else {
                0
            }
        },
        OperationType::DepthToSpace
        | OperationType::SpaceToDepth
        | OperationType::BatchToSpaceNd => {
            if input_count == 3 { count(2, &[TS::BoolFalse]) } else { 0 }
        },
        OperationType::SpaceToBatchNd => {
            if input_count == 4 { count(3, &[TS::BoolFalse]) } else { 0 }
        },
        OperationType::L2Normalization => {
            if input_count == 2 { count(1, &[TS::Int32NegativeOne]) } else { 0 }
        },
        OperationType::LocalResponseNormalization => {
            if input_count == 6 { count(5, &[TS::Int32NegativeOne]) } else { 0 }
        },
        OperationType::ResizeBilinear => {
            if (4..=6).contains(&input_count) {
                count(3, &[TS::BoolFalse, TS::BoolFalse, TS::BoolFalse])
            } else {
                0
            }
        },
        OperationType::ResizeNearestNeighbor => {
            if (5..=6).contains(&input_count) {
                count(4, &[TS::BoolFalse, TS::BoolFalse])
            } else {
                0
            }
        },
        OperationType::Softmax => {
            if input_count == 3 { count(2, &[TS::Int32NegativeOne]) } else { 0 }
        },
        _ => 0,
    }
}

// ENTRY POINT
// ================================================================================================

/// Strips redundant trailing default arguments from every operation of a
/// step model under construction.
pub(crate) fn strip_trailing_default_arguments(builder: &mut ModelBuilder) {
    let removals: Vec<(usize, u32)> = (0..builder.operation_count())
        .filter_map(|index| {
            let operation = builder.operation(index);
            let count = trailing_arguments_to_remove(builder, operation);
            (count > 0).then_some((index as usize, count))
        })
        .collect();
    for (index, count) in removals {
        let operation = &mut builder.operations_mut()[index];
        let new_len = operation.inputs.len() - count as usize;
        debug!(operation = index, removed = count, "stripping trailing default arguments");
        operation.inputs.truncate(new_len);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn int32_const(builder: &mut ModelBuilder, value: i32) -> u32 {
        let index = builder.add_operand(OperandType::Int32, &[]);
        builder.set_operand_value(index, &value.to_le_bytes()).unwrap();
        index
    }

    fn bool_const(builder: &mut ModelBuilder, value: bool) -> u32 {
        let index = builder.add_operand(OperandType::Bool, &[]);
        builder.set_operand_value(index, &[value as u8]).unwrap();
        index
    }

    fn softmax_model(axis: Option<i32>) -> ModelBuilder {
        let mut builder = ModelBuilder::new();
        let input = builder.add_operand(OperandType::TensorFloat32, &[2, 3]);
        let beta = builder.add_operand(OperandType::Float32, &[]);
        builder.set_operand_value(beta, &1f32.to_le_bytes()).unwrap();
        let out = builder.add_operand(OperandType::TensorFloat32, &[2, 3]);
        let mut inputs = vec![input, beta];
        if let Some(axis) = axis {
            inputs.push(int32_const(&mut builder, axis));
        }
        builder.add_operation(OperationType::Softmax, &inputs, &[out]).unwrap();
        builder.identify_inputs_outputs(&[input], &[out]).unwrap();
        builder
    }

    #[rstest]
    #[case::default_axis_stripped(Some(-1), 2)]
    #[case::explicit_axis_kept(Some(1), 3)]
    #[case::absent_axis_untouched(None, 2)]
    fn softmax_trailing_axis(#[case] axis: Option<i32>, #[case] expected_inputs: usize) {
        let mut builder = softmax_model(axis);
        strip_trailing_default_arguments(&mut builder);
        assert_eq!(builder.operation(0).inputs.len(), expected_inputs);
    }

    #[test]
    fn constant_reference_axis_is_kept() {
        let mut builder = ModelBuilder::new();
        let input = builder.add_operand(OperandType::TensorFloat32, &[2, 3]);
        let beta = builder.add_operand(OperandType::Float32, &[]);
        builder.set_operand_value(beta, &1f32.to_le_bytes()).unwrap();
        let axis = builder.add_operand(OperandType::Int32, &[]);
        let memory = tessera_core::Memory::from_bytes((-1i32).to_le_bytes().to_vec());
        builder.set_operand_value_from_memory(axis, memory, 0, 4).unwrap();
        let out = builder.add_operand(OperandType::TensorFloat32, &[2, 3]);
        builder
            .add_operation(OperationType::Softmax, &[input, beta, axis], &[out])
            .unwrap();
        builder.identify_inputs_outputs(&[input], &[out]).unwrap();
        strip_trailing_default_arguments(&mut builder);
        assert_eq!(builder.operation(0).inputs.len(), 3);
    }

    /// Explicit-padding CONV_2D with 13 inputs: layout flag false and both
    /// dilation factors 1 are all redundant.
    fn conv2d_model(dilation_w: i32, dilation_h: i32) -> ModelBuilder {
        let mut builder = ModelBuilder::new();
        let input = builder.add_operand(OperandType::TensorFloat32, &[1, 4, 4, 1]);
        let filter = builder.add_operand(OperandType::TensorFloat32, &[1, 2, 2, 1]);
        builder.set_operand_value(filter, &[0u8; 16]).unwrap();
        let bias = builder.add_operand(OperandType::TensorFloat32, &[1]);
        builder.set_operand_value(bias, &[0u8; 4]).unwrap();
        let pads: Vec<u32> = (0..4).map(|_| int32_const(&mut builder, 0)).collect();
        let strides: Vec<u32> = (0..2).map(|_| int32_const(&mut builder, 1)).collect();
        let activation = int32_const(&mut builder, 0);
        let layout = bool_const(&mut builder, false);
        let dw = int32_const(&mut builder, dilation_w);
        let dh = int32_const(&mut builder, dilation_h);
        let out = builder.add_operand(OperandType::TensorFloat32, &[1, 3, 3, 1]);
        let mut inputs = vec![input, filter, bias];
        inputs.extend(&pads);
        inputs.extend(&strides);
        inputs.push(activation);
        inputs.extend([layout, dw, dh]);
        builder.add_operation(OperationType::Conv2d, &inputs, &[out]).unwrap();
        builder.identify_inputs_outputs(&[input], &[out]).unwrap();
        builder
    }

    #[test]
    fn conv2d_all_defaults_are_stripped() {
        let mut builder = conv2d_model(1, 1);
        strip_trailing_default_arguments(&mut builder);
        assert_eq!(builder.operation(0).inputs.len(), 10);
    }

    #[test]
    fn conv2d_dilation_factors_are_removed_together() {
        // Only the height factor is default; removing it alone would leave a
        // 12-input operation, which is not a valid arity.
        let mut builder = conv2d_model(2, 1);
        strip_trailing_default_arguments(&mut builder);
        assert_eq!(builder.operation(0).inputs.len(), 13);
    }
}
