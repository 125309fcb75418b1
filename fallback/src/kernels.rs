//! Reference kernels for the software back-end.
//!
//! Values are carried as raw little-endian bytes plus an element type and a
//! fully-specified shape; kernels decode, compute, and re-encode. None of
//! this is performance-sensitive: the software back-end exists for coverage
//! and fallback, not throughput.

use tessera_core::{DeviceError, OperandType, OperationType};

// VALUE
// ================================================================================================

/// A fully-materialised operand value.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub ty: OperandType,
    pub dimensions: Vec<u32>,
    pub bytes: Vec<u8>,
}

impl Value {
    pub fn as_f32_vec(&self) -> Result<Vec<f32>, DeviceError> {
        match self.ty {
            OperandType::Float32 | OperandType::TensorFloat32 => Ok(self
                .bytes
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes(chunk.try_into().expect("chunk of 4")))
                .collect()),
            other => Err(DeviceError::BadData(format!("expected float32 data, got {other:?}"))),
        }
    }

    pub fn as_i32_vec(&self) -> Result<Vec<i32>, DeviceError> {
        match self.ty {
            OperandType::Int32 | OperandType::TensorInt32 => Ok(self
                .bytes
                .chunks_exact(4)
                .map(|chunk| i32::from_le_bytes(chunk.try_into().expect("chunk of 4")))
                .collect()),
            other => Err(DeviceError::BadData(format!("expected int32 data, got {other:?}"))),
        }
    }

    /// Reads a boolean condition from a scalar or single-element tensor.
    pub fn as_bool(&self) -> Result<bool, DeviceError> {
        match self.bytes.first() {
            Some(&byte) => Ok(byte != 0),
            None => Err(DeviceError::BadData("empty condition value".into())),
        }
    }

    pub fn from_f32_vec(ty: OperandType, dimensions: Vec<u32>, data: Vec<f32>) -> Self {
        let bytes = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self { ty, dimensions, bytes }
    }

    pub fn from_i32_vec(ty: OperandType, dimensions: Vec<u32>, data: Vec<i32>) -> Self {
        let bytes = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self { ty, dimensions, bytes }
    }

    pub fn from_bool_vec(dimensions: Vec<u32>, data: Vec<bool>) -> Self {
        let bytes = data.iter().map(|&b| b as u8).collect();
        Self { ty: OperandType::TensorBool8, dimensions, bytes }
    }
}

// BROADCASTING
// ================================================================================================

/// Computes the broadcast shape of two operands, aligning shapes at their
/// trailing dimensions and treating a missing or size-1 dimension as
/// repeatable.
pub fn broadcast_shape(a: &[u32], b: &[u32]) -> Result<Vec<u32>, DeviceError> {
    let rank = a.len().max(b.len());
    let mut out = vec![0u32; rank];
    for i in 0..rank {
        let da = dim_from_end(a, rank - 1 - i);
        let db = dim_from_end(b, rank - 1 - i);
        out[i] = if da == db || db == 1 {
            da
        } else if da == 1 {
            db
        } else {
            return Err(DeviceError::BadData(format!(
                "shapes {a:?} and {b:?} are not broadcast-compatible"
            )));
        };
    }
    Ok(out)
}

fn dim_from_end(dims: &[u32], from_end: usize) -> u32 {
    if from_end < dims.len() {
        dims[dims.len() - 1 - from_end]
    } else {
        1
    }
}

/// Maps a linear index into the broadcast output shape back to a linear index
/// into a (possibly lower-rank, possibly size-1-dimensioned) source shape.
fn source_index(out_dims: &[u32], src_dims: &[u32], mut linear: usize) -> usize {
    let mut index = 0;
    let mut stride = 1;
    // Walk dimensions from the innermost outward.
    for from_end in 0..out_dims.len() {
        let out_dim = out_dims[out_dims.len() - 1 - from_end] as usize;
        let src_dim = dim_from_end(src_dims, from_end) as usize;
        let coordinate = linear % out_dim;
        linear /= out_dim;
        if src_dim != 1 {
            index += coordinate * stride;
        }
        stride *= src_dim;
    }
    index
}

fn broadcast_f32(
    a: &Value,
    b: &Value,
    f: impl Fn(f32, f32) -> f32,
) -> Result<(Vec<u32>, Vec<f32>), DeviceError> {
    let out_dims = broadcast_shape(&a.dimensions, &b.dimensions)?;
    let lhs = a.as_f32_vec()?;
    let rhs = b.as_f32_vec()?;
    let count = out_dims.iter().map(|&d| d as usize).product::<usize>().max(1);
    let data = (0..count)
        .map(|i| {
            f(
                lhs[source_index(&out_dims, &a.dimensions, i)],
                rhs[source_index(&out_dims, &b.dimensions, i)],
            )
        })
        .collect();
    Ok((out_dims, data))
}

// KERNELS
// ================================================================================================

pub fn arithmetic(
    ty: OperationType,
    a: &Value,
    b: &Value,
    out_ty: OperandType,
) -> Result<Value, DeviceError> {
    let f: fn(f32, f32) -> f32 = match ty {
        OperationType::Add => |x, y| x + y,
        OperationType::Sub => |x, y| x - y,
        OperationType::Mul => |x, y| x * y,
        OperationType::Div => |x, y| x / y,
        other => return Err(DeviceError::BadData(format!("{other} is not arithmetic"))),
    };
    let (dims, data) = broadcast_f32(a, b, f)?;
    Ok(Value::from_f32_vec(out_ty, dims, data))
}

pub fn compare(ty: OperationType, a: &Value, b: &Value) -> Result<Value, DeviceError> {
    let f: fn(f32, f32) -> bool = match ty {
        OperationType::Equal => |x, y| x == y,
        OperationType::NotEqual => |x, y| x != y,
        OperationType::Greater => |x, y| x > y,
        OperationType::GreaterEqual => |x, y| x >= y,
        OperationType::Less => |x, y| x < y,
        OperationType::LessEqual => |x, y| x <= y,
        other => return Err(DeviceError::BadData(format!("{other} is not a comparison"))),
    };
    // Integer and boolean inputs are widened to f32 for the comparison; the
    // widening is exact for the value ranges these graphs carry.
    let (lhs, rhs) = (widen_to_f32(a)?, widen_to_f32(b)?);
    let (dims, data) = broadcast_f32(&lhs, &rhs, move |x, y| f(x, y) as u8 as f32)?;
    Ok(Value::from_bool_vec(dims, data.into_iter().map(|v| v != 0.0).collect()))
}

fn widen_to_f32(value: &Value) -> Result<Value, DeviceError> {
    match value.ty {
        OperandType::Float32 | OperandType::TensorFloat32 => Ok(value.clone()),
        OperandType::Int32 | OperandType::TensorInt32 => Ok(Value::from_f32_vec(
            OperandType::TensorFloat32,
            value.dimensions.clone(),
            value.as_i32_vec()?.into_iter().map(|v| v as f32).collect(),
        )),
        OperandType::Bool | OperandType::TensorBool8 => Ok(Value::from_f32_vec(
            OperandType::TensorFloat32,
            value.dimensions.clone(),
            value.bytes.iter().map(|&b| (b != 0) as u8 as f32).collect(),
        )),
        other => Err(DeviceError::BadData(format!("cannot compare values of type {other:?}"))),
    }
}

pub fn logical_binary(ty: OperationType, a: &Value, b: &Value) -> Result<Value, DeviceError> {
    let f: fn(bool, bool) -> bool = match ty {
        OperationType::LogicalAnd => |x, y| x && y,
        OperationType::LogicalOr => |x, y| x || y,
        other => return Err(DeviceError::BadData(format!("{other} is not a logical operation"))),
    };
    let (lhs, rhs) = (widen_to_f32(a)?, widen_to_f32(b)?);
    let (dims, data) = broadcast_f32(&lhs, &rhs, move |x, y| f(x != 0.0, y != 0.0) as u8 as f32)?;
    Ok(Value::from_bool_vec(dims, data.into_iter().map(|v| v != 0.0).collect()))
}

pub fn logical_not(a: &Value) -> Result<Value, DeviceError> {
    Ok(Value::from_bool_vec(
        a.dimensions.clone(),
        a.bytes.iter().map(|&b| b == 0).collect(),
    ))
}

pub fn relu(a: &Value, out_ty: OperandType) -> Result<Value, DeviceError> {
    let data = a.as_f32_vec()?.into_iter().map(|v| v.max(0.0)).collect();
    Ok(Value::from_f32_vec(out_ty, a.dimensions.clone(), data))
}

pub fn cast(a: &Value, out_ty: OperandType) -> Result<Value, DeviceError> {
    match out_ty {
        OperandType::Float32 | OperandType::TensorFloat32 => {
            let data = match a.ty {
                OperandType::Float32 | OperandType::TensorFloat32 => a.as_f32_vec()?,
                _ => a.as_i32_vec()?.into_iter().map(|v| v as f32).collect(),
            };
            Ok(Value::from_f32_vec(out_ty, a.dimensions.clone(), data))
        },
        OperandType::Int32 | OperandType::TensorInt32 => {
            let data = match a.ty {
                OperandType::Int32 | OperandType::TensorInt32 => a.as_i32_vec()?,
                _ => a.as_f32_vec()?.into_iter().map(|v| v as i32).collect(),
            };
            Ok(Value::from_i32_vec(out_ty, a.dimensions.clone(), data))
        },
        other => Err(DeviceError::BadData(format!("unsupported cast target {other:?}"))),
    }
}

/// Softmax along `axis` (negative values count from the last dimension).
pub fn softmax(a: &Value, beta: f32, axis: i32, out_ty: OperandType) -> Result<Value, DeviceError> {
    let rank = a.dimensions.len() as i32;
    let axis = if axis < 0 { axis + rank } else { axis };
    if axis < 0 || axis >= rank {
        return Err(DeviceError::BadData(format!("softmax axis {axis} out of range for rank {rank}")));
    }
    let axis = axis as usize;
    let data = a.as_f32_vec()?;
    let axis_len = a.dimensions[axis] as usize;
    let inner: usize = a.dimensions[axis + 1..].iter().map(|&d| d as usize).product();
    let outer: usize = a.dimensions[..axis].iter().map(|&d| d as usize).product();

    let mut out = vec![0f32; data.len()];
    for o in 0..outer {
        for i in 0..inner {
            let at = |k: usize| o * axis_len * inner + k * inner + i;
            let max = (0..axis_len).map(|k| data[at(k)]).fold(f32::NEG_INFINITY, f32::max);
            let sum: f32 = (0..axis_len).map(|k| ((data[at(k)] - max) * beta).exp()).sum();
            for k in 0..axis_len {
                out[at(k)] = ((data[at(k)] - max) * beta).exp() / sum;
            }
        }
    }
    Ok(Value::from_f32_vec(out_ty, a.dimensions.clone(), out))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn tensor(dims: &[u32], data: &[f32]) -> Value {
        Value::from_f32_vec(OperandType::TensorFloat32, dims.to_vec(), data.to_vec())
    }

    #[rstest]
    #[case(OperationType::Add, &[5.0, 7.0])]
    #[case(OperationType::Sub, &[-1.0, -1.0])]
    #[case(OperationType::Mul, &[6.0, 12.0])]
    fn arithmetic_elementwise(#[case] ty: OperationType, #[case] expected: &[f32]) {
        let a = tensor(&[2], &[2.0, 3.0]);
        let b = tensor(&[2], &[3.0, 4.0]);
        let out = arithmetic(ty, &a, &b, OperandType::TensorFloat32).unwrap();
        assert_eq!(out.as_f32_vec().unwrap(), expected);
    }

    #[test]
    fn broadcast_scalar_against_matrix() {
        let a = tensor(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let b = Value::from_f32_vec(OperandType::Float32, vec![], vec![10.0]);
        let out = arithmetic(OperationType::Mul, &a, &b, OperandType::TensorFloat32).unwrap();
        assert_eq!(out.dimensions, vec![2, 2]);
        assert_eq!(out.as_f32_vec().unwrap(), vec![10.0, 20.0, 30.0, 40.0]);
    }

    #[test]
    fn broadcast_row_against_matrix() {
        let a = tensor(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let b = tensor(&[1, 2], &[10.0, 100.0]);
        let out = arithmetic(OperationType::Add, &a, &b, OperandType::TensorFloat32).unwrap();
        assert_eq!(out.as_f32_vec().unwrap(), vec![11.0, 102.0, 13.0, 104.0]);
    }

    #[test]
    fn incompatible_shapes_are_rejected() {
        let a = tensor(&[2], &[1.0, 2.0]);
        let b = tensor(&[3], &[1.0, 2.0, 3.0]);
        assert!(matches!(
            arithmetic(OperationType::Add, &a, &b, OperandType::TensorFloat32),
            Err(DeviceError::BadData(_))
        ));
    }

    #[test]
    fn compare_produces_bool8() {
        let a = tensor(&[3], &[1.0, 2.0, 3.0]);
        let b = tensor(&[3], &[2.0, 2.0, 2.0]);
        let out = compare(OperationType::Less, &a, &b).unwrap();
        assert_eq!(out.ty, OperandType::TensorBool8);
        assert_eq!(out.bytes, vec![1, 0, 0]);
    }

    #[test]
    fn softmax_last_axis_sums_to_one() {
        let a = tensor(&[2, 3], &[1.0, 2.0, 3.0, 1.0, 1.0, 1.0]);
        let out = softmax(&a, 1.0, -1, OperandType::TensorFloat32).unwrap();
        let data = out.as_f32_vec().unwrap();
        let row0: f32 = data[..3].iter().sum();
        let row1: f32 = data[3..].iter().sum();
        assert!((row0 - 1.0).abs() < 1e-6);
        assert!((row1 - 1.0).abs() < 1e-6);
        assert!((data[3] - 1.0 / 3.0).abs() < 1e-6);
    }
}
