//! Graph interpretation for the software back-end.

use std::time::Instant;

use tessera_core::{
    DeviceError, ExecuteConfig, Model, OutputShape, Request, RequestArgument,
    device::DEFAULT_LOOP_TIMEOUT,
    operand::{Operand, OperandLifetime, OperandType, byte_size_of},
    operation::{Operation, OperationType, if_op, while_op},
};
use tracing::trace;

use crate::kernels::{self, Value};

// EVALUATOR
// ================================================================================================

/// Drives one request through a model and reports the refined output shapes.
pub struct Evaluator;

impl Evaluator {
    pub fn run(
        model: &Model,
        request: &Request,
        config: &ExecuteConfig,
    ) -> Result<Vec<OutputShape>, DeviceError> {
        if request.inputs.len() != model.input_count() as usize {
            return Err(DeviceError::BadData(format!(
                "request has {} inputs, model expects {}",
                request.inputs.len(),
                model.input_count()
            )));
        }
        if request.outputs.len() != model.output_count() as usize {
            return Err(DeviceError::BadData(format!(
                "request has {} outputs, model expects {}",
                request.outputs.len(),
                model.output_count()
            )));
        }

        let inputs = (0..model.input_count())
            .map(|i| read_input(model, request, i))
            .collect::<Result<Vec<_>, _>>()?;

        let outputs = evaluate_graph(model, inputs, config)?;

        // Write each output back through its bound window; shapes are always
        // reported, even when a buffer turns out to be too small.
        let mut shapes = Vec::with_capacity(outputs.len());
        let mut all_sufficient = true;
        for (i, value) in outputs.iter().enumerate() {
            let RequestArgument::Pool { pool, offset, length, .. } = &request.outputs[i] else {
                return Err(DeviceError::BadData(format!("output {i} is not bound")));
            };
            let sufficient = value.bytes.len() as u32 <= *length;
            if sufficient {
                let memory = request.pools.get(*pool as usize).ok_or_else(|| {
                    DeviceError::BadData(format!("output {i} references missing pool {pool}"))
                })?;
                memory
                    .write(*offset, &value.bytes)
                    .map_err(|err| DeviceError::OpFailed(err.to_string()))?;
            } else {
                all_sufficient = false;
            }
            shapes.push(OutputShape {
                dimensions: value.dimensions.clone(),
                is_sufficient: sufficient,
            });
        }
        if !all_sufficient {
            return Err(DeviceError::OutputInsufficientSize(shapes));
        }
        Ok(shapes)
    }
}

fn read_input(model: &Model, request: &Request, input: u32) -> Result<Value, DeviceError> {
    let operand = model.input_operand(input);
    match &request.inputs[input as usize] {
        RequestArgument::NoValue => {
            Err(DeviceError::BadData(format!("input {input} has no value")))
        },
        RequestArgument::Pool { pool, offset, length, dimensions } => {
            let dims = merge_dimensions(&operand.dimensions, dimensions)
                .map_err(|reason| DeviceError::BadData(format!("input {input}: {reason}")))?;
            let Some(expected) = byte_size_of(operand.ty, &dims) else {
                return Err(DeviceError::BadData(format!(
                    "input {input} shape is not fully specified"
                )));
            };
            if expected != *length {
                return Err(DeviceError::BadData(format!(
                    "input {input} window is {length} bytes, shape requires {expected}"
                )));
            }
            let memory = request.pools.get(*pool as usize).ok_or_else(|| {
                DeviceError::BadData(format!("input {input} references missing pool {pool}"))
            })?;
            let bytes = memory
                .read(*offset, *length)
                .map_err(|err| DeviceError::OpFailed(err.to_string()))?;
            Ok(Value { ty: operand.ty, dimensions: dims, bytes })
        },
    }
}

/// Reconciles a declared shape with a per-argument override. Unknown declared
/// dimensions take the override; fully-specified dimensions must agree.
fn merge_dimensions(declared: &[u32], overridden: &[u32]) -> Result<Vec<u32>, String> {
    if overridden.is_empty() {
        return Ok(declared.to_vec());
    }
    if declared.is_empty() {
        return Ok(overridden.to_vec());
    }
    if declared.len() != overridden.len() {
        return Err(format!(
            "rank mismatch between declared {declared:?} and override {overridden:?}"
        ));
    }
    declared
        .iter()
        .zip(overridden)
        .map(|(&d, &o)| match (d, o) {
            (0, o) => Ok(o),
            (d, 0) => Ok(d),
            (d, o) if d == o => Ok(d),
            (d, o) => Err(format!("cannot override dimension {d} with {o}")),
        })
        .collect()
}

// GRAPH EVALUATION
// ================================================================================================

/// Evaluates a graph given materialised values for its external inputs and
/// returns the values of its external outputs.
fn evaluate_graph(
    model: &Model,
    inputs: Vec<Value>,
    config: &ExecuteConfig,
) -> Result<Vec<Value>, DeviceError> {
    let mut values: Vec<Option<Value>> = vec![None; model.operand_count() as usize];

    for (index, operand) in model.operands().iter().enumerate() {
        match operand.lifetime {
            OperandLifetime::ConstantCopy => {
                let bytes = model
                    .operand_value(operand)
                    .ok_or_else(|| DeviceError::BadData("constant without a value".into()))?;
                values[index] = Some(Value {
                    ty: operand.ty,
                    dimensions: operand.dimensions.to_vec(),
                    bytes: bytes.to_vec(),
                });
            },
            OperandLifetime::ConstantReference => {
                let (memory, offset, length) = model
                    .constant_reference(operand)
                    .ok_or_else(|| DeviceError::BadData("constant without a region".into()))?;
                let bytes = memory
                    .read(offset, length)
                    .map_err(|err| DeviceError::OpFailed(err.to_string()))?;
                values[index] = Some(Value {
                    ty: operand.ty,
                    dimensions: operand.dimensions.to_vec(),
                    bytes,
                });
            },
            _ => {},
        }
    }
    for (input, value) in model.input_indexes().iter().zip(inputs) {
        values[*input as usize] = Some(value);
    }

    for operation in model.operations() {
        execute_operation(model, &mut values, operation, config)?;
    }

    model
        .output_indexes()
        .iter()
        .map(|&output| {
            values[output as usize]
                .take()
                .ok_or_else(|| DeviceError::OpFailed(format!("output operand {output} never written")))
        })
        .collect()
}

fn execute_operation(
    model: &Model,
    values: &mut [Option<Value>],
    operation: &Operation,
    config: &ExecuteConfig,
) -> Result<(), DeviceError> {
    trace!(ty = %operation.ty, "executing operation");
    match operation.ty {
        OperationType::Add | OperationType::Sub | OperationType::Mul | OperationType::Div => {
            let out_ty = output_type(model, operation, 0);
            let result = kernels::arithmetic(
                operation.ty,
                value_of(values, operation.inputs[0])?,
                value_of(values, operation.inputs[1])?,
                out_ty,
            )?;
            store(model, values, operation.outputs[0], result)
        },
        OperationType::Equal
        | OperationType::NotEqual
        | OperationType::Greater
        | OperationType::GreaterEqual
        | OperationType::Less
        | OperationType::LessEqual => {
            let result = kernels::compare(
                operation.ty,
                value_of(values, operation.inputs[0])?,
                value_of(values, operation.inputs[1])?,
            )?;
            store(model, values, operation.outputs[0], result)
        },
        OperationType::LogicalAnd | OperationType::LogicalOr => {
            let result = kernels::logical_binary(
                operation.ty,
                value_of(values, operation.inputs[0])?,
                value_of(values, operation.inputs[1])?,
            )?;
            store(model, values, operation.outputs[0], result)
        },
        OperationType::LogicalNot => {
            let result = kernels::logical_not(value_of(values, operation.inputs[0])?)?;
            store(model, values, operation.outputs[0], result)
        },
        OperationType::Relu => {
            let out_ty = output_type(model, operation, 0);
            let result = kernels::relu(value_of(values, operation.inputs[0])?, out_ty)?;
            store(model, values, operation.outputs[0], result)
        },
        OperationType::Cast => {
            let out_ty = output_type(model, operation, 0);
            let result = kernels::cast(value_of(values, operation.inputs[0])?, out_ty)?;
            store(model, values, operation.outputs[0], result)
        },
        OperationType::Softmax => {
            let out_ty = output_type(model, operation, 0);
            let beta = value_of(values, operation.inputs[1])?.as_f32_vec()?[0];
            let axis = match optional_input(model, values, operation, 2) {
                Some(value) => value.as_i32_vec()?[0],
                None => -1,
            };
            let result =
                kernels::softmax(value_of(values, operation.inputs[0])?, beta, axis, out_ty)?;
            store(model, values, operation.outputs[0], result)
        },
        OperationType::If => execute_if(model, values, operation, config),
        OperationType::While => execute_while(model, values, operation, config),
        other => Err(DeviceError::OpFailed(format!("no software kernel for {other}"))),
    }
}

// CONTROL FLOW
// ================================================================================================

fn execute_if(
    model: &Model,
    values: &mut [Option<Value>],
    operation: &Operation,
    config: &ExecuteConfig,
) -> Result<(), DeviceError> {
    let condition = value_of(values, operation.inputs[if_op::CONDITION_INPUT])?.as_bool()?;
    let slot = if condition { if_op::THEN_GRAPH_INPUT } else { if_op::ELSE_GRAPH_INPUT };
    let branch = referenced_graph(model, operation, slot)?;

    let inputs = operation.inputs[if_op::FIRST_OUTER_INPUT..]
        .iter()
        .map(|&index| value_of(values, index).cloned())
        .collect::<Result<Vec<_>, _>>()?;
    let outputs = evaluate_graph(branch, inputs, config)?;
    for (&index, value) in operation.outputs.iter().zip(outputs) {
        store(model, values, index, value)?;
    }
    Ok(())
}

fn execute_while(
    model: &Model,
    values: &mut [Option<Value>],
    operation: &Operation,
    config: &ExecuteConfig,
) -> Result<(), DeviceError> {
    let cond_graph = referenced_graph(model, operation, while_op::CONDITION_GRAPH_INPUT)?;
    let body_graph = referenced_graph(model, operation, while_op::BODY_GRAPH_INPUT)?;

    let mut args = operation.inputs[while_op::FIRST_OUTER_INPUT..]
        .iter()
        .map(|&index| value_of(values, index).cloned())
        .collect::<Result<Vec<_>, _>>()?;

    let timeout = config.loop_timeout.unwrap_or(DEFAULT_LOOP_TIMEOUT);
    let started = Instant::now();
    loop {
        if started.elapsed() > timeout {
            return Err(DeviceError::MissedDeadlineTransient);
        }
        let condition = evaluate_graph(cond_graph, args.clone(), config)?
            .first()
            .ok_or_else(|| DeviceError::BadData("condition graph has no output".into()))?
            .as_bool()?;
        if !condition {
            break;
        }
        let outputs = evaluate_graph(body_graph, args.clone(), config)?;
        // Body outputs feed the leading loop-carried arguments; any remaining
        // arguments are input-only and keep their values.
        for (slot, value) in outputs.into_iter().enumerate() {
            args[slot] = value;
        }
    }

    for (&index, value) in operation.outputs.iter().zip(args) {
        store(model, values, index, value)?;
    }
    Ok(())
}

fn referenced_graph<'a>(
    model: &'a Model,
    operation: &Operation,
    slot: usize,
) -> Result<&'a Model, DeviceError> {
    let operand = model.operand(operation.inputs[slot]);
    model
        .referenced_model(operand)
        .map(|model| model.as_ref())
        .ok_or_else(|| DeviceError::BadData("control-flow input does not reference a graph".into()))
}

// HELPERS
// ================================================================================================

fn value_of(values: &[Option<Value>], index: u32) -> Result<&Value, DeviceError> {
    values[index as usize]
        .as_ref()
        .ok_or_else(|| DeviceError::OpFailed(format!("operand {index} has no value")))
}

/// An optional trailing argument: absent, or present with NoValue lifetime.
fn optional_input<'a>(
    model: &Model,
    values: &'a [Option<Value>],
    operation: &Operation,
    slot: usize,
) -> Option<&'a Value> {
    let index = *operation.inputs.get(slot)?;
    if model.operand(index).lifetime == OperandLifetime::NoValue {
        return None;
    }
    values[index as usize].as_ref()
}

fn output_type(model: &Model, operation: &Operation, output: usize) -> OperandType {
    model.operand(operation.outputs[output]).ty
}

/// Stores a computed value, reconciling its shape against the declared one:
/// unknown declared dimensions are refined, fully-specified dimensions must
/// not change.
fn store(
    model: &Model,
    values: &mut [Option<Value>],
    index: u32,
    value: Value,
) -> Result<(), DeviceError> {
    let operand: &Operand = model.operand(index);
    if !operand.dimensions.is_empty() || operand.ty.is_tensor() {
        check_refines(&operand.dimensions, &value.dimensions)
            .map_err(|reason| DeviceError::BadData(format!("operand {index}: {reason}")))?;
    }
    values[index as usize] = Some(value);
    Ok(())
}

fn check_refines(declared: &[u32], computed: &[u32]) -> Result<(), String> {
    if declared.is_empty() {
        return Ok(());
    }
    if declared.len() != computed.len() {
        return Err(format!("computed rank {} differs from declared {}", computed.len(), declared.len()));
    }
    for (&d, &c) in declared.iter().zip(computed) {
        if d != 0 && d != c {
            return Err(format!("computed dimension {c} conflicts with declared {d}"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use pretty_assertions::assert_eq;
    use tessera_core::{Memory, ModelBuilder, OperationType};

    use super::*;

    fn float_tensor_model() -> Arc<Model> {
        // out = relu(a + b)
        let mut builder = ModelBuilder::new();
        let a = builder.add_operand(OperandType::TensorFloat32, &[2]);
        let b = builder.add_operand(OperandType::TensorFloat32, &[2]);
        let t = builder.add_operand(OperandType::TensorFloat32, &[2]);
        let out = builder.add_operand(OperandType::TensorFloat32, &[2]);
        builder.add_operation(OperationType::Add, &[a, b], &[t]).unwrap();
        builder.add_operation(OperationType::Relu, &[t], &[out]).unwrap();
        builder.identify_inputs_outputs(&[a, b], &[out]).unwrap();
        builder.finish().unwrap()
    }

    fn pool_arg(pool: u32, offset: u32, length: u32) -> RequestArgument {
        RequestArgument::Pool { pool, offset, length, dimensions: vec![] }
    }

    fn write_f32s(memory: &Memory, offset: u32, data: &[f32]) {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        memory.write(offset, &bytes).unwrap();
    }

    fn read_f32s(memory: &Memory, offset: u32, count: usize) -> Vec<f32> {
        memory
            .read(offset, (count * 4) as u32)
            .unwrap()
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn add_then_relu() {
        let model = float_tensor_model();
        let pool = Memory::allocate(32);
        write_f32s(&pool, 0, &[1.0, -5.0]);
        write_f32s(&pool, 8, &[2.0, 2.0]);
        let request = Request {
            inputs: vec![pool_arg(0, 0, 8), pool_arg(0, 8, 8)],
            outputs: vec![pool_arg(0, 16, 8)],
            pools: vec![Arc::clone(&pool)],
        };
        let shapes = Evaluator::run(&model, &request, &ExecuteConfig::default()).unwrap();
        assert_eq!(shapes[0].dimensions, vec![2]);
        assert!(shapes[0].is_sufficient);
        assert_eq!(read_f32s(&pool, 16, 2), vec![3.0, 0.0]);
    }

    #[test]
    fn insufficient_output_buffer_reports_shapes() {
        let model = float_tensor_model();
        let pool = Memory::allocate(20);
        write_f32s(&pool, 0, &[1.0, 1.0]);
        write_f32s(&pool, 8, &[1.0, 1.0]);
        let request = Request {
            inputs: vec![pool_arg(0, 0, 8), pool_arg(0, 8, 8)],
            // Only 4 bytes bound for an 8-byte output.
            outputs: vec![pool_arg(0, 16, 4)],
            pools: vec![Arc::clone(&pool)],
        };
        let err = Evaluator::run(&model, &request, &ExecuteConfig::default()).unwrap_err();
        let DeviceError::OutputInsufficientSize(shapes) = err else {
            panic!("expected insufficient-size error, got {err:?}");
        };
        assert_eq!(shapes[0].dimensions, vec![2]);
        assert!(!shapes[0].is_sufficient);
    }

    #[test]
    fn while_loop_halves_until_condition() {
        // cond: less(f, limit); body: f' = mul(f, half). Runs on values
        // [f, limit, half] with one loop-carried output.
        let cond = {
            let mut builder = ModelBuilder::new();
            let f = builder.add_operand(OperandType::TensorFloat32, &[1]);
            let limit = builder.add_operand(OperandType::TensorFloat32, &[1]);
            let _half = builder.add_operand(OperandType::TensorFloat32, &[1]);
            let out = builder.add_operand(OperandType::TensorBool8, &[1]);
            builder.add_operation(OperationType::Greater, &[f, limit], &[out]).unwrap();
            builder.identify_inputs_outputs(&[f, limit, _half], &[out]).unwrap();
            builder.finish().unwrap()
        };
        let body = {
            let mut builder = ModelBuilder::new();
            let f = builder.add_operand(OperandType::TensorFloat32, &[1]);
            let _limit = builder.add_operand(OperandType::TensorFloat32, &[1]);
            let half = builder.add_operand(OperandType::TensorFloat32, &[1]);
            let out = builder.add_operand(OperandType::TensorFloat32, &[1]);
            builder.add_operation(OperationType::Mul, &[f, half], &[out]).unwrap();
            builder.identify_inputs_outputs(&[f, _limit, half], &[out]).unwrap();
            builder.finish().unwrap()
        };
        let main = {
            let mut builder = ModelBuilder::new();
            let cond_ref = builder.add_operand(OperandType::Subgraph, &[]);
            let body_ref = builder.add_operand(OperandType::Subgraph, &[]);
            let f = builder.add_operand(OperandType::TensorFloat32, &[1]);
            let limit = builder.add_operand(OperandType::TensorFloat32, &[1]);
            let half = builder.add_operand(OperandType::TensorFloat32, &[1]);
            let out = builder.add_operand(OperandType::TensorFloat32, &[1]);
            builder.set_operand_subgraph(cond_ref, cond).unwrap();
            builder.set_operand_subgraph(body_ref, body).unwrap();
            builder
                .add_operation(OperationType::While, &[cond_ref, body_ref, f, limit, half], &[out])
                .unwrap();
            builder.identify_inputs_outputs(&[f, limit, half], &[out]).unwrap();
            builder.finish().unwrap()
        };

        let pool = Memory::allocate(16);
        write_f32s(&pool, 0, &[16.0]); // f
        write_f32s(&pool, 4, &[1.0]); // limit
        write_f32s(&pool, 8, &[0.5]); // half
        let request = Request {
            inputs: vec![pool_arg(0, 0, 4), pool_arg(0, 4, 4), pool_arg(0, 8, 4)],
            outputs: vec![pool_arg(0, 12, 4)],
            pools: vec![Arc::clone(&pool)],
        };
        Evaluator::run(&main, &request, &ExecuteConfig::default()).unwrap();
        // 16 -> 8 -> 4 -> 2 -> 1; loop exits once f is no longer > 1.
        assert_eq!(read_f32s(&pool, 12, 1), vec![1.0]);
    }

    #[test]
    fn while_loop_times_out() {
        // cond: greater(f, limit) with f growing each iteration; never exits.
        let cond = {
            let mut builder = ModelBuilder::new();
            let f = builder.add_operand(OperandType::TensorFloat32, &[1]);
            let _two = builder.add_operand(OperandType::TensorFloat32, &[1]);
            let out = builder.add_operand(OperandType::TensorBool8, &[1]);
            let zero = builder.add_operand(OperandType::TensorFloat32, &[1]);
            builder.set_operand_value(zero, &0f32.to_le_bytes()).unwrap();
            builder.add_operation(OperationType::Greater, &[f, zero], &[out]).unwrap();
            builder.identify_inputs_outputs(&[f, _two], &[out]).unwrap();
            builder.finish().unwrap()
        };
        let body = {
            let mut builder = ModelBuilder::new();
            let f = builder.add_operand(OperandType::TensorFloat32, &[1]);
            let two = builder.add_operand(OperandType::TensorFloat32, &[1]);
            let out = builder.add_operand(OperandType::TensorFloat32, &[1]);
            builder.add_operation(OperationType::Mul, &[f, two], &[out]).unwrap();
            builder.identify_inputs_outputs(&[f, two], &[out]).unwrap();
            builder.finish().unwrap()
        };
        let main = {
            let mut builder = ModelBuilder::new();
            let cond_ref = builder.add_operand(OperandType::Subgraph, &[]);
            let body_ref = builder.add_operand(OperandType::Subgraph, &[]);
            let f = builder.add_operand(OperandType::TensorFloat32, &[1]);
            let two = builder.add_operand(OperandType::TensorFloat32, &[1]);
            let out = builder.add_operand(OperandType::TensorFloat32, &[1]);
            builder.set_operand_subgraph(cond_ref, cond).unwrap();
            builder.set_operand_subgraph(body_ref, body).unwrap();
            builder
                .add_operation(OperationType::While, &[cond_ref, body_ref, f, two], &[out])
                .unwrap();
            builder.identify_inputs_outputs(&[f, two], &[out]).unwrap();
            builder.finish().unwrap()
        };

        let pool = Memory::allocate(12);
        write_f32s(&pool, 0, &[1.0]);
        write_f32s(&pool, 4, &[2.0]);
        let request = Request {
            inputs: vec![pool_arg(0, 0, 4), pool_arg(0, 4, 4)],
            outputs: vec![pool_arg(0, 8, 4)],
            pools: vec![Arc::clone(&pool)],
        };
        let config = ExecuteConfig {
            loop_timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let err = Evaluator::run(&main, &request, &config).unwrap_err();
        assert_eq!(err, DeviceError::MissedDeadlineTransient);
    }
}
