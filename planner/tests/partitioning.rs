//! Partitioning tests: plan structure, step-model boundary tables, cache
//! tokens, and failure handling.

use std::{path::PathBuf, sync::Arc};

use pretty_assertions::assert_eq;
use tessera_core::{
    CacheToken, Device, Model, ModelBuilder, OperandType, OperationType, SourceOperandIndex,
};
use tessera_fallback::SoftwareDevice;
use tessera_planner::{
    Compilation, CompileError, ExecutionPlan, LogicalStep, PartitioningMode, PlanBody,
};
use tessera_test_utils::MockDeviceBuilder;

// MODEL HELPERS
// ================================================================================================

/// `v2 = add(v0, v1); v4 = mul(v2, v3)` with all tensors of shape [2].
fn add_mul_model() -> Arc<Model> {
    let mut builder = ModelBuilder::new();
    let v0 = builder.add_operand(OperandType::TensorFloat32, &[2]);
    let v1 = builder.add_operand(OperandType::TensorFloat32, &[2]);
    let v2 = builder.add_operand(OperandType::TensorFloat32, &[2]);
    let v3 = builder.add_operand(OperandType::TensorFloat32, &[2]);
    let v4 = builder.add_operand(OperandType::TensorFloat32, &[2]);
    builder.add_operation(OperationType::Add, &[v0, v1], &[v2]).unwrap();
    builder.add_operation(OperationType::Mul, &[v2, v3], &[v4]).unwrap();
    builder.identify_inputs_outputs(&[v0, v1, v3], &[v4]).unwrap();
    builder.finish().unwrap()
}

/// A single-operation graph `out = <op>(x, y)` used as a control-flow branch.
fn binary_graph(op: OperationType) -> Arc<Model> {
    let mut builder = ModelBuilder::new();
    let x = builder.add_operand(OperandType::TensorFloat32, &[2]);
    let y = builder.add_operand(OperandType::TensorFloat32, &[2]);
    let out = builder.add_operand(OperandType::TensorFloat32, &[2]);
    builder.add_operation(op, &[x, y], &[out]).unwrap();
    builder.identify_inputs_outputs(&[x, y], &[out]).unwrap();
    builder.finish().unwrap()
}

/// `z = cond ? add(x, y) : mul(x, y)`.
fn if_model() -> Arc<Model> {
    let mut builder = ModelBuilder::new();
    let cond = builder.add_operand(OperandType::TensorBool8, &[1]);
    let then_ref = builder.add_operand(OperandType::Subgraph, &[]);
    let else_ref = builder.add_operand(OperandType::Subgraph, &[]);
    let x = builder.add_operand(OperandType::TensorFloat32, &[2]);
    let y = builder.add_operand(OperandType::TensorFloat32, &[2]);
    let z = builder.add_operand(OperandType::TensorFloat32, &[2]);
    builder.set_operand_subgraph(then_ref, binary_graph(OperationType::Add)).unwrap();
    builder.set_operand_subgraph(else_ref, binary_graph(OperationType::Mul)).unwrap();
    builder
        .add_operation(OperationType::If, &[cond, then_ref, else_ref, x, y], &[z])
        .unwrap();
    builder.identify_inputs_outputs(&[cond, x, y], &[z]).unwrap();
    builder.finish().unwrap()
}

/// `f_out = while (greater(f, limit)) { f = mul(f, 0.5) }`.
fn while_model() -> Arc<Model> {
    let cond = {
        let mut builder = ModelBuilder::new();
        let f = builder.add_operand(OperandType::TensorFloat32, &[1]);
        let limit = builder.add_operand(OperandType::TensorFloat32, &[1]);
        let out = builder.add_operand(OperandType::TensorBool8, &[1]);
        builder.add_operation(OperationType::Greater, &[f, limit], &[out]).unwrap();
        builder.identify_inputs_outputs(&[f, limit], &[out]).unwrap();
        builder.finish().unwrap()
    };
    let body = {
        let mut builder = ModelBuilder::new();
        let f = builder.add_operand(OperandType::TensorFloat32, &[1]);
        let _limit = builder.add_operand(OperandType::TensorFloat32, &[1]);
        let half = builder.add_operand(OperandType::TensorFloat32, &[1]);
        let out = builder.add_operand(OperandType::TensorFloat32, &[1]);
        builder.set_operand_value(half, &0.5f32.to_le_bytes()).unwrap();
        builder.add_operation(OperationType::Mul, &[f, half], &[out]).unwrap();
        builder.identify_inputs_outputs(&[f, _limit], &[out]).unwrap();
        builder.finish().unwrap()
    };
    let mut builder = ModelBuilder::new();
    let cond_ref = builder.add_operand(OperandType::Subgraph, &[]);
    let body_ref = builder.add_operand(OperandType::Subgraph, &[]);
    let f = builder.add_operand(OperandType::TensorFloat32, &[1]);
    let limit = builder.add_operand(OperandType::TensorFloat32, &[1]);
    let f_out = builder.add_operand(OperandType::TensorFloat32, &[1]);
    builder.set_operand_subgraph(cond_ref, cond).unwrap();
    builder.set_operand_subgraph(body_ref, body).unwrap();
    builder
        .add_operation(OperationType::While, &[cond_ref, body_ref, f, limit], &[f_out])
        .unwrap();
    builder.identify_inputs_outputs(&[f, limit], &[f_out]).unwrap();
    builder.finish().unwrap()
}

fn compile(model: Arc<Model>, devices: Vec<Arc<dyn Device>>) -> Arc<ExecutionPlan> {
    let mut compilation = Compilation::new(model, devices).unwrap();
    compilation.finish().unwrap();
    Arc::clone(compilation.plan().unwrap())
}

fn source_operands(pairs: &[(u32, u32)]) -> Vec<u32> {
    pairs.iter().map(|&(source, _)| source).collect()
}

// PLAN STRUCTURE
// ================================================================================================

#[test]
fn two_operations_two_devices() {
    let device_a = MockDeviceBuilder::new("mock-a").supporting([OperationType::Add]).build();
    let device_b = MockDeviceBuilder::new("mock-b").supporting([OperationType::Mul]).build();
    let plan = compile(
        add_mul_model(),
        vec![device_a, device_b, SoftwareDevice::new()],
    );

    let steps = plan.steps();
    assert_eq!(steps.len(), 2);

    let first = steps[0].as_execution().unwrap();
    assert_eq!(first.device().name(), "mock-a");
    assert_eq!(source_operands(first.model_inputs()), vec![0, 1]);
    assert!(first.model_outputs().is_empty());
    assert_eq!(first.temps_as_step_outputs().keys().copied().collect::<Vec<_>>(), vec![2]);

    let second = steps[1].as_execution().unwrap();
    assert_eq!(second.device().name(), "mock-b");
    assert_eq!(source_operands(second.model_inputs()), vec![3]);
    assert_eq!(source_operands(second.temps_as_step_inputs()), vec![2]);
    assert_eq!(source_operands(second.model_outputs()), vec![4]);
    // External input order: main-model inputs first, then temporaries.
    assert_eq!(source_operands(second.step_model_inputs()), vec![3, 2]);
    assert_eq!(source_operands(second.step_model_outputs()), vec![4]);
}

#[test]
fn single_capable_device_yields_simple_plan() {
    let device = MockDeviceBuilder::new("mock-a")
        .supporting([OperationType::Add, OperationType::Mul])
        .build();
    let plan = compile(add_mul_model(), vec![device, SoftwareDevice::new()]);
    let PlanBody::Simple(simple) = plan.body() else {
        panic!("expected a simple plan, got {plan:?}");
    };
    assert_eq!(simple.device.name(), "mock-a");
}

#[test]
fn fallback_only_device_list_yields_simple_plan() {
    let plan = compile(add_mul_model(), vec![SoftwareDevice::new()]);
    assert!(plan.is_simple());
    assert!(plan.is_simple_on_fallback());
}

#[test]
fn empty_model_yields_empty_plan() {
    let mut builder = ModelBuilder::new();
    builder.identify_inputs_outputs(&[], &[]).unwrap();
    let plan = compile(builder.finish().unwrap(), vec![SoftwareDevice::new()]);
    assert!(plan.is_empty());
}

#[test]
fn if_plan_layout() {
    let device_a = MockDeviceBuilder::new("mock-a").supporting([OperationType::Add]).build();
    let device_b = MockDeviceBuilder::new("mock-b").supporting([OperationType::Mul]).build();
    let plan = compile(if_model(), vec![device_a, device_b, SoftwareDevice::new()]);

    // if @0, then @1, goto @2 -> 4, else @3; exit at 4 == step count.
    let steps = plan.steps();
    assert_eq!(steps.len(), 4);
    let if_step = steps[0].as_if().unwrap();
    assert_eq!(if_step.then_step_index, 1);
    assert_eq!(if_step.else_step_index, 3);
    assert_eq!(if_step.condition_operand, SourceOperandIndex::new(0, 0));
    assert_eq!(
        if_step.outer_inputs,
        vec![SourceOperandIndex::new(0, 3), SourceOperandIndex::new(0, 4)]
    );
    assert_eq!(if_step.outer_outputs, vec![SourceOperandIndex::new(0, 5)]);
    assert_eq!(if_step.then_branch_inputs.len(), 2);
    assert_eq!(if_step.else_branch_inputs.len(), 2);

    assert_eq!(steps[1].as_execution().unwrap().device().name(), "mock-a");
    assert_eq!(steps[2].as_goto().unwrap().target_step_index, 4);
    assert_eq!(steps[3].as_execution().unwrap().device().name(), "mock-b");
}

#[test]
fn while_plan_layout() {
    let plan = compile(while_model(), vec![SoftwareDevice::new()]);

    // while @0, cond @1, goto @2 -> 0, body @3, goto @4 -> 0; exit at 5.
    let steps = plan.steps();
    assert_eq!(steps.len(), 5);
    let while_step = steps[0].as_while().unwrap();
    assert_eq!(while_step.cond_step_index, 1);
    assert_eq!(while_step.body_step_index, 3);
    assert_eq!(while_step.exit_step_index, 5);
    assert_eq!(while_step.outer_inputs.len(), 2);
    assert_eq!(while_step.cond_inputs.len(), 2);
    assert_eq!(while_step.body_outputs.len(), 1);
    assert!(steps[1].is_execution());
    assert_eq!(steps[2].as_goto().unwrap().target_step_index, 0);
    assert!(steps[3].is_execution());
    assert_eq!(steps[4].as_goto().unwrap().target_step_index, 0);
}

#[test]
fn every_operation_lands_in_exactly_one_step() {
    let device_a = MockDeviceBuilder::new("mock-a").supporting([OperationType::Add]).build();
    let device_b = MockDeviceBuilder::new("mock-b").supporting([OperationType::Mul]).build();
    let plan = compile(
        add_mul_model(),
        vec![device_a, device_b, SoftwareDevice::new()],
    );
    let total_operations: u32 = plan
        .steps()
        .iter()
        .filter_map(LogicalStep::as_execution)
        .map(|step| step.model().operation_count())
        .sum();
    assert_eq!(total_operations, 2);
}

// CACHE TOKENS
// ================================================================================================

fn compile_with_token(
    devices: Vec<Arc<dyn Device>>,
    token: CacheToken,
    preference: tessera_core::ExecutionPreference,
) -> Arc<ExecutionPlan> {
    let mut compilation = Compilation::new(add_mul_model(), devices).unwrap();
    compilation.set_preference(preference).unwrap();
    compilation.set_caching(PathBuf::from("/tmp/tessera-cache"), token).unwrap();
    compilation.finish().unwrap();
    Arc::clone(compilation.plan().unwrap())
}

fn step_tokens(plan: &ExecutionPlan) -> Vec<CacheToken> {
    plan.steps()
        .iter()
        .filter_map(LogicalStep::as_execution)
        .map(|step| *step.cache_token().unwrap())
        .collect()
}

fn split_devices(name_a: &str) -> Vec<Arc<dyn Device>> {
    vec![
        MockDeviceBuilder::new(name_a).supporting([OperationType::Add]).build(),
        MockDeviceBuilder::new("mock-b").supporting([OperationType::Mul]).build(),
        SoftwareDevice::new(),
    ]
}

#[test]
fn cache_tokens_are_deterministic() {
    let token = CacheToken([9u8; 32]);
    let preference = tessera_core::ExecutionPreference::FastSingleAnswer;
    let first = compile_with_token(split_devices("mock-a"), token, preference);
    let second = compile_with_token(split_devices("mock-a"), token, preference);
    assert_eq!(step_tokens(&first), step_tokens(&second));
}

#[test]
fn cache_tokens_are_sensitive_to_device_and_options() {
    let token = CacheToken([9u8; 32]);
    let preference = tessera_core::ExecutionPreference::FastSingleAnswer;
    let base = step_tokens(&compile_with_token(split_devices("mock-a"), token, preference));

    // Renaming the first device changes its step's token and only that one.
    let renamed = step_tokens(&compile_with_token(split_devices("mock-x"), token, preference));
    assert_ne!(base[0], renamed[0]);
    assert_eq!(base[1], renamed[1]);

    // A different preference changes every step's token.
    let low_power = step_tokens(&compile_with_token(
        split_devices("mock-a"),
        token,
        tessera_core::ExecutionPreference::LowPower,
    ));
    assert_ne!(base[0], low_power[0]);
    assert_ne!(base[1], low_power[1]);

    // A different client token changes every step's token.
    let other_seed = step_tokens(&compile_with_token(
        split_devices("mock-a"),
        CacheToken([10u8; 32]),
        preference,
    ));
    assert_ne!(base[0], other_seed[0]);
    assert_ne!(base[1], other_seed[1]);
}

#[test]
fn branch_step_tokens_do_not_depend_on_runtime_data() {
    // Compiling the same IF model twice yields identical branch-step tokens;
    // the condition value is execution data and cannot affect them.
    let make = || {
        let devices: Vec<Arc<dyn Device>> = vec![
            MockDeviceBuilder::new("mock-a").supporting([OperationType::Add]).build(),
            MockDeviceBuilder::new("mock-b").supporting([OperationType::Mul]).build(),
            SoftwareDevice::new(),
        ];
        let mut compilation = Compilation::new(if_model(), devices).unwrap();
        compilation
            .set_caching(PathBuf::from("/tmp/tessera-cache"), CacheToken([3u8; 32]))
            .unwrap();
        compilation.finish().unwrap();
        step_tokens(compilation.plan().unwrap())
    };
    assert_eq!(make(), make());
}

// FAILURE HANDLING
// ================================================================================================

#[test]
fn finish_twice_is_rejected() {
    let mut compilation =
        Compilation::new(add_mul_model(), vec![SoftwareDevice::new()]).unwrap();
    compilation.finish().unwrap();
    assert!(matches!(compilation.finish(), Err(CompileError::AlreadyFinished)));
}

#[test]
fn plan_before_finish_is_rejected() {
    let compilation = Compilation::new(add_mul_model(), vec![SoftwareDevice::new()]).unwrap();
    assert!(matches!(compilation.plan(), Err(CompileError::NotFinished)));
}

#[test]
fn unsupported_operation_is_surfaced() {
    let mut builder = ModelBuilder::new();
    let x = builder.add_operand(OperandType::TensorFloat32, &[2]);
    let out = builder.add_operand(OperandType::TensorFloat32, &[2]);
    builder.add_operation(OperationType::Oem(7), &[x], &[out]).unwrap();
    builder.identify_inputs_outputs(&[x], &[out]).unwrap();
    let model = builder.finish().unwrap();

    let mut compilation = Compilation::new(model, vec![SoftwareDevice::new()]).unwrap();
    assert!(matches!(
        compilation.finish(),
        Err(CompileError::UnsupportedOperation { graph: 0, ty: OperationType::Oem(7) })
    ));
}

#[test]
fn prepare_failure_with_fallback_becomes_full_fallback_plan() {
    let failing = MockDeviceBuilder::new("mock-a")
        .supporting([OperationType::Add])
        .failing_prepare(tessera_core::DeviceError::OpFailed("no compiler".into()))
        .build();
    let device_b = MockDeviceBuilder::new("mock-b").supporting([OperationType::Mul]).build();
    let mut compilation =
        Compilation::new(add_mul_model(), vec![failing, device_b, SoftwareDevice::new()])
            .unwrap();
    compilation.finish().unwrap();
    assert!(compilation.plan().unwrap().is_simple_on_fallback());
}

#[test]
fn prepare_failure_without_fallback_is_surfaced() {
    let failing = MockDeviceBuilder::new("mock-a")
        .supporting([OperationType::Add])
        .failing_prepare(tessera_core::DeviceError::OpFailed("no compiler".into()))
        .build();
    let device_b = MockDeviceBuilder::new("mock-b").supporting([OperationType::Mul]).build();
    let mut compilation =
        Compilation::new(add_mul_model(), vec![failing, device_b, SoftwareDevice::new()])
            .unwrap();
    compilation.set_partitioning(PartitioningMode::WithoutFallback).unwrap();
    assert!(matches!(
        compilation.finish(),
        Err(CompileError::PrepareFailed { device, .. }) if device == "mock-a"
    ));
}

#[test]
fn dynamic_step_output_rejected_without_fallback() {
    // The temporary between the two steps has an unknown dimension.
    let model = {
        let mut builder = ModelBuilder::new();
        let v0 = builder.add_operand(OperandType::TensorFloat32, &[1, 0]);
        let v1 = builder.add_operand(OperandType::TensorFloat32, &[1, 0]);
        let v2 = builder.add_operand(OperandType::TensorFloat32, &[1, 0]);
        let v3 = builder.add_operand(OperandType::TensorFloat32, &[1, 0]);
        builder.add_operation(OperationType::Add, &[v0, v1], &[v2]).unwrap();
        builder.add_operation(OperationType::Mul, &[v2, v1], &[v3]).unwrap();
        builder.identify_inputs_outputs(&[v0, v1], &[v3]).unwrap();
        builder.finish().unwrap()
    };
    let devices: Vec<Arc<dyn Device>> = vec![
        MockDeviceBuilder::new("mock-a").supporting([OperationType::Add]).build(),
        MockDeviceBuilder::new("mock-b").supporting([OperationType::Mul]).build(),
        SoftwareDevice::new(),
    ];

    let mut strict = Compilation::new(Arc::clone(&model), devices.clone()).unwrap();
    strict.set_partitioning(PartitioningMode::WithoutFallback).unwrap();
    assert!(matches!(strict.finish(), Err(CompileError::DynamicOutputNotAllowed)));

    let mut lenient = Compilation::new(model, devices).unwrap();
    lenient.finish().unwrap();
    let PlanBody::Compound(compound) = lenient.plan().unwrap().body() else {
        panic!("expected a compound plan");
    };
    assert!(compound.has_dynamic_step_outputs);
}
