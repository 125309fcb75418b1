use std::sync::Arc;

use smallvec::SmallVec;

use crate::{
    error::ModelError,
    memory::Memory,
    operand::{ChannelQuant, Operand, OperandLifetime, OperandLocation, OperandType},
    operation::{Operation, OperationType, if_op, while_op},
};

// CONSTANTS
// ================================================================================================

/// Constant values at or below this size are copied into the model's inline
/// constant pool; larger values are spilled to an owned memory region and
/// referenced instead.
pub const MAX_INLINE_CONSTANT_LEN: u32 = 128;

// MODEL
// ================================================================================================

/// A finished, immutable computation graph.
///
/// A model owns one graph (operands, operations in execution order, external
/// input/output lists), an inline constant pool, the memory regions backing
/// its by-reference constants, and the models referenced by its subgraph
/// operands. Models referenced from control-flow operations are ordinary
/// models in their own right.
#[derive(Debug)]
pub struct Model {
    operands: Vec<Operand>,
    operations: Vec<Operation>,
    input_indexes: Vec<u32>,
    output_indexes: Vec<u32>,
    constant_pool: Vec<u8>,
    memories: Vec<Arc<Memory>>,
    referenced: Vec<Arc<Model>>,
    relax_float32_to_float16: bool,
}

impl Model {
    pub fn operands(&self) -> &[Operand] {
        &self.operands
    }

    pub fn operand_count(&self) -> u32 {
        self.operands.len() as u32
    }

    pub fn operand(&self, index: u32) -> &Operand {
        &self.operands[index as usize]
    }

    /// Operations in execution order.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn operation_count(&self) -> u32 {
        self.operations.len() as u32
    }

    pub fn operation(&self, index: u32) -> &Operation {
        &self.operations[index as usize]
    }

    pub fn input_indexes(&self) -> &[u32] {
        &self.input_indexes
    }

    pub fn output_indexes(&self) -> &[u32] {
        &self.output_indexes
    }

    pub fn input_count(&self) -> u32 {
        self.input_indexes.len() as u32
    }

    pub fn output_count(&self) -> u32 {
        self.output_indexes.len() as u32
    }

    pub fn input_operand_index(&self, input: u32) -> u32 {
        self.input_indexes[input as usize]
    }

    pub fn output_operand_index(&self, output: u32) -> u32 {
        self.output_indexes[output as usize]
    }

    pub fn input_operand(&self, input: u32) -> &Operand {
        self.operand(self.input_operand_index(input))
    }

    pub fn output_operand(&self, output: u32) -> &Operand {
        self.operand(self.output_operand_index(output))
    }

    pub fn memories(&self) -> &[Arc<Memory>] {
        &self.memories
    }

    pub fn referenced_models(&self) -> &[Arc<Model>] {
        &self.referenced
    }

    /// The model referenced by a subgraph operand.
    pub fn referenced_model(&self, operand: &Operand) -> Option<&Arc<Model>> {
        match operand.location {
            OperandLocation::Graph(index) => self.referenced.get(index as usize),
            _ => None,
        }
    }

    /// The inline constant bytes of a constant-copy operand.
    pub fn operand_value(&self, operand: &Operand) -> Option<&[u8]> {
        match (operand.lifetime, operand.location) {
            (OperandLifetime::ConstantCopy, OperandLocation::Pool { offset, length }) => {
                self.constant_pool.get(offset as usize..(offset + length) as usize)
            },
            _ => None,
        }
    }

    /// The memory window of a constant-reference operand.
    pub fn constant_reference(&self, operand: &Operand) -> Option<(&Arc<Memory>, u32, u32)> {
        match (operand.lifetime, operand.location) {
            (OperandLifetime::ConstantReference, OperandLocation::Memory { pool, offset, length }) => {
                self.memories.get(pool as usize).map(|memory| (memory, offset, length))
            },
            _ => None,
        }
    }

    pub fn is_relaxed_float32_to_float16(&self) -> bool {
        self.relax_float32_to_float16
    }

    /// Returns true if the model's main graph has no operations.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

// MODEL BUILDER
// ================================================================================================

/// Incremental construction of a [`Model`].
///
/// The planner uses the same builder to synthesise step models that clients
/// use to describe their graphs. `finish` validates the graph, sorts its
/// operations into execution order, and yields the immutable model;
/// consuming the builder makes a second finish unrepresentable.
#[derive(Debug, Default)]
pub struct ModelBuilder {
    operands: Vec<Operand>,
    operations: Vec<Operation>,
    input_indexes: Vec<u32>,
    output_indexes: Vec<u32>,
    constant_pool: Vec<u8>,
    memories: Vec<Arc<Memory>>,
    referenced: Vec<Arc<Model>>,
    relax_float32_to_float16: bool,
    identified: bool,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operand_count(&self) -> u32 {
        self.operands.len() as u32
    }

    pub fn operation_count(&self) -> u32 {
        self.operations.len() as u32
    }

    pub fn operand(&self, index: u32) -> &Operand {
        &self.operands[index as usize]
    }

    pub fn operation(&self, index: u32) -> &Operation {
        &self.operations[index as usize]
    }

    /// The inline constant bytes of a constant-copy operand.
    pub fn operand_value(&self, operand: &Operand) -> Option<&[u8]> {
        match (operand.lifetime, operand.location) {
            (OperandLifetime::ConstantCopy, OperandLocation::Pool { offset, length }) => {
                self.constant_pool.get(offset as usize..(offset + length) as usize)
            },
            _ => None,
        }
    }

    /// Adds an operand of the given type and shape, returning its index.
    /// The operand starts out as a transient temporary with no value.
    pub fn add_operand(&mut self, ty: OperandType, dimensions: &[u32]) -> u32 {
        let index = self.operands.len() as u32;
        self.operands.push(Operand {
            ty,
            dimensions: SmallVec::from_slice(dimensions),
            scale: 0.0,
            zero_point: 0,
            channel_quant: None,
            lifetime: OperandLifetime::Temporary,
            location: OperandLocation::None,
        });
        index
    }

    /// Adds an operand with the same type, shape, and quantisation as an
    /// existing operand description, but no lifetime or value.
    pub fn add_operand_like(&mut self, operand: &Operand) -> u32 {
        let index = self.add_operand(operand.ty, &operand.dimensions);
        let target = &mut self.operands[index as usize];
        target.scale = operand.scale;
        target.zero_point = operand.zero_point;
        target.channel_quant = operand.channel_quant.clone();
        index
    }

    pub fn set_operand_quant(
        &mut self,
        index: u32,
        scale: f32,
        zero_point: i32,
    ) -> Result<(), ModelError> {
        let operand = self.operand_mut(index)?;
        operand.scale = scale;
        operand.zero_point = zero_point;
        Ok(())
    }

    pub fn set_operand_channel_quant(
        &mut self,
        index: u32,
        channel_quant: ChannelQuant,
    ) -> Result<(), ModelError> {
        self.operand_mut(index)?.channel_quant = Some(channel_quant);
        Ok(())
    }

    /// Gives an operand a constant value. Small values are copied into the
    /// inline constant pool; values above [`MAX_INLINE_CONSTANT_LEN`] bytes
    /// are spilled to an owned memory region and referenced.
    pub fn set_operand_value(&mut self, index: u32, value: &[u8]) -> Result<(), ModelError> {
        self.check_fresh(index)?;
        let operand = self.operand(index);
        if let Some(expected) = operand.byte_size()
            && expected != value.len() as u32
        {
            return Err(ModelError::OperandValueLengthMismatch {
                index,
                expected,
                actual: value.len() as u32,
            });
        }
        if value.len() as u32 > MAX_INLINE_CONSTANT_LEN {
            let memory = Memory::from_bytes(value.to_vec());
            let pool = self.intern_memory(memory);
            let operand = &mut self.operands[index as usize];
            operand.lifetime = OperandLifetime::ConstantReference;
            operand.location =
                OperandLocation::Memory { pool, offset: 0, length: value.len() as u32 };
        } else {
            // Keep pool windows word-aligned so typed reads stay aligned.
            while self.constant_pool.len() % 4 != 0 {
                self.constant_pool.push(0);
            }
            let offset = self.constant_pool.len() as u32;
            self.constant_pool.extend_from_slice(value);
            let operand = &mut self.operands[index as usize];
            operand.lifetime = OperandLifetime::ConstantCopy;
            operand.location = OperandLocation::Pool { offset, length: value.len() as u32 };
        }
        Ok(())
    }

    /// Gives an operand a constant value living in an external memory region.
    pub fn set_operand_value_from_memory(
        &mut self,
        index: u32,
        memory: Arc<Memory>,
        offset: u32,
        length: u32,
    ) -> Result<(), ModelError> {
        self.check_fresh(index)?;
        if offset.checked_add(length).is_none_or(|end| end > memory.size()) {
            return Err(ModelError::MemoryWindowOutOfRange {
                offset,
                length,
                size: memory.size(),
            });
        }
        let operand = self.operand(index);
        if let Some(expected) = operand.byte_size()
            && expected != length
        {
            return Err(ModelError::OperandValueLengthMismatch { index, expected, actual: length });
        }
        let pool = self.intern_memory(memory);
        let operand = &mut self.operands[index as usize];
        operand.lifetime = OperandLifetime::ConstantReference;
        operand.location = OperandLocation::Memory { pool, offset, length };
        Ok(())
    }

    /// Marks an operand as an omitted optional argument.
    pub fn set_operand_no_value(&mut self, index: u32) -> Result<(), ModelError> {
        self.check_fresh(index)?;
        let operand = &mut self.operands[index as usize];
        operand.lifetime = OperandLifetime::NoValue;
        operand.location = OperandLocation::None;
        Ok(())
    }

    /// Makes an operand reference another (finished) model.
    pub fn set_operand_subgraph(
        &mut self,
        index: u32,
        model: Arc<Model>,
    ) -> Result<(), ModelError> {
        self.check_fresh(index)?;
        if self.operand(index).ty != OperandType::Subgraph {
            return Err(ModelError::SubgraphOperandWithoutGraph(index));
        }
        let graph = self.intern_referenced(model);
        let operand = &mut self.operands[index as usize];
        operand.lifetime = OperandLifetime::Subgraph;
        operand.location = OperandLocation::Graph(graph);
        Ok(())
    }

    pub fn add_operation(
        &mut self,
        ty: OperationType,
        inputs: &[u32],
        outputs: &[u32],
    ) -> Result<u32, ModelError> {
        for &index in inputs.iter().chain(outputs) {
            self.check_operand_index(index)?;
        }
        let index = self.operations.len() as u32;
        self.operations.push(Operation::new(ty, inputs.to_vec(), outputs.to_vec()));
        Ok(index)
    }

    /// Declares the graph's external inputs and outputs, in client binding
    /// order.
    pub fn identify_inputs_outputs(
        &mut self,
        inputs: &[u32],
        outputs: &[u32],
    ) -> Result<(), ModelError> {
        for &index in inputs {
            self.check_fresh(index)?;
            self.operands[index as usize].lifetime = OperandLifetime::GraphInput;
        }
        for &index in outputs {
            self.check_operand_index(index)?;
            self.operands[index as usize].lifetime = OperandLifetime::GraphOutput;
        }
        self.input_indexes = inputs.to_vec();
        self.output_indexes = outputs.to_vec();
        self.identified = true;
        Ok(())
    }

    pub fn relax_computation_float32_to_float16(&mut self, relax: bool) {
        self.relax_float32_to_float16 = relax;
    }

    pub fn is_relaxed_float32_to_float16(&self) -> bool {
        self.relax_float32_to_float16
    }

    pub fn referenced_models(&self) -> &[Arc<Model>] {
        &self.referenced
    }

    /// Direct access to the operations for planner passes that rewrite
    /// operation argument lists before the builder is finished.
    pub fn operations_mut(&mut self) -> &mut [Operation] {
        &mut self.operations
    }

    /// Validates the graph, sorts operations into execution order, and
    /// produces the immutable model.
    pub fn finish(mut self) -> Result<Arc<Model>, ModelError> {
        if !self.identified {
            return Err(ModelError::InputsOutputsNotIdentified);
        }
        self.validate_operations()?;
        self.sort_into_run_order()?;
        tracing::debug!(
            operands = self.operands.len(),
            operations = self.operations.len(),
            referenced = self.referenced.len(),
            "model finished"
        );
        Ok(Arc::new(Model {
            operands: self.operands,
            operations: self.operations,
            input_indexes: self.input_indexes,
            output_indexes: self.output_indexes,
            constant_pool: self.constant_pool,
            memories: self.memories,
            referenced: self.referenced,
            relax_float32_to_float16: self.relax_float32_to_float16,
        }))
    }

    // VALIDATION
    // --------------------------------------------------------------------------------------------

    fn validate_operations(&self) -> Result<(), ModelError> {
        let mut writer: Vec<Option<u32>> = vec![None; self.operands.len()];
        for (operation_index, operation) in self.operations.iter().enumerate() {
            let operation_index = operation_index as u32;
            match operation.ty {
                OperationType::If => {
                    if operation.inputs.len() < if_op::FIRST_OUTER_INPUT {
                        return Err(ModelError::WrongOperationArity(
                            operation_index,
                            if_op::FIRST_OUTER_INPUT,
                            operation.inputs.len(),
                        ));
                    }
                    for slot in [if_op::THEN_GRAPH_INPUT, if_op::ELSE_GRAPH_INPUT] {
                        self.check_subgraph_input(operation_index, operation, slot)?;
                    }
                },
                OperationType::While => {
                    if operation.inputs.len() < while_op::FIRST_OUTER_INPUT {
                        return Err(ModelError::WrongOperationArity(
                            operation_index,
                            while_op::FIRST_OUTER_INPUT,
                            operation.inputs.len(),
                        ));
                    }
                    for slot in [while_op::CONDITION_GRAPH_INPUT, while_op::BODY_GRAPH_INPUT] {
                        self.check_subgraph_input(operation_index, operation, slot)?;
                    }
                },
                _ => {},
            }
            for &output in &operation.outputs {
                let operand = &self.operands[output as usize];
                if !matches!(
                    operand.lifetime,
                    OperandLifetime::Temporary | OperandLifetime::GraphOutput
                ) {
                    return Err(ModelError::OperandAlreadyHasValue(output, operand.lifetime));
                }
                if writer[output as usize].replace(operation_index).is_some() {
                    return Err(ModelError::OperandWrittenTwice(output));
                }
            }
        }
        for &output in &self.output_indexes {
            if writer[output as usize].is_none() {
                return Err(ModelError::GraphOutputNeverWritten(output));
            }
        }
        Ok(())
    }

    fn check_subgraph_input(
        &self,
        operation_index: u32,
        operation: &Operation,
        slot: usize,
    ) -> Result<(), ModelError> {
        let operand = &self.operands[operation.inputs[slot] as usize];
        if operand.lifetime != OperandLifetime::Subgraph {
            return Err(ModelError::ControlFlowInputNotSubgraph(operation_index, slot));
        }
        Ok(())
    }

    /// Ready-queue topological sort; the sorted order is the execution order.
    fn sort_into_run_order(&mut self) -> Result<(), ModelError> {
        let operation_count = self.operations.len();
        let mut consumers: Vec<Vec<u32>> = vec![Vec::new(); self.operands.len()];
        let mut unknown_inputs = vec![0u32; operation_count];
        let mut ready: Vec<u32> = Vec::new();
        for (operation_index, operation) in self.operations.iter().enumerate() {
            let mut count = 0;
            for &input in &operation.inputs {
                let lifetime = self.operands[input as usize].lifetime;
                if matches!(lifetime, OperandLifetime::Temporary | OperandLifetime::GraphOutput) {
                    count += 1;
                    consumers[input as usize].push(operation_index as u32);
                }
            }
            unknown_inputs[operation_index] = count;
            if count == 0 {
                ready.push(operation_index as u32);
            }
        }

        let mut run_order: Vec<Operation> = Vec::with_capacity(operation_count);
        let mut position = 0;
        while position < ready.len() {
            let operation_index = ready[position];
            position += 1;
            let operation = self.operations[operation_index as usize].clone();
            for &output in &operation.outputs {
                for &consumer in &consumers[output as usize] {
                    unknown_inputs[consumer as usize] -= 1;
                    if unknown_inputs[consumer as usize] == 0 {
                        ready.push(consumer);
                    }
                }
            }
            run_order.push(operation);
        }

        if run_order.len() != operation_count {
            return Err(ModelError::GraphContainsCycle);
        }
        self.operations = run_order;
        Ok(())
    }

    // HELPERS
    // --------------------------------------------------------------------------------------------

    fn operand_mut(&mut self, index: u32) -> Result<&mut Operand, ModelError> {
        self.check_operand_index(index)?;
        Ok(&mut self.operands[index as usize])
    }

    fn check_operand_index(&self, index: u32) -> Result<(), ModelError> {
        if index as usize >= self.operands.len() {
            return Err(ModelError::OperandIndexOutOfRange {
                index,
                count: self.operands.len() as u32,
            });
        }
        Ok(())
    }

    /// An operand may be given a value (or an input role) only while it is
    /// still a plain temporary.
    fn check_fresh(&self, index: u32) -> Result<(), ModelError> {
        self.check_operand_index(index)?;
        let operand = self.operand(index);
        if operand.lifetime != OperandLifetime::Temporary {
            return Err(ModelError::OperandAlreadyHasValue(index, operand.lifetime));
        }
        Ok(())
    }

    fn intern_memory(&mut self, memory: Arc<Memory>) -> u32 {
        if let Some(pool) = self.memories.iter().position(|m| Arc::ptr_eq(m, &memory)) {
            return pool as u32;
        }
        self.memories.push(memory);
        (self.memories.len() - 1) as u32
    }

    fn intern_referenced(&mut self, model: Arc<Model>) -> u32 {
        if let Some(graph) = self.referenced.iter().position(|m| Arc::ptr_eq(m, &model)) {
            return graph as u32;
        }
        self.referenced.push(model);
        (self.referenced.len() - 1) as u32
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn float_scalar(builder: &mut ModelBuilder, value: f32) -> u32 {
        let index = builder.add_operand(OperandType::Float32, &[]);
        builder.set_operand_value(index, &value.to_le_bytes()).unwrap();
        index
    }

    #[test]
    fn simple_model_round_trip() {
        let mut builder = ModelBuilder::new();
        let a = builder.add_operand(OperandType::TensorFloat32, &[2]);
        let b = builder.add_operand(OperandType::TensorFloat32, &[2]);
        let out = builder.add_operand(OperandType::TensorFloat32, &[2]);
        builder.add_operation(OperationType::Add, &[a, b], &[out]).unwrap();
        builder.identify_inputs_outputs(&[a, b], &[out]).unwrap();
        let model = builder.finish().unwrap();

        assert_eq!(model.operand_count(), 3);
        assert_eq!(model.operation_count(), 1);
        assert_eq!(model.input_indexes(), &[a, b]);
        assert_eq!(model.output_indexes(), &[out]);
        assert_eq!(model.operand(out).lifetime, OperandLifetime::GraphOutput);
    }

    #[test]
    fn operations_are_sorted_into_run_order() {
        // Add the operations out of dependency order; finish must reorder.
        let mut builder = ModelBuilder::new();
        let a = builder.add_operand(OperandType::TensorFloat32, &[2]);
        let t = builder.add_operand(OperandType::TensorFloat32, &[2]);
        let out = builder.add_operand(OperandType::TensorFloat32, &[2]);
        builder.add_operation(OperationType::Relu, &[t], &[out]).unwrap();
        builder.add_operation(OperationType::Mul, &[a, a], &[t]).unwrap();
        builder.identify_inputs_outputs(&[a], &[out]).unwrap();
        let model = builder.finish().unwrap();

        assert_eq!(model.operation(0).ty, OperationType::Mul);
        assert_eq!(model.operation(1).ty, OperationType::Relu);
    }

    #[test]
    fn cycle_is_rejected() {
        let mut builder = ModelBuilder::new();
        let a = builder.add_operand(OperandType::TensorFloat32, &[2]);
        let b = builder.add_operand(OperandType::TensorFloat32, &[2]);
        let out = builder.add_operand(OperandType::TensorFloat32, &[2]);
        builder.add_operation(OperationType::Relu, &[b], &[a]).unwrap();
        builder.add_operation(OperationType::Relu, &[a], &[b]).unwrap();
        builder.add_operation(OperationType::Relu, &[a], &[out]).unwrap();
        builder.identify_inputs_outputs(&[], &[out]).unwrap();
        assert_eq!(builder.finish().unwrap_err(), ModelError::GraphContainsCycle);
    }

    #[test]
    fn small_constant_goes_to_inline_pool() {
        let mut builder = ModelBuilder::new();
        let c = float_scalar(&mut builder, 1.5);
        let operand = builder.operand(c).clone();
        assert_eq!(operand.lifetime, OperandLifetime::ConstantCopy);
        assert_eq!(
            builder.operand_value(&operand).unwrap(),
            1.5f32.to_le_bytes().as_slice()
        );
    }

    #[test]
    fn large_constant_spills_to_memory() {
        let mut builder = ModelBuilder::new();
        let c = builder.add_operand(OperandType::TensorFloat32, &[64]);
        builder.set_operand_value(c, &[0u8; 256]).unwrap();
        assert_eq!(builder.operand(c).lifetime, OperandLifetime::ConstantReference);
    }

    #[test]
    fn constant_length_mismatch_is_rejected() {
        let mut builder = ModelBuilder::new();
        let c = builder.add_operand(OperandType::Float32, &[]);
        let err = builder.set_operand_value(c, &[0u8; 7]).unwrap_err();
        assert_eq!(
            err,
            ModelError::OperandValueLengthMismatch { index: c, expected: 4, actual: 7 }
        );
    }

    #[test]
    fn double_write_is_rejected() {
        let mut builder = ModelBuilder::new();
        let a = builder.add_operand(OperandType::TensorFloat32, &[2]);
        let out = builder.add_operand(OperandType::TensorFloat32, &[2]);
        builder.add_operation(OperationType::Relu, &[a], &[out]).unwrap();
        builder.add_operation(OperationType::Relu, &[a], &[out]).unwrap();
        builder.identify_inputs_outputs(&[a], &[out]).unwrap();
        assert_eq!(builder.finish().unwrap_err(), ModelError::OperandWrittenTwice(out));
    }

    #[test]
    fn control_flow_requires_subgraph_operands() {
        let mut builder = ModelBuilder::new();
        let cond = builder.add_operand(OperandType::TensorBool8, &[1]);
        let then_graph = builder.add_operand(OperandType::Subgraph, &[]);
        let else_graph = builder.add_operand(OperandType::Subgraph, &[]);
        let x = builder.add_operand(OperandType::TensorFloat32, &[2]);
        let out = builder.add_operand(OperandType::TensorFloat32, &[2]);
        builder
            .add_operation(OperationType::If, &[cond, then_graph, else_graph, x], &[out])
            .unwrap();
        builder.identify_inputs_outputs(&[cond, x], &[out]).unwrap();
        assert_eq!(
            builder.finish().unwrap_err(),
            ModelError::ControlFlowInputNotSubgraph(0, if_op::THEN_GRAPH_INPUT)
        );
    }
}
