use core::fmt;

use derive_more::From;
use smallvec::SmallVec;

// SOURCE OPERAND INDEX
// ================================================================================================

/// Identifies an operand across the set of graphs taking part in one
/// compilation: the index of the graph in the plan's source registry paired
/// with the operand's index within that graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From)]
pub struct SourceOperandIndex {
    pub graph: u32,
    pub operand: u32,
}

impl SourceOperandIndex {
    pub const fn new(graph: u32, operand: u32) -> Self {
        Self { graph, operand }
    }
}

impl fmt::Display for SourceOperandIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.graph, self.operand)
    }
}

// OPERAND TYPE
// ================================================================================================

/// Element type of an operand.
///
/// Scalar types describe single values; tensor types describe n-dimensional
/// arrays. [`OperandType::Subgraph`] marks an operand that references another
/// graph (used by control-flow operations), and [`OperandType::TensorOem`]
/// carries a vendor-namespaced element type the runtime treats as opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OperandType {
    Float32,
    Float16,
    Int32,
    UInt32,
    Bool,
    TensorFloat32,
    TensorFloat16,
    TensorInt32,
    TensorQuant8Asymm,
    TensorQuant8Symm,
    TensorQuant8SymmPerChannel,
    TensorBool8,
    TensorOem(u16),
    Subgraph,
}

impl OperandType {
    /// Returns true if this type describes an n-dimensional array.
    pub fn is_tensor(&self) -> bool {
        matches!(
            self,
            Self::TensorFloat32
                | Self::TensorFloat16
                | Self::TensorInt32
                | Self::TensorQuant8Asymm
                | Self::TensorQuant8Symm
                | Self::TensorQuant8SymmPerChannel
                | Self::TensorBool8
                | Self::TensorOem(_)
        )
    }

    pub fn is_scalar(&self) -> bool {
        !self.is_tensor() && *self != Self::Subgraph
    }

    /// Size in bytes of a single element of this type, or `None` for types
    /// without a host-known element size (subgraph references, OEM types).
    pub fn element_size(&self) -> Option<u32> {
        match self {
            Self::Float32 | Self::Int32 | Self::UInt32 | Self::TensorFloat32 | Self::TensorInt32 => {
                Some(4)
            },
            Self::Float16 | Self::TensorFloat16 => Some(2),
            Self::Bool
            | Self::TensorQuant8Asymm
            | Self::TensorQuant8Symm
            | Self::TensorQuant8SymmPerChannel
            | Self::TensorBool8 => Some(1),
            Self::TensorOem(_) | Self::Subgraph => None,
        }
    }
}

// OPERAND
// ================================================================================================

/// How long an operand's value lives and who provides it. The lifetime
/// determines which [`OperandLocation`] variant is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandLifetime {
    /// A constant copied inline into the owning model's constant pool.
    ConstantCopy,
    /// A constant referenced inside an external memory region.
    ConstantReference,
    /// An external input of the graph, bound by the client at execution time.
    GraphInput,
    /// An external output of the graph, bound by the client at execution time.
    GraphOutput,
    /// An intermediate value produced and consumed within the graph.
    Temporary,
    /// An omitted optional argument.
    NoValue,
    /// A reference to another graph of the same model.
    Subgraph,
}

/// Where an operand's backing data can be found, for lifetimes that have any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperandLocation {
    #[default]
    None,
    /// A window of the owning model's inline constant pool.
    Pool { offset: u32, length: u32 },
    /// A window of one of the owning model's external memory regions.
    Memory { pool: u32, offset: u32, length: u32 },
    /// Index of a referenced graph.
    Graph(u32),
}

/// Per-channel quantisation parameters for
/// [`OperandType::TensorQuant8SymmPerChannel`] operands.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelQuant {
    pub channel_dim: u32,
    pub scales: Vec<f32>,
}

pub type Dimensions = SmallVec<[u32; 4]>;

/// Description of a single graph operand.
///
/// A dimension size of 0 means "unknown at model construction time"; an empty
/// dimension list on a tensor type means the rank itself is unknown.
#[derive(Debug, Clone, PartialEq)]
pub struct Operand {
    pub ty: OperandType,
    pub dimensions: Dimensions,
    pub scale: f32,
    pub zero_point: i32,
    pub channel_quant: Option<ChannelQuant>,
    pub lifetime: OperandLifetime,
    pub location: OperandLocation,
}

impl Operand {
    /// Returns true if the operand's full byte size cannot be computed from
    /// its declared type and dimensions alone.
    pub fn has_unknown_size(&self) -> bool {
        if self.ty.is_tensor() && self.dimensions.is_empty() {
            return true;
        }
        self.dimensions.contains(&0)
    }

    /// Total byte size of the operand, or `None` if any dimension is unknown
    /// or the element size is not host-known.
    pub fn byte_size(&self) -> Option<u32> {
        byte_size_of(self.ty, &self.dimensions)
    }
}

/// Computes the byte size of a value of the given type and shape.
pub fn byte_size_of(ty: OperandType, dimensions: &[u32]) -> Option<u32> {
    let element = ty.element_size()?;
    if ty.is_scalar() {
        return Some(element);
    }
    if dimensions.is_empty() || dimensions.contains(&0) {
        return None;
    }
    dimensions
        .iter()
        .try_fold(element, |acc, &dim| acc.checked_mul(dim))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_size_of_scalar_ignores_dimensions() {
        assert_eq!(byte_size_of(OperandType::Float32, &[]), Some(4));
        assert_eq!(byte_size_of(OperandType::Bool, &[]), Some(1));
    }

    #[test]
    fn byte_size_of_tensor_multiplies_dimensions() {
        assert_eq!(byte_size_of(OperandType::TensorFloat32, &[2, 3]), Some(24));
        assert_eq!(byte_size_of(OperandType::TensorBool8, &[7]), Some(7));
    }

    #[test]
    fn byte_size_of_unknown_dimension_is_none() {
        assert_eq!(byte_size_of(OperandType::TensorFloat32, &[1, 0]), None);
        assert_eq!(byte_size_of(OperandType::TensorFloat32, &[]), None);
    }

    #[test]
    fn unknown_size_detection() {
        let operand = Operand {
            ty: OperandType::TensorFloat32,
            dimensions: smallvec::smallvec![1, 0],
            scale: 0.0,
            zero_point: 0,
            channel_quant: None,
            lifetime: OperandLifetime::Temporary,
            location: OperandLocation::None,
        };
        assert!(operand.has_unknown_size());
    }
}
