use std::fmt;

use cranelift_entity::{entity_impl, packed_option::ReservedValue};
use smallvec::SmallVec;
use smol_str::SmolStr;

use crate::{module::CompId, types::Shape};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstId(u32);
entity_impl!(InstId, "inst");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Parameter,
    Constant,

    Negate,
    Exp,
    Tanh,
    Sqrt,
    Copy,

    Add,
    Subtract,
    Multiply,
    Divide,
    Maximum,
    Minimum,
    Compare,

    Dot,
    Reduce,
    Broadcast,
    Concatenate,
    DynamicUpdateSlice,

    Tuple,
    GetTupleElement,
    Bitcast,

    While,
    Conditional,

    CopyStart,
    CopyDone,
    SliceStart,
    SliceDone,
    SliceConcat,
}

impl Opcode {
    pub const ALL: [Opcode; 29] = [
        Self::Parameter,
        Self::Constant,
        Self::Negate,
        Self::Exp,
        Self::Tanh,
        Self::Sqrt,
        Self::Copy,
        Self::Add,
        Self::Subtract,
        Self::Multiply,
        Self::Divide,
        Self::Maximum,
        Self::Minimum,
        Self::Compare,
        Self::Dot,
        Self::Reduce,
        Self::Broadcast,
        Self::Concatenate,
        Self::DynamicUpdateSlice,
        Self::Tuple,
        Self::GetTupleElement,
        Self::Bitcast,
        Self::While,
        Self::Conditional,
        Self::CopyStart,
        Self::CopyDone,
        Self::SliceStart,
        Self::SliceDone,
        Self::SliceConcat,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parameter => "parameter",
            Self::Constant => "constant",
            Self::Negate => "negate",
            Self::Exp => "exp",
            Self::Tanh => "tanh",
            Self::Sqrt => "sqrt",
            Self::Copy => "copy",
            Self::Add => "add",
            Self::Subtract => "subtract",
            Self::Multiply => "multiply",
            Self::Divide => "divide",
            Self::Maximum => "maximum",
            Self::Minimum => "minimum",
            Self::Compare => "compare",
            Self::Dot => "dot",
            Self::Reduce => "reduce",
            Self::Broadcast => "broadcast",
            Self::Concatenate => "concatenate",
            Self::DynamicUpdateSlice => "dynamic_update_slice",
            Self::Tuple => "tuple",
            Self::GetTupleElement => "get_tuple_element",
            Self::Bitcast => "bitcast",
            Self::While => "while",
            Self::Conditional => "conditional",
            Self::CopyStart => "copy_start",
            Self::CopyDone => "copy_done",
            Self::SliceStart => "slice_start",
            Self::SliceDone => "slice_done",
            Self::SliceConcat => "slice_concat",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.as_str() == s)
    }

    pub fn is_elementwise_unary(self) -> bool {
        matches!(
            self,
            Self::Negate | Self::Exp | Self::Tanh | Self::Sqrt | Self::Copy
        )
    }

    pub fn is_elementwise_binary(self) -> bool {
        matches!(
            self,
            Self::Add | Self::Subtract | Self::Multiply | Self::Divide | Self::Maximum | Self::Minimum
        )
    }

    /// Instructions whose output leaves are views of values defined elsewhere.
    /// Allocation never happens at these positions.
    pub fn is_trivial(self) -> bool {
        matches!(self, Self::Tuple | Self::GetTupleElement | Self::Bitcast)
    }

    pub fn is_async_start(self) -> bool {
        matches!(self, Self::CopyStart | Self::SliceStart)
    }

    pub fn is_async_done(self) -> bool {
        matches!(self, Self::CopyDone | Self::SliceDone)
    }

    pub fn calls_computations(self) -> bool {
        matches!(self, Self::While | Self::Conditional)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Half-open `[start, limit)` range of one dimension of a `slice_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SliceRange {
    pub start: u64,
    pub limit: u64,
}

impl SliceRange {
    pub fn new(start: u64, limit: u64) -> Self {
        Self { start, limit }
    }

    pub fn len(&self) -> u64 {
        self.limit - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.limit <= self.start
    }
}

impl fmt::Display for SliceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.start, self.limit)
    }
}

/// Optional attributes of an instruction. Which ones are present is dictated
/// by the opcode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Attrs {
    /// Parameter number.
    pub number: Option<u32>,
    /// Tuple index of `get_tuple_element`.
    pub index: Option<u32>,
    /// Dimension of `concatenate`, `reduce`, `slice_concat`.
    pub dim: Option<u32>,
    /// Per-dimension ranges of `slice_start`.
    pub slice: Option<Vec<SliceRange>>,
    /// Marks a `copy_start` that belongs to a cross-program prefetch.
    pub cross_program_prefetch: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct InstData {
    pub name: SmolStr,
    pub opcode: Opcode,
    pub operands: SmallVec<[InstId; 2]>,
    pub shape: Shape,
    pub attrs: Attrs,

    /// `[condition, body]` for `while`, the branches for `conditional`.
    pub called: SmallVec<[CompId; 2]>,

    pub(crate) comp: CompId,
}

impl InstData {
    pub fn new(name: impl Into<SmolStr>, opcode: Opcode, shape: Shape) -> Self {
        Self {
            name: name.into(),
            opcode,
            operands: SmallVec::new(),
            shape,
            attrs: Attrs::default(),
            called: SmallVec::new(),
            comp: CompId::reserved_value(),
        }
    }

    pub fn with_operands(mut self, operands: &[InstId]) -> Self {
        self.operands = operands.into();
        self
    }

    pub fn with_called(mut self, called: &[CompId]) -> Self {
        self.called = called.into();
        self
    }

    pub fn with_attrs(mut self, attrs: Attrs) -> Self {
        self.attrs = attrs;
        self
    }

    /// The computation this instruction is scheduled in.
    pub fn comp(&self) -> CompId {
        self.comp
    }

    pub fn while_condition(&self) -> Option<CompId> {
        (self.opcode == Opcode::While).then(|| self.called[0])
    }

    pub fn while_body(&self) -> Option<CompId> {
        (self.opcode == Opcode::While).then(|| self.called[1])
    }
}
