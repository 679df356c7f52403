pub mod alias;
pub mod builder;
pub mod call_graph;
pub mod dataflow;
pub mod inst;
pub mod ir_writer;
pub mod module;
pub mod types;

pub use alias::{AliasAnalysis, BufferId};
pub use builder::{CompBuilder, ModuleBuilder};
pub use call_graph::{CallGraph, CallKind, CallSite};
pub use dataflow::{Dataflow, Position, Use, ValueData, ValueId};
pub use inst::{Attrs, InstData, InstId, Opcode, SliceRange};
pub use ir_writer::{DisplayInst, ModuleWriter};
pub use module::{CompId, Computation, Module};
pub use types::{ArrayShape, PrimitiveType, Shape, ShapeIndex, DEFAULT_MEMORY_SPACE};
