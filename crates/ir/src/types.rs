//! Shapes of values flowing through a computation graph.
use std::fmt;

use smallvec::SmallVec;

/// Memory space tag of the default (large, slow) memory.
pub const DEFAULT_MEMORY_SPACE: i64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PrimitiveType {
    Pred,
    S8,
    S16,
    S32,
    S64,
    U8,
    U16,
    U32,
    U64,
    F16,
    Bf16,
    F32,
    F64,
}

impl PrimitiveType {
    pub fn byte_size(self) -> u64 {
        match self {
            Self::Pred | Self::S8 | Self::U8 => 1,
            Self::S16 | Self::U16 | Self::F16 | Self::Bf16 => 2,
            Self::S32 | Self::U32 | Self::F32 => 4,
            Self::S64 | Self::U64 | Self::F64 => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pred => "pred",
            Self::S8 => "s8",
            Self::S16 => "s16",
            Self::S32 => "s32",
            Self::S64 => "s64",
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::F16 => "f16",
            Self::Bf16 => "bf16",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let ty = match s {
            "pred" => Self::Pred,
            "s8" => Self::S8,
            "s16" => Self::S16,
            "s32" => Self::S32,
            "s64" => Self::S64,
            "u8" => Self::U8,
            "u16" => Self::U16,
            "u32" => Self::U32,
            "u64" => Self::U64,
            "f16" => Self::F16,
            "bf16" => Self::Bf16,
            "f32" => Self::F32,
            "f64" => Self::F64,
            _ => return None,
        };
        Some(ty)
    }
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dense array with an element type, dimensions and the memory space its
/// layout is coloured with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArrayShape {
    pub elem: PrimitiveType,
    pub dims: SmallVec<[u64; 4]>,
    pub memory_space: i64,
}

impl ArrayShape {
    pub fn new(elem: PrimitiveType, dims: &[u64]) -> Self {
        Self {
            elem,
            dims: dims.into(),
            memory_space: DEFAULT_MEMORY_SPACE,
        }
    }

    pub fn scalar(elem: PrimitiveType) -> Self {
        Self::new(elem, &[])
    }

    pub fn with_memory_space(mut self, memory_space: i64) -> Self {
        self.memory_space = memory_space;
        self
    }

    pub fn element_count(&self) -> u64 {
        self.dims.iter().product()
    }

    pub fn byte_size(&self) -> u64 {
        self.element_count() * self.elem.byte_size()
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

}

impl fmt::Display for ArrayShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.elem)?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{d}")?;
        }
        f.write_str("]")?;
        if self.memory_space != DEFAULT_MEMORY_SPACE {
            write!(f, "{{S({})}}", self.memory_space)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Shape {
    Array(ArrayShape),
    Tuple(Vec<Shape>),
}

impl Shape {
    pub fn array(elem: PrimitiveType, dims: &[u64]) -> Self {
        Self::Array(ArrayShape::new(elem, dims))
    }

    pub fn scalar(elem: PrimitiveType) -> Self {
        Self::Array(ArrayShape::scalar(elem))
    }

    pub fn tuple(elems: Vec<Shape>) -> Self {
        Self::Tuple(elems)
    }

    pub fn as_array(&self) -> Option<&ArrayShape> {
        match self {
            Self::Array(a) => Some(a),
            Self::Tuple(_) => None,
        }
    }

    pub fn tuple_elements(&self) -> &[Shape] {
        match self {
            Self::Tuple(elems) => elems,
            Self::Array(_) => &[],
        }
    }

    pub fn subshape(&self, index: &ShapeIndex) -> Option<&Shape> {
        let mut cur = self;
        for &i in index.iter() {
            cur = match cur {
                Self::Tuple(elems) => elems.get(i as usize)?,
                Self::Array(_) => return None,
            };
        }
        Some(cur)
    }

    pub fn subshape_mut(&mut self, index: &ShapeIndex) -> Option<&mut Shape> {
        let mut cur = self;
        for &i in index.iter() {
            cur = match cur {
                Self::Tuple(elems) => elems.get_mut(i as usize)?,
                Self::Array(_) => return None,
            };
        }
        Some(cur)
    }

    pub fn leaf(&self, index: &ShapeIndex) -> Option<&ArrayShape> {
        self.subshape(index).and_then(Shape::as_array)
    }

    pub fn leaf_mut(&mut self, index: &ShapeIndex) -> Option<&mut ArrayShape> {
        match self.subshape_mut(index)? {
            Self::Array(a) => Some(a),
            Self::Tuple(_) => None,
        }
    }

    /// All array leaves in depth-first order together with their index.
    pub fn leaves(&self) -> Vec<(ShapeIndex, &ArrayShape)> {
        let mut out = Vec::new();
        let mut prefix = ShapeIndex::empty();
        collect_leaves(self, &mut prefix, &mut out);
        out
    }

    /// Sum of the byte sizes of all leaves.
    pub fn byte_size(&self) -> u64 {
        self.leaves().iter().map(|(_, a)| a.byte_size()).sum()
    }

    /// A copy with every leaf coloured with `memory_space`.
    pub fn recoloured(&self, memory_space: i64) -> Shape {
        match self {
            Self::Array(a) => Self::Array(a.clone().with_memory_space(memory_space)),
            Self::Tuple(elems) => {
                Self::Tuple(elems.iter().map(|e| e.recoloured(memory_space)).collect())
            }
        }
    }
}

fn collect_leaves<'a>(
    shape: &'a Shape,
    prefix: &mut ShapeIndex,
    out: &mut Vec<(ShapeIndex, &'a ArrayShape)>,
) {
    match shape {
        Shape::Array(a) => out.push((prefix.clone(), a)),
        Shape::Tuple(elems) => {
            for (i, elem) in elems.iter().enumerate() {
                prefix.push(i as u32);
                collect_leaves(elem, prefix, out);
                prefix.pop();
            }
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Array(a) => a.fmt(f),
            Self::Tuple(elems) => {
                f.write_str("(")?;
                for (i, elem) in elems.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    elem.fmt(f)?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Path of tuple element indices addressing a subshape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShapeIndex(SmallVec<[u32; 2]>);

impl ShapeIndex {
    pub fn empty() -> Self {
        Self(SmallVec::new())
    }

    pub fn from_slice(indices: &[u32]) -> Self {
        Self(indices.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn push(&mut self, i: u32) {
        self.0.push(i)
    }

    pub fn pop(&mut self) -> Option<u32> {
        self.0.pop()
    }

    pub fn iter(&self) -> impl Iterator<Item = &u32> {
        self.0.iter()
    }

    pub fn first(&self) -> Option<u32> {
        self.0.first().copied()
    }

    /// The index with its first element removed.
    pub fn tail(&self) -> Self {
        Self(self.0.iter().skip(1).copied().collect())
    }

    /// `i` prepended to `self`.
    pub fn prepend(&self, i: u32) -> Self {
        let mut v: SmallVec<[u32; 2]> = SmallVec::with_capacity(self.0.len() + 1);
        v.push(i);
        v.extend(self.0.iter().copied());
        Self(v)
    }
}

impl fmt::Display for ShapeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, idx) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{idx}")?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaves_are_depth_first() {
        let shape = Shape::tuple(vec![
            Shape::array(PrimitiveType::F32, &[4]),
            Shape::tuple(vec![
                Shape::scalar(PrimitiveType::S32),
                Shape::array(PrimitiveType::Bf16, &[2, 8]),
            ]),
        ]);

        let leaves: Vec<_> = shape
            .leaves()
            .into_iter()
            .map(|(idx, a)| (idx.to_string(), a.byte_size()))
            .collect();
        assert_eq!(
            leaves,
            vec![
                ("{0}".to_string(), 16),
                ("{1,0}".to_string(), 4),
                ("{1,1}".to_string(), 32),
            ]
        );
        assert_eq!(shape.byte_size(), 52);
    }

    #[test]
    fn display_marks_memory_space() {
        let a = ArrayShape::new(PrimitiveType::F32, &[16, 8]).with_memory_space(1);
        assert_eq!(a.to_string(), "f32[16,8]{S(1)}");
        assert_eq!(Shape::scalar(PrimitiveType::Pred).to_string(), "pred[]");
    }

    #[test]
    fn subshape_walks_tuples() {
        let shape = Shape::tuple(vec![Shape::tuple(vec![Shape::array(
            PrimitiveType::U8,
            &[3],
        )])]);
        let idx = ShapeIndex::from_slice(&[0, 0]);
        assert_eq!(shape.leaf(&idx).map(|a| a.byte_size()), Some(3));
        assert!(shape.leaf(&ShapeIndex::from_slice(&[1])).is_none());
        assert_eq!(idx.tail(), ShapeIndex::from_slice(&[0]));
        assert_eq!(idx.tail().prepend(2), ShapeIndex::from_slice(&[2, 0]));
    }
}
