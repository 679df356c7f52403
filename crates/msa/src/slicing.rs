//! Decomposition of a prefetch into slices along one dimension.
use ir::{ArrayShape, SliceRange};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceProposal {
    /// Shape of the slice.
    pub shape: ArrayShape,
    /// Range of the sliced array covered by the slice, per dimension.
    pub ranges: Vec<SliceRange>,
}

impl SliceProposal {
    pub fn size(&self) -> u64 {
        self.shape.byte_size()
    }
}

/// Splits the major dimension of `shape` into at most `max_slices` parts of
/// equal extent. Leftover rows go to the first slices so larger slices come
/// first.
pub fn propose_major_dim_slices(shape: &ArrayShape, max_slices: u32) -> Option<Vec<SliceProposal>> {
    let major = *shape.dims.first()?;
    let n = u64::from(max_slices).min(major);
    if n < 2 {
        return None;
    }

    let (base, rem) = (major / n, major % n);
    let mut start = 0;
    let proposals = (0..n)
        .map(|i| {
            let extent = base + u64::from(i < rem);
            let mut dims: Vec<u64> = shape.dims.iter().copied().collect();
            dims[0] = extent;
            let mut ranges = vec![SliceRange::new(start, start + extent)];
            ranges.extend(shape.dims.iter().skip(1).map(|&d| SliceRange::new(0, d)));
            start += extent;
            SliceProposal {
                shape: ArrayShape::new(shape.elem, &dims).with_memory_space(shape.memory_space),
                ranges,
            }
        })
        .collect();
    Some(proposals)
}

/// Exclusive start times of slices of the given sizes spread over
/// `earliest..=latest`. A slice starts after the copy time of all slices
/// before it, measured in bytes.
pub fn slice_start_times(sizes: &[u64], earliest: i64, latest: i64) -> Vec<i64> {
    let total: u64 = sizes.iter().sum();
    if total == 0 {
        return vec![earliest; sizes.len()];
    }
    let span = (latest - earliest).max(0) as f64;
    let mut before = 0;
    sizes
        .iter()
        .map(|&size| {
            let t = earliest + (span * before as f64 / total as f64).floor() as i64;
            before += size;
            t
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use ir::PrimitiveType;

    use super::*;

    #[test]
    fn splits_major_dimension() {
        let shape = ArrayShape::new(PrimitiveType::F32, &[1024, 1024]);
        let slices = propose_major_dim_slices(&shape, 4).unwrap();
        assert_eq!(slices.len(), 4);
        assert!(slices.iter().all(|s| s.size() == 1024 * 1024));
        assert_eq!(slices[1].ranges, vec![SliceRange::new(256, 512), SliceRange::new(0, 1024)]);

        let uneven = propose_major_dim_slices(&ArrayShape::new(PrimitiveType::U8, &[5]), 2).unwrap();
        assert_eq!(uneven[0].shape.dims.as_slice(), &[3]);
        assert_eq!(uneven[1].shape.dims.as_slice(), &[2]);

        assert!(propose_major_dim_slices(&ArrayShape::new(PrimitiveType::U8, &[1, 8]), 4).is_none());
        assert!(propose_major_dim_slices(&ArrayShape::scalar(PrimitiveType::U8), 4).is_none());
    }

    #[test]
    fn start_times_follow_cumulative_size() {
        assert_eq!(slice_start_times(&[4, 4, 4, 4], 0, 8), vec![0, 2, 4, 6]);
        assert_eq!(slice_start_times(&[6, 2], 10, 18), vec![10, 16]);
        assert_eq!(slice_start_times(&[4, 4], 3, 3), vec![3, 3]);
    }
}
