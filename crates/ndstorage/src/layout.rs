//! Fixed-rank shape/stride descriptor.
//!
//! Shapes are right-aligned: a shape of length `ndim < RANK` occupies the
//! trailing `ndim` slots and the leading slots are extent 1. All indexing,
//! broadcasting and permutation arguments follow the same convention.
//!
//! Strides are in elements and row-major: for a freshly created layout
//! `strides[RANK - 1] == 1` and `strides[i] == strides[i + 1] * shape[i + 1]`.
//! A stride of 0 marks a broadcast (repeated) dimension.
//!
//! Every constructor checks that the product of the non-zero extents fits in
//! a `usize`; a shape that does not is rejected with `AllocFailed`.
//!
//! # Example
//!
//! ```
//! use ndstorage::layout::{Layout, RANK};
//!
//! let layout = Layout::new(&[2, 3]).unwrap();
//! assert_eq!(layout.dims(2), &[2, 3]);
//! assert_eq!(layout.shape()[0], 1);
//! assert_eq!(layout.strides()[RANK - 2..], [3, 1]);
//! assert_eq!(layout.flat_index(&[1, 2]).unwrap(), 5);
//! ```

use std::fmt;

use crate::error::TensorError;

/// Maximum number of dimensions a layout can describe.
pub const RANK: usize = 8;

/// Shape, strides and logical element count of a strided buffer view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Layout {
    size: usize,
    shape: [usize; RANK],
    strides: [usize; RANK],
}

impl Layout {
    /// Create a contiguous row-major layout for `shape`.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::RankExceeded` if `shape.len() > RANK`, or
    /// `TensorError::AllocFailed` if the element count overflows `usize`.
    pub fn new(shape: &[usize]) -> Result<Self, TensorError> {
        let offset = trailing_offset(shape.len())?;
        let mut full = [1usize; RANK];
        full[offset..].copy_from_slice(shape);
        Self::packed(full, 1)
    }

    /// Create a layout from explicit full-rank shape and strides.
    ///
    /// No consistency check is made between the two arrays; this is the
    /// entry point for backends that reconstruct views.
    ///
    /// # Errors
    ///
    /// `TensorError::AllocFailed` if the element count overflows `usize`.
    pub fn from_parts(shape: [usize; RANK], strides: [usize; RANK]) -> Result<Self, TensorError> {
        check_volume(&shape)?;
        Ok(Self {
            size: shape.iter().product(),
            shape,
            strides,
        })
    }

    /// Packed row-major strides scaled by `step`.
    fn packed(shape: [usize; RANK], step: usize) -> Result<Self, TensorError> {
        check_volume(&shape)?;
        let mut strides = unit_strides(&shape);
        for stride in &mut strides {
            *stride = stride.checked_mul(step).ok_or(OVERFLOW)?;
        }
        Ok(Self {
            size: shape.iter().product(),
            shape,
            strides,
        })
    }

    /// Same strides with the dims from `from` on collapsed to extent 1.
    pub(crate) fn collapse_trailing(&self, from: usize) -> Layout {
        let mut shape = self.shape;
        shape[from..].fill(1);
        // fewer elements than `self`, so the product cannot overflow
        Self {
            size: shape.iter().product(),
            shape,
            strides: self.strides,
        }
    }

    /// Logical number of elements (product of the shape).
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Full right-aligned shape.
    #[inline]
    pub fn shape(&self) -> &[usize; RANK] {
        &self.shape
    }

    /// Full right-aligned strides.
    #[inline]
    pub fn strides(&self) -> &[usize; RANK] {
        &self.strides
    }

    /// Trailing `ndim` extents.
    ///
    /// # Panics
    ///
    /// Panics if `ndim > RANK`.
    #[inline]
    pub fn dims(&self, ndim: usize) -> &[usize] {
        &self.shape[RANK - ndim..]
    }

    /// Number of dimensions after dropping leading extent-1 slots.
    pub fn ndim(&self) -> usize {
        self.shape
            .iter()
            .position(|&d| d != 1)
            .map_or(0, |first| RANK - first)
    }

    /// Map a right-aligned index tuple to a flat element offset.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::IndexOutOfBounds` if a coordinate is not smaller
    /// than its extent, or `TensorError::RankExceeded` for too many indices.
    pub fn flat_index(&self, indices: &[usize]) -> Result<usize, TensorError> {
        let offset = trailing_offset(indices.len())?;
        let mut flat = 0usize;
        for (k, &index) in indices.iter().enumerate() {
            let dim = offset + k;
            let size = self.shape[dim];
            if index >= size {
                return Err(TensorError::IndexOutOfBounds { dim, index, size });
            }
            flat += index * self.strides[dim];
        }
        Ok(flat)
    }

    /// Offset of the `linear`-th element in logical row-major order.
    ///
    /// `linear` must be smaller than `size()`.
    #[inline]
    pub fn offset_of(&self, mut linear: usize) -> usize {
        let mut offset = 0usize;
        for i in (0..RANK).rev() {
            let extent = self.shape[i];
            if extent > 1 {
                offset += (linear % extent) * self.strides[i];
                linear /= extent;
            }
        }
        offset
    }

    /// Broadcast dims `[start, end)` of `l1` and `l2` against each other.
    ///
    /// Equal extents are left alone. Where exactly one side has extent 1, that
    /// side takes the other's extent and gets stride 0. Both layouts are
    /// validated before either is modified.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::BroadcastError` if two extents differ and neither
    /// is 1.
    pub fn broadcast(
        l1: &mut Layout,
        l2: &mut Layout,
        start: usize,
        end: usize,
    ) -> Result<(), TensorError> {
        if end > RANK || start > end {
            return Err(TensorError::RankExceeded {
                ndim: end.max(start),
                max: RANK,
            });
        }
        for dim in start..end {
            let (lhs, rhs) = (l1.shape[dim], l2.shape[dim]);
            if lhs != rhs && lhs != 1 && rhs != 1 {
                return Err(TensorError::BroadcastError { dim, lhs, rhs });
            }
        }
        let (mut joined1, mut joined2) = (l1.shape, l2.shape);
        for dim in start..end {
            let extent = l1.shape[dim].max(l2.shape[dim]);
            joined1[dim] = extent;
            joined2[dim] = extent;
        }
        check_volume(&joined1)?;
        check_volume(&joined2)?;
        for dim in start..end {
            let (lhs, rhs) = (l1.shape[dim], l2.shape[dim]);
            if lhs == rhs {
                continue;
            }
            if lhs == 1 {
                l1.shape[dim] = rhs;
                l1.strides[dim] = 0;
            } else {
                l2.shape[dim] = lhs;
                l2.strides[dim] = 0;
            }
        }
        l1.size = l1.shape.iter().product();
        l2.size = l2.shape.iter().product();
        Ok(())
    }

    /// Broadcast this layout over all dims so that its shape equals `target`.
    ///
    /// Unlike [`Layout::broadcast`] only `self` may expand; `target` is
    /// treated as fixed.
    pub fn expand_to(&mut self, target: &[usize; RANK]) -> Result<(), TensorError> {
        for dim in 0..RANK {
            let (lhs, rhs) = (self.shape[dim], target[dim]);
            if lhs != rhs && lhs != 1 {
                return Err(TensorError::BroadcastError { dim, lhs, rhs });
            }
        }
        check_volume(target)?;
        for dim in 0..RANK {
            if self.shape[dim] != target[dim] {
                self.shape[dim] = target[dim];
                self.strides[dim] = 0;
            }
        }
        self.size = self.shape.iter().product();
        Ok(())
    }

    /// Shape of the mutual broadcast of `self` and `other` over all dims, as a
    /// fresh contiguous layout. Neither input is modified.
    pub fn broadcast_with(&self, other: &Layout) -> Result<Layout, TensorError> {
        let (mut lhs, mut rhs) = (*self, *other);
        Layout::broadcast(&mut lhs, &mut rhs, 0, RANK)?;
        Self::packed(lhs.shape, 1)
    }

    /// Packed layout of the batched product `self · rhs`.
    ///
    /// The trailing two dims are the matrix; the leading dims are batch dims
    /// and are broadcast against each other. The result keeps `self`'s rows
    /// and `rhs`'s columns.
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` if the inner extents differ, `BroadcastError` if the
    /// batch dims are incompatible.
    pub fn gemm_with(&self, rhs: &Layout) -> Result<Layout, TensorError> {
        let (rows, cols) = (RANK - 2, RANK - 1);
        if self.shape[cols] != rhs.shape[rows] {
            return Err(TensorError::ShapeMismatch {
                expected: vec![self.shape[rows], self.shape[cols]],
                actual: vec![rhs.shape[rows], rhs.shape[cols]],
            });
        }
        let (mut lhs, mut other) = (*self, *rhs);
        Layout::broadcast(&mut lhs, &mut other, 0, rows)?;
        let mut shape = lhs.shape;
        shape[cols] = rhs.shape[cols];
        Self::packed(shape, 1)
    }

    /// Permute the trailing `perm.len()` (extent, stride) pairs.
    ///
    /// `perm[i]` names the source dimension (relative to the trailing block)
    /// of the i-th result dimension. No data moves.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::DuplicateDimension` if `perm` is not a bijection
    /// on `0..perm.len()`.
    pub fn transpose(&mut self, perm: &[usize]) -> Result<(), TensorError> {
        validate_permutation(perm)?;
        let offset = RANK - perm.len();
        let (shape, strides) = (self.shape, self.strides);
        for (i, &p) in perm.iter().enumerate() {
            self.shape[offset + i] = shape[offset + p];
            self.strides[offset + i] = strides[offset + p];
        }
        Ok(())
    }

    /// Whether the layout is traversable with one stride multiplier.
    ///
    /// Extent-1 dimensions are ignored. The innermost remaining dimension
    /// fixes the multiplier (the "step"); every dimension to its left must have
    /// stride `step * product(extents to the right)`. Broadcast dimensions
    /// (stride 0) and permuted dimensions break regularity.
    pub fn is_regular(&self) -> bool {
        if self.size == 0 {
            return true;
        }
        let mut expected: Option<usize> = None;
        for i in (0..RANK).rev() {
            let extent = self.shape[i];
            if extent == 1 {
                continue;
            }
            let stride = self.strides[i];
            match expected {
                None if stride == 0 => return false,
                None => expected = Some(stride * extent),
                Some(e) if e != stride => return false,
                Some(e) => expected = Some(e * extent),
            }
        }
        true
    }

    /// Regular with unit step: the canonical packed layout.
    pub fn is_contiguous(&self) -> bool {
        self.is_regular() && self.step() == 1
    }

    /// Stride of the innermost dimension with extent above 1 (1 if none).
    pub fn step(&self) -> usize {
        (0..RANK)
            .rev()
            .find(|&i| self.shape[i] != 1)
            .map_or(1, |i| self.strides[i])
    }

    /// Reshape to `new_shape`, right-aligned, with at most one `-1`.
    ///
    /// The new strides are packed row-major strides scaled by the original
    /// step, so a regular strided view stays correct.
    ///
    /// # Errors
    ///
    /// - `TensorError::NotRegular` if the source layout is not regular.
    /// - `TensorError::ReshapeInvalidShape` for more than one `-1`, negative
    ///   extents, or a product different from the current size.
    pub fn reshape(&mut self, new_shape: &[isize]) -> Result<(), TensorError> {
        if !self.is_regular() {
            return Err(TensorError::NotRegular);
        }
        let offset = trailing_offset(new_shape.len())?;
        let invalid = || TensorError::ReshapeInvalidShape {
            shape: new_shape.to_vec(),
            size: self.size,
        };

        let mut inferred_at = None;
        let mut known = 1usize;
        for (i, &extent) in new_shape.iter().enumerate() {
            match extent {
                -1 if inferred_at.is_none() => inferred_at = Some(i),
                e if e >= 0 => known = known.checked_mul(e as usize).ok_or_else(invalid)?,
                _ => return Err(invalid()),
            }
        }

        let mut full = [1usize; RANK];
        for (i, &extent) in new_shape.iter().enumerate() {
            full[offset + i] = extent.max(0) as usize;
        }
        if let Some(i) = inferred_at {
            if known == 0 || self.size % known != 0 {
                return Err(invalid());
            }
            full[offset + i] = self.size / known;
        } else if known != self.size {
            return Err(invalid());
        }

        *self = Self::packed(full, self.step())?;
        Ok(())
    }

    /// Collapse the masked trailing dimensions to extent 1.
    ///
    /// The result always carries fresh packed strides: a reduction writes
    /// into a separately allocated destination.
    pub fn reduce(&mut self, mask: &[bool]) -> Result<(), TensorError> {
        let offset = trailing_offset(mask.len())?;
        let mut shape = self.shape;
        for (i, &reduced) in mask.iter().enumerate() {
            if reduced {
                shape[offset + i] = 1;
            }
        }
        *self = Self::packed(shape, 1)?;
        Ok(())
    }

    /// Fresh packed layout with the same shape.
    pub fn to_contiguous(&self) -> Layout {
        Self {
            size: self.size,
            shape: self.shape,
            strides: unit_strides(&self.shape),
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ndim = self.ndim();
        write!(
            f,
            "Layout(shape={:?}, strides={:?})",
            &self.shape[RANK - ndim..],
            &self.strides[RANK - ndim..]
        )
    }
}

/// Inverse of a permutation: `inverse[perm[i]] == i`.
///
/// # Errors
///
/// Returns `TensorError::DuplicateDimension` if `perm` is not a bijection.
pub fn inverse_permutation(perm: &[usize]) -> Result<Vec<usize>, TensorError> {
    validate_permutation(perm)?;
    let mut inverse = vec![0usize; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        inverse[p] = i;
    }
    Ok(inverse)
}

fn validate_permutation(perm: &[usize]) -> Result<(), TensorError> {
    trailing_offset(perm.len())?;
    let mut seen = [false; RANK];
    for &p in perm {
        if p >= perm.len() || seen[p] {
            return Err(TensorError::DuplicateDimension {
                perm: perm.to_vec(),
            });
        }
        seen[p] = true;
    }
    Ok(())
}

const OVERFLOW: TensorError = TensorError::AllocFailed { len: usize::MAX };

/// Fails if the product of the non-zero extents overflows `usize`.
fn check_volume(shape: &[usize; RANK]) -> Result<usize, TensorError> {
    shape
        .iter()
        .try_fold(1usize, |acc, &extent| acc.checked_mul(extent.max(1)))
        .ok_or(OVERFLOW)
}

/// Packed unit-step strides. Each stride is a product of extents to its
/// right, bounded by the volume every constructor has checked.
fn unit_strides(shape: &[usize; RANK]) -> [usize; RANK] {
    let mut strides = [0usize; RANK];
    let mut stride = 1usize;
    for i in (0..RANK).rev() {
        strides[i] = stride;
        stride = stride.saturating_mul(shape[i]);
    }
    strides
}

#[inline]
fn trailing_offset(ndim: usize) -> Result<usize, TensorError> {
    RANK.checked_sub(ndim)
        .ok_or(TensorError::RankExceeded { ndim, max: RANK })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_right_aligns() {
        let layout = Layout::new(&[2, 3, 4]).unwrap();
        assert_eq!(layout.shape(), &[1, 1, 1, 1, 1, 2, 3, 4]);
        assert_eq!(layout.strides()[RANK - 3..], [12, 4, 1]);
        assert_eq!(layout.size(), 24);
        assert_eq!(layout.ndim(), 3);
        assert!(layout.is_contiguous());
    }

    #[test]
    fn test_new_scalar() {
        let layout = Layout::new(&[]).unwrap();
        assert_eq!(layout.size(), 1);
        assert_eq!(layout.ndim(), 0);
        assert_eq!(layout.strides()[RANK - 1], 1);
    }

    #[test]
    fn test_new_rank_exceeded() {
        let err = Layout::new(&[1; RANK + 1]).unwrap_err();
        assert_eq!(
            err,
            TensorError::RankExceeded {
                ndim: RANK + 1,
                max: RANK
            }
        );
    }

    #[test]
    fn test_flat_index() {
        let layout = Layout::new(&[2, 3, 4]).unwrap();
        assert_eq!(layout.flat_index(&[0, 0, 0]).unwrap(), 0);
        assert_eq!(layout.flat_index(&[1, 2, 3]).unwrap(), 12 + 8 + 3);
        // fewer indices address the trailing dims
        assert_eq!(layout.flat_index(&[2, 3]).unwrap(), 11);
        assert!(matches!(
            layout.flat_index(&[0, 3, 0]),
            Err(TensorError::IndexOutOfBounds {
                dim: 6,
                index: 3,
                size: 3
            })
        ));
    }

    #[test]
    fn test_offset_of_matches_flat_index() {
        let mut layout = Layout::new(&[2, 3, 4]).unwrap();
        layout.transpose(&[2, 0, 1]).unwrap();
        let mut linear = 0;
        for i in 0..4 {
            for j in 0..2 {
                for k in 0..3 {
                    assert_eq!(
                        layout.offset_of(linear),
                        layout.flat_index(&[i, j, k]).unwrap()
                    );
                    linear += 1;
                }
            }
        }
    }

    #[test]
    fn test_broadcast_expands_unit_side() {
        let mut a = Layout::new(&[1, 3]).unwrap();
        let mut b = Layout::new(&[2, 3]).unwrap();
        Layout::broadcast(&mut a, &mut b, 0, RANK).unwrap();
        assert_eq!(a.dims(2), &[2, 3]);
        assert_eq!(a.strides()[RANK - 2], 0);
        assert_eq!(b.strides()[RANK - 2], 3);
        assert_eq!(a.size(), 6);
        assert!(!a.is_regular());
    }

    #[test]
    fn test_broadcast_incompatible_leaves_layouts() {
        let mut a = Layout::new(&[2, 1, 4]).unwrap();
        let mut b = Layout::new(&[3, 5, 4]).unwrap();
        let (a0, b0) = (a, b);
        let err = Layout::broadcast(&mut a, &mut b, 0, RANK).unwrap_err();
        assert_eq!(
            err,
            TensorError::BroadcastError {
                dim: 5,
                lhs: 2,
                rhs: 3
            }
        );
        assert_eq!(a, a0);
        assert_eq!(b, b0);
    }

    #[test]
    fn test_broadcast_range_only() {
        let mut a = Layout::new(&[1, 2, 3]).unwrap();
        let mut b = Layout::new(&[4, 3, 5]).unwrap();
        // only the batch dimension takes part
        Layout::broadcast(&mut a, &mut b, 0, RANK - 2).unwrap();
        assert_eq!(a.dims(3), &[4, 2, 3]);
        assert_eq!(b.dims(3), &[4, 3, 5]);
    }

    #[test]
    fn test_transpose_swaps_trailing() {
        let mut layout = Layout::new(&[2, 3, 4]).unwrap();
        layout.transpose(&[1, 0]).unwrap();
        assert_eq!(layout.dims(3), &[2, 4, 3]);
        assert_eq!(layout.strides()[RANK - 3..], [12, 1, 4]);
        assert!(!layout.is_regular());
    }

    #[test]
    fn test_transpose_involution() {
        let original = Layout::new(&[2, 3, 4, 5]).unwrap();
        let perm = [3, 1, 0, 2];
        let mut layout = original;
        layout.transpose(&perm).unwrap();
        layout
            .transpose(&inverse_permutation(&perm).unwrap())
            .unwrap();
        assert_eq!(layout, original);
    }

    #[test]
    fn test_transpose_rejects_duplicates() {
        let mut layout = Layout::new(&[2, 3]).unwrap();
        assert!(matches!(
            layout.transpose(&[0, 0]),
            Err(TensorError::DuplicateDimension { .. })
        ));
        assert!(matches!(
            layout.transpose(&[0, 2]),
            Err(TensorError::DuplicateDimension { .. })
        ));
    }

    #[test]
    fn test_reshape_infers_placeholder() {
        let mut layout = Layout::new(&[2, 3, 4]).unwrap();
        layout.reshape(&[-1, 4]).unwrap();
        assert_eq!(layout.dims(2), &[6, 4]);
        assert_eq!(layout.strides()[RANK - 2..], [4, 1]);
        assert_eq!(layout.size(), 24);
    }

    #[test]
    fn test_reshape_invalid() {
        let mut layout = Layout::new(&[2, 3]).unwrap();
        assert!(matches!(
            layout.reshape(&[-1, -1]),
            Err(TensorError::ReshapeInvalidShape { .. })
        ));
        assert!(matches!(
            layout.reshape(&[4, 2]),
            Err(TensorError::ReshapeInvalidShape { .. })
        ));
        assert!(matches!(
            layout.reshape(&[-1, 4]),
            Err(TensorError::ReshapeInvalidShape { .. })
        ));
        assert!(matches!(
            layout.reshape(&[-2, 3]),
            Err(TensorError::ReshapeInvalidShape { .. })
        ));
    }

    #[test]
    fn test_reshape_requires_regular() {
        let mut layout = Layout::new(&[2, 3]).unwrap();
        layout.transpose(&[1, 0]).unwrap();
        assert_eq!(layout.reshape(&[6]), Err(TensorError::NotRegular));
    }

    #[test]
    fn test_reshape_keeps_step() {
        // every other element of a 12-element buffer, viewed as 2x3
        let layout =
            Layout::from_parts([1, 1, 1, 1, 1, 1, 2, 3], [12, 12, 12, 12, 12, 12, 6, 2]).unwrap();
        assert!(layout.is_regular());
        assert!(!layout.is_contiguous());
        assert_eq!(layout.step(), 2);

        let mut reshaped = layout;
        reshaped.reshape(&[3, 2]).unwrap();
        assert_eq!(reshaped.dims(2), &[3, 2]);
        assert_eq!(reshaped.strides()[RANK - 2..], [4, 2]);
        assert!(reshaped.is_regular());
    }

    #[test]
    fn test_reduce() {
        let mut layout = Layout::new(&[2, 3, 4]).unwrap();
        layout.reduce(&[false, true, false]).unwrap();
        assert_eq!(layout.dims(3), &[2, 1, 4]);
        assert_eq!(layout.strides()[RANK - 3..], [4, 4, 1]);
        assert_eq!(layout.size(), 8);
        assert!(layout.is_contiguous());
    }

    #[test]
    fn test_regular_ignores_unit_dims() {
        let mut layout = Layout::new(&[3, 1, 4]).unwrap();
        layout.transpose(&[1, 0, 2]).unwrap();
        assert!(layout.is_contiguous());
    }

    #[test]
    fn test_broadcast_with() {
        let a = Layout::new(&[4, 1, 3]).unwrap();
        let b = Layout::new(&[5, 1]).unwrap();
        let joined = a.broadcast_with(&b).unwrap();
        assert_eq!(joined.dims(3), &[4, 5, 3]);
        assert!(joined.is_contiguous());
    }

    #[test]
    fn test_gemm_with() {
        let a = Layout::new(&[4, 1, 2, 3]).unwrap();
        let b = Layout::new(&[5, 3, 6]).unwrap();
        let c = a.gemm_with(&b).unwrap();
        assert_eq!(c.dims(4), &[4, 5, 2, 6]);
        assert!(c.is_contiguous());
        assert!(matches!(
            b.gemm_with(&a),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_display() {
        let layout = Layout::new(&[2, 3]).unwrap();
        assert_eq!(layout.to_string(), "Layout(shape=[2, 3], strides=[3, 1])");
    }

    #[test]
    fn test_size_overflow_is_an_error() {
        let huge = usize::MAX / 2;
        let overflow = TensorError::AllocFailed { len: usize::MAX };
        assert_eq!(Layout::new(&[huge, 3]), Err(overflow.clone()));
        assert_eq!(Layout::new(&[1 << 40, 1 << 40, 1 << 40]), Err(overflow.clone()));

        let mut shape = [1; RANK];
        shape[RANK - 2] = huge;
        shape[RANK - 1] = 4;
        assert_eq!(Layout::from_parts(shape, [0; RANK]), Err(overflow.clone()));

        // a zero extent keeps the size at 0 but the strides still must fit
        assert_eq!(Layout::new(&[0, huge, 3]), Err(overflow));
        assert_eq!(Layout::new(&[0, huge]).unwrap().size(), 0);
    }

    #[test]
    fn test_broadcast_overflow_leaves_layouts_untouched() {
        let huge = usize::MAX / 2;
        let mut a = Layout::new(&[huge, 1]).unwrap();
        let mut b = Layout::new(&[1, 3]).unwrap();
        let (a0, b0) = (a, b);
        assert!(matches!(
            Layout::broadcast(&mut a, &mut b, 0, RANK),
            Err(TensorError::AllocFailed { .. })
        ));
        assert_eq!((a, b), (a0, b0));
        assert!(a.broadcast_with(&b).is_err());

        let mut c = Layout::new(&[3]).unwrap();
        let target = *Layout::new(&[huge, 1]).unwrap().shape();
        let mut target_wide = target;
        target_wide[RANK - 1] = 3;
        assert!(c.expand_to(&target_wide).is_err());
        assert_eq!(c.dims(1), &[3]);
    }

    #[test]
    fn test_reshape_product_overflow() {
        let mut layout = Layout::new(&[4]).unwrap();
        let huge = (usize::MAX / 2) as isize;
        assert!(matches!(
            layout.reshape(&[huge, 3, -1]),
            Err(TensorError::ReshapeInvalidShape { size: 4, .. })
        ));
        assert_eq!(layout, Layout::new(&[4]).unwrap());
    }
}
