//! Slice-level kernels for the CPU backend.

use faer::linalg::matmul::matmul;
use faer::{Accum, MatMut, MatRef, Par};
use rayon::prelude::*;

use crate::error::TensorError;
use crate::layout::{Layout, RANK};

use super::Parallelism;

/// Split of a layout into a leading part that is iterated and a trailing
/// block that is copied in one strided run.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockPlan {
    /// Layout of the leading dims, block dims collapsed to extent 1.
    pub outer: Layout,
    /// Elements per block.
    pub block: usize,
    /// Source stride between consecutive elements of a block.
    pub inner_stride: usize,
}

impl BlockPlan {
    /// Find the maximal trailing run of dims consistent with one strided block.
    pub(crate) fn of(layout: &Layout) -> Self {
        let (shape, strides) = (layout.shape(), layout.strides());
        let mut block = 1usize;
        let mut inner = None;
        let mut split = RANK;
        for i in (0..RANK).rev() {
            let (extent, stride) = (shape[i], strides[i]);
            if extent != 1 {
                match inner {
                    None => inner = Some(stride),
                    Some(s) if stride == s * block => {}
                    Some(_) => break,
                }
                block *= extent;
            }
            split = i;
        }

        Self {
            outer: layout.collapse_trailing(split),
            block,
            inner_stride: inner.unwrap_or(1),
        }
    }
}

/// Gather the elements addressed by `layout` from `src` into packed `dst`.
///
/// Copies block-sized runs (strided source, unit-stride destination) and
/// only loops over the leading, non-mergeable dims.
pub(crate) fn copy_strided(
    src: &[f32],
    layout: &Layout,
    dst: &mut [f32],
    par: Parallelism,
) -> Result<(), TensorError> {
    let size = layout.size();
    if dst.len() < size {
        return Err(TensorError::ShapeMismatch {
            expected: vec![size],
            actual: vec![dst.len()],
        });
    }
    if size == 0 {
        return Ok(());
    }
    check_span(layout, src.len())?;

    let plan = BlockPlan::of(layout);
    let copy_block = |(k, chunk): (usize, &mut [f32])| {
        let base = plan.outer.offset_of(k);
        if plan.inner_stride == 1 {
            chunk.copy_from_slice(&src[base..base + plan.block]);
        } else {
            for (j, value) in chunk.iter_mut().enumerate() {
                *value = src[base + j * plan.inner_stride];
            }
        }
    };

    let dst = &mut dst[..size];
    match par {
        Parallelism::Rayon => dst.par_chunks_mut(plan.block).enumerate().for_each(copy_block),
        Parallelism::Sequential => dst.chunks_mut(plan.block).enumerate().for_each(copy_block),
    }
    Ok(())
}

/// Largest offset addressed by a non-empty layout, `None` on overflow.
pub(crate) fn max_offset(layout: &Layout) -> Option<usize> {
    layout
        .shape()
        .iter()
        .zip(layout.strides())
        .try_fold(0usize, |acc, (&extent, &stride)| {
            extent.saturating_sub(1).checked_mul(stride)?.checked_add(acc)
        })
}

/// Fails unless every offset of a non-empty `layout` is below `len`.
pub(crate) fn check_span(layout: &Layout, len: usize) -> Result<(), TensorError> {
    if layout.size() == 0 {
        return Ok(());
    }
    match max_offset(layout) {
        Some(last) if last < len => Ok(()),
        last => Err(TensorError::IndexOutOfBounds {
            dim: RANK - 1,
            index: last.unwrap_or(usize::MAX),
            size: len,
        }),
    }
}

/// Apply `f` to every element addressed by `layout`, in logical order.
pub(crate) fn for_each_offset(layout: &Layout, mut f: impl FnMut(usize)) {
    if layout.is_contiguous() {
        (0..layout.size()).for_each(f);
    } else {
        for linear in 0..layout.size() {
            f(layout.offset_of(linear));
        }
    }
}

/// `y ← alpha·x + y` over equally long packed slices.
pub(crate) fn axpy(alpha: f32, x: &[f32], y: &mut [f32], par: Parallelism) {
    match par {
        Parallelism::Rayon => y
            .par_iter_mut()
            .zip(x.par_iter())
            .for_each(|(yi, &xi)| *yi += alpha * xi),
        Parallelism::Sequential => y
            .iter_mut()
            .zip(x.iter())
            .for_each(|(yi, &xi)| *yi += alpha * xi),
    }
}

/// Whether the trailing two dims are packed row-major.
pub(crate) fn is_matrix_packed(layout: &Layout) -> bool {
    let (shape, strides) = (layout.shape(), layout.strides());
    let (rows, cols) = (RANK - 2, RANK - 1);
    (shape[cols] == 1 || strides[cols] == 1) && (shape[rows] == 1 || strides[rows] == shape[cols])
}

/// Batched `c ← alpha·a·b + beta·c`.
///
/// `a` and `b` must have packed matrix parts (see [`is_matrix_packed`]);
/// their batch dims may carry any strides, including 0. `c` is packed with
/// shape `[batch..., m, n]` where the batch dims are the broadcast of `a`'s
/// and `b`'s.
#[allow(clippy::too_many_arguments)]
pub(crate) fn gemm_batched(
    alpha: f32,
    a: &[f32],
    a_layout: &Layout,
    b: &[f32],
    b_layout: &Layout,
    beta: f32,
    c: &mut [f32],
    par: Parallelism,
) -> Result<(), TensorError> {
    let (mut a_layout, mut b_layout) = (*a_layout, *b_layout);
    Layout::broadcast(&mut a_layout, &mut b_layout, 0, RANK - 2)?;

    let m = a_layout.shape()[RANK - 2];
    let k = a_layout.shape()[RANK - 1];
    let n = b_layout.shape()[RANK - 1];
    let tile = m * n;
    if tile == 0 {
        return Ok(());
    }

    let batch_a = batch_layout(&a_layout);
    let batch_b = batch_layout(&b_layout);
    let batches = batch_a.size();
    if c.len() != batches * tile {
        return Err(TensorError::ShapeMismatch {
            expected: vec![batches * tile],
            actual: vec![c.len()],
        });
    }

    let offsets: Vec<(usize, usize)> = match par {
        Parallelism::Rayon => (0..batches)
            .into_par_iter()
            .map(|i| (batch_a.offset_of(i), batch_b.offset_of(i)))
            .collect(),
        Parallelism::Sequential => (0..batches)
            .map(|i| (batch_a.offset_of(i), batch_b.offset_of(i)))
            .collect(),
    };
    for &(oa, ob) in &offsets {
        if oa + m * k > a.len() || ob + k * n > b.len() {
            return Err(TensorError::IndexOutOfBounds {
                dim: RANK - 3,
                index: (oa + m * k).max(ob + k * n),
                size: a.len().min(b.len()),
            });
        }
    }

    let inner_par = match par {
        Parallelism::Rayon if batches == 1 => Par::rayon(0),
        _ => Par::Seq,
    };
    let accum = if beta == 0.0 { Accum::Replace } else { Accum::Add };

    // Row-major X (r×c) is column-major Xᵗ (c×r), so Cᵗ = Bᵗ·Aᵗ needs no copy.
    let run = |(c_tile, &(oa, ob)): (&mut [f32], &(usize, usize))| {
        if beta != 0.0 && beta != 1.0 {
            c_tile.iter_mut().for_each(|v| *v *= beta);
        }
        let at = MatRef::from_column_major_slice(&a[oa..oa + m * k], k, m);
        let bt = MatRef::from_column_major_slice(&b[ob..ob + k * n], n, k);
        let mut ct = MatMut::from_column_major_slice_mut(c_tile, n, m);
        matmul(ct.as_mut(), accum, bt, at, alpha, inner_par);
    };

    match par {
        Parallelism::Rayon => c
            .par_chunks_mut(tile)
            .zip(offsets.par_iter())
            .for_each(run),
        Parallelism::Sequential => c.chunks_mut(tile).zip(offsets.iter()).for_each(run),
    }
    Ok(())
}

/// Layout over the batch dims only (matrix dims collapsed).
fn batch_layout(layout: &Layout) -> Layout {
    layout.collapse_trailing(RANK - 2)
}

/// `dst ← sum(src)` where `dst_layout` is `src_layout` with reduced dims at
/// extent 1 and packed strides.
pub(crate) fn reduce_sum(
    src: &[f32],
    src_layout: &Layout,
    dst: &mut [f32],
    dst_layout: &Layout,
) -> Result<(), TensorError> {
    let mut target = *dst_layout;
    target.expand_to(src_layout.shape())?;
    dst[..dst_layout.size()].fill(0.0);
    for linear in 0..src_layout.size() {
        dst[target.offset_of(linear)] += src[src_layout.offset_of(linear)];
    }
    Ok(())
}
