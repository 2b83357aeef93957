//! Host `f32` backend.

use std::any::Any;
use std::cell::Ref;
use std::fmt::Write as _;

use rand::distr::StandardUniform;
use rand::{Rng, RngCore};

use crate::error::TensorError;
use crate::layout::{Layout, RANK};
use crate::storage::CpuBuffer;

use super::kernels;
use super::{Backend, BackendData};

/// How the CPU kernels spread work across threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parallelism {
    /// Everything on the calling thread.
    Sequential,
    /// Block copies and batched gemm fan out over the rayon global pool.
    #[default]
    Rayon,
}

/// Reference `f32` backend on the host.
#[derive(Debug, Clone, Default)]
pub struct CpuBackend {
    par: Parallelism,
}

impl CpuBackend {
    /// Registry name of this backend.
    pub const NAME: &'static str = "cpu_f32";

    /// Backend using the default (rayon) parallelism.
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend with an explicit parallelism setting.
    pub fn with_parallelism(par: Parallelism) -> Self {
        Self { par }
    }

    /// Current parallelism setting.
    pub fn parallelism(&self) -> Parallelism {
        self.par
    }

    fn gather(&self, values: &[f32], layout: &Layout) -> Result<Vec<f32>, TensorError> {
        let mut out = Vec::new();
        out.try_reserve_exact(layout.size())
            .map_err(|_| TensorError::AllocFailed { len: layout.size() })?;
        out.resize(layout.size(), 0.0);
        kernels::copy_strided(values, layout, &mut out, self.par)?;
        Ok(out)
    }

    /// Borrow `data` as a gemm operand, packing it first when its matrix part
    /// is strided or it shares a buffer with the destination.
    fn operand<'a>(
        &self,
        data: &'a CpuData,
        dst: &CpuData,
    ) -> Result<(Operand<'a>, Layout), TensorError> {
        if kernels::is_matrix_packed(&data.layout) && !data.buffer.ptr_eq(&dst.buffer) {
            let values = data.buffer.read()?;
            kernels::check_span(&data.layout, values.len())?;
            Ok((Operand::Borrowed(values), data.layout))
        } else {
            let packed = self.gather(&data.buffer.read()?, &data.layout)?;
            Ok((Operand::Owned(packed), data.layout.to_contiguous()))
        }
    }
}

/// Layout plus shared buffer.
#[derive(Debug, Clone)]
pub struct CpuData {
    layout: Layout,
    buffer: CpuBuffer,
}

impl CpuData {
    /// The physical buffer behind this handle.
    pub fn buffer(&self) -> &CpuBuffer {
        &self.buffer
    }
}

impl BackendData for CpuData {
    fn layout(&self) -> &Layout {
        &self.layout
    }

    fn layout_mut(&mut self) -> &mut Layout {
        &mut self.layout
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn cpu_data(data: &dyn BackendData) -> Result<&CpuData, TensorError> {
    data.as_any()
        .downcast_ref::<CpuData>()
        .ok_or_else(|| TensorError::InvalidBackend(format!("data is not {}", CpuBackend::NAME)))
}

fn require_contiguous(data: &CpuData, op: &str) -> Result<(), TensorError> {
    if data.layout.is_contiguous() {
        Ok(())
    } else {
        Err(TensorError::NotImplemented(format!(
            "{op} into a non-contiguous destination"
        )))
    }
}

/// Gemm operand: either the live buffer or a packed copy.
enum Operand<'a> {
    Borrowed(Ref<'a, [f32]>),
    Owned(Vec<f32>),
}

impl Operand<'_> {
    fn as_slice(&self) -> &[f32] {
        match self {
            Self::Borrowed(values) => values,
            Self::Owned(values) => values,
        }
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn init(&self, layout: Layout) -> Result<Box<dyn BackendData>, TensorError> {
        let layout = layout.to_contiguous();
        let buffer = CpuBuffer::zeros(layout.size())?;
        Ok(Box::new(CpuData { layout, buffer }))
    }

    fn from_vec(
        &self,
        layout: Layout,
        values: Vec<f32>,
    ) -> Result<Box<dyn BackendData>, TensorError> {
        let layout = layout.to_contiguous();
        if values.len() != layout.size() {
            return Err(TensorError::ShapeMismatch {
                expected: vec![layout.size()],
                actual: vec![values.len()],
            });
        }
        Ok(Box::new(CpuData {
            layout,
            buffer: CpuBuffer::from_vec(values),
        }))
    }

    fn fill(&self, data: &dyn BackendData, value: f32) -> Result<(), TensorError> {
        let data = cpu_data(data)?;
        let mut values = data.buffer.write()?;
        kernels::check_span(&data.layout, values.len())?;
        kernels::for_each_offset(&data.layout, |offset| values[offset] = value);
        Ok(())
    }

    fn fill_rand(&self, data: &dyn BackendData, rng: &mut dyn RngCore) -> Result<(), TensorError> {
        let data = cpu_data(data)?;
        let mut values = data.buffer.write()?;
        kernels::check_span(&data.layout, values.len())?;
        kernels::for_each_offset(&data.layout, |offset| {
            values[offset] = rng.sample(StandardUniform);
        });
        Ok(())
    }

    fn shallow_copy(&self, data: &dyn BackendData) -> Result<Box<dyn BackendData>, TensorError> {
        let data = cpu_data(data)?;
        if data.buffer.is_released() {
            return Err(TensorError::NotInitialized);
        }
        Ok(Box::new(data.clone()))
    }

    fn contiguous(&self, data: &dyn BackendData) -> Result<Box<dyn BackendData>, TensorError> {
        let data = cpu_data(data)?;
        let packed = self.gather(&data.buffer.read()?, &data.layout)?;
        Ok(Box::new(CpuData {
            layout: data.layout.to_contiguous(),
            buffer: CpuBuffer::from_vec(packed),
        }))
    }

    fn free(&self, data: &dyn BackendData) -> Result<(), TensorError> {
        cpu_data(data)?.buffer.release()
    }

    fn copy(&self, src: &dyn BackendData, dst: &dyn BackendData) -> Result<(), TensorError> {
        let (src, dst) = (cpu_data(src)?, cpu_data(dst)?);
        require_contiguous(dst, "copy")?;
        let mut source = src.layout;
        source.expand_to(dst.layout.shape())?;

        let size = dst.layout.size();
        if src.buffer.ptr_eq(&dst.buffer) {
            let staged = self.gather(&src.buffer.read()?, &source)?;
            dst.buffer.write()?[..size].copy_from_slice(&staged);
        } else {
            let values = src.buffer.read()?;
            let mut out = dst.buffer.write()?;
            kernels::copy_strided(&values, &source, &mut out[..size], self.par)?;
        }
        Ok(())
    }

    fn axpy(&self, alpha: f32, x: &dyn BackendData, y: &dyn BackendData) -> Result<(), TensorError> {
        let (x, y) = (cpu_data(x)?, cpu_data(y)?);
        require_contiguous(y, "axpy")?;
        let mut source = x.layout;
        source.expand_to(y.layout.shape())?;

        let size = y.layout.size();
        if source.is_contiguous() && !x.buffer.ptr_eq(&y.buffer) {
            let values = x.buffer.read()?;
            kernels::check_span(&source, values.len())?;
            let mut out = y.buffer.write()?;
            kernels::axpy(alpha, &values[..size], &mut out[..size], self.par);
        } else {
            let staged = self.gather(&x.buffer.read()?, &source)?;
            let mut out = y.buffer.write()?;
            kernels::axpy(alpha, &staged, &mut out[..size], self.par);
        }
        Ok(())
    }

    fn gemm(
        &self,
        alpha: f32,
        a: &dyn BackendData,
        b: &dyn BackendData,
        beta: f32,
        c: &dyn BackendData,
    ) -> Result<(), TensorError> {
        let (a, b, c) = (cpu_data(a)?, cpu_data(b)?, cpu_data(c)?);
        require_contiguous(c, "gemm")?;

        let expected = *a.layout.gemm_with(&b.layout)?.shape();
        if c.layout.shape() != &expected {
            return Err(TensorError::ShapeMismatch {
                expected: expected.to_vec(),
                actual: c.layout.shape().to_vec(),
            });
        }

        let (lhs, lhs_layout) = self.operand(a, c)?;
        let (rhs, rhs_layout) = self.operand(b, c)?;

        tracing::trace!(
            m = expected[RANK - 2],
            n = expected[RANK - 1],
            k = a.layout.shape()[RANK - 1],
            "cpu_gemm"
        );
        let size = c.layout.size();
        let mut out = c.buffer.write()?;
        kernels::gemm_batched(
            alpha,
            lhs.as_slice(),
            &lhs_layout,
            rhs.as_slice(),
            &rhs_layout,
            beta,
            &mut out[..size],
            self.par,
        )
    }

    fn reduce_sum(&self, src: &dyn BackendData, dst: &dyn BackendData) -> Result<(), TensorError> {
        let (src, dst) = (cpu_data(src)?, cpu_data(dst)?);
        require_contiguous(dst, "reduce_sum")?;
        let mismatch = || TensorError::ShapeMismatch {
            expected: src.layout.shape().to_vec(),
            actual: dst.layout.shape().to_vec(),
        };
        let mut target = dst.layout;
        target.expand_to(src.layout.shape()).map_err(|_| mismatch())?;

        if src.buffer.ptr_eq(&dst.buffer) {
            let staged = self.gather(&src.buffer.read()?, &src.layout)?;
            let mut out = dst.buffer.write()?;
            kernels::reduce_sum(&staged, &src.layout.to_contiguous(), &mut out, &dst.layout)
        } else {
            let values = src.buffer.read()?;
            kernels::check_span(&src.layout, values.len())?;
            let mut out = dst.buffer.write()?;
            kernels::reduce_sum(&values, &src.layout, &mut out, &dst.layout)
        }
    }

    fn get(&self, data: &dyn BackendData, indices: &[usize]) -> Result<f32, TensorError> {
        let data = cpu_data(data)?;
        let offset = data.layout.flat_index(indices)?;
        let values = data.buffer.read()?;
        values
            .get(offset)
            .copied()
            .ok_or(TensorError::IndexOutOfBounds {
                dim: RANK - 1,
                index: offset,
                size: values.len(),
            })
    }

    fn set(&self, data: &dyn BackendData, indices: &[usize], value: f32) -> Result<(), TensorError> {
        let data = cpu_data(data)?;
        let offset = data.layout.flat_index(indices)?;
        let mut values = data.buffer.write()?;
        let size = values.len();
        let slot = values.get_mut(offset).ok_or(TensorError::IndexOutOfBounds {
            dim: RANK - 1,
            index: offset,
            size,
        })?;
        *slot = value;
        Ok(())
    }

    fn same_buffer(&self, a: &dyn BackendData, b: &dyn BackendData) -> bool {
        match (cpu_data(a), cpu_data(b)) {
            (Ok(a), Ok(b)) => a.buffer.ptr_eq(&b.buffer),
            _ => false,
        }
    }

    fn to_vec(&self, data: &dyn BackendData) -> Result<Vec<f32>, TensorError> {
        let data = cpu_data(data)?;
        self.gather(&data.buffer.read()?, &data.layout)
    }

    fn format_data(&self, data: &dyn BackendData) -> Result<String, TensorError> {
        let layout = *data.layout();
        let values = self.to_vec(data)?;
        let mut out = String::new();
        write_nested(&mut out, &values, layout.dims(layout.ndim()));
        Ok(out)
    }
}

fn write_nested(out: &mut String, values: &[f32], dims: &[usize]) {
    let Some((&first, rest)) = dims.split_first() else {
        let _ = write!(out, "{}", values.first().copied().unwrap_or_default());
        return;
    };
    let chunk = rest.iter().product::<usize>();
    out.push('[');
    for i in 0..first {
        if i > 0 {
            out.push_str(", ");
        }
        write_nested(out, &values[i * chunk..(i + 1) * chunk], rest);
    }
    out.push(']');
}
