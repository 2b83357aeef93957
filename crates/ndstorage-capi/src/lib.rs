//! C API for ndstorage
//!
//! This crate exposes the storage lifecycle and the math operations of
//! ndstorage through opaque handles and integer status codes, so the library
//! can be driven from C, Julia, Python and other languages.
//!
//! A `nds_session` owns the registry and the backend table. Every storage is
//! created inside a session and must be freed through the same session before
//! the session itself is freed.
//!
//! Status codes are `0` on success and the negative, subsystem-banded codes of
//! `TensorError::code` otherwise.

#![allow(clippy::not_unsafe_ptr_arg_deref)]
#![allow(non_camel_case_types)]

use libc::{c_char, c_float, c_int, size_t, ssize_t};
use ndstorage::operations::{axpy, gemm, gemm_into, reshape, sum, transpose};
use ndstorage::{BackendRegistry, CpuBackend, Registry, Storage, TensorError};
use std::ffi::CStr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;

// Status codes
pub type StatusCode = c_int;

pub const NDS_SUCCESS: StatusCode = 0;
pub const NDS_NULL_POINTER: StatusCode = -1;
/// A panic was caught at the boundary.
pub const NDS_INTERNAL_ERROR: StatusCode = -9;

/// Registry plus backend table.
pub struct nds_session {
    registry: Registry,
    backends: BackendRegistry,
}

/// Opaque storage handle.
pub struct nds_storage {
    inner: Storage,
}

// ============================================================================
// Boundary helpers
// ============================================================================

fn run<T>(f: impl FnOnce() -> Result<T, TensorError>) -> Result<T, StatusCode> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err.code()),
        Err(_) => Err(NDS_INTERNAL_ERROR),
    }
}

fn status_of(result: Result<(), StatusCode>) -> StatusCode {
    result.err().unwrap_or(NDS_SUCCESS)
}

fn write_status(status: *mut StatusCode, code: StatusCode) {
    if !status.is_null() {
        unsafe {
            *status = code;
        }
    }
}

fn into_handle(result: Result<Storage, StatusCode>, status: *mut StatusCode) -> *mut nds_storage {
    match result {
        Ok(inner) => {
            write_status(status, NDS_SUCCESS);
            Box::into_raw(Box::new(nds_storage { inner }))
        }
        Err(code) => {
            write_status(status, code);
            ptr::null_mut()
        }
    }
}

fn session_mut<'a>(session: *mut nds_session) -> Result<&'a mut nds_session, TensorError> {
    unsafe { session.as_mut() }.ok_or(TensorError::NullPointer)
}

fn storage_ref<'a>(storage: *const nds_storage) -> Result<&'a Storage, TensorError> {
    unsafe { storage.as_ref() }
        .map(|handle| &handle.inner)
        .ok_or(TensorError::NullPointer)
}

fn slice<'a, T>(data: *const T, len: size_t) -> Result<&'a [T], TensorError> {
    if len == 0 {
        Ok(&[])
    } else if data.is_null() {
        Err(TensorError::NullPointer)
    } else {
        Ok(unsafe { std::slice::from_raw_parts(data, len) })
    }
}

// ============================================================================
// Session lifecycle
// ============================================================================

/// Create a session with the built-in backends registered.
#[unsafe(no_mangle)]
pub extern "C" fn nds_session_new(status: *mut StatusCode) -> *mut nds_session {
    let session = nds_session {
        registry: Registry::new(),
        backends: BackendRegistry::with_defaults(),
    };
    write_status(status, NDS_SUCCESS);
    Box::into_raw(Box::new(session))
}

/// Release a session. Storages still tracked by it must not be used
/// afterwards.
#[unsafe(no_mangle)]
pub extern "C" fn nds_session_free(session: *mut nds_session) {
    if !session.is_null() {
        unsafe {
            let _ = Box::from_raw(session);
        }
    }
}

/// Number of storages the session still tracks.
#[unsafe(no_mangle)]
pub extern "C" fn nds_session_live_storages(session: *const nds_session) -> size_t {
    unsafe { session.as_ref() }.map_or(0, |s| s.registry.len())
}

// ============================================================================
// Storage lifecycle
// ============================================================================

fn backend_name<'a>(name: *const c_char) -> Result<&'a str, TensorError> {
    if name.is_null() {
        return Ok(CpuBackend::NAME);
    }
    unsafe { CStr::from_ptr(name) }
        .to_str()
        .map_err(|_| TensorError::InvalidBackend("backend name is not UTF-8".into()))
}

/// Create a zero-initialized storage.
///
/// # Arguments
/// * `backend` - Backend name, or null for `"cpu_f32"`
/// * `shape` - Pointer to `ndim` extents
/// * `status` - Pointer to receive status code
///
/// # Returns
/// New storage handle, or null on error
#[unsafe(no_mangle)]
pub extern "C" fn nds_storage_init(
    session: *mut nds_session,
    backend: *const c_char,
    shape: *const size_t,
    ndim: size_t,
    status: *mut StatusCode,
) -> *mut nds_storage {
    let result = run(|| {
        let session = session_mut(session)?;
        let backend = session.backends.require(backend_name(backend)?)?;
        Storage::init(&mut session.registry, &backend, slice(shape, ndim)?)
    });
    into_handle(result, status)
}

/// Create a storage on the default backend holding `len` row-major values.
#[unsafe(no_mangle)]
pub extern "C" fn nds_storage_from_data(
    session: *mut nds_session,
    data: *const c_float,
    len: size_t,
    shape: *const size_t,
    ndim: size_t,
    status: *mut StatusCode,
) -> *mut nds_storage {
    let result = run(|| {
        let session = session_mut(session)?;
        let backend = session.backends.require(CpuBackend::NAME)?;
        let values = slice(data, len)?.to_vec();
        Storage::from_vec(&mut session.registry, &backend, slice(shape, ndim)?, values)
    });
    into_handle(result, status)
}

/// Release a storage handle. The buffer goes away with the last view of it.
#[unsafe(no_mangle)]
pub extern "C" fn nds_storage_free(
    session: *mut nds_session,
    storage: *mut nds_storage,
) -> StatusCode {
    if storage.is_null() {
        return NDS_NULL_POINTER;
    }
    let session = match session_mut(session) {
        Ok(session) => session,
        Err(err) => return err.code(),
    };
    let handle = unsafe { Box::from_raw(storage) };
    status_of(run(|| handle.inner.free(&mut session.registry)))
}

/// Set every element to `value`.
#[unsafe(no_mangle)]
pub extern "C" fn nds_storage_fill(storage: *const nds_storage, value: c_float) -> StatusCode {
    status_of(run(|| storage_ref(storage)?.fill(value)))
}

/// Fill with uniform samples in `[0, 1)`.
#[unsafe(no_mangle)]
pub extern "C" fn nds_storage_fill_rand(storage: *const nds_storage) -> StatusCode {
    status_of(run(|| storage_ref(storage)?.fill_rand()))
}

/// View of the same buffer.
#[unsafe(no_mangle)]
pub extern "C" fn nds_storage_shallow_copy(
    session: *mut nds_session,
    src: *const nds_storage,
    status: *mut StatusCode,
) -> *mut nds_storage {
    let result = run(|| storage_ref(src)?.shallow_copy(&mut session_mut(session)?.registry));
    into_handle(result, status)
}

/// Packed copy in logical order.
#[unsafe(no_mangle)]
pub extern "C" fn nds_storage_contiguous(
    session: *mut nds_session,
    src: *const nds_storage,
    status: *mut StatusCode,
) -> *mut nds_storage {
    let result = run(|| storage_ref(src)?.contiguous(&mut session_mut(session)?.registry));
    into_handle(result, status)
}

/// Transposed view over the trailing `ndim` dims.
#[unsafe(no_mangle)]
pub extern "C" fn nds_storage_transpose(
    session: *mut nds_session,
    src: *const nds_storage,
    perm: *const size_t,
    ndim: size_t,
    status: *mut StatusCode,
) -> *mut nds_storage {
    let result = run(|| {
        transpose(
            &mut session_mut(session)?.registry,
            storage_ref(src)?,
            slice(perm, ndim)?,
        )
    });
    into_handle(result, status)
}

/// Reshaped view; one extent may be `-1`.
#[unsafe(no_mangle)]
pub extern "C" fn nds_storage_reshape(
    session: *mut nds_session,
    src: *const nds_storage,
    shape: *const ssize_t,
    ndim: size_t,
    status: *mut StatusCode,
) -> *mut nds_storage {
    let result = run(|| {
        reshape(
            &mut session_mut(session)?.registry,
            storage_ref(src)?,
            slice(shape, ndim)?,
        )
    });
    into_handle(result, status)
}

// ============================================================================
// Element access
// ============================================================================

/// Read the element at right-aligned `indices`.
#[unsafe(no_mangle)]
pub extern "C" fn nds_storage_get(
    storage: *const nds_storage,
    indices: *const size_t,
    ndim: size_t,
    out: *mut c_float,
) -> StatusCode {
    if out.is_null() {
        return NDS_NULL_POINTER;
    }
    let result = run(|| storage_ref(storage)?.get(slice(indices, ndim)?));
    match result {
        Ok(value) => {
            unsafe {
                *out = value;
            }
            NDS_SUCCESS
        }
        Err(code) => code,
    }
}

/// Overwrite the element at right-aligned `indices`.
#[unsafe(no_mangle)]
pub extern "C" fn nds_storage_set(
    storage: *const nds_storage,
    indices: *const size_t,
    ndim: size_t,
    value: c_float,
) -> StatusCode {
    status_of(run(|| storage_ref(storage)?.set(slice(indices, ndim)?, value)))
}

/// Logical element count, 0 for a null handle.
#[unsafe(no_mangle)]
pub extern "C" fn nds_storage_size(storage: *const nds_storage) -> size_t {
    storage_ref(storage).map_or(0, |s| s.layout().size())
}

/// Write the trailing `ndim` extents into `out`.
#[unsafe(no_mangle)]
pub extern "C" fn nds_storage_shape(
    storage: *const nds_storage,
    out: *mut size_t,
    ndim: size_t,
) -> StatusCode {
    status_of(run(|| {
        let layout = storage_ref(storage)?.layout();
        if ndim > ndstorage::RANK {
            return Err(TensorError::RankExceeded {
                ndim,
                max: ndstorage::RANK,
            });
        }
        if out.is_null() {
            return Err(TensorError::NullPointer);
        }
        let out = unsafe { std::slice::from_raw_parts_mut(out, ndim) };
        out.copy_from_slice(layout.dims(ndim));
        Ok(())
    }))
}

/// Print the storage to standard output.
#[unsafe(no_mangle)]
pub extern "C" fn nds_storage_print(storage: *const nds_storage) -> StatusCode {
    status_of(run(|| {
        println!("{}", storage_ref(storage)?);
        Ok(())
    }))
}

// ============================================================================
// Math
// ============================================================================

/// `alpha * x + y` into a new storage of the broadcast shape.
#[unsafe(no_mangle)]
pub extern "C" fn nds_axpy(
    session: *mut nds_session,
    alpha: c_float,
    x: *const nds_storage,
    y: *const nds_storage,
    status: *mut StatusCode,
) -> *mut nds_storage {
    let result = run(|| {
        axpy(
            &mut session_mut(session)?.registry,
            alpha,
            storage_ref(x)?,
            storage_ref(y)?,
        )
    });
    into_handle(result, status)
}

/// `y = alpha * x + y` in place.
#[unsafe(no_mangle)]
pub extern "C" fn nds_axpy_into(
    alpha: c_float,
    x: *const nds_storage,
    y: *const nds_storage,
) -> StatusCode {
    status_of(run(|| {
        ndstorage::operations::axpy_into(alpha, storage_ref(x)?, storage_ref(y)?)
    }))
}

/// `alpha * a * b` into a new storage.
#[unsafe(no_mangle)]
pub extern "C" fn nds_gemm(
    session: *mut nds_session,
    alpha: c_float,
    a: *const nds_storage,
    b: *const nds_storage,
    status: *mut StatusCode,
) -> *mut nds_storage {
    let result = run(|| {
        gemm(
            &mut session_mut(session)?.registry,
            alpha,
            storage_ref(a)?,
            storage_ref(b)?,
        )
    });
    into_handle(result, status)
}

/// `c = alpha * a * b + beta * c`.
#[unsafe(no_mangle)]
pub extern "C" fn nds_gemm_into(
    alpha: c_float,
    a: *const nds_storage,
    b: *const nds_storage,
    beta: c_float,
    c: *const nds_storage,
) -> StatusCode {
    status_of(run(|| {
        gemm_into(alpha, storage_ref(a)?, storage_ref(b)?, beta, storage_ref(c)?)
    }))
}

/// Sum over the trailing dims selected by `mask`.
#[unsafe(no_mangle)]
pub extern "C" fn nds_sum(
    session: *mut nds_session,
    src: *const nds_storage,
    mask: *const bool,
    ndim: size_t,
    status: *mut StatusCode,
) -> *mut nds_storage {
    let result = run(|| {
        sum(
            &mut session_mut(session)?.registry,
            storage_ref(src)?,
            slice(mask, ndim)?,
        )
    });
    into_handle(result, status)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_data(session: *mut nds_session, data: &[f32], shape: &[usize]) -> *mut nds_storage {
        let mut status: StatusCode = -999;
        let s = nds_storage_from_data(
            session,
            data.as_ptr(),
            data.len(),
            shape.as_ptr(),
            shape.len(),
            &mut status,
        );
        assert_eq!(status, NDS_SUCCESS);
        s
    }

    #[test]
    fn test_storage_init_and_access() {
        let mut status: StatusCode = -999;
        let session = nds_session_new(&mut status);
        assert_eq!(status, NDS_SUCCESS);

        let shape = [2usize, 3usize];
        let s = nds_storage_init(session, ptr::null(), shape.as_ptr(), 2, &mut status);
        assert_eq!(status, NDS_SUCCESS);
        assert_eq!(nds_storage_size(s), 6);

        let idx = [1usize, 2usize];
        assert_eq!(nds_storage_set(s, idx.as_ptr(), 2, 4.0), NDS_SUCCESS);
        let mut val = 0.0;
        assert_eq!(nds_storage_get(s, idx.as_ptr(), 2, &mut val), NDS_SUCCESS);
        assert_eq!(val, 4.0);

        let bad = [2usize, 0usize];
        assert_eq!(
            nds_storage_get(s, bad.as_ptr(), 2, &mut val),
            TensorError::IndexOutOfBounds {
                dim: 0,
                index: 0,
                size: 0
            }
            .code()
        );

        assert_eq!(nds_storage_free(session, s), NDS_SUCCESS);
        assert_eq!(nds_session_live_storages(session), 0);
        nds_session_free(session);
    }

    #[test]
    fn test_unknown_backend() {
        let mut status: StatusCode = -999;
        let session = nds_session_new(&mut status);
        let shape = [2usize];
        let name = c"cuda_f32";
        let s = nds_storage_init(session, name.as_ptr(), shape.as_ptr(), 1, &mut status);
        assert!(s.is_null());
        assert_eq!(status, TensorError::InvalidBackend(String::new()).code());
        nds_session_free(session);
    }

    #[test]
    fn test_null_handles() {
        assert_eq!(nds_storage_fill(ptr::null(), 1.0), NDS_NULL_POINTER);
        let mut status: StatusCode = -999;
        let out = nds_gemm(ptr::null_mut(), 1.0, ptr::null(), ptr::null(), &mut status);
        assert!(out.is_null());
        assert_eq!(status, NDS_NULL_POINTER);
    }

    #[test]
    fn test_transpose_view_and_gemm() {
        let mut status: StatusCode = -999;
        let session = nds_session_new(&mut status);
        let a = from_data(session, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let b = from_data(session, &[7.0, 8.0, 9.0, 10.0, 11.0, 12.0], &[3, 2]);

        let c = nds_gemm(session, 1.0, a, b, &mut status);
        assert_eq!(status, NDS_SUCCESS);
        let mut shape = [0usize; 2];
        assert_eq!(nds_storage_shape(c, shape.as_mut_ptr(), 2), NDS_SUCCESS);
        assert_eq!(shape, [2, 2]);
        let mut val = 0.0;
        let idx = [1usize, 0usize];
        assert_eq!(nds_storage_get(c, idx.as_ptr(), 2, &mut val), NDS_SUCCESS);
        assert_eq!(val, 139.0);

        let perm = [1usize, 0usize];
        let at = nds_storage_transpose(session, a, perm.as_ptr(), 2, &mut status);
        assert_eq!(status, NDS_SUCCESS);
        let idx = [2usize, 1usize];
        assert_eq!(nds_storage_get(at, idx.as_ptr(), 2, &mut val), NDS_SUCCESS);
        assert_eq!(val, 6.0);

        // a, its view, b, c
        assert_eq!(nds_session_live_storages(session), 4);
        for s in [at, a, b, c] {
            assert_eq!(nds_storage_free(session, s), NDS_SUCCESS);
        }
        assert_eq!(nds_session_live_storages(session), 0);
        nds_session_free(session);
    }

    #[test]
    fn test_axpy_broadcast_and_sum() {
        let mut status: StatusCode = -999;
        let session = nds_session_new(&mut status);
        let x = from_data(session, &[1.0, 2.0, 3.0], &[1, 3]);
        let y = from_data(session, &[1.0; 6], &[2, 3]);

        let z = nds_axpy(session, 1.0, x, y, &mut status);
        assert_eq!(status, NDS_SUCCESS);
        let mask = [true, false];
        let s = nds_sum(session, z, mask.as_ptr(), 2, &mut status);
        assert_eq!(status, NDS_SUCCESS);

        let mut val = 0.0;
        let idx = [0usize, 2usize];
        assert_eq!(nds_storage_get(s, idx.as_ptr(), 2, &mut val), NDS_SUCCESS);
        assert_eq!(val, 8.0);

        assert_eq!(nds_axpy_into(1.0, y, x), TensorError::BroadcastError { dim: 0, lhs: 0, rhs: 0 }.code());

        for h in [s, z, y, x] {
            assert_eq!(nds_storage_free(session, h), NDS_SUCCESS);
        }
        nds_session_free(session);
    }
}
