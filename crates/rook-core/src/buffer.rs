//! Scoped device buffers and the borrowed views kernels operate on.
//!
//! A [`DeviceBuffer`] owns one allocation for its whole lifetime and frees
//! it on drop. Kernels never see the owner: they take [`DevSlice`] /
//! [`DevSliceMut`] views, which the borrow checker keeps from aliasing.

#[cfg(feature = "cuda")]
use std::marker::PhantomData;
use std::ops::Range;

use crate::dtype::DeviceScalar;
use crate::error::ensure_len;
use crate::stream::Stream;
use crate::{Device, Result, RookError};

enum Storage<T: DeviceScalar> {
    Host(Vec<T>),
    #[cfg(feature = "cuda")]
    Cuda(cudarc::driver::CudaSlice<T>),
}

/// Typed device allocation (move-only, freed on drop).
pub struct DeviceBuffer<T: DeviceScalar> {
    storage: Storage<T>,
    device: Device,
}

impl<T: DeviceScalar> DeviceBuffer<T> {
    /// Allocate `len` zero-initialized elements on `device`.
    pub fn zeros(device: &Device, len: usize) -> Result<Self> {
        let storage = match device {
            Device::Host => {
                let mut v = Vec::new();
                v.try_reserve_exact(len).map_err(|e| RookError::Allocation {
                    op: "DeviceBuffer::zeros",
                    bytes: len * std::mem::size_of::<T>(),
                    reason: e.to_string(),
                })?;
                v.resize(len, T::default());
                Storage::Host(v)
            }
            #[cfg(feature = "cuda")]
            Device::Cuda(idx) => {
                let dev = crate::cuda::get_device(*idx).map_err(|e| e.into_rook("DeviceBuffer::zeros"))?;
                let slice = dev.alloc_zeros::<T>(len).map_err(|e| RookError::Allocation {
                    op: "DeviceBuffer::zeros",
                    bytes: len * std::mem::size_of::<T>(),
                    reason: e.to_string(),
                })?;
                Storage::Cuda(slice)
            }
            #[cfg(not(feature = "cuda"))]
            Device::Cuda(_) => {
                return Err(RookError::DeviceUnavailable {
                    device: *device,
                    reason: "built without the `cuda` feature".into(),
                })
            }
        };
        Ok(Self {
            storage,
            device: *device,
        })
    }

    /// Allocate a buffer holding a copy of `data`.
    pub fn from_host(device: &Device, data: &[T]) -> Result<Self> {
        match device {
            Device::Host => Ok(Self {
                storage: Storage::Host(data.to_vec()),
                device: *device,
            }),
            _ => {
                let mut buf = Self::zeros(device, data.len())?;
                buf.upload(data)?;
                Ok(buf)
            }
        }
    }

    pub fn len(&self) -> usize {
        match &self.storage {
            Storage::Host(v) => v.len(),
            #[cfg(feature = "cuda")]
            Storage::Cuda(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Size of the allocation in bytes.
    pub fn nbytes(&self) -> usize {
        self.len() * std::mem::size_of::<T>()
    }

    pub fn view(&self) -> DevSlice<'_, T> {
        match &self.storage {
            Storage::Host(v) => DevSlice::Host(v),
            #[cfg(feature = "cuda")]
            Storage::Cuda(s) => DevSlice::Cuda(CudaRegion::of(s)),
        }
    }

    pub fn view_mut(&mut self) -> DevSliceMut<'_, T> {
        match &mut self.storage {
            Storage::Host(v) => DevSliceMut::Host(v),
            #[cfg(feature = "cuda")]
            Storage::Cuda(s) => DevSliceMut::Cuda(CudaRegionMut::of(s)),
        }
    }

    pub fn slice(&self, range: Range<usize>) -> Result<DevSlice<'_, T>> {
        self.view().slice(range)
    }

    pub fn slice_mut(&mut self, range: Range<usize>) -> Result<DevSliceMut<'_, T>> {
        self.view_mut().into_slice(range)
    }

    /// Copy `src` into the first `src.len()` elements, ordered after all
    /// work already issued on `stream`.
    pub fn copy_from_host(&mut self, stream: &Stream, src: &[T]) -> Result<()> {
        ensure_len("copy_from_host", src.len(), self.len())?;
        stream.record("copy_from_host");
        self.upload(src)
    }

    /// Copy the first `dst.len()` elements to `dst`. Waits for `stream`.
    pub fn copy_to_host(&self, stream: &Stream, dst: &mut [T]) -> Result<()> {
        ensure_len("copy_to_host", dst.len(), self.len())?;
        stream.synchronize()?;
        match &self.storage {
            Storage::Host(v) => {
                dst.copy_from_slice(&v[..dst.len()]);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            Storage::Cuda(s) => {
                let dev = crate::cuda::get_device(self.device_idx())
                    .map_err(|e| e.into_rook("copy_to_host"))?;
                dev.dtoh_sync_copy_into(&s.slice(0..dst.len()), dst)
                    .map_err(|e| crate::cuda::CudaError::MemoryError(e.to_string()).into_rook("copy_to_host"))
            }
        }
    }

    /// Copy the whole buffer to a new host vector.
    pub fn to_host_vec(&self) -> Result<Vec<T>> {
        match &self.storage {
            Storage::Host(v) => Ok(v.clone()),
            #[cfg(feature = "cuda")]
            Storage::Cuda(s) => {
                let dev = crate::cuda::get_device(self.device_idx())
                    .map_err(|e| e.into_rook("to_host_vec"))?;
                dev.dtoh_sync_copy(s)
                    .map_err(|e| crate::cuda::CudaError::MemoryError(e.to_string()).into_rook("to_host_vec"))
            }
        }
    }

    /// Set every element to zero.
    pub fn fill_zero(&mut self, stream: &Stream) -> Result<()> {
        stream.record("fill_zero");
        match &mut self.storage {
            Storage::Host(v) => {
                v.iter_mut().for_each(|x| *x = T::default());
                Ok(())
            }
            #[cfg(feature = "cuda")]
            Storage::Cuda(s) => {
                let dev = crate::cuda::get_device(self.device.cuda_index())
                    .map_err(|e| e.into_rook("fill_zero"))?;
                dev.memset_zeros(s)
                    .map_err(|e| crate::cuda::CudaError::MemoryError(e.to_string()).into_rook("fill_zero"))
            }
        }
    }

    fn upload(&mut self, src: &[T]) -> Result<()> {
        match &mut self.storage {
            Storage::Host(v) => {
                v[..src.len()].copy_from_slice(src);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            Storage::Cuda(s) => {
                let dev = crate::cuda::get_device(self.device.cuda_index())
                    .map_err(|e| e.into_rook("copy_from_host"))?;
                dev.htod_sync_copy_into(src, &mut s.slice_mut(0..src.len()))
                    .map_err(|e| crate::cuda::CudaError::MemoryError(e.to_string()).into_rook("copy_from_host"))
            }
        }
    }

    #[cfg(feature = "cuda")]
    fn device_idx(&self) -> usize {
        self.device.cuda_index()
    }
}

#[cfg(feature = "cuda")]
impl Device {
    fn cuda_index(&self) -> usize {
        match self {
            Device::Cuda(idx) => *idx,
            Device::Host => 0,
        }
    }
}

impl<T: DeviceScalar> std::fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("device", &self.device)
            .field("len", &self.len())
            .finish()
    }
}

/// Raw device range borrowed from a CUDA allocation.
#[cfg(feature = "cuda")]
pub struct CudaRegion<'a, T> {
    ptr: cudarc::driver::sys::CUdeviceptr,
    len: usize,
    _marker: PhantomData<&'a T>,
}

#[cfg(feature = "cuda")]
impl<T> Clone for CudaRegion<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

#[cfg(feature = "cuda")]
impl<T> Copy for CudaRegion<'_, T> {}

#[cfg(feature = "cuda")]
impl<'a, T> CudaRegion<'a, T> {
    fn of(s: &'a cudarc::driver::CudaSlice<T>) -> Self {
        use cudarc::driver::{DevicePtr, DeviceSlice};
        Self {
            ptr: *s.device_ptr(),
            len: s.len(),
            _marker: PhantomData,
        }
    }

    pub fn ptr(&self) -> u64 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Reinterpret as a region of `U`.
    ///
    /// # Safety
    /// `U` must have the same size and representation as `T`.
    pub unsafe fn reinterpret<U>(self) -> CudaRegion<'a, U> {
        CudaRegion {
            ptr: self.ptr,
            len: self.len,
            _marker: PhantomData,
        }
    }

    fn sub(&self, range: Range<usize>) -> Self {
        Self {
            ptr: self.ptr + (range.start * std::mem::size_of::<T>()) as u64,
            len: range.end - range.start,
            _marker: PhantomData,
        }
    }
}

/// Raw mutable device range borrowed from a CUDA allocation.
#[cfg(feature = "cuda")]
pub struct CudaRegionMut<'a, T> {
    ptr: cudarc::driver::sys::CUdeviceptr,
    len: usize,
    _marker: PhantomData<&'a mut T>,
}

#[cfg(feature = "cuda")]
impl<'a, T> CudaRegionMut<'a, T> {
    fn of(s: &'a mut cudarc::driver::CudaSlice<T>) -> Self {
        use cudarc::driver::{DevicePtrMut, DeviceSlice};
        let len = s.len();
        Self {
            ptr: *s.device_ptr_mut(),
            len,
            _marker: PhantomData,
        }
    }

    pub fn ptr(&self) -> u64 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Reinterpret as a region of `U`.
    ///
    /// # Safety
    /// `U` must have the same size and representation as `T`.
    pub unsafe fn reinterpret<U>(&mut self) -> CudaRegionMut<'_, U> {
        CudaRegionMut {
            ptr: self.ptr,
            len: self.len,
            _marker: PhantomData,
        }
    }

    fn split(self, mid: usize) -> (Self, Self) {
        let off = (mid * std::mem::size_of::<T>()) as u64;
        (
            Self {
                ptr: self.ptr,
                len: mid,
                _marker: PhantomData,
            },
            Self {
                ptr: self.ptr + off,
                len: self.len - mid,
                _marker: PhantomData,
            },
        )
    }
}

#[cfg(feature = "cuda")]
impl<T> cudarc::driver::DeviceSlice<T> for CudaRegion<'_, T> {
    fn len(&self) -> usize {
        self.len
    }
}

#[cfg(feature = "cuda")]
impl<T> cudarc::driver::DevicePtr<T> for CudaRegion<'_, T> {
    fn device_ptr(&self) -> &cudarc::driver::sys::CUdeviceptr {
        &self.ptr
    }
}

#[cfg(feature = "cuda")]
impl<T> cudarc::driver::DeviceSlice<T> for CudaRegionMut<'_, T> {
    fn len(&self) -> usize {
        self.len
    }
}

#[cfg(feature = "cuda")]
impl<T> cudarc::driver::DevicePtr<T> for CudaRegionMut<'_, T> {
    fn device_ptr(&self) -> &cudarc::driver::sys::CUdeviceptr {
        &self.ptr
    }
}

#[cfg(feature = "cuda")]
impl<T> cudarc::driver::DevicePtrMut<T> for CudaRegionMut<'_, T> {
    fn device_ptr_mut(&mut self) -> &mut cudarc::driver::sys::CUdeviceptr {
        &mut self.ptr
    }
}

/// Read-only view of device memory.
pub enum DevSlice<'a, T> {
    Host(&'a [T]),
    #[cfg(feature = "cuda")]
    Cuda(CudaRegion<'a, T>),
}

impl<T> Clone for DevSlice<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for DevSlice<'_, T> {}

impl<'a, T> DevSlice<'a, T> {
    pub fn len(&self) -> usize {
        match self {
            DevSlice::Host(s) => s.len(),
            #[cfg(feature = "cuda")]
            DevSlice::Cuda(r) => r.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn slice(self, range: Range<usize>) -> Result<DevSlice<'a, T>> {
        check_range("DevSlice::slice", &range, self.len())?;
        Ok(match self {
            DevSlice::Host(s) => DevSlice::Host(&s[range]),
            #[cfg(feature = "cuda")]
            DevSlice::Cuda(r) => DevSlice::Cuda(r.sub(range)),
        })
    }

    /// Host memory behind this view, if it is host-resident.
    pub fn as_host(self) -> Option<&'a [T]> {
        match self {
            DevSlice::Host(s) => Some(s),
            #[cfg(feature = "cuda")]
            _ => None,
        }
    }

    #[cfg(feature = "cuda")]
    pub fn as_cuda(self) -> Option<CudaRegion<'a, T>> {
        match self {
            DevSlice::Cuda(r) => Some(r),
            _ => None,
        }
    }
}

/// Writable view of device memory.
pub enum DevSliceMut<'a, T> {
    Host(&'a mut [T]),
    #[cfg(feature = "cuda")]
    Cuda(CudaRegionMut<'a, T>),
}

impl<'a, T> DevSliceMut<'a, T> {
    pub fn len(&self) -> usize {
        match self {
            DevSliceMut::Host(s) => s.len(),
            #[cfg(feature = "cuda")]
            DevSliceMut::Cuda(r) => r.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shorter-lived mutable view of the same memory.
    pub fn reborrow(&mut self) -> DevSliceMut<'_, T> {
        match self {
            DevSliceMut::Host(s) => DevSliceMut::Host(s),
            #[cfg(feature = "cuda")]
            DevSliceMut::Cuda(r) => DevSliceMut::Cuda(CudaRegionMut {
                ptr: r.ptr,
                len: r.len,
                _marker: PhantomData,
            }),
        }
    }

    /// Read-only view of the same memory.
    pub fn view(&self) -> DevSlice<'_, T> {
        match self {
            DevSliceMut::Host(s) => DevSlice::Host(s),
            #[cfg(feature = "cuda")]
            DevSliceMut::Cuda(r) => DevSlice::Cuda(CudaRegion {
                ptr: r.ptr,
                len: r.len,
                _marker: PhantomData,
            }),
        }
    }

    pub fn into_view(self) -> DevSlice<'a, T> {
        match self {
            DevSliceMut::Host(s) => DevSlice::Host(s),
            #[cfg(feature = "cuda")]
            DevSliceMut::Cuda(r) => DevSlice::Cuda(CudaRegion {
                ptr: r.ptr,
                len: r.len,
                _marker: PhantomData,
            }),
        }
    }

    /// Split into two disjoint views at `mid`.
    pub fn split_at(self, mid: usize) -> Result<(DevSliceMut<'a, T>, DevSliceMut<'a, T>)> {
        ensure_len("DevSliceMut::split_at", mid, self.len())?;
        Ok(match self {
            DevSliceMut::Host(s) => {
                let (a, b) = s.split_at_mut(mid);
                (DevSliceMut::Host(a), DevSliceMut::Host(b))
            }
            #[cfg(feature = "cuda")]
            DevSliceMut::Cuda(r) => {
                let (a, b) = r.split(mid);
                (DevSliceMut::Cuda(a), DevSliceMut::Cuda(b))
            }
        })
    }

    pub fn into_slice(self, range: Range<usize>) -> Result<DevSliceMut<'a, T>> {
        check_range("DevSliceMut::into_slice", &range, self.len())?;
        let len = range.end - range.start;
        let (_, tail) = self.split_at(range.start)?;
        let (mid, _) = tail.split_at(len)?;
        Ok(mid)
    }

    pub fn as_host_mut(&mut self) -> Option<&mut [T]> {
        match self {
            DevSliceMut::Host(s) => Some(s),
            #[cfg(feature = "cuda")]
            _ => None,
        }
    }

    #[cfg(feature = "cuda")]
    pub fn as_cuda_mut(&mut self) -> Option<&mut CudaRegionMut<'a, T>> {
        match self {
            DevSliceMut::Cuda(r) => Some(r),
            _ => None,
        }
    }
}

fn check_range(op: &'static str, range: &Range<usize>, len: usize) -> Result<()> {
    if range.start > range.end {
        return Err(RookError::BufferTooSmall {
            op,
            needed: range.start,
            available: range.end,
        });
    }
    ensure_len(op, range.end, len)
}

/// Alignment of workspace carve-outs, in elements.
pub const WORKSPACE_ALIGN: usize = 64;

/// Bump allocator over one workspace view.
///
/// Hands out disjoint, aligned sub-views for the duration of a single layer
/// evaluation. Dropping the arena releases every carve-out at once.
pub struct WorkspaceArena<'a, T> {
    rest: Option<DevSliceMut<'a, T>>,
    used: usize,
    capacity: usize,
}

impl<'a, T> WorkspaceArena<'a, T> {
    pub fn new(workspace: DevSliceMut<'a, T>) -> Self {
        let capacity = workspace.len();
        Self {
            rest: Some(workspace),
            used: 0,
            capacity,
        }
    }

    /// Carve `n` elements. The next carve-out starts on an aligned offset.
    pub fn take(&mut self, n: usize) -> Result<DevSliceMut<'a, T>> {
        let rest = self.rest.take().ok_or(RookError::BufferTooSmall {
            op: "workspace",
            needed: n,
            available: 0,
        })?;
        let available = rest.len();
        if n > available {
            self.rest = Some(rest);
            return Err(RookError::BufferTooSmall {
                op: "workspace",
                needed: self.used + n,
                available: self.capacity,
            });
        }
        let stride = align_up(n, WORKSPACE_ALIGN).min(available);
        let (chunk, tail) = rest.split_at(stride)?;
        let (out, _) = chunk.split_at(n)?;
        self.rest = Some(tail);
        self.used += stride;
        Ok(out)
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.used
    }
}

/// Elements a sequence of carve-outs occupies in a [`WorkspaceArena`].
pub fn arena_footprint(sizes: &[usize]) -> usize {
    sizes.iter().map(|&n| align_up(n, WORKSPACE_ALIGN)).sum()
}

#[inline]
fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeros_and_round_trip() {
        let stream = Stream::new(&Device::Host).unwrap();
        let mut buf = DeviceBuffer::<f32>::zeros(&Device::Host, 8).unwrap();
        assert_eq!(buf.len(), 8);
        assert_eq!(buf.nbytes(), 32);
        buf.copy_from_host(&stream, &[1.0, 2.0, 3.0]).unwrap();
        let mut out = [0.0f32; 4];
        buf.copy_to_host(&stream, &mut out).unwrap();
        assert_eq!(out, [1.0, 2.0, 3.0, 0.0]);
    }

    #[test]
    fn test_copy_bounds_checked() {
        let stream = Stream::new(&Device::Host).unwrap();
        let mut buf = DeviceBuffer::<u64>::zeros(&Device::Host, 2).unwrap();
        assert!(buf.copy_from_host(&stream, &[1, 2, 3]).is_err());
        let mut big = [0u64; 3];
        assert!(buf.copy_to_host(&stream, &mut big).is_err());
    }

    #[test]
    fn test_views_and_slices() {
        let buf = DeviceBuffer::from_host(&Device::Host, &[0i16, 1, 2, 3, 4]).unwrap();
        let s = buf.slice(1..4).unwrap();
        assert_eq!(s.as_host().unwrap(), &[1, 2, 3]);
        assert!(buf.slice(2..9).is_err());
    }

    #[test]
    fn test_split_at_disjoint() {
        let mut buf = DeviceBuffer::<f32>::zeros(&Device::Host, 6).unwrap();
        let (mut a, mut b) = buf.view_mut().split_at(2).unwrap();
        a.as_host_mut().unwrap().fill(1.0);
        b.as_host_mut().unwrap().fill(2.0);
        assert_eq!(buf.to_host_vec().unwrap(), vec![1.0, 1.0, 2.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_arena_alignment_and_exhaustion() {
        let mut buf = DeviceBuffer::<f32>::zeros(&Device::Host, 200).unwrap();
        let mut arena = WorkspaceArena::new(buf.view_mut());
        let a = arena.take(10).unwrap();
        assert_eq!(a.len(), 10);
        assert_eq!(arena.used(), WORKSPACE_ALIGN);
        let b = arena.take(100).unwrap();
        assert_eq!(b.len(), 100);
        assert_eq!(arena.remaining(), 200 - 64 - 128);
        assert!(arena.take(100).is_err());
        let c = arena.take(8).unwrap();
        assert_eq!(c.len(), 8);
        assert_eq!(arena_footprint(&[10, 100, 8]), 64 + 128 + 64);
    }

    #[test]
    fn test_fill_zero() {
        let stream = Stream::new(&Device::Host).unwrap();
        let mut buf = DeviceBuffer::from_host(&Device::Host, &[3.0f32; 4]).unwrap();
        buf.fill_zero(&stream).unwrap();
        assert_eq!(buf.to_host_vec().unwrap(), vec![0.0; 4]);
    }
}
