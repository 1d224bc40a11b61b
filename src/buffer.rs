//! GPU resident memory blocks.
//!
//! A [`Buffer`] wraps one [`wgpu::Buffer`] together with the name it's registered
//! under, the kind of block it's meant to feed and whether this crate owns the
//! allocation or only refers to a buffer created somewhere else.

use crate::errors::BufferError;
use crate::interface::Executor;
use crate::variable::Bindable;
use log::{info, warn};
use std::fmt;
use std::sync::Arc;

/// The kind of shader block a [`Buffer`] is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BufferKind {
    /// Read/write memory declared as `var<storage>` in the shader
    Storage,
    /// Read only parameters declared as `var<uniform>` in the shader
    Uniform,
}

impl BufferKind {
    /// Usages every buffer of this kind is created with
    pub fn base_usage(self) -> wgpu::BufferUsages {
        let copy = wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC;
        match self {
            BufferKind::Storage => wgpu::BufferUsages::STORAGE | copy,
            BufferKind::Uniform => wgpu::BufferUsages::UNIFORM | copy,
        }
    }

    /// The binding type of a layout entry for a block of this kind
    pub fn binding_type(self, read_only: bool) -> wgpu::BufferBindingType {
        match self {
            BufferKind::Storage => wgpu::BufferBindingType::Storage { read_only },
            BufferKind::Uniform => wgpu::BufferBindingType::Uniform,
        }
    }
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferKind::Storage => write!(f, "storage"),
            BufferKind::Uniform => write!(f, "uniform"),
        }
    }
}

/// Who is responsible for the lifetime of the native allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Allocated by the registry, destroyed when the registry drops it
    Owned,
    /// Supplied by the caller, never reallocated nor destroyed here
    External,
}

#[derive(Debug)]
enum Handle {
    Owned(wgpu::Buffer),
    External(Arc<wgpu::Buffer>),
}

impl Handle {
    fn get(&self) -> &wgpu::Buffer {
        match self {
            Handle::Owned(buffer) => buffer,
            Handle::External(buffer) => buffer,
        }
    }
}

/// Typed content used to fill a buffer
///
/// The set of element types is closed on purpose: these are the types a WGSL
/// storage or uniform block can be made of.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BufferData<'a> {
    Bytes(&'a [u8]),
    U32(&'a [u32]),
    I32(&'a [i32]),
    F32(&'a [f32]),
}

impl<'a> BufferData<'a> {
    pub fn as_bytes(&self) -> &'a [u8] {
        match *self {
            BufferData::Bytes(bytes) => bytes,
            BufferData::U32(data) => bytemuck::cast_slice(data),
            BufferData::I32(data) => bytemuck::cast_slice(data),
            BufferData::F32(data) => bytemuck::cast_slice(data),
        }
    }

    pub fn byte_len(&self) -> u64 {
        self.as_bytes().len() as u64
    }
}

impl<'a> From<&'a [u8]> for BufferData<'a> {
    fn from(data: &'a [u8]) -> Self {
        BufferData::Bytes(data)
    }
}

impl<'a> From<&'a [u32]> for BufferData<'a> {
    fn from(data: &'a [u32]) -> Self {
        BufferData::U32(data)
    }
}

impl<'a> From<&'a [i32]> for BufferData<'a> {
    fn from(data: &'a [i32]) -> Self {
        BufferData::I32(data)
    }
}

impl<'a> From<&'a [f32]> for BufferData<'a> {
    fn from(data: &'a [f32]) -> Self {
        BufferData::F32(data)
    }
}

/// Rounds `size` up to the next multiple of [`wgpu::COPY_BUFFER_ALIGNMENT`]
///
/// Saturates at `u64::MAX`: sizes that close to the limit are rejected before allocating anyway.
pub(crate) fn aligned_size(size: u64) -> u64 {
    match size % wgpu::COPY_BUFFER_ALIGNMENT {
        0 => size,
        rest => size.saturating_add(wgpu::COPY_BUFFER_ALIGNMENT - rest),
    }
}

/// A named block of GPU memory
///
/// Owned buffers are created through the [`crate::registry::Registry`]; the
/// allocation is released as soon as the buffer is dropped. External buffers only
/// name a [`wgpu::Buffer`] the caller keeps alive: their content can be updated,
/// but any attempt to (re)allocate them fails with
/// [`BufferError::InvalidOperationOnExternalBuffer`].
#[derive(Debug)]
pub struct Buffer {
    name: String,
    kind: BufferKind,
    handle: Handle,
    size: u64,
    usage: wgpu::BufferUsages,
    allocation: u64,
}

impl Buffer {
    /// Allocates a new owned buffer of `size` bytes, optionally filled with `data`
    ///
    /// `usage` is added to the usages required by `kind`.
    ///
    /// # Errors
    /// - [`BufferError::ZeroSize`] if `size` is 0
    /// - [`BufferError::OutOfBounds`] if `data` is longer than `size`
    pub fn owned(
        executor: &Executor,
        name: &str,
        kind: BufferKind,
        size: u64,
        data: Option<&[u8]>,
        usage: wgpu::BufferUsages,
        allocation: u64,
    ) -> Result<Buffer, BufferError> {
        let usage = kind.base_usage() | usage;
        let handle = Buffer::allocate(executor, name, size, data, usage)?;
        Ok(Buffer {
            name: name.to_string(),
            kind,
            handle: Handle::Owned(handle),
            size,
            usage,
            allocation,
        })
    }

    /// Wraps a buffer created and owned by the caller
    ///
    /// The byte size is the one of the handle.
    pub fn external(
        name: &str,
        kind: BufferKind,
        handle: Arc<wgpu::Buffer>,
        allocation: u64,
    ) -> Buffer {
        Buffer {
            name: name.to_string(),
            kind,
            size: handle.size(),
            usage: handle.usage(),
            handle: Handle::External(handle),
            allocation,
        }
    }

    fn allocate(
        executor: &Executor,
        name: &str,
        size: u64,
        data: Option<&[u8]>,
        usage: wgpu::BufferUsages,
    ) -> Result<wgpu::Buffer, BufferError> {
        if size == 0 {
            return Err(BufferError::ZeroSize(name.to_string()));
        }
        let limit = executor.limits().max_buffer_size;
        if aligned_size(size) > limit {
            return Err(BufferError::TooLarge {
                name: name.to_string(),
                size,
                limit,
            });
        }
        let data_len = data.map_or(0, |d| d.len() as u64);
        if data_len > size {
            return Err(BufferError::OutOfBounds {
                name: name.to_string(),
                offset: 0,
                len: data_len,
                size,
            });
        }

        let buffer = executor.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some(name),
            size: aligned_size(size),
            usage,
            mapped_at_creation: false,
        });
        if let Some(data) = data.filter(|d| !d.is_empty()) {
            let mut padded = data.to_vec();
            padded.resize(aligned_size(data_len) as usize, 0);
            executor.queue().write_buffer(&buffer, 0, &padded);
        }
        Ok(buffer)
    }

    /// (Re)allocates the native storage of an owned buffer
    ///
    /// This is the same destructive operation as [`Buffer::resize`]: whatever the
    /// buffer held before is gone.
    pub fn create(
        &mut self,
        executor: &Executor,
        size: u64,
        data: Option<&[u8]>,
        usage: wgpu::BufferUsages,
        allocation: u64,
    ) -> Result<(), BufferError> {
        self.reallocate(executor, size, data, self.kind.base_usage() | usage, allocation)
    }

    /// Replaces the allocation with a new one of `new_size` bytes
    ///
    /// The previous content is discarded, never copied over. The new content is
    /// `data` if given, zeroes otherwise.
    pub fn resize(
        &mut self,
        executor: &Executor,
        new_size: u64,
        data: Option<&[u8]>,
        allocation: u64,
    ) -> Result<(), BufferError> {
        self.reallocate(executor, new_size, data, self.usage, allocation)
    }

    fn reallocate(
        &mut self,
        executor: &Executor,
        size: u64,
        data: Option<&[u8]>,
        usage: wgpu::BufferUsages,
        allocation: u64,
    ) -> Result<(), BufferError> {
        if self.ownership() == Ownership::External {
            warn!("Cannot reallocate external buffer {:?}", self.name);
            return Err(BufferError::InvalidOperationOnExternalBuffer(
                self.name.clone(),
            ));
        }
        let handle = Buffer::allocate(executor, &self.name, size, data, usage)?;
        if let Handle::Owned(previous) = std::mem::replace(&mut self.handle, Handle::Owned(handle)) {
            previous.destroy();
        }
        self.size = size;
        self.usage = usage;
        self.allocation = allocation;
        info!("Reallocated {} buffer {:?} with {} bytes", self.kind, self.name, size);
        Ok(())
    }

    /// Writes `data` in the existing allocation starting at byte `offset`
    ///
    /// Allowed on external buffers too, since the allocation itself is untouched.
    /// The write is ordered before any dispatch submitted afterwards.
    ///
    /// `offset` must be a multiple of 4 bytes, and so must the length unless the write ends
    /// exactly at the end of the buffer: the tail is then padded into the allocation padding.
    pub fn upload_sub_data(
        &self,
        executor: &Executor,
        data: &[u8],
        offset: u64,
    ) -> Result<(), BufferError> {
        if data.is_empty() {
            return Ok(());
        }
        let len = data.len() as u64;
        if offset.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(BufferError::OutOfBounds {
                name: self.name.clone(),
                offset,
                len,
                size: self.size,
            });
        }
        let padded_len = aligned_size(len);
        let reaches_end = offset + len == self.size;
        let padding_fits = offset + padded_len <= self.handle().size();
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0
            || (padded_len != len && !(reaches_end && padding_fits))
        {
            return Err(BufferError::Misaligned {
                name: self.name.clone(),
                offset,
                len,
            });
        }
        if !self.usage.contains(wgpu::BufferUsages::COPY_DST) {
            return Err(BufferError::MissingUsage {
                name: self.name.clone(),
                usage: wgpu::BufferUsages::COPY_DST,
            });
        }
        if padded_len == len {
            executor.queue().write_buffer(self.handle(), offset, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize(padded_len as usize, 0);
            executor.queue().write_buffer(self.handle(), offset, &padded);
        }
        Ok(())
    }

    /// Attaches the whole buffer to the `binding` slot of a bind group
    pub fn bind_to_index(&self, binding: u32) -> wgpu::BindGroupEntry<'_> {
        wgpu::BindGroupEntry {
            binding,
            resource: self.handle().as_entire_binding(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn ownership(&self) -> Ownership {
        match self.handle {
            Handle::Owned(_) => Ownership::Owned,
            Handle::External(_) => Ownership::External,
        }
    }

    pub fn handle(&self) -> &wgpu::Buffer {
        self.handle.get()
    }

    pub fn usage(&self) -> wgpu::BufferUsages {
        self.usage
    }

    pub fn byte_size(&self) -> u64 {
        self.size
    }

    /// Identifier of the current allocation, changed by every reallocation
    pub fn allocation(&self) -> u64 {
        self.allocation
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Handle::Owned(buffer) = &self.handle {
            buffer.destroy();
        }
    }
}

impl Bindable for Buffer {
    fn get_name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BufferKind {
        self.kind
    }

    fn byte_size(&self) -> u64 {
        self.size
    }

    fn allocation(&self) -> u64 {
        self.allocation
    }
}
