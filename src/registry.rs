//! Name keyed collections of the resources programs are built from.
//!
//! The [`Registry`] owns every [`ProgramSource`] and every [`Buffer`]. Shader sources,
//! storage buffers and uniform buffers live in three separate collections, so the same
//! name can be used once in each of them. Programs never hold a buffer: they remember its
//! name and the allocation it had when they bound it.

use crate::buffer::{Buffer, BufferData, BufferKind};
use crate::coding::ProgramSource;
use crate::errors::BufferError;
use crate::interface::Executor;
use log::{info, warn};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug)]
pub struct Registry {
    executor: Executor,
    shaders: BTreeMap<String, ProgramSource>,
    storage: BTreeMap<String, Buffer>,
    uniform: BTreeMap<String, Buffer>,
    allocations: u64,
}

impl Registry {
    /// Creates an empty registry allocating its buffers on the device of `executor`
    pub fn new(executor: &Executor) -> Self {
        Registry {
            executor: executor.clone(),
            shaders: BTreeMap::new(),
            storage: BTreeMap::new(),
            uniform: BTreeMap::new(),
            allocations: 0,
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    fn next_allocation(&mut self) -> u64 {
        self.allocations += 1;
        self.allocations
    }

    fn collection(&self, kind: BufferKind) -> &BTreeMap<String, Buffer> {
        match kind {
            BufferKind::Storage => &self.storage,
            BufferKind::Uniform => &self.uniform,
        }
    }

    fn insert(&mut self, buffer: Buffer) {
        let collection = match buffer.kind() {
            BufferKind::Storage => &mut self.storage,
            BufferKind::Uniform => &mut self.uniform,
        };
        if let Some(previous) = collection.insert(buffer.name().to_string(), buffer) {
            info!(
                "Replaced {} buffer {:?}",
                previous.kind(),
                previous.name()
            );
        }
    }

    /// Reads every `name → path` shader file into the registry
    ///
    /// Unreadable files are still registered, with an empty source which fails to compile.
    /// Their names are given back.
    pub fn load_shaders<S, P, I>(&mut self, paths: I) -> Vec<String>
    where
        S: AsRef<str>,
        P: AsRef<Path>,
        I: IntoIterator<Item = (S, P)>,
    {
        let mut failed = Vec::new();
        for (name, path) in paths {
            let source = ProgramSource::load(path);
            if source.is_empty() {
                failed.push(name.as_ref().to_string());
            }
            self.add_shader(name.as_ref(), source);
        }
        failed
    }

    pub fn add_shader(&mut self, name: &str, source: ProgramSource) {
        info!("Registered shader {:?}", name);
        self.shaders.insert(name.to_string(), source);
    }

    /// Allocates one storage buffer per `name → size`, all with the extra `usage`
    ///
    /// Each entry is created independently: the ones failing are given back with their
    /// error, the others are kept.
    pub fn create_buffers<S, I>(&mut self, sizes: I, usage: wgpu::BufferUsages) -> Vec<(String, BufferError)>
    where
        S: AsRef<str>,
        I: IntoIterator<Item = (S, u64)>,
    {
        self.create_all(BufferKind::Storage, sizes, usage)
    }

    /// Same as [`Registry::create_buffers`] for uniform buffers
    pub fn create_uniform_buffers<S, I>(
        &mut self,
        sizes: I,
        usage: wgpu::BufferUsages,
    ) -> Vec<(String, BufferError)>
    where
        S: AsRef<str>,
        I: IntoIterator<Item = (S, u64)>,
    {
        self.create_all(BufferKind::Uniform, sizes, usage)
    }

    fn create_all<S, I>(
        &mut self,
        kind: BufferKind,
        sizes: I,
        usage: wgpu::BufferUsages,
    ) -> Vec<(String, BufferError)>
    where
        S: AsRef<str>,
        I: IntoIterator<Item = (S, u64)>,
    {
        sizes
            .into_iter()
            .filter_map(|(name, size)| {
                let name = name.as_ref();
                self.create_buffer(kind, name, size, None, usage)
                    .err()
                    .map(|e| (name.to_string(), e))
            })
            .collect()
    }

    /// Allocates a buffer of `size` bytes, replacing any buffer of the same kind and name
    pub fn create_buffer(
        &mut self,
        kind: BufferKind,
        name: &str,
        size: u64,
        data: Option<BufferData>,
        usage: wgpu::BufferUsages,
    ) -> Result<(), BufferError> {
        let allocation = self.next_allocation();
        let buffer = Buffer::owned(
            &self.executor,
            name,
            kind,
            size,
            data.map(|d| d.as_bytes()),
            usage,
            allocation,
        )
        .map_err(|e| {
            warn!("{}", e);
            e
        })?;
        info!("Created {} buffer {:?} with {} bytes", kind, name, size);
        self.insert(buffer);
        Ok(())
    }

    /// Creates a storage buffer sized and filled by `data`
    ///
    /// # Example
    /// ```no_run
    /// use wgpu_pipeline::interface::{Executor, ExecutorConfig};
    /// use wgpu_pipeline::registry::Registry;
    /// use wgpu_pipeline::buffer::BufferData;
    ///
    /// let executor = pollster::block_on(Executor::new(ExecutorConfig::default())).unwrap();
    /// let mut registry = Registry::new(&executor);
    /// let data: Vec<u32> = (1..=1024).collect();
    /// registry.create_buffer_with_data("Data", BufferData::U32(&data)).unwrap();
    /// ```
    pub fn create_buffer_with_data(
        &mut self,
        name: &str,
        data: BufferData,
    ) -> Result<(), BufferError> {
        self.create_buffer(
            BufferKind::Storage,
            name,
            data.byte_len(),
            Some(data),
            wgpu::BufferUsages::empty(),
        )
    }

    /// Creates a uniform buffer sized and filled by `data`
    pub fn create_uniform_buffer_with_data(
        &mut self,
        name: &str,
        data: BufferData,
    ) -> Result<(), BufferError> {
        self.create_buffer(
            BufferKind::Uniform,
            name,
            data.byte_len(),
            Some(data),
            wgpu::BufferUsages::empty(),
        )
    }

    /// Registers storage buffers created outside of the registry
    ///
    /// The registry only names them: they're never reallocated, and never destroyed when
    /// released.
    pub fn register_external_buffers<S, I>(&mut self, handles: I) -> Vec<(String, BufferError)>
    where
        S: AsRef<str>,
        I: IntoIterator<Item = (S, Arc<wgpu::Buffer>)>,
    {
        self.register_all(BufferKind::Storage, handles)
    }

    pub fn register_external_uniform_buffers<S, I>(
        &mut self,
        handles: I,
    ) -> Vec<(String, BufferError)>
    where
        S: AsRef<str>,
        I: IntoIterator<Item = (S, Arc<wgpu::Buffer>)>,
    {
        self.register_all(BufferKind::Uniform, handles)
    }

    fn register_all<S, I>(&mut self, kind: BufferKind, handles: I) -> Vec<(String, BufferError)>
    where
        S: AsRef<str>,
        I: IntoIterator<Item = (S, Arc<wgpu::Buffer>)>,
    {
        let mut failed = Vec::new();
        for (name, handle) in handles {
            let name = name.as_ref();
            if handle.size() == 0 {
                let error = BufferError::ZeroSize(name.to_string());
                warn!("{}", error);
                failed.push((name.to_string(), error));
                continue;
            }
            let allocation = self.next_allocation();
            info!("Registered external {} buffer {:?}", kind, name);
            self.insert(Buffer::external(name, kind, handle, allocation));
        }
        failed
    }

    pub fn shader(&self, name: &str) -> Option<&ProgramSource> {
        let shader = self.shaders.get(name);
        if shader.is_none() {
            warn!("No shader named {:?} in the registry", name);
        }
        shader
    }

    pub fn storage_buffer(&self, name: &str) -> Option<&Buffer> {
        self.buffer(BufferKind::Storage, name)
    }

    pub fn uniform_buffer(&self, name: &str) -> Option<&Buffer> {
        self.buffer(BufferKind::Uniform, name)
    }

    pub fn buffer(&self, kind: BufferKind, name: &str) -> Option<&Buffer> {
        let buffer = self.collection(kind).get(name);
        if buffer.is_none() {
            warn!("No {} buffer named {:?} in the registry", kind, name);
        }
        buffer
    }

    /// Every buffer of the given kind, in name order
    pub fn buffers(&self, kind: BufferKind) -> impl Iterator<Item = &Buffer> {
        self.collection(kind).values()
    }

    pub fn shader_names(&self) -> impl Iterator<Item = &str> {
        self.shaders.keys().map(String::as_str)
    }

    /// Destructively resizes a buffer, see [`Buffer::resize`]
    ///
    /// Programs bound to the buffer pick the new allocation up on their next dispatch.
    pub fn resize(
        &mut self,
        kind: BufferKind,
        name: &str,
        new_size: u64,
        data: Option<BufferData>,
    ) -> Result<(), BufferError> {
        let allocation = self.next_allocation();
        let collection = match kind {
            BufferKind::Storage => &mut self.storage,
            BufferKind::Uniform => &mut self.uniform,
        };
        let buffer = collection
            .get_mut(name)
            .ok_or_else(|| BufferError::BufferNotFound {
                kind,
                name: name.to_string(),
            })?;
        buffer.resize(
            &self.executor,
            new_size,
            data.map(|d| d.as_bytes()),
            allocation,
        )
    }

    /// Writes `data` into an existing buffer at byte `offset`, see [`Buffer::upload_sub_data`]
    pub fn upload(
        &self,
        kind: BufferKind,
        name: &str,
        data: BufferData,
        offset: u64,
    ) -> Result<(), BufferError> {
        let buffer = self
            .collection(kind)
            .get(name)
            .ok_or_else(|| BufferError::BufferNotFound {
                kind,
                name: name.to_string(),
            })?;
        buffer
            .upload_sub_data(&self.executor, data.as_bytes(), offset)
            .map_err(|e| {
                warn!("{}", e);
                e
            })
    }

    /// Copies a buffer back to the host, after every submitted dispatch has completed
    pub async fn read_buffer(&self, kind: BufferKind, name: &str) -> Result<Vec<u8>, BufferError> {
        let buffer = self
            .collection(kind)
            .get(name)
            .ok_or_else(|| BufferError::BufferNotFound {
                kind,
                name: name.to_string(),
            })?;
        self.executor.read_buffer(buffer).await
    }

    /// Same as [`Registry::read_buffer`], with the bytes cast to `T`
    ///
    /// Fails with [`BufferError::Readback`] if the buffer doesn't hold a whole number of `T`.
    pub async fn read_data<T: bytemuck::Pod>(
        &self,
        kind: BufferKind,
        name: &str,
    ) -> Result<Vec<T>, BufferError> {
        let bytes = self.read_buffer(kind, name).await?;
        let element = std::mem::size_of::<T>();
        if element == 0 || bytes.len() % element != 0 {
            return Err(BufferError::Readback {
                name: name.to_string(),
                reason: format!(
                    "{} bytes can't be read as elements of {} bytes",
                    bytes.len(),
                    element
                ),
            });
        }
        Ok(bytes
            .chunks_exact(element)
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    /// Drops every source and buffer, destroying the buffers the registry owns
    pub fn release_all(&mut self) {
        if self.shaders.is_empty() && self.storage.is_empty() && self.uniform.is_empty() {
            return;
        }
        info!(
            "Releasing {} shader(s), {} storage and {} uniform buffer(s)",
            self.shaders.len(),
            self.storage.len(),
            self.uniform.len()
        );
        self.shaders.clear();
        self.storage.clear();
        self.uniform.clear();
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.release_all();
    }
}
