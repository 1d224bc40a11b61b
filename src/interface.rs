//! This module contains the code to interface with the GPU device.
//!
//! It's responsible of opening the connection with the GPU, handing the device to
//! the rest of the crate, submitting the recorded command buffers and getting data
//! back to the host once the device has drained its queue.

use crate::buffer::Buffer;
use crate::errors::{BufferError, ExecutorError};
use log::{debug, info};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Settings used by [`Executor::new`] to pick the adapter and open the device
///
/// The defaults ask for any backend, a high performance adapter and the downlevel limits,
/// which every compute capable adapter supports.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub label: Option<String>,
    pub backends: wgpu::Backends,
    pub power_preference: wgpu::PowerPreference,
    /// Set this to use a software back end instead of an hardware one
    pub force_fallback_adapter: bool,
    pub limits: wgpu::Limits,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            label: None,
            backends: wgpu::Backends::all(),
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            limits: wgpu::Limits::downlevel_defaults(),
        }
    }
}

impl ExecutorConfig {
    /// Default settings, overridden by the `WGPU_BACKEND` and `WGPU_POWER_PREF`
    /// environment variables when they are set
    pub fn from_env() -> Self {
        let mut config = ExecutorConfig::default();
        if let Some(backends) = wgpu::util::backend_bits_from_env() {
            config.backends = backends;
        }
        if let Some(power_preference) = wgpu::util::power_preference_from_env() {
            config.power_preference = power_preference;
        }
        config
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }
}

/// Contains all the functions to interact with the GPU device in the machine.
///
/// It owns the device and the queue, and every resource of the crate is created through it.
/// Cloning an [`Executor`] is cheap and gives another handle on the same device: this is how
/// the [`crate::registry::Registry`] keeps hold of it.
///
/// Every call to [`Executor::execute`] is counted, so the number of submissions done on the
/// device can be checked with [`Executor::submission_count`].
#[derive(Debug, Clone)]
pub struct Executor {
    adapter: Arc<wgpu::Adapter>,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    submissions: Arc<AtomicU64>,
    label: Option<String>,
}

impl Executor {
    /// This function sets up the connection with the GPU.
    ///
    /// To use it simply write
    /// ```no_run
    /// use wgpu_pipeline::interface::{Executor, ExecutorConfig};
    ///
    /// let config = ExecutorConfig::from_env().with_label("Label for debugging purposes");
    /// let executor = pollster::block_on(Executor::new(config)).unwrap();
    /// ```
    ///
    /// # Errors
    /// - if no adapter is found for the requested backends
    /// - if the adapter can't run compute shaders
    /// - if the device doesn't match the requested limits
    pub async fn new(config: ExecutorConfig) -> Result<Executor, ExecutorError> {
        let adapter = Executor::find_adapter(&config)
            .await
            .ok_or(ExecutorError::NoAdapter)?;

        let adapter_info = adapter.get_info();
        let capabilities = adapter.get_downlevel_capabilities();
        if !capabilities
            .flags
            .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS)
        {
            return Err(ExecutorError::NoComputeSupport(adapter_info.name));
        }

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: config.label.as_deref(),
                    required_features: wgpu::Features::empty(),
                    required_limits: config.limits.clone(),
                },
                None,
            )
            .await?;

        info!(
            "Opened device on {} ({:?})",
            adapter_info.name, adapter_info.backend
        );

        Ok(Executor {
            adapter: Arc::new(adapter),
            device: Arc::new(device),
            queue: Arc::new(queue),
            submissions: Arc::new(AtomicU64::new(0)),
            label: config.label,
        })
    }

    /// This function finds the adapters and gives back an Option value. It's primary purpose is the use with [`Executor::new`] function
    async fn find_adapter(config: &ExecutorConfig) -> Option<wgpu::Adapter> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: config.backends,
            ..Default::default()
        });

        instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: config.power_preference,
                compatible_surface: None, // no surface, this is only used for compute
                force_fallback_adapter: config.force_fallback_adapter,
            })
            .await
    }

    pub fn adapter(&self) -> &wgpu::Adapter {
        &self.adapter
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Limits the device was opened with
    pub fn limits(&self) -> wgpu::Limits {
        self.device.limits()
    }

    /// This function gets the bind group layout associated with the [`Executor`] device from a descriptor
    pub fn get_bind_group_layout(
        &self,
        layout_descriptor: &wgpu::BindGroupLayoutDescriptor,
    ) -> wgpu::BindGroupLayout {
        self.device.create_bind_group_layout(layout_descriptor)
    }

    /// This method gives back a bind group associated with the [`Executor`]
    pub fn get_bind_group(
        &self,
        bind_group_descriptor: &wgpu::BindGroupDescriptor,
    ) -> wgpu::BindGroup {
        self.device.create_bind_group(bind_group_descriptor)
    }

    /// This method creates a pipeline layout associated with the [`Executor`] from a pipeline layout descriptor
    pub fn get_pipeline_layout(
        &self,
        pipeline_layout_descriptor: &wgpu::PipelineLayoutDescriptor,
    ) -> wgpu::PipelineLayout {
        self.device
            .create_pipeline_layout(pipeline_layout_descriptor)
    }

    /// This method creates a [`wgpu::ComputePipeline`] from a pipeline descriptor
    pub fn get_pipeline(
        &self,
        pipeline_descriptor: &wgpu::ComputePipelineDescriptor,
    ) -> wgpu::ComputePipeline {
        self.device.create_compute_pipeline(pipeline_descriptor)
    }

    /// This method creates a shader module from already checked WGSL code
    pub fn get_shader_module(&self, label: Option<&str>, content: &str) -> wgpu::ShaderModule {
        self.device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label,
                source: wgpu::ShaderSource::Wgsl(std::borrow::Cow::Borrowed(content)),
            })
    }

    pub fn get_command_encoder(&self, label: Option<&str>) -> wgpu::CommandEncoder {
        self.device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label })
    }

    /// Runs `create` while capturing the validation errors it raises on the device
    ///
    /// wgpu reports validation errors asynchronously through an uncaptured error handler,
    /// which panics by default. Wrapping the object creation in an error scope turns
    /// them into a value the caller can handle.
    pub(crate) async fn capture_validation<T>(
        &self,
        create: impl FnOnce() -> T,
    ) -> (T, Option<wgpu::Error>) {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let created = create();
        let error = self.device.pop_error_scope().await;
        (created, error)
    }

    /// Submits the command buffers to the queue
    ///
    /// The submission returns right away: the work is only enqueued. Use [`Executor::wait`]
    /// to block until the device has completed it.
    pub fn execute<I: IntoIterator<Item = wgpu::CommandBuffer>>(
        &self,
        command_buffers: I,
    ) -> wgpu::SubmissionIndex {
        self.submissions.fetch_add(1, Ordering::Relaxed);
        self.queue.submit(command_buffers)
    }

    /// Number of submissions done through [`Executor::execute`] since the device was opened
    pub fn submission_count(&self) -> u64 {
        self.submissions.load(Ordering::Relaxed)
    }

    /// Blocks the host until every submitted command has been completed by the device
    pub fn wait(&self) {
        let _ = self.device.poll(wgpu::Maintain::Wait);
    }

    /// Copies the whole content of `buffer` back to the host
    ///
    /// The content is copied into a staging buffer in a new submission, then the host waits
    /// for the device to be idle before mapping it. Dispatches submitted earlier on this
    /// [`Executor`] are therefore complete and visible when the bytes are read.
    ///
    /// # Errors
    /// - if the buffer was created without [`wgpu::BufferUsages::COPY_SRC`]
    /// - if the staging buffer can't be mapped
    pub async fn read_buffer(&self, buffer: &Buffer) -> Result<Vec<u8>, BufferError> {
        self.read_handle(buffer.name(), buffer.handle(), buffer.byte_size())
            .await
    }

    /// Same as [`Executor::read_buffer`] for a raw handle, like the ones shared with the
    /// registry as external buffers. `len` bytes are given back, at most the handle size.
    pub async fn read_handle(
        &self,
        name: &str,
        handle: &wgpu::Buffer,
        len: u64,
    ) -> Result<Vec<u8>, BufferError> {
        if !handle.usage().contains(wgpu::BufferUsages::COPY_SRC) {
            return Err(BufferError::MissingUsage {
                name: name.to_string(),
                usage: wgpu::BufferUsages::COPY_SRC,
            });
        }

        let copy_size = handle.size() & !(wgpu::COPY_BUFFER_ALIGNMENT - 1);
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback staging"),
            size: copy_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self.get_command_encoder(Some("readback"));
        encoder.copy_buffer_to_buffer(handle, 0, &staging, 0, copy_size);
        self.execute([encoder.finish()]);

        let slice = staging.slice(..);
        let (sender, receiver) = futures_channel::oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.wait();

        let readback_error = |reason: String| BufferError::Readback {
            name: name.to_string(),
            reason,
        };
        receiver
            .await
            .map_err(|_| readback_error("map_async callback dropped".to_string()))?
            .map_err(|e| readback_error(e.to_string()))?;

        let mut bytes = slice.get_mapped_range().to_vec();
        staging.unmap();
        bytes.truncate(len as usize);

        debug!("Read back {} bytes from {:?}", bytes.len(), name);
        Ok(bytes)
    }
}
