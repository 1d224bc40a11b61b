//! The orchestrator driving programs over the resources of a [`Registry`].
//!
//! A [`Pipeline`] borrows the registry for as long as it lives, and keeps one
//! [`ComputeProgram`] per shader name it has been asked to build. Nothing outlives
//! the pipeline but the registry itself.

use crate::buffer::BufferData;
use crate::coding::ProgramSource;
use crate::errors::{BufferError, PipelineError};
use crate::interface::Executor;
use crate::program::{BindingTable, ComputeProgram};
use crate::registry::Registry;
use crate::uniform::UniformValue;
use log::warn;
use std::collections::BTreeMap;

/// Builds, dispatches and parameterises compute programs by name
///
/// # Example
/// ```no_run
/// use wgpu_pipeline::buffer::{BufferData, BufferKind};
/// use wgpu_pipeline::coding::ProgramSource;
/// use wgpu_pipeline::interface::{Executor, ExecutorConfig};
/// use wgpu_pipeline::pipeline::Pipeline;
/// use wgpu_pipeline::registry::Registry;
///
/// # async fn run() -> anyhow::Result<()> {
/// let executor = Executor::new(ExecutorConfig::from_env()).await?;
/// let mut registry = Registry::new(&executor);
/// let data: Vec<u32> = (1..=1024).collect();
///
/// let mut pipeline = Pipeline::new(&mut registry);
/// pipeline.add_shader("AddOne", ProgramSource::load("./shaders/add_one.wgsl"));
/// pipeline.add_buffer("Data", BufferData::U32(&data))?;
/// pipeline.build("AddOne").await?;
/// pipeline.dispatch("AddOne", 4, 1, 1)?;
/// pipeline.wait();
///
/// let result: Vec<u32> = registry.read_data(BufferKind::Storage, "Data").await?;
/// assert_eq!(result[0], 2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Pipeline<'r> {
    registry: &'r mut Registry,
    programs: BTreeMap<String, ComputeProgram>,
}

impl<'r> Pipeline<'r> {
    pub fn new(registry: &'r mut Registry) -> Self {
        Pipeline {
            registry,
            programs: BTreeMap::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &*self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut *self.registry
    }

    pub fn executor(&self) -> &Executor {
        self.registry.executor()
    }

    pub fn add_shader(&mut self, name: &str, source: ProgramSource) {
        self.registry.add_shader(name, source);
    }

    /// Creates a storage buffer filled with `data`, see [`Registry::create_buffer_with_data`]
    pub fn add_buffer(&mut self, name: &str, data: BufferData) -> Result<(), BufferError> {
        self.registry.create_buffer_with_data(name, data)
    }

    pub fn add_uniform_buffer(&mut self, name: &str, data: BufferData) -> Result<(), BufferError> {
        self.registry.create_uniform_buffer_with_data(name, data)
    }

    /// Picks the `@compute` function `program` is built from, the first one when `None`
    ///
    /// It takes effect on the next build.
    pub fn set_entry_point(&mut self, program: &str, entry_point: Option<&str>) {
        self.programs
            .entry(program.to_string())
            .or_insert_with(|| ComputeProgram::new(program))
            .set_entry_point(entry_point);
    }

    /// Builds, or rebuilds, the program from the shader registered under `name`
    ///
    /// Bindings are resolved against the buffers registered right now: buffers added
    /// later need another build to be bound.
    pub async fn build(&mut self, name: &str) -> Result<(), PipelineError> {
        let program = self
            .programs
            .entry(name.to_string())
            .or_insert_with(|| ComputeProgram::new(name));
        program.build(&*self.registry).await
    }

    /// Builds every registered shader, giving back the ones which failed
    pub async fn build_all(&mut self) -> Vec<(String, PipelineError)> {
        let names: Vec<String> = self.registry.shader_names().map(str::to_string).collect();
        let mut failed = Vec::new();
        for name in names {
            if let Err(e) = self.build(&name).await {
                failed.push((name, e));
            }
        }
        failed
    }

    /// Submits `x * y * z` workgroups of a built program
    ///
    /// # Errors
    /// - [`PipelineError::ProgramNotBuilt`] if the program was never built, or its last build failed
    /// - [`PipelineError::WorkgroupLimit`] if a count exceeds what the device allows
    /// - [`PipelineError::BufferNotFound`] if a block of the program has no buffer anymore
    ///
    /// Nothing is submitted when an error is returned.
    pub fn dispatch(&mut self, name: &str, x: u32, y: u32, z: u32) -> Result<(), PipelineError> {
        let program = self
            .programs
            .get_mut(name)
            .ok_or_else(|| PipelineError::ProgramNotBuilt(name.to_string()))?;
        program.dispatch(&*self.registry, [x, y, z]).map_err(|e| {
            warn!("{}", e);
            e
        })
    }

    /// Shorthand of [`Pipeline::dispatch`] for one dimensional kernels
    pub fn dispatch_1d(&mut self, name: &str, x: u32) -> Result<(), PipelineError> {
        self.dispatch(name, x, 1, 1)
    }

    /// Sets a loose uniform of `program` for every later dispatch
    ///
    /// `uniform` is the name of a member of a `var<uniform>` struct no buffer is registered
    /// for, optionally qualified as `block.member`, or the name of a plain `var<uniform>`.
    pub fn set_uniform(
        &self,
        program: &str,
        uniform: &str,
        value: impl Into<UniformValue>,
    ) -> Result<(), PipelineError> {
        let compute_program = self
            .programs
            .get(program)
            .ok_or_else(|| PipelineError::ProgramNotFound(program.to_string()))?;
        compute_program
            .set_uniform(self.registry.executor(), uniform, &value.into())
            .map_err(|e| {
                warn!("{}", e);
                e
            })
    }

    pub fn program(&self, name: &str) -> Option<&ComputeProgram> {
        self.programs.get(name)
    }

    /// The buffers the last successful build of `program` bound, with their binding points
    pub fn binding_table(&self, program: &str) -> Option<&BindingTable> {
        self.programs.get(program).map(ComputeProgram::binding_table)
    }

    /// Blocks until every dispatch submitted so far has completed
    pub fn wait(&self) {
        self.registry.executor().wait();
    }
}
