//! Compute programs: build, binding resolution and dispatch.
//!
//! A [`ComputeProgram`] is built from the [`crate::coding::ProgramSource`] registered
//! under its name. Building goes through three stages, each of which can fail and leave
//! the program [`BuildStatus::Failed`]:
//!
//! 1. *compiling*: the WGSL text is parsed
//! 2. *linking*: the module is validated, the compute entry point is picked and the
//!    [`wgpu::ComputePipeline`] is created
//! 3. *resolving*: every registered buffer whose name matches a block the kernel declares
//!    is bound at the block's `@group`/`@binding`. Buffers matching nothing are skipped, since
//!    one pool of buffers is usually shared by several kernels each using part of it.
//!
//! The bindings are resolved per program, so the same buffer can sit at different binding
//! points in different programs.

use crate::buffer::{aligned_size, Buffer, BufferKind};
use crate::errors::{BufferError, PipelineError};
use crate::interface::Executor;
use crate::reflect::{self, BindingPoint, DeclaredBlock, Reflection};
use crate::registry::Registry;
use crate::uniform::{DefaultUniformBlock, DefaultUniforms, UniformLocation, UniformValue};
use crate::variable::Bindable;
use log::{debug, info, warn};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Unbuilt,
    Built,
    Failed,
}

/// A buffer bound to one of the blocks of a program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBinding {
    /// Name of the declared block the buffer was matched with
    pub block: String,
    pub point: BindingPoint,
    pub kind: BufferKind,
    /// Allocation of the buffer when the bind group was last created
    pub allocation: u64,
}

/// Buffer name to binding, for the buffers a build bound
pub type BindingTable = BTreeMap<String, ResolvedBinding>;

/// Matches `buffers` against the blocks of `reflection`
///
/// Buffers with no block of their kind and name are skipped. Two buffers matching the same
/// block (one by variable name and one by type name) can't both be bound: the one matching
/// the variable name wins.
///
/// # Errors
/// - [`PipelineError::BufferTooSmall`] if a matched buffer is smaller than its block
pub fn resolve<'b, B, I>(
    program: &str,
    reflection: &Reflection,
    buffers: I,
) -> Result<BindingTable, PipelineError>
where
    B: Bindable + 'b,
    I: IntoIterator<Item = &'b B>,
{
    let mut table = BindingTable::new();
    let mut claimed: BTreeMap<BindingPoint, (String, bool)> = BTreeMap::new();

    for buffer in buffers {
        let name = buffer.get_name();
        let Some(block) = reflection.find_block(name, buffer.kind()) else {
            debug!("{:?} declares no {} block named {:?}, skipping it", program, buffer.kind(), name);
            continue;
        };
        check_fit(program, block, buffer)?;

        let by_variable = block.name == name;
        if let Some((previous, previous_by_variable)) = claimed.get(&block.point) {
            if *previous_by_variable || !by_variable {
                warn!(
                    "{:?} is already bound at {} in {:?}, skipping {:?}",
                    previous, block.point, program, name
                );
                continue;
            }
            table.remove(previous);
        }
        claimed.insert(block.point, (name.to_string(), by_variable));
        table.insert(
            name.to_string(),
            ResolvedBinding {
                block: block.name.clone(),
                point: block.point,
                kind: block.kind,
                allocation: buffer.allocation(),
            },
        );
        debug!("Bound {} buffer {:?} at {} in {:?}", block.kind, name, block.point, program);
    }
    Ok(table)
}

fn check_fit<B: Bindable + ?Sized>(
    program: &str,
    block: &DeclaredBlock,
    buffer: &B,
) -> Result<(), PipelineError> {
    if buffer.byte_size() < block.min_size {
        return Err(PipelineError::BufferTooSmall {
            program: program.to_string(),
            name: buffer.get_name().to_string(),
            required: block.min_size,
            actual: buffer.byte_size(),
        });
    }
    Ok(())
}

#[derive(Debug)]
struct Linked {
    reflection: Reflection,
    pipeline: wgpu::ComputePipeline,
    layouts: Vec<wgpu::BindGroupLayout>,
}

/// A kernel built into an executable pipeline, with the buffers bound to it
#[derive(Debug)]
pub struct ComputeProgram {
    name: String,
    entry_point: Option<String>,
    status: BuildStatus,
    linked: Option<Linked>,
    bindings: BindingTable,
    uniforms: DefaultUniforms,
    bind_groups: Vec<wgpu::BindGroup>,
}

impl ComputeProgram {
    pub fn new(name: &str) -> Self {
        ComputeProgram {
            name: name.to_string(),
            entry_point: None,
            status: BuildStatus::Unbuilt,
            linked: None,
            bindings: BindingTable::new(),
            uniforms: DefaultUniforms::default(),
            bind_groups: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> BuildStatus {
        self.status
    }

    pub fn is_built(&self) -> bool {
        self.status == BuildStatus::Built
    }

    /// Selects the `@compute` function used by the next build, the first one when unset
    pub fn set_entry_point(&mut self, entry_point: Option<&str>) {
        self.entry_point = entry_point.map(str::to_string);
    }

    /// The buffers bound by the last successful build
    pub fn binding_table(&self) -> &BindingTable {
        &self.bindings
    }

    /// What the last successful link learnt about the kernel
    pub fn reflection(&self) -> Option<&Reflection> {
        self.linked.as_ref().map(|l| &l.reflection)
    }

    /// The local workgroup size declared by the entry point
    ///
    /// Dispatches are sized in workgroups: covering `n` elements with a 1D kernel takes
    /// `n.div_ceil(workgroup_size[0])` groups.
    pub fn workgroup_size(&self) -> Option<[u32; 3]> {
        self.reflection().map(|r| r.workgroup_size)
    }

    /// Forgets everything a previous build produced
    fn discard(&mut self) {
        self.status = BuildStatus::Unbuilt;
        self.linked = None;
        self.bindings.clear();
        self.uniforms = DefaultUniforms::default();
        self.bind_groups.clear();
    }

    /// Builds the program from the source registered under its name
    ///
    /// Whatever a previous build left is discarded first: if this build fails the program
    /// is [`BuildStatus::Failed`] and can't be dispatched.
    pub async fn build(&mut self, registry: &Registry) -> Result<(), PipelineError> {
        self.discard();
        match self.try_build(registry).await {
            Ok(()) => {
                self.status = BuildStatus::Built;
                info!(
                    "Built {:?} with {} bound buffer(s)",
                    self.name,
                    self.bindings.len()
                );
                Ok(())
            }
            Err(e) => {
                self.discard();
                self.status = BuildStatus::Failed;
                warn!("{}", e);
                Err(e)
            }
        }
    }

    async fn try_build(&mut self, registry: &Registry) -> Result<(), PipelineError> {
        let executor = registry.executor();
        let source = registry
            .shader(&self.name)
            .ok_or_else(|| PipelineError::ShaderNotFound(self.name.clone()))?;

        debug!("Compiling {:?}", self.name);
        let module =
            reflect::compile(source.get_content()).map_err(|log| PipelineError::CompileError {
                name: self.name.clone(),
                log,
            })?;

        debug!("Linking {:?}", self.name);
        let link_error = |log: String| PipelineError::LinkError {
            name: self.name.clone(),
            log,
        };
        let reflection = reflect::link(&module, self.entry_point.as_deref()).map_err(link_error)?;
        let ((pipeline, layouts), error) = executor
            .capture_validation(|| self.create_pipeline(executor, source.get_content(), &reflection))
            .await;
        if let Some(error) = error {
            return Err(link_error(reflect::error_chain(&error)));
        }

        debug!("Resolving the bindings of {:?}", self.name);
        let mut bindings = resolve(
            &self.name,
            &reflection,
            registry.buffers(BufferKind::Storage),
        )?;
        for (name, binding) in resolve(
            &self.name,
            &reflection,
            registry.buffers(BufferKind::Uniform),
        )? {
            if bindings.contains_key(&name) {
                warn!(
                    "{:?} names both a storage and a uniform block of {:?}, only the storage buffer is bound",
                    name, self.name
                );
                continue;
            }
            bindings.insert(name, binding);
        }
        let uniforms = self.default_uniforms(executor, &reflection, &bindings);
        let mut complete = true;
        for block in &reflection.blocks {
            let bound = bindings.values().any(|b| b.point == block.point);
            if block.kind == BufferKind::Storage && !bound {
                debug!(
                    "No buffer is registered for block {:?} of {:?}: it can't be dispatched until it's rebuilt with one",
                    block.name, self.name
                );
                complete = false;
            }
        }

        self.linked = Some(Linked {
            reflection,
            pipeline,
            layouts,
        });
        self.bindings = bindings;
        self.uniforms = uniforms;
        if complete {
            self.refresh_bind_groups(registry)?;
        }
        Ok(())
    }

    fn create_pipeline(
        &self,
        executor: &Executor,
        content: &str,
        reflection: &Reflection,
    ) -> (wgpu::ComputePipeline, Vec<wgpu::BindGroupLayout>) {
        let label = Some(self.name.as_str());
        let layouts: Vec<wgpu::BindGroupLayout> = (0..reflection.group_count())
            .map(|group| {
                let entries: Vec<wgpu::BindGroupLayoutEntry> = reflection
                    .blocks_in_group(group)
                    .map(|block| wgpu::BindGroupLayoutEntry {
                        binding: block.point.binding,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: block.kind.binding_type(block.read_only),
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    })
                    .collect();
                executor.get_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label,
                    entries: &entries,
                })
            })
            .collect();

        let shader_module = executor.get_shader_module(label, content);
        let layout_refs: Vec<&wgpu::BindGroupLayout> = layouts.iter().collect();
        let pipeline_layout = executor.get_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label,
            bind_group_layouts: &layout_refs,
            push_constant_ranges: &[],
        });
        let pipeline = executor.get_pipeline(&wgpu::ComputePipelineDescriptor {
            label,
            layout: Some(&pipeline_layout),
            module: &shader_module,
            entry_point: &reflection.entry_point,
        });
        (pipeline, layouts)
    }

    /// Allocates the blocks no registered uniform buffer feeds, and maps their members
    fn default_uniforms(
        &self,
        executor: &Executor,
        reflection: &Reflection,
        bindings: &BindingTable,
    ) -> DefaultUniforms {
        let mut uniforms = DefaultUniforms::default();
        let unbound = reflection.blocks.iter().filter(|block| {
            block.kind == BufferKind::Uniform && !bindings.values().any(|b| b.point == block.point)
        });
        for block in unbound {
            let index = uniforms.blocks.len();
            let buffer = executor.device().create_buffer(&wgpu::BufferDescriptor {
                label: Some(block.name.as_str()),
                size: aligned_size(block.min_size.max(wgpu::COPY_BUFFER_ALIGNMENT)),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            uniforms.blocks.push(DefaultUniformBlock {
                name: block.name.clone(),
                point: block.point,
                buffer,
            });

            if let Some(kind) = block.value_kind {
                let location = UniformLocation {
                    block: index,
                    offset: 0,
                    kind,
                };
                uniforms.locations.push((block.name.clone(), location));
            }
            for member in &block.members {
                let location = UniformLocation {
                    block: index,
                    offset: member.offset,
                    kind: member.kind,
                };
                uniforms
                    .locations
                    .push((format!("{}.{}", block.name, member.name), location));
                if uniforms.location(&member.name).is_none() {
                    uniforms.locations.push((member.name.clone(), location));
                }
            }
        }
        uniforms
    }

    /// Checks the bound buffers are still registered, and recreates the bind groups
    /// if any of them was reallocated since they were created
    fn refresh_bind_groups(&mut self, registry: &Registry) -> Result<(), PipelineError> {
        let Some(linked) = self.linked.as_ref() else {
            return Err(PipelineError::ProgramNotBuilt(self.name.clone()));
        };

        let mut stale = self.bind_groups.is_empty();
        let mut bound: BTreeMap<BindingPoint, &Buffer> = BTreeMap::new();
        for (name, binding) in &self.bindings {
            let buffer = registry.buffer(binding.kind, name).ok_or_else(|| {
                PipelineError::BufferNotFound {
                    program: self.name.clone(),
                    block: binding.block.clone(),
                    kind: binding.kind,
                }
            })?;
            stale |= buffer.allocation() != binding.allocation;
            bound.insert(binding.point, buffer);
        }
        if !stale {
            return Ok(());
        }

        let limits = registry.executor().limits();
        let mut bind_groups = Vec::with_capacity(linked.layouts.len());
        for (group, layout) in linked.layouts.iter().enumerate() {
            let mut entries = Vec::new();
            for block in linked.reflection.blocks_in_group(group as u32) {
                if let Some(buffer) = bound.get(&block.point) {
                    check_fit(&self.name, block, *buffer)?;
                    check_binding(&self.name, buffer, &limits)?;
                    entries.push(buffer.bind_to_index(block.point.binding));
                } else if let Some(default) =
                    self.uniforms.blocks.iter().find(|d| d.point == block.point)
                {
                    entries.push(wgpu::BindGroupEntry {
                        binding: block.point.binding,
                        resource: default.buffer.as_entire_binding(),
                    });
                } else {
                    return Err(PipelineError::BufferNotFound {
                        program: self.name.clone(),
                        block: block.name.clone(),
                        kind: block.kind,
                    });
                }
            }
            bind_groups.push(registry.executor().get_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(self.name.as_str()),
                layout,
                entries: &entries,
            }));
        }

        for binding in self.bindings.values_mut() {
            if let Some(buffer) = bound.get(&binding.point) {
                binding.allocation = buffer.allocation();
            }
        }
        self.bind_groups = bind_groups;
        Ok(())
    }

    /// Submits `workgroups` groups of the kernel
    ///
    /// The dispatch is recorded in its own compute pass. Ending the pass is the storage
    /// visibility barrier: everything the kernel writes is visible to the passes and copies
    /// submitted afterwards. The call returns as soon as the work is submitted; reading the
    /// results on the host needs an [`Executor::wait`] first.
    pub fn dispatch(
        &mut self,
        registry: &Registry,
        workgroups: [u32; 3],
    ) -> Result<(), PipelineError> {
        if !self.is_built() {
            return Err(PipelineError::ProgramNotBuilt(self.name.clone()));
        }
        let executor = registry.executor();
        let limit = executor.limits().max_compute_workgroups_per_dimension;
        if workgroups.iter().any(|&count| count > limit) {
            return Err(PipelineError::WorkgroupLimit {
                requested: workgroups,
                limit,
            });
        }
        self.refresh_bind_groups(registry)?;
        let Some(linked) = self.linked.as_ref() else {
            return Err(PipelineError::ProgramNotBuilt(self.name.clone()));
        };

        let mut encoder = executor.get_command_encoder(Some(self.name.as_str()));
        {
            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(self.name.as_str()),
                timestamp_writes: None,
            });
            compute_pass.set_pipeline(&linked.pipeline);
            for (index, bind_group) in self.bind_groups.iter().enumerate() {
                compute_pass.set_bind_group(index as u32, bind_group, &[]);
            }
            compute_pass.dispatch_workgroups(workgroups[0], workgroups[1], workgroups[2]);
        }
        executor.execute([encoder.finish()]);
        debug!("Dispatched {:?} with {:?} workgroups", self.name, workgroups);
        Ok(())
    }

    /// Writes `value` into the loose uniform `uniform` of the default uniform block
    pub fn set_uniform(
        &self,
        executor: &Executor,
        uniform: &str,
        value: &UniformValue,
    ) -> Result<(), PipelineError> {
        if !self.is_built() {
            return Err(PipelineError::ProgramNotBuilt(self.name.clone()));
        }
        let location =
            self.uniforms
                .location(uniform)
                .ok_or_else(|| PipelineError::UniformNotFound {
                    program: self.name.clone(),
                    uniform: uniform.to_string(),
                })?;
        if location.kind != value.kind() {
            return Err(PipelineError::UniformTypeMismatch {
                program: self.name.clone(),
                uniform: uniform.to_string(),
                expected: location.kind,
                found: value.kind(),
            });
        }
        self.uniforms.apply(executor, location, value);
        Ok(())
    }
}

/// Checks a buffer can be bound as a block of its kind on this device
fn check_binding(
    program: &str,
    buffer: &Buffer,
    limits: &wgpu::Limits,
) -> Result<(), PipelineError> {
    let (usage, max_size) = match buffer.kind() {
        BufferKind::Storage => (
            wgpu::BufferUsages::STORAGE,
            limits.max_storage_buffer_binding_size,
        ),
        BufferKind::Uniform => (
            wgpu::BufferUsages::UNIFORM,
            limits.max_uniform_buffer_binding_size,
        ),
    };
    if !buffer.usage().contains(usage) {
        return Err(BufferError::MissingUsage {
            name: buffer.name().to_string(),
            usage,
        }
        .into());
    }
    if buffer.byte_size() > max_size as u64 {
        return Err(PipelineError::BufferTooLarge {
            program: program.to_string(),
            name: buffer.name().to_string(),
            limit: max_size as u64,
            actual: buffer.byte_size(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod program_tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct FakeBuffer {
        name: &'static str,
        kind: BufferKind,
        size: u64,
        allocation: u64,
    }

    impl FakeBuffer {
        fn storage(name: &'static str, size: u64) -> Self {
            FakeBuffer {
                name,
                kind: BufferKind::Storage,
                size,
                allocation: size,
            }
        }
    }

    impl Bindable for FakeBuffer {
        fn get_name(&self) -> &str {
            self.name
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

    fn reflection(source: &str) -> Reflection {
        reflect::link(&reflect::compile(source).unwrap(), None).unwrap()
    }

    const SCAN: &str = "
        struct Sums {
            values: array<u32>,
        }

        @group(0) @binding(0)
        var<storage, read> InputBuffer: array<u32>;
        @group(0) @binding(1)
        var<storage, read_write> OutputBuffer: array<u32>;
        @group(0) @binding(2)
        var<storage, read_write> block_sums: Sums;

        @compute @workgroup_size(256)
        fn main(@builtin(global_invocation_id) id: vec3<u32>) {
            OutputBuffer[id.x] = InputBuffer[id.x] + block_sums.values[0];
        }
    ";

    #[test]
    fn matched_buffers_get_the_declared_binding() {
        let reflection = reflection(SCAN);
        let buffers = [
            FakeBuffer::storage("OutputBuffer", 1024),
            FakeBuffer::storage("InputBuffer", 1024),
        ];
        let table = resolve("BlockScan", &reflection, &buffers).unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table["InputBuffer"].point, BindingPoint { group: 0, binding: 0 });
        assert_eq!(table["OutputBuffer"].point, BindingPoint { group: 0, binding: 1 });
        assert_eq!(table["OutputBuffer"].allocation, 1024);
    }

    #[test]
    fn unmatched_buffers_are_skipped_silently() {
        let reflection = reflection(SCAN);
        let mut uniform = FakeBuffer::storage("InputBuffer", 16);
        uniform.kind = BufferKind::Uniform;
        let buffers = [FakeBuffer::storage("Unrelated", 64), uniform];

        let table = resolve("BlockScan", &reflection, &buffers).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn struct_type_names_match_too() {
        let reflection = reflection(SCAN);
        let buffers = [FakeBuffer::storage("Sums", 64)];
        let table = resolve("BlockScan", &reflection, &buffers).unwrap();
        assert_eq!(table["Sums"].block, "block_sums");
        assert_eq!(table["Sums"].point, BindingPoint { group: 0, binding: 2 });
    }

    #[test]
    fn variable_name_wins_over_type_name() {
        let reflection = reflection(SCAN);
        let buffers = [
            FakeBuffer::storage("Sums", 64),
            FakeBuffer::storage("block_sums", 64),
        ];
        let table = resolve("BlockScan", &reflection, &buffers).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.contains_key("block_sums"));
    }

    #[test]
    fn buffers_smaller_than_their_block_are_rejected() {
        let reflection = reflection(
            "
            struct Params { a: vec4<f32>, b: vec4<f32> }
            @group(0) @binding(3)
            var<storage, read_write> Params_: Params;

            @compute @workgroup_size(1)
            fn main() { Params_.a = Params_.b; }
            ",
        );
        let buffers = [FakeBuffer::storage("Params_", 16)];
        assert_eq!(
            resolve("Small", &reflection, &buffers),
            Err(PipelineError::BufferTooSmall {
                program: "Small".to_string(),
                name: "Params_".to_string(),
                required: 32,
                actual: 16,
            })
        );
    }

    #[test]
    fn the_same_buffer_resolves_per_program() {
        let first = reflection(
            "@group(0) @binding(0) var<storage, read_write> Data: array<u32>;
             @compute @workgroup_size(1) fn main() { Data[0] = 1u; }",
        );
        let second = reflection(
            "@group(1) @binding(4) var<storage, read_write> Data: array<u32>;
             @compute @workgroup_size(1) fn main() { Data[0] = 2u; }",
        );
        let buffers = [FakeBuffer::storage("Data", 4)];

        let first = resolve("First", &first, &buffers).unwrap();
        let second = resolve("Second", &second, &buffers).unwrap();
        assert_eq!(first["Data"].point, BindingPoint { group: 0, binding: 0 });
        assert_eq!(second["Data"].point, BindingPoint { group: 1, binding: 4 });
    }

    #[test]
    fn new_programs_are_unbuilt() {
        let program = ComputeProgram::new("AddOne");
        assert_eq!(program.status(), BuildStatus::Unbuilt);
        assert!(program.binding_table().is_empty());
        assert!(program.workgroup_size().is_none());
    }
}
