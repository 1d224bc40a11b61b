/*!
This crate is a small layer on top of [`wgpu`] to run compute kernels written in WGSL.

Kernels and buffers are registered by name in a [`registry::Registry`], which owns them.
A [`pipeline::Pipeline`] borrows the registry to build programs out of the kernels: building
parses and validates the WGSL code, creates the compute pipeline and binds every registered
buffer whose name matches a block the kernel declares, at the `@group`/`@binding` the kernel
chose for it. No binding index has to be written anywhere but in the kernel.

Dispatching a program only submits the work. Every dispatch is recorded in its own compute pass,
so whatever a kernel writes is visible to the dispatches and copies which follow it, but the host
has to wait for the device ([`interface::Executor::wait`]) before reading a result back. Reading a
buffer through [`registry::Registry::read_buffer`] does that wait itself.

Loose parameters declared in `var<uniform>` blocks with no registered buffer are allocated by the
program and set by name with [`pipeline::Pipeline::set_uniform`].
*/

pub mod buffer;
pub mod coding;
pub mod errors;
pub mod interface;
pub mod pipeline;
pub mod program;
pub mod reflect;
pub mod registry;
pub mod uniform;
pub mod variable;

pub use buffer::{Buffer, BufferData, BufferKind, Ownership};
pub use coding::ProgramSource;
pub use errors::{BufferError, ExecutorError, PipelineError};
pub use interface::{Executor, ExecutorConfig};
pub use pipeline::Pipeline;
pub use program::{BindingTable, BuildStatus, ComputeProgram, ResolvedBinding};
pub use reflect::BindingPoint;
pub use registry::Registry;
pub use uniform::{UniformValue, ValueKind};

#[cfg(test)]
mod tests;
