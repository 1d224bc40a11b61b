//! This module contains all the specific error implementation for the crate
//!
//! Hopefully like this errors are easier to catch and manage from another crate.
//! None of them is fatal: every operation returning one of these leaves the
//! state it touched as it was before the call.

use crate::buffer::BufferKind;
use crate::uniform::ValueKind;
use thiserror::Error;

/// Errors raised while talking to a single [`crate::buffer::Buffer`] or while
/// looking one up in the [`crate::registry::Registry`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("No {kind} buffer named {name:?} is registered")]
    BufferNotFound { kind: BufferKind, name: String },
    #[error("Buffer {0:?} wraps an external handle: it can be written to, but never (re)allocated")]
    InvalidOperationOnExternalBuffer(String),
    #[error("Buffer {0:?} can't be created with a size of 0 bytes")]
    ZeroSize(String),
    #[error("Buffer {name:?} of {size} bytes exceeds the device limit of {limit} bytes")]
    TooLarge { name: String, size: u64, limit: u64 },
    #[error("Writing {len} bytes at offset {offset} overflows buffer {name:?} of {size} bytes")]
    OutOfBounds {
        name: String,
        offset: u64,
        len: u64,
        size: u64,
    },
    #[error("Offset {offset} and length {len} for buffer {name:?} must both be multiples of 4 bytes, unless the write ends the buffer")]
    Misaligned { name: String, offset: u64, len: u64 },
    #[error("Buffer {name:?} lacks the {usage:?} usage needed for this operation")]
    MissingUsage {
        name: String,
        usage: wgpu::BufferUsages,
    },
    #[error("Reading back buffer {name:?} failed: {reason}")]
    Readback { name: String, reason: String },
}

/// Errors raised by the [`crate::pipeline::Pipeline`] while building, dispatching
/// or setting parameters on a program
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PipelineError {
    #[error("No shader named {0:?} is loaded in the registry")]
    ShaderNotFound(String),
    #[error("Compilation of {name:?} failed:\n{log}")]
    CompileError { name: String, log: String },
    #[error("Linking of {name:?} failed:\n{log}")]
    LinkError { name: String, log: String },
    #[error("Program {0:?} has not been successfully built")]
    ProgramNotBuilt(String),
    #[error("No program named {0:?} exists in this pipeline")]
    ProgramNotFound(String),
    #[error("Program {program:?} has no uniform named {uniform:?}")]
    UniformNotFound { program: String, uniform: String },
    #[error("Uniform {uniform:?} of {program:?} is declared as {expected}, got a {found} value")]
    UniformTypeMismatch {
        program: String,
        uniform: String,
        expected: ValueKind,
        found: ValueKind,
    },
    #[error("Block {block:?} of program {program:?} has no {kind} buffer bound to it")]
    BufferNotFound {
        program: String,
        block: String,
        kind: BufferKind,
    },
    #[error("Buffer {name:?} has {actual} bytes, but its block in {program:?} needs at least {required}")]
    BufferTooSmall {
        program: String,
        name: String,
        required: u64,
        actual: u64,
    },
    #[error("Buffer {name:?} has {actual} bytes, more than the {limit} the device can bind in {program:?}")]
    BufferTooLarge {
        program: String,
        name: String,
        limit: u64,
        actual: u64,
    },
    #[error("Workgroup count {requested:?} exceeds the device limit of {limit} per dimension")]
    WorkgroupLimit { requested: [u32; 3], limit: u32 },
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Errors raised while opening the connection with the GPU
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("No adapter found for this machine")]
    NoAdapter,
    #[error("Adapter {0:?} does not support compute shaders")]
    NoComputeSupport(String),
    #[error(transparent)]
    RequestDevice(#[from] wgpu::RequestDeviceError),
}
