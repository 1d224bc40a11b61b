//! Values applied to the loose uniforms of a program.
//!
//! WGSL has no loose uniforms: every uniform lives in a `var<uniform>` block. The
//! blocks a program declares without a registered uniform buffer to feed them form
//! its *default uniform block*, allocated by the program itself. [`UniformValue`]s are
//! written into it, member by member, through [`crate::pipeline::Pipeline::set_uniform`].

use crate::interface::Executor;
use crate::reflect::BindingPoint;
use naga::{Scalar, TypeInner, VectorSize};
use std::fmt;

/// The closed set of types a uniform value can have
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Int,
    UInt,
    Float,
    Vec2,
    Vec3,
    Vec4,
    Mat4,
}

impl ValueKind {
    /// The kind matching a shader declared type, if it's one of the supported ones
    pub(crate) fn from_naga(inner: &TypeInner) -> Option<ValueKind> {
        let kind = match *inner {
            TypeInner::Scalar(Scalar::I32) => ValueKind::Int,
            TypeInner::Scalar(Scalar::U32) => ValueKind::UInt,
            TypeInner::Scalar(Scalar::F32) => ValueKind::Float,
            TypeInner::Vector {
                size,
                scalar: Scalar::F32,
            } => match size {
                VectorSize::Bi => ValueKind::Vec2,
                VectorSize::Tri => ValueKind::Vec3,
                VectorSize::Quad => ValueKind::Vec4,
            },
            TypeInner::Matrix {
                columns: VectorSize::Quad,
                rows: VectorSize::Quad,
                scalar: Scalar::F32,
            } => ValueKind::Mat4,
            _ => return None,
        };
        Some(kind)
    }

    pub fn byte_size(self) -> usize {
        match self {
            ValueKind::Int | ValueKind::UInt | ValueKind::Float => 4,
            ValueKind::Vec2 => 8,
            ValueKind::Vec3 => 12,
            ValueKind::Vec4 => 16,
            ValueKind::Mat4 => 64,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Int => "i32",
            ValueKind::UInt => "u32",
            ValueKind::Float => "f32",
            ValueKind::Vec2 => "vec2<f32>",
            ValueKind::Vec3 => "vec3<f32>",
            ValueKind::Vec4 => "vec4<f32>",
            ValueKind::Mat4 => "mat4x4<f32>",
        };
        write!(f, "{}", name)
    }
}

/// A value for a uniform
///
/// Matrices are given column by column, which is the order WGSL stores them in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    Int(i32),
    UInt(u32),
    Float(f32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    Mat4([[f32; 4]; 4]),
}

impl UniformValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            UniformValue::Int(_) => ValueKind::Int,
            UniformValue::UInt(_) => ValueKind::UInt,
            UniformValue::Float(_) => ValueKind::Float,
            UniformValue::Vec2(_) => ValueKind::Vec2,
            UniformValue::Vec3(_) => ValueKind::Vec3,
            UniformValue::Vec4(_) => ValueKind::Vec4,
            UniformValue::Mat4(_) => ValueKind::Mat4,
        }
    }

    /// The bytes of the value, as they're laid out in the uniform block
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            UniformValue::Int(value) => bytemuck::bytes_of(value).to_vec(),
            UniformValue::UInt(value) => bytemuck::bytes_of(value).to_vec(),
            UniformValue::Float(value) => bytemuck::bytes_of(value).to_vec(),
            UniformValue::Vec2(value) => bytemuck::cast_slice(value).to_vec(),
            UniformValue::Vec3(value) => bytemuck::cast_slice(value).to_vec(),
            UniformValue::Vec4(value) => bytemuck::cast_slice(value).to_vec(),
            UniformValue::Mat4(columns) => bytemuck::cast_slice(columns).to_vec(),
        }
    }
}

impl From<i32> for UniformValue {
    fn from(value: i32) -> Self {
        UniformValue::Int(value)
    }
}

impl From<u32> for UniformValue {
    fn from(value: u32) -> Self {
        UniformValue::UInt(value)
    }
}

impl From<f32> for UniformValue {
    fn from(value: f32) -> Self {
        UniformValue::Float(value)
    }
}

impl From<[f32; 2]> for UniformValue {
    fn from(value: [f32; 2]) -> Self {
        UniformValue::Vec2(value)
    }
}

impl From<[f32; 3]> for UniformValue {
    fn from(value: [f32; 3]) -> Self {
        UniformValue::Vec3(value)
    }
}

impl From<[f32; 4]> for UniformValue {
    fn from(value: [f32; 4]) -> Self {
        UniformValue::Vec4(value)
    }
}

impl From<[[f32; 4]; 4]> for UniformValue {
    fn from(value: [[f32; 4]; 4]) -> Self {
        UniformValue::Mat4(value)
    }
}

/// Where a loose uniform lives inside the default uniform block of a program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformLocation {
    /// Index of the block in [`DefaultUniforms::blocks`]
    pub block: usize,
    pub offset: u32,
    pub kind: ValueKind,
}

/// One `var<uniform>` block backed by a buffer the program allocated itself
#[derive(Debug)]
pub struct DefaultUniformBlock {
    pub name: String,
    pub point: BindingPoint,
    pub buffer: wgpu::Buffer,
}

/// The default uniform block of a built program, and the locations of its members
#[derive(Debug, Default)]
pub struct DefaultUniforms {
    pub blocks: Vec<DefaultUniformBlock>,
    pub locations: Vec<(String, UniformLocation)>,
}

impl DefaultUniforms {
    /// Finds the location of a uniform by member name, `block.member` or block name
    pub fn location(&self, uniform: &str) -> Option<UniformLocation> {
        self.locations
            .iter()
            .find(|(name, _)| name == uniform)
            .map(|(_, location)| *location)
    }

    /// Writes `value` at `location`
    ///
    /// The write goes through the queue, so it's visible to every dispatch submitted
    /// after it and stays until it's overwritten.
    pub fn apply(&self, executor: &Executor, location: UniformLocation, value: &UniformValue) {
        let block = &self.blocks[location.block];
        executor
            .queue()
            .write_buffer(&block.buffer, location.offset as u64, &value.to_bytes());
    }
}
