//! Shader reflection.
//!
//! Kernels are parsed and validated with [`naga`], the shader translator `wgpu` itself
//! runs on. The resulting module tells which storage and uniform blocks the kernel
//! declares, at which `@group`/`@binding` they sit, how big they need to be, and which
//! `@compute` function is the entry point.

use crate::buffer::BufferKind;
use crate::uniform::ValueKind;
use naga::{AddressSpace, ShaderStage, StorageAccess, TypeInner};
use std::error::Error;
use std::fmt;

/// The slot a block is declared at, `@group(group) @binding(binding)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingPoint {
    pub group: u32,
    pub binding: u32,
}

impl fmt::Display for BindingPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@group({}) @binding({})", self.group, self.binding)
    }
}

/// A member of a uniform block whose type can be set with a [`crate::uniform::UniformValue`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredMember {
    pub name: String,
    pub offset: u32,
    pub kind: ValueKind,
}

/// A `var<storage>` or `var<uniform>` declared by the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredBlock {
    /// Name of the variable
    pub name: String,
    /// Name of the variable type, when it's a struct
    pub type_name: Option<String>,
    pub kind: BufferKind,
    pub point: BindingPoint,
    pub read_only: bool,
    /// Bytes a buffer needs to hold the block, one element for runtime sized arrays
    pub min_size: u64,
    /// Members which can be set as loose uniforms
    pub members: Vec<DeclaredMember>,
    /// Set when the block is a plain scalar, vector or matrix instead of a struct
    pub value_kind: Option<ValueKind>,
}

impl DeclaredBlock {
    /// A block matches a buffer name if it's the name of the variable or of its struct type
    pub fn matches(&self, name: &str) -> bool {
        self.name == name || self.type_name.as_deref() == Some(name)
    }
}

/// Everything the build step needs to know about a linked kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reflection {
    pub entry_point: String,
    pub workgroup_size: [u32; 3],
    pub blocks: Vec<DeclaredBlock>,
}

impl Reflection {
    /// Finds the block of the given kind matching `name`
    ///
    /// A block declared with the variable name wins over one matching by type name.
    pub fn find_block(&self, name: &str, kind: BufferKind) -> Option<&DeclaredBlock> {
        let mut candidates = self.blocks.iter().filter(|b| b.kind == kind);
        let by_type = candidates.clone().find(|b| b.type_name.as_deref() == Some(name));
        candidates.find(|b| b.name == name).or(by_type)
    }

    /// Number of bind groups the pipeline layout needs
    pub fn group_count(&self) -> u32 {
        self.blocks
            .iter()
            .map(|b| b.point.group + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn blocks_in_group(&self, group: u32) -> impl Iterator<Item = &DeclaredBlock> {
        self.blocks.iter().filter(move |b| b.point.group == group)
    }
}

/// Renders an error and all of its sources, one per line
pub(crate) fn error_chain(error: &dyn Error) -> String {
    let mut log = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        log.push_str(&format!("\n  caused by: {}", inner));
        source = inner.source();
    }
    log
}

/// Parses the WGSL text of a kernel
///
/// On failure the diagnostic of the front-end, rendered against the source, is given back.
pub fn compile(source: &str) -> Result<naga::Module, String> {
    if source.trim().is_empty() {
        return Err("the shader source is empty".to_string());
    }
    naga::front::wgsl::parse_str(source).map_err(|e| e.emit_to_string(source))
}

/// Validates a parsed kernel and reflects its compute entry point and blocks
///
/// `entry_point` selects a `@compute` function by name; with `None` the first one
/// declared is used. Only the blocks the entry point uses are reflected, so a kernel
/// sharing a module with others never asks for their buffers.
pub fn link(module: &naga::Module, entry_point: Option<&str>) -> Result<Reflection, String> {
    let info = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(module)
    .map_err(|e| error_chain(e.as_inner()))?;

    let mut compute_entries = module
        .entry_points
        .iter()
        .enumerate()
        .filter(|(_, ep)| ep.stage == ShaderStage::Compute);
    let (index, entry) = match entry_point {
        Some(name) => compute_entries
            .find(|(_, ep)| ep.name == name)
            .ok_or_else(|| format!("no @compute entry point named {:?} in the shader", name))?,
        None => compute_entries
            .next()
            .ok_or_else(|| "the shader declares no @compute entry point".to_string())?,
    };
    let usage = info.get_entry_point(index);

    let gctx = module.to_ctx();
    let mut blocks = Vec::new();
    for (handle, var) in module.global_variables.iter() {
        if usage[handle].is_empty() {
            continue;
        }
        let (kind, read_only) = match var.space {
            AddressSpace::Storage { access } => {
                (BufferKind::Storage, !access.contains(StorageAccess::STORE))
            }
            AddressSpace::Uniform => (BufferKind::Uniform, true),
            _ => continue,
        };
        let (Some(name), Some(binding)) = (var.name.as_ref(), var.binding.as_ref()) else {
            continue;
        };
        let ty = &module.types[var.ty];

        let (type_name, members) = match ty.inner {
            TypeInner::Struct { ref members, .. } => {
                let members = members
                    .iter()
                    .filter_map(|member| {
                        let kind = ValueKind::from_naga(&module.types[member.ty].inner)?;
                        Some(DeclaredMember {
                            name: member.name.clone()?,
                            offset: member.offset,
                            kind,
                        })
                    })
                    .collect();
                (ty.name.clone(), members)
            }
            _ => (None, Vec::new()),
        };

        blocks.push(DeclaredBlock {
            name: name.clone(),
            type_name,
            kind,
            point: BindingPoint {
                group: binding.group,
                binding: binding.binding,
            },
            read_only,
            min_size: ty.inner.size(gctx) as u64,
            members,
            value_kind: ValueKind::from_naga(&ty.inner),
        });
    }
    blocks.sort_by_key(|b| b.point);

    Ok(Reflection {
        entry_point: entry.name.clone(),
        workgroup_size: entry.workgroup_size,
        blocks,
    })
}

#[cfg(test)]
mod reflect_tests {
    use super::*;

    const KERNEL: &str = "
        struct Params {
            scale: f32,
            offset: vec4<f32>,
        }

        @group(0) @binding(0)
        var<storage, read> Input: array<f32>;
        @group(0) @binding(1)
        var<storage, read_write> Output: array<f32>;
        @group(1) @binding(0)
        var<uniform> params: Params;

        @compute @workgroup_size(64, 2)
        fn main(@builtin(global_invocation_id) id: vec3<u32>) {
            Output[id.x] = Input[id.x] * params.scale + params.offset.x;
        }
    ";

    fn reflect(source: &str) -> Reflection {
        let module = compile(source).unwrap();
        link(&module, None).unwrap()
    }

    #[test]
    fn blocks_are_reflected_with_their_binding_points() {
        let reflection = reflect(KERNEL);
        assert_eq!(reflection.entry_point, "main");
        assert_eq!(reflection.workgroup_size, [64, 2, 1]);
        assert_eq!(reflection.group_count(), 2);

        let input = reflection.find_block("Input", BufferKind::Storage).unwrap();
        assert_eq!(input.point, BindingPoint { group: 0, binding: 0 });
        assert!(input.read_only);
        assert_eq!(input.min_size, 4);

        let output = reflection.find_block("Output", BufferKind::Storage).unwrap();
        assert_eq!(output.point, BindingPoint { group: 0, binding: 1 });
        assert!(!output.read_only);
    }

    #[test]
    fn uniform_blocks_expose_their_members() {
        let reflection = reflect(KERNEL);
        let params = reflection.find_block("Params", BufferKind::Uniform).unwrap();
        assert_eq!(params.name, "params");
        assert_eq!(params.point, BindingPoint { group: 1, binding: 0 });
        assert_eq!(params.min_size, 32);
        assert_eq!(
            params.members,
            vec![
                DeclaredMember {
                    name: "scale".to_string(),
                    offset: 0,
                    kind: ValueKind::Float
                },
                DeclaredMember {
                    name: "offset".to_string(),
                    offset: 16,
                    kind: ValueKind::Vec4
                },
            ]
        );
    }

    #[test]
    fn lookup_is_kind_sensitive() {
        let reflection = reflect(KERNEL);
        assert!(reflection.find_block("Input", BufferKind::Uniform).is_none());
        assert!(reflection.find_block("params", BufferKind::Storage).is_none());
        assert!(reflection.find_block("Missing", BufferKind::Storage).is_none());
    }

    #[test]
    fn syntax_errors_are_compile_failures() {
        let log = compile("@compute @workgroup_size(1) fn main( {").unwrap_err();
        assert!(!log.is_empty());
        assert_eq!(compile("   ").unwrap_err(), "the shader source is empty");
    }

    #[test]
    fn a_compute_entry_point_is_required_to_link() {
        let module = compile("fn helper() -> u32 { return 1u; }").unwrap();
        let log = link(&module, None).unwrap_err();
        assert!(log.contains("@compute"));

        let module = compile(KERNEL).unwrap();
        assert!(link(&module, Some("other")).is_err());
        assert_eq!(link(&module, Some("main")).unwrap().entry_point, "main");
    }

    #[test]
    fn only_blocks_used_by_the_entry_point_are_reflected() {
        let module = compile(
            "
            @group(0) @binding(0)
            var<storage, read_write> A: array<u32>;
            @group(0) @binding(1)
            var<storage, read_write> B: array<u32>;
            @group(1) @binding(0)
            var<uniform> b_step: u32;

            @compute @workgroup_size(1)
            fn only_a() { A[0] = 1u; }

            @compute @workgroup_size(1)
            fn only_b() { B[0] = b_step; }
            ",
        )
        .unwrap();

        let names = |reflection: Reflection| -> Vec<String> {
            reflection.blocks.into_iter().map(|b| b.name).collect()
        };
        let only_a = link(&module, Some("only_a")).unwrap();
        assert_eq!(only_a.group_count(), 1);
        assert_eq!(names(only_a), vec!["A"]);
        assert_eq!(names(link(&module, Some("only_b")).unwrap()), vec!["B", "b_step"]);
        assert_eq!(names(link(&module, None).unwrap()), vec!["A"]);
    }

    #[test]
    fn invalid_modules_fail_to_link() {
        // Parses fine, but a read-only storage block can't be written to
        let module = compile(
            "
            @group(0) @binding(0)
            var<storage, read> Data: array<u32>;

            @compute @workgroup_size(1)
            fn main() {
                Data[0] = 1u;
            }
            ",
        );
        match module {
            Ok(module) => assert!(link(&module, None).is_err()),
            Err(log) => assert!(!log.is_empty()),
        }
    }
}
