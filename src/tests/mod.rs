use crate::buffer::{aligned_size, BufferData, BufferKind};
use crate::coding::ProgramSource;
use crate::errors::PipelineError;
use crate::interface::{Executor, ExecutorConfig};
use crate::program::{BuildStatus, ComputeProgram};
use crate::reflect::{error_chain, BindingPoint};
use crate::registry::Registry;
use crate::uniform::UniformValue;

const COUNTER: &str = "
    struct Settings {
        step: u32,
        gain: f32,
    }

    @group(0) @binding(0)
    var<storage, read_write> Counter: array<u32>;
    @group(0) @binding(1)
    var<uniform> settings: Settings;

    @compute @workgroup_size(32)
    fn main(@builtin(global_invocation_id) global_id: vec3<u32>) {
        if (global_id.x >= arrayLength(&Counter)) {
            return;
        }
        Counter[global_id.x] = Counter[global_id.x] + settings.step;
    }
";

async fn executor() -> Option<Executor> {
    let _ = env_logger::builder().is_test(true).try_init();
    Executor::new(ExecutorConfig::default()).await.ok()
}

#[test]
fn error_chains_list_every_source() {
    #[derive(Debug, thiserror::Error)]
    #[error("outer")]
    struct Outer(#[source] std::io::Error);

    let error = Outer(std::io::Error::new(std::io::ErrorKind::Other, "inner"));
    assert_eq!(error_chain(&error), "outer\n  caused by: inner");
}

#[tokio::test]
async fn validation_errors_are_captured() {
    let Some(executor) = executor().await else {
        return;
    };
    let (_, error) = executor
        .capture_validation(|| {
            executor.device().create_buffer(&wgpu::BufferDescriptor {
                label: Some("invalid usage"),
                size: 16,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::STORAGE,
                mapped_at_creation: false,
            })
        })
        .await;
    assert!(error.is_some());

    let (_, error) = executor
        .capture_validation(|| executor.get_command_encoder(Some("valid")))
        .await;
    assert!(error.is_none());
}

#[tokio::test]
async fn programs_track_their_build_status() {
    let Some(executor) = executor().await else {
        return;
    };
    let mut registry = Registry::new(&executor);
    registry.add_shader("Counter", ProgramSource::from_content(COUNTER));
    registry
        .create_buffer_with_data("Counter", BufferData::U32(&[0; 64]))
        .unwrap();

    let mut program = ComputeProgram::new("Counter");
    assert_eq!(
        program.dispatch(&registry, [1, 1, 1]),
        Err(PipelineError::ProgramNotBuilt("Counter".to_string()))
    );

    program.build(&registry).await.unwrap();
    assert_eq!(program.status(), BuildStatus::Built);
    assert_eq!(
        program.binding_table()["Counter"].point,
        BindingPoint { group: 0, binding: 0 }
    );
    let reflection = program.reflection().unwrap();
    assert_eq!(reflection.entry_point, "main");
    assert_eq!(reflection.group_count(), 1);

    // A broken rebuild leaves nothing usable behind
    registry.add_shader("Counter", ProgramSource::from_content("@compute fn main() {}"));
    assert!(program.build(&registry).await.is_err());
    assert_eq!(program.status(), BuildStatus::Failed);
    assert!(program.binding_table().is_empty());
    assert!(program.reflection().is_none());
    assert_eq!(
        program.set_uniform(&executor, "step", &UniformValue::UInt(1)),
        Err(PipelineError::ProgramNotBuilt("Counter".to_string()))
    );
}

#[tokio::test]
async fn default_uniforms_persist_across_dispatches() {
    let Some(executor) = executor().await else {
        return;
    };
    let mut registry = Registry::new(&executor);
    registry.add_shader("Counter", ProgramSource::from_content(COUNTER));
    registry
        .create_buffer_with_data("Counter", BufferData::U32(&[0; 64]))
        .unwrap();

    let mut program = ComputeProgram::new("Counter");
    program.build(&registry).await.unwrap();
    program
        .set_uniform(&executor, "settings.step", &UniformValue::UInt(3))
        .unwrap();
    program
        .set_uniform(&executor, "gain", &UniformValue::Float(0.5))
        .unwrap();

    let before = executor.submission_count();
    for _ in 0..3 {
        program.dispatch(&registry, [2, 1, 1]).unwrap();
    }
    assert_eq!(executor.submission_count(), before + 3);

    let counter: Vec<u32> = registry
        .read_data(BufferKind::Storage, "Counter")
        .await
        .unwrap();
    assert_eq!(counter, vec![9; 64]);
}

#[tokio::test]
async fn buffers_are_allocated_with_padding() {
    let Some(executor) = executor().await else {
        return;
    };
    let mut registry = Registry::new(&executor);
    registry
        .create_buffer_with_data("Odd", BufferData::Bytes(&[1, 2, 3, 4, 5]))
        .unwrap();

    let buffer = registry.storage_buffer("Odd").unwrap();
    assert_eq!(buffer.byte_size(), 5);
    assert_eq!(buffer.handle().size(), aligned_size(5));

    let bytes = registry
        .read_buffer(BufferKind::Storage, "Odd")
        .await
        .unwrap();
    assert_eq!(bytes, vec![1, 2, 3, 4, 5]);
}
