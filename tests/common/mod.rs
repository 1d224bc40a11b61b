use wgpu_pipeline::interface::{Executor, ExecutorConfig};

/// Opens the device the tests run on
///
/// Machines without a compute capable adapter can't run these tests: `None` is given back
/// and the calling test returns early.
pub async fn executor() -> Option<Executor> {
    let _ = env_logger::builder().is_test(true).try_init();
    match Executor::new(ExecutorConfig::from_env().with_label("integration tests")).await {
        Ok(executor) => Some(executor),
        Err(e) => {
            log::warn!("Skipping GPU test: {}", e);
            None
        }
    }
}
