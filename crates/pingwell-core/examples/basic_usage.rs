//! Example of driving pingwell-core directly from Rust.

use std::sync::Arc;

use pingwell_core::storage;
use pingwell_core::{
    Configuration, Coordinator, FileEngine, InitContext, MetricValue, PendingPingsScheduler,
    PingType, StaticClientInfo,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Setup configuration
    let files_dir = std::env::temp_dir().join("pingwell-example");
    let context = InitContext::new(&files_dir, "org.example.basic");
    let config = Configuration::new().with_channel("example").with_log_pings(true);
    let data_dir = context.data_dir(&config);

    // 2. Create the coordinator. This starts the dispatcher's background task.
    let coordinator = Coordinator::new(
        Arc::new(FileEngine::new()),
        Arc::new(PendingPingsScheduler::new(&data_dir, config.server_endpoint.clone())),
        Arc::new(StaticClientInfo::new("1").with_display_version(env!("CARGO_PKG_VERSION"))),
    )?;

    // 3. Ping types can be registered before the engine exists
    let metrics = PingType::new("metrics", true, false, vec![]);
    coordinator.register_ping_type(&metrics);

    coordinator.initialize(&context, config)?;
    coordinator.set_experiment_active("example-experiment", "treatment", None);

    // 4. Stage some data and send it
    storage::stage_metric(&data_dir, "metrics", "startup_ms", MetricValue::Int(420))?;
    if let Some(completion) = metrics.submit(&coordinator) {
        completion.wait()?;
    }

    // 5. Drain the queue before exiting
    coordinator.shutdown()?;
    println!(
        "Pending pings in {}: {}",
        data_dir.display(),
        storage::list_pending_pings(&data_dir)?.len()
    );

    Ok(())
}
