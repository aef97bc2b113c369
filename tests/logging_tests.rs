//! Logging integration: structured events from the scheduler reach the
//! configured log file
//!
//! The subscriber is process-global, so this binary holds a single test.

mod common;

use batchforge::logging::{self, LogFormat, LogLevel, LoggingConfig};
use batchforge::request::RequestSpec;
use common::{
    create_temp_dir, echo, harness, log_path_in, serial, test_config, within, ScriptedWorker,
};

#[tokio::test]
#[serial]
async fn test_scheduler_events_written_as_json() -> anyhow::Result<()> {
    let dir = create_temp_dir()?;
    let path = log_path_in(&dir, "logs/scheduler.jsonl");

    let config = LoggingConfig::new()
        .with_level(LogLevel::Debug)
        .with_format(LogFormat::Human)
        .with_log_file(path.clone());
    logging::init_with_config(&config)?;
    assert!(logging::is_initialized());

    let mut h = harness(test_config(), ScriptedWorker::new(echo));
    let task = h.spawn();
    let request = h.handle.submit(RequestSpec::new(vec![1, 2], 2).with_id("logged"))?;
    within(request.collect_output()).await;
    h.handle.shutdown();
    within(task).await??;

    // The file writer is synchronous, so the loop's events are on disk once it has returned
    let contents = std::fs::read_to_string(&path)?;

    assert!(contents.contains("Scheduler created"));
    assert!(contents.contains("Scheduler loop stopped"));
    assert!(contents.contains("\"leftover\":0"));
    for line in contents.lines().filter(|l| !l.trim().is_empty()) {
        serde_json::from_str::<serde_json::Value>(line)?;
    }

    // Only the first configuration is ever installed
    logging::init_with_config(&LoggingConfig::new().with_level(LogLevel::Trace))?;
    assert!(logging::is_initialized());
    Ok(())
}
