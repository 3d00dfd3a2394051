use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use handoff::config::HandoffConfig;
use handoff::error::Result;
use handoff::handoff::message_type;
use handoff::handoff::{
    HandoffMessage, HandoffProcessor, HandoffSystem, MemoryQueue, ProcessResult, ProcessorContext,
    ProcessorMetadata, ProcessorPolicy,
};
use handoff::runtime::Lane;

/// Replies with its payload; useful for smoke-testing a deployment.
struct EchoProcessor;

#[async_trait]
impl HandoffProcessor for EchoProcessor {
    fn name(&self) -> &str {
        "echo"
    }

    fn metadata(&self) -> ProcessorMetadata {
        ProcessorMetadata::new([message_type::system("echo", 1)], ProcessorPolicy::new(Lane::Main))
    }

    async fn process(&self, message: &HandoffMessage, ctx: ProcessorContext) -> Result<ProcessResult> {
        ctx.emit(json!({ "status": "echoing", "runId": ctx.run_id }));
        tracing::info!(message_id = %message.id, trace_id = %ctx.trace_id, "Echo");
        Ok(ProcessResult::ok_with_output(Value::Object(
            message.payload.clone(),
        )))
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = HandoffConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    });

    eprintln!("Handoff worker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Worker concurrency: {}", config.worker_concurrency);
    eprintln!("   Max attempts: {}", config.max_attempts);
    eprintln!("   Run TTL: {:?}", config.run_ttl);
    eprintln!("   Pending timeout: {:?}", config.pending_timeout);

    let system = HandoffSystem::new(config, Arc::new(MemoryQueue::new())).await;
    system.processors().register(Arc::new(EchoProcessor)).await;
    for processor in system.processors().list(None).await {
        eprintln!(
            "   Processor: {} ({}, lane {})",
            processor.message_type,
            processor.processor.name(),
            processor.metadata.policy.lane
        );
    }

    system.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Ctrl+C received, shutting down...");
    system.shutdown().await;

    Ok(())
}
