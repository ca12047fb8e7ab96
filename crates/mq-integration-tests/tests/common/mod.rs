//! Common test utilities for mq integration tests
//!
//! This module provides:
//! - A once-guarded tracing subscriber driven by `RUST_LOG`
//! - [`TestContext`], which owns provisioned infrastructure and queue cleanup
//!   for one test and releases both when the test finishes
//! - Recording handlers for consumer scenarios

use async_trait::async_trait;
use mq_infra::{new_infra, InfraError, MqInfra, MqInfraConfig};
use mq_runtime::{Cleanup, Json, Message, MessageHandler};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Install a test-writer subscriber once per test binary
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Name unique to this run, so tests sharing a broker never collide
#[allow(dead_code)]
pub fn unique_name(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

// ============================================================================
// Test Context
// ============================================================================

/// Resources one test created, released in reverse order by [`teardown`]
///
/// [`teardown`]: TestContext::teardown
pub struct TestContext {
    infras: Vec<Box<dyn MqInfra>>,
    cleanups: Vec<Cleanup>,
}

#[allow(dead_code)]
impl TestContext {
    pub fn new() -> Self {
        init_tracing();
        Self {
            infras: Vec::new(),
            cleanups: Vec::new(),
        }
    }

    /// Provision `config` and remember it for teardown
    pub async fn declare(&mut self, config: MqInfraConfig) -> Result<(), InfraError> {
        let infra = new_infra(config);
        infra.declare().await?;
        self.infras.push(infra);
        Ok(())
    }

    /// Run `cleanup` when the context is torn down
    pub fn defer(&mut self, cleanup: Cleanup) {
        self.cleanups.push(cleanup);
    }

    /// Release queue clients first, then provisioned infrastructure.
    /// Teardown failures are logged so every resource gets its chance.
    pub async fn teardown(mut self) {
        while let Some(cleanup) = self.cleanups.pop() {
            cleanup.run().await;
        }
        while let Some(infra) = self.infras.pop() {
            if let Err(e) = infra.tear_down().await {
                tracing::warn!(error = %e, "Failed to tear down test infrastructure");
            }
        }
    }
}

// ============================================================================
// Payloads and Handlers
// ============================================================================

/// Payload used across scenarios
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestEvent {
    #[serde(rename = "ID")]
    pub id: String,
}

#[allow(dead_code)]
pub fn event(id: impl Into<String>) -> Json<TestEvent> {
    Json(TestEvent { id: id.into() })
}

/// Acks every message and records the decoded ids in handling order,
/// optionally holding each message for `delay`
#[allow(dead_code)]
pub struct RecordingHandler {
    pub seen: Mutex<Vec<String>>,
    pub active: Mutex<(usize, usize)>,
    delay: Duration,
}

#[allow(dead_code)]
impl RecordingHandler {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            active: Mutex::new((0, 0)),
            delay,
        })
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    /// Highest number of invocations that were running at the same time
    pub fn max_active(&self) -> usize {
        self.active.lock().unwrap().1
    }

    /// Wait until `count` messages have been handled or `limit` elapses
    pub async fn wait_for(&self, count: usize, limit: Duration) -> bool {
        tokio::time::timeout(limit, async {
            while self.seen.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, message: Message, _cancel: CancellationToken) -> anyhow::Result<()> {
        {
            let mut active = self.active.lock().unwrap();
            active.0 += 1;
            active.1 = active.1.max(active.0);
        }

        let Json(event) = <Json<TestEvent> as mq_runtime::IncomingMessage>::from_message(&message)?;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        message.ack().await?;

        self.seen.lock().unwrap().push(event.id);
        self.active.lock().unwrap().0 -= 1;
        Ok(())
    }
}
