//! Webhook delivery tests against a mock HTTP sink.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{job, pipeline_config, wait_terminal, ScriptedExecutor};
use sutra_core::jobs::{
    deliver, InMemoryJobStore, JobPipeline, JobStatus, RetryPolicy, Scheduler,
    SchedulerConfig, TerminalEvent, WebhookNotifier,
};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn succeeded_event(id: &str) -> TerminalEvent {
    let mut finished = job(id);
    finished.status = JobStatus::Succeeded;
    TerminalEvent::from_job(&finished).unwrap()
}

#[tokio::test]
async fn test_webhook_sends_idempotency_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/render"))
        .and(header("Idempotency-Key", "abc123:succeeded"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let notifier = WebhookNotifier::new(format!("{}/hooks/render", server.uri()), Duration::from_secs(2)).unwrap();
    assert!(deliver(&notifier, &succeeded_event("abc123"), &RetryPolicy::immediate(3)).await);
}

#[tokio::test]
async fn test_webhook_retries_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let notifier = WebhookNotifier::new(server.uri(), Duration::from_secs(2)).unwrap();
    assert!(deliver(&notifier, &succeeded_event("flaky-sink"), &RetryPolicy::immediate(5)).await);
}

#[tokio::test]
async fn test_webhook_gives_up_on_client_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(410))
        .expect(1)
        .mount(&server)
        .await;

    let notifier = WebhookNotifier::new(server.uri(), Duration::from_secs(2)).unwrap();
    assert!(!deliver(&notifier, &succeeded_event("gone"), &RetryPolicy::immediate(5)).await);
}

#[tokio::test]
async fn test_scheduler_notifies_on_terminal_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("Idempotency-Key", "notify-me:succeeded"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryJobStore::new());
    let pipeline = JobPipeline::new(store.clone(), Arc::new(ScriptedExecutor::new()), pipeline_config(3));
    let notifier = Arc::new(WebhookNotifier::new(server.uri(), Duration::from_secs(2)).unwrap());
    let scheduler = Scheduler::new(
        store.clone(),
        pipeline,
        notifier,
        SchedulerConfig {
            max_concurrency: 1,
            queue_capacity: 4,
            notify_policy: RetryPolicy::immediate(3),
            ..Default::default()
        },
    );
    let workers = scheduler.start();

    let id = scheduler.enqueue(job("notify-me")).await.unwrap();
    wait_terminal(&*store, &id).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while scheduler.stats().processed() < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    workers.shutdown();
    workers.join().await;
    server.verify().await;
}
