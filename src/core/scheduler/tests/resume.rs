use chrono::Utc;
use serde_json::json;

use super::{parked, scheduler, terminal, wait_for};
use crate::core::normalize::CanonicalPayload;
use crate::core::providers::{PendingJob, ProviderKind};
use crate::core::scheduler::poller::{CompletionPoller, PollVerdict};
use crate::core::scheduler::types::TaskStatus;
use crate::core::testing::{self, MockResponse, MockVendor, TestEnv, graph_history, png_bytes};

fn graph_job(job_id: &str, endpoint: &str) -> PendingJob {
    PendingJob {
        provider: ProviderKind::NodeGraph,
        job_id: job_id.to_string(),
        endpoint: endpoint.to_string(),
        capability_id: "sdxl".into(),
        executor_id: Some("comfy-local".into()),
        credential_id: None,
        log_id: None,
        submitted_at: Utc::now(),
    }
}

async fn graph_env(vendor: &MockVendor) -> TestEnv {
    let env = TestEnv::new().await;
    env.add(
        &testing::graph_capability("sdxl"),
        &testing::graph_executor("comfy-local", &vendor.base_url()),
    )
    .await;
    env
}

#[tokio::test]
async fn resume_leaves_submitted_jobs_alone() {
    let Some(vendor) = MockVendor::start().await else {
        return;
    };
    vendor.respond(
        "GET",
        "/history/g-1",
        vec![MockResponse::json(200, graph_history("g-1", &["out.png"]))],
    );
    vendor.respond("GET", "/view", vec![MockResponse::bytes(200, png_bytes(), "image/png")]);
    let env = graph_env(&vendor).await;
    env.store
        .create_running_task_with_job(
            "t-parked",
            "sdxl",
            None,
            &json!({"capabilityId": "sdxl", "params": {"prompt": "x"}}),
            &graph_job("g-1", &vendor.base_url()),
        )
        .await
        .unwrap();
    let scheduler = scheduler(&env);

    let report = scheduler.resume_incomplete().await.unwrap();
    assert_eq!(report.awaiting_poll, 1);
    assert_eq!(report.requeued, 0);

    let snapshot = scheduler.get_task("t-parked").await.unwrap().unwrap();
    assert_eq!(snapshot.status, TaskStatus::Succeeded);
    assert_eq!(snapshot.images.len(), 1);
    assert_eq!(vendor.count("POST", "/prompt"), 0);
}

#[tokio::test]
async fn resume_resubmits_work_that_never_reached_the_vendor() {
    let Some(vendor) = MockVendor::start().await else {
        return;
    };
    vendor.respond(
        "POST",
        "/v1/images",
        vec![MockResponse::json(200, json!({"data": [{"url": "https://cdn.acme.test/r.png"}]}))],
    );
    let env = TestEnv::new().await;
    env.add(
        &testing::http_capability("txt2img", "/v1/images"),
        &testing::http_executor("acme-http", &vendor.base_url()),
    )
    .await;
    env.add_credential("acme", "sk-1").await;
    let snapshot = json!({"capabilityId": "txt2img", "params": {"prompt": "x"}});
    env.store
        .create_task("t-queued", "txt2img", None, &snapshot)
        .await
        .unwrap();
    env.store
        .create_task("t-orphan", "txt2img", None, &snapshot)
        .await
        .unwrap();
    // claimed by a worker that died before submitting
    assert!(
        env.store
            .claim_task("t-orphan", TaskStatus::Queued, 0)
            .await
            .unwrap()
    );
    let scheduler = scheduler(&env);

    let report = scheduler.resume_incomplete().await.unwrap();
    assert_eq!(report.requeued, 2);
    assert_eq!(report.awaiting_poll, 0);

    let queued = wait_for(&env.store, "t-queued", terminal).await;
    let orphan = wait_for(&env.store, "t-orphan", terminal).await;
    assert_eq!(queued.status, TaskStatus::Succeeded);
    assert_eq!(orphan.status, TaskStatus::Succeeded);
    assert_eq!(queued.attempts, 1);
    assert_eq!(orphan.attempts, 2);
    assert_eq!(vendor.count("POST", "/v1/images"), 2);
}

#[tokio::test]
async fn claim_is_exclusive() {
    let env = TestEnv::new().await;
    env.store
        .create_task("t-1", "txt2img", None, &json!({"capabilityId": "txt2img"}))
        .await
        .unwrap();
    assert!(env.store.claim_task("t-1", TaskStatus::Queued, 0).await.unwrap());
    assert!(!env.store.claim_task("t-1", TaskStatus::Queued, 0).await.unwrap());
    assert!(!env.store.claim_task("t-1", TaskStatus::Running, 0).await.unwrap());
}

#[tokio::test]
async fn recheck_revives_a_task_whose_job_is_still_running() {
    let Some(vendor) = MockVendor::start().await else {
        return;
    };
    vendor.respond(
        "GET",
        "/history/g-2",
        vec![
            MockResponse::json(200, json!({})),
            MockResponse::json(200, graph_history("g-2", &["late.png"])),
        ],
    );
    vendor.respond("GET", "/view", vec![MockResponse::bytes(200, png_bytes(), "image/png")]);
    let env = graph_env(&vendor).await;
    env.store
        .create_running_task_with_job(
            "t-late",
            "sdxl",
            None,
            &json!({"capabilityId": "sdxl"}),
            &graph_job("g-2", &vendor.base_url()),
        )
        .await
        .unwrap();
    env.store
        .fail_task("t-late", "timed out waiting for the graph runner")
        .await
        .unwrap();
    let scheduler = scheduler(&env);

    // plain queries never touch a failed task
    let failed = scheduler.get_task("t-late").await.unwrap().unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(vendor.count("GET", "/history/g-2"), 0);

    let revived = scheduler.recheck("t-late").await.unwrap().unwrap();
    assert_eq!(revived.status, TaskStatus::Running);
    assert_eq!(revived.job_id.as_deref(), Some("g-2"));

    let done = scheduler.get_task("t-late").await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Succeeded);
    assert_eq!(done.images.len(), 1);
}

#[tokio::test]
async fn poller_failure_is_final_and_not_revived() {
    let Some(vendor) = MockVendor::start().await else {
        return;
    };
    vendor.respond(
        "GET",
        "/history/g-3",
        vec![MockResponse::json(
            200,
            json!({"g-3": {
                "outputs": {},
                "status": {"status_str": "error", "completed": false,
                           "messages": [["execution_error", {"exception_message": "CUDA out of memory"}]]}
            }}),
        )],
    );
    let env = graph_env(&vendor).await;
    env.store
        .create_running_task_with_job(
            "t-oom",
            "sdxl",
            None,
            &json!({"capabilityId": "sdxl"}),
            &graph_job("g-3", &vendor.base_url()),
        )
        .await
        .unwrap();
    let poller = CompletionPoller::new(
        env.store.clone(),
        env.orchestrator.clone(),
        env.config.poller.timeout(),
    );

    let task = env.store.get_task("t-oom").await.unwrap().unwrap();
    assert!(parked(&task));
    let verdict = poller.refresh(&task).await.unwrap();
    assert!(matches!(verdict, PollVerdict::Failed(ref reason) if reason.contains("out of memory")));

    let failed = env.store.get_task("t-oom").await.unwrap().unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(poller.revive(&failed).await.unwrap(), PollVerdict::Unchanged);
    assert_eq!(
        env.store.get_task("t-oom").await.unwrap().unwrap().status,
        TaskStatus::Failed
    );
}

#[tokio::test]
async fn losing_the_completion_race_reports_the_stored_outcome() {
    let Some(vendor) = MockVendor::start().await else {
        return;
    };
    vendor.respond(
        "GET",
        "/history/g-race",
        vec![MockResponse::json(200, graph_history("g-race", &["out.png"]))],
    );
    vendor.respond("GET", "/view", vec![MockResponse::bytes(200, png_bytes(), "image/png")]);
    let env = graph_env(&vendor).await;
    env.store
        .create_running_task_with_job(
            "t-race",
            "sdxl",
            None,
            &json!({"capabilityId": "sdxl"}),
            &graph_job("g-race", &vendor.base_url()),
        )
        .await
        .unwrap();
    let stale = env.store.get_task("t-race").await.unwrap().unwrap();
    assert!(parked(&stale));

    // another reader finalizes the task between our read and our check
    let winner = CanonicalPayload {
        images: vec!["http://media/files/winner.png".into()],
        ..Default::default()
    };
    assert!(env.store.complete_task("t-race", &winner).await.unwrap());

    let scheduler = scheduler(&env);
    let verdict = scheduler.poller.refresh(&stale).await.unwrap();
    assert_eq!(verdict, PollVerdict::Superseded);

    let snapshot = scheduler.after_poll(&stale, verdict).await.unwrap().unwrap();
    assert_eq!(snapshot.status, TaskStatus::Succeeded);
    assert_eq!(snapshot.images, winner.images);
}
