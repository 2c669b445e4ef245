//! Coordination integration tests against the in-memory store.

use std::sync::Arc;

use chrono::{Duration, Utc};
use futures_util::future::join_all;
use serde_json::json;

use vconv_models::{ApiToken, Machine, QueueId, Task, TaskStatus};
use vconv_queue::{Clock, Coordinator, CoordinatorError, ManualClock};
use vconv_store::{InMemoryStore, Store};

struct Harness {
    store: Arc<InMemoryStore>,
    clock: Arc<ManualClock>,
    core: Coordinator,
}

fn harness() -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let core = Coordinator::new(store.clone(), clock.clone());
    Harness { store, clock, core }
}

fn client() -> ApiToken {
    ApiToken::issue(100, Utc::now())
}

async fn machine(h: &Harness, name: &str, ip: &str) -> Machine {
    h.core.fleet.register_machine(name, ip).await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_task_goes_to_exactly_one_machine() {
    let h = harness();
    let queue = h.core.queues.create_queue("default").await.unwrap();
    h.core.queues.enqueue(&queue.id, "clip.mp4", 0, &client()).await.unwrap();

    let mut machines = Vec::new();
    for i in 0..16 {
        machines.push(machine(&h, &format!("encoder-{i:02}"), &format!("10.0.0.{i}")).await);
    }

    let handles = machines.iter().map(|m| {
        let dispatcher = h.core.dispatcher.clone();
        let machine_id = m.id.clone();
        let queue_id = queue.id.clone();
        tokio::spawn(async move { dispatcher.next_task(&machine_id, Some(&queue_id)).await })
    });

    let results = join_all(handles).await;
    let winners: Vec<_> = results
        .into_iter()
        .flat_map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(winners.len(), 1);
    let stored = h.store.get_task(&winners[0].id).await.unwrap().unwrap();
    assert_eq!(stored.machine_id, winners[0].machine_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_tasks_many_machines_no_double_assignment() {
    let h = harness();
    let queue = h.core.queues.create_queue("default").await.unwrap();
    for i in 0..40 {
        h.core.queues.enqueue(&queue.id, &format!("clip-{i}.mp4"), i % 3, &client()).await.unwrap();
    }

    let mut machines = Vec::new();
    for i in 0..8 {
        machines.push(machine(&h, &format!("encoder-{i}"), &format!("10.0.1.{i}")).await);
    }

    let handles = machines.iter().map(|m| {
        let dispatcher = h.core.dispatcher.clone();
        let machine_id = m.id.clone();
        tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(task) = dispatcher.next_task(&machine_id, None).await.unwrap() {
                claimed.push(task.id);
            }
            claimed
        })
    });

    let mut all: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .flat_map(|joined| joined.unwrap())
        .collect();
    all.sort();
    let total = all.len();
    all.dedup();
    assert_eq!(total, 40);
    assert_eq!(all.len(), 40);
}

#[tokio::test]
async fn test_dispatch_order() {
    let h = harness();
    let queue = h.core.queues.create_queue("default").await.unwrap();
    for (name, priority) in [("t1", 5), ("t2", 10), ("t3", 5), ("t4", 1)] {
        h.core.queues.enqueue(&queue.id, name, priority, &client()).await.unwrap();
        h.clock.advance(Duration::seconds(1));
    }
    let worker = machine(&h, "encoder-01", "10.0.0.1").await;

    let mut order = Vec::new();
    while let Some(task) = h.core.dispatcher.next_task(&worker.id, Some(&queue.id)).await.unwrap() {
        order.push(task.name);
    }
    assert_eq!(order, ["t2", "t1", "t3", "t4"]);
}

#[tokio::test]
async fn test_queue_filter_scopes_selection() {
    let h = harness();
    let urgent = h.core.queues.create_queue("urgent").await.unwrap();
    let batch = h.core.queues.create_queue("batch").await.unwrap();
    h.core.queues.enqueue(&batch.id, "big.mov", 50, &client()).await.unwrap();
    h.core.queues.enqueue(&urgent.id, "small.mp4", 1, &client()).await.unwrap();
    let worker = machine(&h, "encoder-01", "10.0.0.1").await;

    let task = h.core.dispatcher.next_task(&worker.id, Some(&urgent.id)).await.unwrap().unwrap();
    assert_eq!(task.name, "small.mp4");
    assert!(h.core.dispatcher.next_task(&worker.id, Some(&urgent.id)).await.unwrap().is_none());

    let task = h.core.dispatcher.next_task(&worker.id, None).await.unwrap().unwrap();
    assert_eq!(task.name, "big.mov");
}

#[tokio::test]
async fn test_non_owner_cannot_touch_task() {
    let h = harness();
    let queue = h.core.queues.create_queue("default").await.unwrap();
    h.core.queues.enqueue(&queue.id, "clip.mp4", 0, &client()).await.unwrap();
    let owner = machine(&h, "encoder-01", "10.0.0.1").await;
    let intruder = machine(&h, "encoder-02", "10.0.0.2").await;

    let task = h.core.dispatcher.next_task(&owner.id, None).await.unwrap().unwrap();
    h.core.lifecycle.report_download(&task.id, &owner.id, json!({"percent": 10})).await.unwrap();
    let before = h.store.get_task(&task.id).await.unwrap().unwrap();

    let err = h
        .core
        .lifecycle
        .report_convert(&task.id, &intruder.id, json!({"percent": 99}))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::NotOwner(_)));

    let err = h.core.lifecycle.complete(&task.id, &intruder.id, json!({})).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::NotOwner(_)));

    assert_eq!(h.store.get_task(&task.id).await.unwrap().unwrap(), before);
    let intruder = h.store.get_machine(&intruder.id).await.unwrap().unwrap();
    assert_eq!(intruder.success_count, 0);
}

#[tokio::test]
async fn test_terminal_transition_happens_once() {
    let h = harness();
    let queue = h.core.queues.create_queue("default").await.unwrap();
    h.core.queues.enqueue(&queue.id, "clip.mp4", 0, &client()).await.unwrap();
    let worker = machine(&h, "encoder-01", "10.0.0.1").await;

    let task = h.core.dispatcher.next_task(&worker.id, None).await.unwrap().unwrap();
    h.core.lifecycle.report_convert(&task.id, &worker.id, json!({"fps": 120})).await.unwrap();
    h.core.lifecycle.report_upload(&task.id, &worker.id, json!({"bytes": 1024})).await.unwrap();
    let done = h
        .core
        .lifecycle
        .complete(&task.id, &worker.id, json!({"url": "s3://bucket/out.mp4"}))
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Finished);

    let err = h.core.lifecycle.fail(&task.id, &worker.id, "late failure").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Conflict(_)));
    let err = h.core.lifecycle.complete(&task.id, &worker.id, json!({})).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Conflict(_)));
    let err = h
        .core
        .lifecycle
        .report_download(&task.id, &worker.id, json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::Conflict(_)));

    let stored = h.store.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Finished);
    assert_eq!(stored.result, Some(json!({"url": "s3://bucket/out.mp4"})));
    assert!(stored.error.is_none());

    let worker = h.store.get_machine(&worker.id).await.unwrap().unwrap();
    assert_eq!((worker.success_count, worker.failed_count), (1, 0));
}

#[tokio::test]
async fn test_concurrent_completion_credits_once() {
    let h = harness();
    let queue = h.core.queues.create_queue("default").await.unwrap();
    h.core.queues.enqueue(&queue.id, "clip.mp4", 0, &client()).await.unwrap();
    let worker = machine(&h, "encoder-01", "10.0.0.1").await;
    let task = h.core.dispatcher.next_task(&worker.id, None).await.unwrap().unwrap();

    let attempts = (0..10).map(|i| {
        let lifecycle = h.core.lifecycle.clone();
        let (task_id, machine_id) = (task.id.clone(), worker.id.clone());
        tokio::spawn(async move {
            if i % 2 == 0 {
                lifecycle.complete(&task_id, &machine_id, json!({})).await
            } else {
                lifecycle.fail(&task_id, &machine_id, "boom").await
            }
        })
    });
    let succeeded = join_all(attempts)
        .await
        .into_iter()
        .filter(|joined| matches!(joined, Ok(Ok(_))))
        .count();
    assert_eq!(succeeded, 1);

    let worker = h.store.get_machine(&worker.id).await.unwrap().unwrap();
    assert_eq!(worker.success_count + worker.failed_count, 1);
}

#[tokio::test]
async fn test_enqueue_round_trip() {
    let h = harness();
    let queue = h.core.queues.create_queue("default").await.unwrap();
    h.core.queues.enqueue(&queue.id, "clip.mp4", 7, &client()).await.unwrap();

    let tasks = h.core.queues.list_tasks(&queue.id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].name, "clip.mp4");
    assert_eq!(tasks[0].status, TaskStatus::Waiting);
    assert_eq!(tasks[0].priority, 7);
    assert_eq!(tasks[0].queue_id, queue.id);
    assert!(tasks[0].machine_id.is_none());
}

#[tokio::test]
async fn test_enqueue_validation() {
    let h = harness();
    let queue = h.core.queues.create_queue("default").await.unwrap();
    let limited = ApiToken::issue(10, Utc::now());

    let err = h.core.queues.enqueue(&queue.id, "clip.mp4", 11, &limited).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::PriorityCeiling { priority: 11, ceiling: 10 }));
    h.core.queues.enqueue(&queue.id, "clip.mp4", 10, &limited).await.unwrap();

    let err = h.core.queues.enqueue(&queue.id, "  ", 0, &limited).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Validation(_)));

    let err = h
        .core
        .queues
        .enqueue(&QueueId::from("missing"), "clip.mp4", 0, &limited)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::NotFound { entity: "Queue", .. }));
}

#[tokio::test]
async fn test_enqueue_into_deleted_queue_leaves_no_task() {
    let h = harness();
    let queue = h.core.queues.create_queue("default").await.unwrap();
    h.core.queues.delete_queue(&queue.id).await.unwrap();

    // A task built before the delete and committed after it.
    let late = Task::new(queue.id.clone(), "clip.mp4", 0, h.clock.now());
    assert!(!h.store.insert_task(&late).await.unwrap());
    assert!(h.store.get_task(&late.id).await.unwrap().is_none());
    assert!(h.store.list_tasks(&queue.id).await.unwrap().is_empty());
    assert!(h.store.task_status_counts(None).await.unwrap().iter().all(|(_, n)| *n == 0));

    let err = h.core.queues.enqueue(&queue.id, "clip.mp4", 0, &client()).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::NotFound { entity: "Queue", .. }));
}

#[tokio::test]
async fn test_queue_administration() {
    let h = harness();
    let queue = h.core.queues.create_queue("default").await.unwrap();
    let err = h.core.queues.create_queue("default").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Conflict(_)));

    let task = h.core.queues.enqueue(&queue.id, "clip.mp4", 0, &client()).await.unwrap();
    let err = h.core.queues.delete_queue(&queue.id).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Conflict(_)));

    h.core.queues.delete_task(&queue.id, &task.id).await.unwrap();
    h.core.queues.delete_queue(&queue.id).await.unwrap();
    let err = h.core.queues.get_queue(&queue.id).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::NotFound { .. }));
}

#[tokio::test]
async fn test_override_to_active_refused_for_waiting_task() {
    let h = harness();
    let queue = h.core.queues.create_queue("default").await.unwrap();
    let task = h.core.queues.enqueue(&queue.id, "clip.mp4", 0, &client()).await.unwrap();

    for status in [TaskStatus::Downloading, TaskStatus::Converting, TaskStatus::Uploading] {
        let err = h
            .core
            .queues
            .override_status(&queue.id, &task.id, status)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Conflict(_)));
    }

    let stored = h.store.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Waiting);
    assert!(stored.machine_id.is_none());

    let worker = machine(&h, "encoder-01", "10.0.0.1").await;
    let claimed = h.core.dispatcher.next_task(&worker.id, None).await.unwrap().unwrap();
    assert_eq!(claimed.id, task.id);

    let converting = h
        .core
        .queues
        .override_status(&queue.id, &task.id, TaskStatus::Converting)
        .await
        .unwrap();
    assert_eq!(converting.status, TaskStatus::Converting);
    assert_eq!(converting.machine_id, Some(worker.id));
}

#[tokio::test]
async fn test_override_to_waiting_requeues() {
    let h = harness();
    let queue = h.core.queues.create_queue("default").await.unwrap();
    h.core.queues.enqueue(&queue.id, "clip.mp4", 0, &client()).await.unwrap();
    let stuck = machine(&h, "encoder-01", "10.0.0.1").await;
    let rescuer = machine(&h, "encoder-02", "10.0.0.2").await;

    let task = h.core.dispatcher.next_task(&stuck.id, None).await.unwrap().unwrap();
    let requeued = h
        .core
        .queues
        .override_status(&queue.id, &task.id, TaskStatus::Waiting)
        .await
        .unwrap();
    assert!(requeued.machine_id.is_none());

    let again = h.core.dispatcher.next_task(&rescuer.id, None).await.unwrap().unwrap();
    assert_eq!(again.id, task.id);
    let err = h.core.lifecycle.complete(&task.id, &stuck.id, json!({})).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::NotOwner(_)));
}

#[tokio::test]
async fn test_liveness_follows_heartbeats() {
    let h = harness();
    let worker = machine(&h, "encoder-01", "10.0.0.1").await;

    let details = h.core.fleet.machine_details(&worker.id).await.unwrap();
    assert!(!details.is_online);
    assert_eq!(details.uptime, 0);

    h.core
        .fleet
        .heartbeat(&worker.id, json!({"gpu": "RTX 4090"}), "hevc_nvenc")
        .await
        .unwrap();
    h.clock.advance(Duration::seconds(119));
    let details = h.core.fleet.machine_details(&worker.id).await.unwrap();
    assert!(details.is_online);
    assert_eq!(details.status, "online");
    assert_eq!(details.uptime, 119);

    h.clock.advance(Duration::seconds(2));
    let listing = h.core.fleet.list_machines().await.unwrap();
    assert!(!listing[0].is_online);
    assert_eq!(listing[0].encoder.as_deref(), Some("hevc_nvenc"));
}

#[tokio::test]
async fn test_heartbeat_validation() {
    let h = harness();
    let worker = machine(&h, "encoder-01", "10.0.0.1").await;

    let err = h.core.fleet.heartbeat(&worker.id, json!("gpu"), "libx264").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Validation(_)));
    let err = h.core.fleet.heartbeat(&worker.id, json!({}), " ").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Validation(_)));

    let stored = h.store.get_machine(&worker.id).await.unwrap().unwrap();
    assert!(stored.heartbeat.is_none());
}

#[tokio::test]
async fn test_mark_online_stamps_once() {
    let h = harness();
    let worker = machine(&h, "encoder-01", "10.0.0.1").await;
    let start = h.clock.now();

    let first = h.core.fleet.mark_online(&worker.id).await.unwrap();
    h.clock.advance(Duration::seconds(30));
    let second = h.core.fleet.mark_online(&worker.id).await.unwrap();
    assert_eq!(first.first_heartbeat, Some(start));
    assert_eq!(second.first_heartbeat, Some(start));
}

#[tokio::test]
async fn test_machine_views_count_active_tasks() {
    let h = harness();
    let queue = h.core.queues.create_queue("default").await.unwrap();
    for name in ["a.mp4", "b.mp4", "c.mp4"] {
        h.core.queues.enqueue(&queue.id, name, 0, &client()).await.unwrap();
    }
    let worker = machine(&h, "encoder-01", "10.0.0.1").await;

    let first = h.core.dispatcher.next_task(&worker.id, None).await.unwrap().unwrap();
    h.core.dispatcher.next_task(&worker.id, None).await.unwrap().unwrap();
    h.core.lifecycle.fail(&first.id, &worker.id, "corrupt source").await.unwrap();

    let details = h.core.fleet.machine_details(&worker.id).await.unwrap();
    assert_eq!(details.running_tasks_count, 1);

    let stats = h.core.fleet.machine_stats(&worker.id).await.unwrap();
    assert_eq!(stats.failed_tasks_count, 1);
    assert_eq!(stats.machine_task_stats.get(TaskStatus::Failed), 1);
    assert_eq!(stats.machine_task_stats.get(TaskStatus::Downloading), 1);
    assert_eq!(stats.global_task_stats.get(TaskStatus::Waiting), 1);
    assert_eq!(stats.global_task_stats.total(), 3);

    let global = h.core.fleet.task_stats().await.unwrap();
    assert_eq!(global, stats.global_task_stats);
}

#[tokio::test]
async fn test_machine_registration_rules() {
    let h = harness();
    let worker = machine(&h, "encoder-01", "10.0.0.1").await;
    assert_eq!(worker.token.len(), 64);

    let err = h.core.fleet.register_machine("encoder-01", "10.0.0.2").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Conflict(_)));
    let err = h.core.fleet.register_machine("", "10.0.0.2").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Validation(_)));

    h.core.fleet.remove_machine(&worker.id).await.unwrap();
    let err = h.core.fleet.remove_machine(&worker.id).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::NotFound { entity: "Machine", .. }));
}

#[tokio::test]
async fn test_removed_machine_cannot_finish() {
    let h = harness();
    let queue = h.core.queues.create_queue("default").await.unwrap();
    h.core.queues.enqueue(&queue.id, "clip.mp4", 0, &client()).await.unwrap();
    let worker = machine(&h, "encoder-01", "10.0.0.1").await;
    let task = h.core.dispatcher.next_task(&worker.id, None).await.unwrap().unwrap();

    h.core.fleet.remove_machine(&worker.id).await.unwrap();
    let err = h.core.lifecycle.complete(&task.id, &worker.id, json!({})).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::NotOwner(_)));
    let stored = h.store.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Downloading);
}
