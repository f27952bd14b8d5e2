mod test_harness;

use std::collections::BTreeMap;

use taskgrid::model::{Job, Step};
use taskgrid::resource::{Resource, Usage};

use test_harness::{single_step_job, TestGrid};

fn fan_out_then_reduce() -> Job {
    let mut steps = BTreeMap::new();
    steps.insert(
        "a".to_string(),
        Step {
            instances: 5,
            concurrency: 1,
            tags: vec!["any".to_string()],
            cmd: "prepare {{index}}".to_string(),
            res: Resource::scalar("cpu", 1.0),
            ..Default::default()
        },
    );
    steps.insert(
        "b".to_string(),
        Step {
            deps: vec!["a".to_string()],
            instances: 3,
            concurrency: 3,
            cmd: "reduce {{job.id}} {{index}}".to_string(),
            res: Resource::scalar("cpu", 1.0),
            ..Default::default()
        },
    );
    Job {
        steps,
        ..Default::default()
    }
}

#[tokio::test]
async fn end_to_end_dag_sweep() {
    let mut grid = TestGrid::new();
    for i in 1..=5 {
        grid.add_worker(&format!("w{i}"), &[], 4.0).await;
    }
    let job_id = grid.scheduler.submit(fan_out_then_reduce()).await.unwrap();

    // First sweep: all five instances of `a` dispatch, `b` stays untouched
    // because `a` has no success record yet.
    grid.scheduler.check().await.unwrap();
    assert_eq!(grid.started_tasks(&job_id, "a").await.len(), 5);
    assert!(grid.started_tasks(&job_id, "b").await.is_empty());

    // While `a` is still running, sweeps change nothing.
    grid.scheduler.check().await.unwrap();
    assert_eq!(grid.started_tasks(&job_id, "a").await.len(), 5);
    assert_eq!(grid.spawner.running_count(), 5);

    // Every instance reports success; the next sweep records the step
    // success, and only the sweep after that starts `b`.
    grid.clock.advance(2_000);
    assert_eq!(grid.spawner.finish_all("").await.unwrap(), 5);
    grid.tick_workers().await;

    grid.scheduler.check().await.unwrap();
    assert!(grid.step_succeeded(&job_id, "a").await);
    assert!(grid.started_tasks(&job_id, "b").await.is_empty());

    grid.scheduler.check().await.unwrap();
    let b_tasks = grid.started_tasks(&job_id, "b").await;
    assert_eq!(b_tasks.len(), 3);
    for task in b_tasks.values() {
        assert!(task.cmd.starts_with(&format!("reduce {job_id} ")));
    }

    // `b` completes; the job is swept out of the submitted set.
    grid.clock.advance(2_000);
    assert_eq!(grid.spawner.finish_all("").await.unwrap(), 3);
    grid.scheduler.check().await.unwrap();
    assert!(grid.step_succeeded(&job_id, "b").await);
    grid.scheduler.check().await.unwrap();
    assert!(!grid.job_submitted(&job_id).await);
}

#[tokio::test]
async fn vanished_worker_becomes_unselectable_and_its_task_is_replanned() {
    let mut grid = TestGrid::new();
    grid.add_worker("w1", &[], 4.0).await;
    let survivor = grid.add_worker("w2", &[], 4.0).await;
    let job_id = grid
        .scheduler
        .submit(single_step_job(1, 1.0))
        .await
        .unwrap();

    grid.scheduler.check().await.unwrap();
    let started = grid.started_tasks(&job_id, "work").await;
    assert_eq!(started.len(), 1);
    assert_eq!(started.values().next().unwrap().worker, "w1");

    // w1 crashes: nothing renews its heartbeat lease or its executor's.
    // w2 keeps renewing within the TTL.
    grid.spawner.abandon_worker("w1");
    grid.clock.advance(6_000);
    survivor.upkeep().await;
    grid.clock.advance(5_000);

    // One TTL after the crash the worker record is gone.
    let demand = Usage::new().with(0, Resource::scalar("cpu", 1.0));
    let selectable = grid
        .scheduler
        .select(&["any".to_string()], &demand)
        .await
        .unwrap();
    assert_eq!(selectable.len(), 1);
    assert_eq!(selectable[0].id, "w2");

    // The orphaned task counts as neither succeeded nor errored: the next
    // sweep plans a replacement instance on the survivor.
    grid.scheduler.check().await.unwrap();
    let started = grid.started_tasks(&job_id, "work").await;
    assert_eq!(started.len(), 2);
    let replacement = started.values().find(|t| t.worker == "w2").unwrap();
    assert_eq!(replacement.index, 1);
    assert!(!replacement.is_finished());
    let orphan = started.values().find(|t| t.worker == "w1").unwrap();
    assert!(!orphan.is_finished());

    // The replacement succeeding completes the step.
    grid.clock.advance(1_000);
    grid.spawner.finish_all("").await.unwrap();
    survivor.upkeep().await;
    grid.scheduler.check().await.unwrap();
    assert!(grid.step_succeeded(&job_id, "work").await);
}

#[tokio::test]
async fn capacity_limits_bound_simultaneous_dispatch() {
    let mut grid = TestGrid::new();
    // One worker with room for two cpu-1 tasks.
    grid.add_worker("w1", &[], 2.0).await;
    let job_id = grid
        .scheduler
        .submit(single_step_job(4, 1.0))
        .await
        .unwrap();

    // Each sweep places one task (one per worker per plan); the worker's
    // published draw then bounds how many fit at once.
    grid.scheduler.check().await.unwrap();
    assert_eq!(grid.started_tasks(&job_id, "work").await.len(), 1);
    grid.scheduler.check().await.unwrap();
    assert_eq!(grid.started_tasks(&job_id, "work").await.len(), 2);

    // Full: further sweeps cannot place the remaining instances.
    grid.scheduler.check().await.unwrap();
    assert_eq!(grid.started_tasks(&job_id, "work").await.len(), 2);

    // Capacity frees up as tasks finish.
    grid.clock.advance(1_000);
    grid.spawner.finish_all("").await.unwrap();
    grid.tick_workers().await;
    grid.scheduler.check().await.unwrap();
    assert_eq!(grid.started_tasks(&job_id, "work").await.len(), 3);
}
