//! End-to-end lifecycle scenarios against the mock runner.


use std::time::Duration;

use harness::{full_request, lod_job, stage_in_request, Harness};
use lodbb_controller::{
    BbState, ControllerError, JobInfo, JobState, MockResponse, StageStatus, StateReason,
};

use BbState::*;

#[tokio::test]
async fn test_stage_in_run_and_teardown() {
    let h = Harness::new();
    let job = h.submit(lod_job(1, 0, stage_in_request()));

    assert_eq!(h.controller.try_stage_in(&[job.clone()]), vec![job.job_id]);
    assert_eq!(h.state(job.job_id), Some(StagingIn));

    h.wait_for_state(job.job_id, StagedIn).await;
    assert_eq!(h.runner.calls("setup", Some(job.job_id)), 1);
    assert_eq!(h.runner.calls("stage_in", Some(job.job_id)), 1);
    assert!(h.scheduler.schedule_requests() >= 1);
    assert!(h.controller.last_update().is_some());
    assert_eq!(h.controller.test_stage_in(&job, true), StageStatus::Complete);

    h.controller.begin(&job).unwrap();
    assert_eq!(h.state(job.job_id), Some(Running));

    h.controller.start_stage_out(&job).unwrap();
    assert_eq!(h.state(job.job_id), Some(Teardown));

    h.wait_for_state(job.job_id, Complete).await;
    assert_eq!(h.runner.calls("teardown", Some(job.job_id)), 1);
    assert_eq!(
        h.history(job.job_id),
        vec![Pending, StagingIn, StagedIn, Running, Teardown, Complete]
    );
    assert_eq!(h.controller.test_stage_out(&job), StageStatus::Complete);
}

#[tokio::test]
async fn test_commands_use_request_options_and_job_nodes() {
    let h = Harness::new();
    let job = h.submit(lod_job(2, 0, stage_in_request()));

    h.controller.try_stage_in(&[job.clone()]);
    h.wait_for_state(job.job_id, StagedIn).await;

    let invocations = h.runner.invocations();
    let setup = invocations.iter().find(|inv| inv.label == "setup").unwrap();
    assert_eq!(setup.program.to_str(), Some("/usr/sbin/lod"));
    assert_eq!(
        setup.args,
        vec![
            "--node=cn[01-02]",
            "--mdtdevs=/dev/sdb",
            "--ostdevs=/dev/sdc",
            "--mountpoint=/mnt/lod",
            "start",
        ]
    );
    assert_eq!(setup.timeout, Duration::from_secs(5));

    let stage_in = invocations.iter().find(|inv| inv.label == "stage_in").unwrap();
    assert!(stage_in.args.contains(&"--source=/home/alice/in".to_string()));
    assert_eq!(stage_in.args.last().map(String::as_str), Some("stage_in"));
}

#[tokio::test]
async fn test_stage_in_failure_is_reported_on_job() {
    let h = Harness::new();
    h.runner
        .push("stage_in", MockResponse::fail(3, "copy failed"));
    let job = h.submit(lod_job(3, 0, stage_in_request()));

    h.controller.try_stage_in(&[job.clone()]);
    h.wait_for_state(job.job_id, TeardownFail).await;

    let failed = h.job(job.job_id);
    let desc = failed.state_desc.unwrap();
    assert_eq!(failed.state_reason, Some(StateReason::FailBurstBufferOp));
    assert!(desc.contains("stage_in"), "{desc}");
    assert!(desc.contains("exit status 3"), "{desc}");
    assert!(desc.contains("copy failed"), "{desc}");

    assert_eq!(h.controller.test_stage_in(&job, true), StageStatus::Error);
    assert!(matches!(
        h.controller.begin(&job),
        Err(ControllerError::StageInIncomplete {
            state: TeardownFail,
            ..
        })
    ));
}

#[tokio::test]
async fn test_setup_failure_skips_stage_in() {
    let h = Harness::new();
    h.runner.push("setup", MockResponse::fail(1, "no mdt"));
    let job = h.submit(lod_job(4, 0, stage_in_request()));

    h.controller.try_stage_in(&[job.clone()]);
    h.wait_for_state(job.job_id, TeardownFail).await;
    h.wait_idle().await;

    assert_eq!(h.runner.calls("stage_in", None), 0);
    let desc = h.job(job.job_id).state_desc.unwrap();
    assert!(desc.starts_with("burst_buffer/lod: setup: exit status 1"), "{desc}");
}

#[tokio::test]
async fn test_cancel_during_stage_in_tears_down() {
    let h = Harness::new();
    h.runner.push("stage_in", MockResponse::Hang);
    let job = h.submit(lod_job(5, 0, stage_in_request()));

    h.controller.try_stage_in(&[job.clone()]);
    h.wait_for_calls("stage_in", job.job_id, 1).await;
    assert_eq!(h.state(job.job_id), Some(StagingIn));

    h.controller.cancel(&job).unwrap();
    assert_eq!(h.state(job.job_id), Some(Teardown));

    h.wait_for_state(job.job_id, Complete).await;
    h.wait_idle().await;

    // Setup had succeeded, so the allocation is stopped.
    assert_eq!(h.runner.calls("teardown", Some(job.job_id)), 1);
    assert_eq!(
        h.history(job.job_id),
        vec![Pending, StagingIn, Teardown, Complete]
    );
}

#[tokio::test]
async fn test_cancel_during_setup_skips_teardown_command() {
    let h = Harness::new();
    h.runner.push("setup", MockResponse::Hang);
    let job = h.submit(lod_job(6, 0, stage_in_request()));

    h.controller.try_stage_in(&[job.clone()]);
    h.wait_for_calls("setup", job.job_id, 1).await;

    h.controller.cancel(&job).unwrap();
    h.wait_for_state(job.job_id, Complete).await;
    h.wait_idle().await;

    assert_eq!(h.runner.calls("stage_in", None), 0);
    assert_eq!(h.runner.calls("teardown", None), 0);
}

#[tokio::test]
async fn test_setup_finishing_after_cancel_is_torn_down() {
    let h = Harness::new();
    h.runner.push("setup", MockResponse::SucceedOnCancel);
    let job = h.submit(lod_job(30, 0, stage_in_request()));

    h.controller.try_stage_in(&[job.clone()]);
    h.wait_for_calls("setup", job.job_id, 1).await;

    h.controller.cancel(&job).unwrap();
    h.wait_for_state(job.job_id, Complete).await;
    h.wait_idle().await;

    // Setup still reported success, so the allocation it made is stopped.
    assert!(h.controller.record(job.job_id).unwrap().request().started);
    assert_eq!(h.runner.calls("stage_in", None), 0);
    assert_eq!(h.runner.calls("teardown", Some(job.job_id)), 1);
    assert_eq!(
        h.history(job.job_id),
        vec![Pending, StagingIn, Teardown, Complete]
    );
}

#[tokio::test]
async fn test_recreated_record_is_torn_down_after_purge() {
    let h = Harness::new();
    h.runner
        .set_default("teardown", MockResponse::Delay(Duration::from_millis(300)));
    let job = h.submit(lod_job(31, 0, stage_in_request()));

    h.controller.try_stage_in(&[job.clone()]);
    h.wait_for_state(job.job_id, StagedIn).await;
    h.controller.cancel(&job).unwrap();
    h.wait_for_calls("teardown", job.job_id, 1).await;
    assert!(h.controller.purge(job.job_id));

    // Same job id, new record, while the first teardown is still running.
    assert_eq!(h.controller.try_stage_in(&[job.clone()]), vec![job.job_id]);
    h.wait_for_state(job.job_id, StagedIn).await;
    h.controller.cancel(&job).unwrap();

    h.wait_for_state(job.job_id, Complete).await;
    h.wait_idle().await;
    assert_eq!(h.runner.calls("teardown", Some(job.job_id)), 2);
    assert_eq!(h.runner.overlapping_runs(), 0);
}

#[tokio::test]
async fn test_cancel_is_idempotent() {
    let h = Harness::new();
    let job = h.submit(lod_job(7, 0, stage_in_request()));

    h.controller.try_stage_in(&[job.clone()]);
    h.wait_for_state(job.job_id, StagedIn).await;
    h.controller.cancel(&job).unwrap();
    h.wait_for_state(job.job_id, Complete).await;
    h.wait_idle().await;

    h.controller.cancel(&job).unwrap();
    h.controller.cancel(&job).unwrap();
    h.wait_idle().await;

    assert_eq!(h.state(job.job_id), Some(Complete));
    assert_eq!(h.runner.calls("teardown", Some(job.job_id)), 1);
}

#[tokio::test]
async fn test_stage_out_then_teardown() {
    let h = Harness::new();
    let job = h.submit(lod_job(8, 0, full_request()));

    h.controller.try_stage_in(&[job.clone()]);
    h.wait_for_state(job.job_id, StagedIn).await;
    h.controller.begin(&job).unwrap();
    h.scheduler.update(job.job_id, |job| {
        job.state = JobState::Running;
        job.allocated_nodes = Some("cn01".to_string());
    });

    h.controller.start_stage_out(&job).unwrap();
    assert_eq!(h.state(job.job_id), Some(PostRun));
    let running = h.job(job.job_id);
    assert!(running.stage_out);
    assert_eq!(
        running.state_desc.as_deref(),
        Some("burst_buffer/lod: Stage-out in progress")
    );
    assert_eq!(h.controller.test_stage_out(&job), StageStatus::Underway);

    h.wait_for_state(job.job_id, Complete).await;
    assert_eq!(
        h.history(job.job_id),
        vec![
            Pending, StagingIn, StagedIn, Running, PostRun, StagingOut, StagedOut, Teardown,
            Complete
        ]
    );

    let stage_out = h
        .runner
        .invocations()
        .into_iter()
        .find(|inv| inv.label == "stage_out")
        .unwrap();
    assert_eq!(stage_out.args[0], "--node=cn01");

    let done = h.job(job.job_id);
    assert!(!done.stage_out);
    assert!(done.state_desc.is_none());
    assert_eq!(h.controller.test_stage_out(&job), StageStatus::Complete);
    assert_eq!(h.controller.test_post_run(&job), StageStatus::Complete);
}

#[tokio::test]
async fn test_stage_out_failure() {
    let h = Harness::new();
    h.runner
        .push("stage_out", MockResponse::fail(2, "destination full"));
    let job = h.submit(lod_job(9, 0, full_request()));

    h.controller.try_stage_in(&[job.clone()]);
    h.wait_for_state(job.job_id, StagedIn).await;
    h.controller.begin(&job).unwrap();
    h.controller.start_stage_out(&job).unwrap();
    h.wait_for_state(job.job_id, TeardownFail).await;

    let failed = h.job(job.job_id);
    assert!(!failed.stage_out);
    assert!(failed.state_desc.unwrap().contains("stage_out: exit status 2"));
    assert_eq!(h.controller.test_stage_out(&job), StageStatus::Error);
    assert_eq!(h.runner.calls("teardown", None), 0);
}

#[tokio::test]
async fn test_teardown_failure() {
    let h = Harness::new();
    h.runner.push("teardown", MockResponse::fail(4, "umount busy"));
    let job = h.submit(lod_job(10, 0, stage_in_request()));

    h.controller.try_stage_in(&[job.clone()]);
    h.wait_for_state(job.job_id, StagedIn).await;
    h.controller.begin(&job).unwrap();
    h.controller.start_stage_out(&job).unwrap();
    h.wait_for_state(job.job_id, TeardownFail).await;

    let desc = h.job(job.job_id).state_desc.unwrap();
    assert!(desc.contains("teardown: exit status 4"), "{desc}");
}

#[tokio::test]
async fn test_teardown_timeout_fails_record() {
    let h = Harness::new();
    h.controller.reconfig(lodbb_controller::ControllerConfig {
        other_timeout_secs: Some(0),
        ..Default::default()
    });
    h.runner.set_default("teardown", MockResponse::Hang);
    let job = h.submit(lod_job(11, 0, stage_in_request()));

    h.controller.try_stage_in(&[job.clone()]);
    h.wait_for_state(job.job_id, StagedIn).await;
    h.controller.begin(&job).unwrap();
    h.controller.start_stage_out(&job).unwrap();
    h.wait_for_state(job.job_id, TeardownFail).await;

    let desc = h.job(job.job_id).state_desc.unwrap();
    assert!(desc.contains("timed out"), "{desc}");
}

#[tokio::test]
async fn test_job_gone_after_stage_out_drops_result() {
    let h = Harness::new();
    h.runner
        .push("stage_out", MockResponse::Delay(Duration::from_millis(100)));
    let job = h.submit(lod_job(12, 0, full_request()));

    h.controller.try_stage_in(&[job.clone()]);
    h.wait_for_state(job.job_id, StagedIn).await;
    h.controller.begin(&job).unwrap();
    h.controller.start_stage_out(&job).unwrap();
    h.wait_for_calls("stage_out", job.job_id, 1).await;

    h.scheduler.remove(job.job_id);
    h.wait_idle().await;

    assert_eq!(h.state(job.job_id), Some(StagingOut));
    assert_eq!(h.runner.calls("teardown", None), 0);
    assert!(h.controller.purge(job.job_id));
}

#[tokio::test]
async fn test_start_stage_out_before_run_tears_down() {
    let h = Harness::new();
    let job = h.submit(lod_job(13, 0, full_request()));

    h.controller.try_stage_in(&[job.clone()]);
    h.wait_for_state(job.job_id, StagedIn).await;

    // Killed before it ever started: no stage-out.
    h.controller.start_stage_out(&job).unwrap();
    h.wait_for_state(job.job_id, Complete).await;

    assert_eq!(h.runner.calls("stage_out", None), 0);
    assert_eq!(h.runner.calls("teardown", Some(job.job_id)), 1);
}

#[tokio::test]
async fn test_pending_record_completes_on_stage_out() {
    let h = Harness::new();
    let job = h.submit(lod_job(14, 0, full_request()));
    h.controller.validate2(&job).unwrap();

    h.controller.start_stage_out(&job).unwrap();
    assert_eq!(h.state(job.job_id), Some(Complete));
    assert_eq!(h.controller.active_workers(), 0);
}

#[tokio::test]
async fn test_job_without_buffer_never_blocks() {
    let h = Harness::new();
    let job = h.submit(JobInfo::new(15).with_start_time(harness::at(0)));

    assert!(h.controller.try_stage_in(&[job.clone()]).is_empty());
    assert_eq!(h.controller.test_stage_in(&job, false), StageStatus::Complete);
    assert_eq!(h.controller.test_stage_out(&job), StageStatus::Complete);
    h.controller.begin(&job).unwrap();
    h.controller.start_stage_out(&job).unwrap();
    h.controller.cancel(&job).unwrap();
    assert!(h.state(job.job_id).is_none());
    assert!(h.runner.invocations().is_empty());
}

#[tokio::test]
async fn test_shutdown_drains_workers() {
    let h = Harness::new();
    h.runner.set_default("setup", MockResponse::Hang);
    let jobs: Vec<JobInfo> = (20..23)
        .map(|id| h.submit(lod_job(id, 0, stage_in_request())))
        .collect();

    assert_eq!(h.controller.try_stage_in(&jobs).len(), 3);
    for job in &jobs {
        h.wait_for_calls("setup", job.job_id, 1).await;
    }

    h.controller.shutdown().await;

    assert_eq!(h.controller.active_workers(), 0);
    assert!(h.controller.state_pack().is_empty());
    assert!(h.controller.try_stage_in(&jobs).is_empty());

    // Records are still created, only stage-in is refused.
    h.controller.validate2(&jobs[0]).unwrap();
    assert_eq!(h.state(jobs[0].job_id), Some(BbState::Pending));
    assert!(h.controller.try_stage_in(&jobs).is_empty());
    assert_eq!(h.state(jobs[0].job_id), Some(BbState::Pending));
}
