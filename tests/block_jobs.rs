use std::time::Duration;

use qmp_block::block::{self, BLOCK_JOB_CANCELLED, BLOCK_JOB_COMPLETED, BLOCK_JOB_ERROR};
use qmp_block::mock::{MockDomain, MockReply, job_event};
use qmp_block::{BlockDevice, BlockJob, ErrorKind};
use serde_json::json;

const TIMEOUT: Duration = Duration::from_secs(5);

fn disk(device: &str, node_name: &str) -> BlockDevice {
    let mut disk = BlockDevice {
        device: device.to_string(),
        ..BlockDevice::default()
    };
    disk.inserted.node_name = node_name.to_string();
    disk
}

#[tokio::test]
async fn cancel_sends_device_and_returns_on_ack() {
    let domain = MockDomain::new(|cmd| {
        assert_eq!(cmd.name, "block-job-cancel");
        assert_eq!(cmd.args, json!({"device": "drive-virtio-disk0"}));
        MockReply::ok()
    });

    let job = BlockJob::new("drive-virtio-disk0");
    job.cancel(&domain, TIMEOUT).await.unwrap();
    assert_eq!(domain.commands().len(), 1);
}

#[tokio::test]
async fn commit_addresses_node_name_and_succeeds_on_completion() {
    let domain = MockDomain::new(|cmd| {
        assert_eq!(cmd.name, "block-commit");
        assert_eq!(cmd.arg("device"), Some("node-A"));
        assert_eq!(cmd.arg("top"), Some("/tmp/foo.img"));
        assert_eq!(cmd.arg("job-id"), Some("job-1"));
        MockReply::ok()
    })
    .with_events([job_event(
        BLOCK_JOB_COMPLETED,
        json!({"type": "commit", "device": "node-A", "len": 0, "offset": 0, "speed": 0}),
    )]);

    let disk = disk("drive-virtio-disk0", "node-A");
    disk.commit(&domain, "/tmp/foo.img", "job-1", TIMEOUT)
        .await
        .unwrap();
}

#[tokio::test]
async fn commit_completion_reported_under_job_id() {
    let domain = MockDomain::acknowledging().with_events([job_event(
        BLOCK_JOB_COMPLETED,
        json!({"type": "commit", "device": "job-1"}),
    )]);

    disk("drive0", "node-A")
        .commit(&domain, "/tmp/foo.img", "job-1", TIMEOUT)
        .await
        .unwrap();
}

#[tokio::test]
async fn commit_with_active_job_is_rejected_without_waiting() {
    let domain = MockDomain::new(|_| MockReply::error("GenericError", "Job 'job-0' already active"))
        .closing_feed();

    let err = disk("drive0", "node-A")
        .commit(&domain, "/tmp/foo", "job-id", Duration::from_secs(3600))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::CommandRejected);
    assert!(!err.is_job_state_unknown());
    assert_eq!(domain.commands().len(), 1);
}

#[tokio::test]
async fn commit_job_error_is_job_failed_with_event_reason() {
    let domain = MockDomain::acknowledging().with_events([job_event(
        BLOCK_JOB_ERROR,
        json!({"device": "job-id", "operation": "write", "action": "report"}),
    )]);

    let err = disk("drive0", "node-A")
        .commit(&domain, "/tmp/foo", "job-id", TIMEOUT)
        .await
        .unwrap_err();

    match err {
        qmp_block::Error::JobFailed { device, reason } => {
            assert_eq!(device, "job-id");
            assert_eq!(reason, "write error (action: report)");
        }
        other => panic!("expected job failure, got {other:?}"),
    }
}

#[tokio::test]
async fn commit_feed_closing_is_stream_ended() {
    let domain = MockDomain::acknowledging().closing_feed();

    let err = disk("drive0", "node-A")
        .commit(&domain, "/tmp/foo", "job-id", TIMEOUT)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::StreamEnded);
    assert_ne!(err.kind(), ErrorKind::Disconnected);
    assert!(err.is_job_state_unknown());
}

#[tokio::test]
async fn commit_times_out_without_events() {
    let domain = MockDomain::acknowledging();

    let err = disk("test", "node-A")
        .commit(&domain, "/tmp/foo", "job-id", Duration::ZERO)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::JobTimeout);
    assert!(err.is_job_state_unknown());
}

#[tokio::test]
async fn commit_ignores_events_for_other_jobs() {
    let domain = MockDomain::acknowledging().with_events([
        job_event(BLOCK_JOB_COMPLETED, json!({"device": "someone-else"})),
        job_event(
            BLOCK_JOB_ERROR,
            json!({"device": "node-B", "operation": "read", "action": "stop"}),
        ),
    ]);

    let err = disk("drive0", "node-A")
        .commit(&domain, "/tmp/foo", "job-id", Duration::from_millis(50))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::JobTimeout);
}

#[tokio::test]
async fn complete_sends_device_and_waits_for_completion() {
    let domain = MockDomain::new(|cmd| {
        assert_eq!(cmd.name, "block-job-complete");
        assert_eq!(cmd.args, json!({"device": "drive-virtio-disk0"}));
        MockReply::ok()
    })
    .with_events([job_event(
        BLOCK_JOB_COMPLETED,
        json!({"type": "mirror", "device": "drive-virtio-disk0"}),
    )]);

    BlockJob::new("drive-virtio-disk0")
        .complete(&domain, TIMEOUT)
        .await
        .unwrap();
}

#[tokio::test]
async fn complete_cancelled_event_is_job_failed() {
    let domain = MockDomain::acknowledging().with_events([job_event(
        BLOCK_JOB_CANCELLED,
        json!({"device": "test", "offset": 5, "len": 10}),
    )]);

    let err = BlockJob::new("test")
        .complete(&domain, TIMEOUT)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::JobFailed);
}

#[tokio::test]
async fn complete_times_out_without_events() {
    let domain = MockDomain::acknowledging();

    let err = BlockJob::new("test")
        .complete(&domain, Duration::ZERO)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::JobTimeout);
}

#[tokio::test]
async fn complete_job_error_is_job_failed_with_event_reason() {
    let domain = MockDomain::acknowledging().with_events([job_event(
        BLOCK_JOB_ERROR,
        json!({"device": "drive0", "operation": "read", "action": "stop"}),
    )]);

    let err = BlockJob::new("drive0")
        .complete(&domain, TIMEOUT)
        .await
        .unwrap_err();

    match err {
        qmp_block::Error::JobFailed { device, reason } => {
            assert_eq!(device, "drive0");
            assert_eq!(reason, "read error (action: stop)");
        }
        other => panic!("expected job failure, got {other:?}"),
    }
}

#[tokio::test]
async fn complete_feed_closing_is_stream_ended() {
    let domain = MockDomain::acknowledging().closing_feed();

    let err = BlockJob::new("drive0")
        .complete(&domain, TIMEOUT)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::StreamEnded);
    assert!(err.is_job_state_unknown());
}

#[tokio::test]
async fn commit_stalled_ack_ends_within_timeout() {
    let domain = MockDomain::new(|_| MockReply::Stall);

    let err = tokio::time::timeout(
        Duration::from_secs(2),
        disk("drive0", "node-A").commit(&domain, "/tmp/foo", "job-id", Duration::from_millis(100)),
    )
    .await
    .expect("commit outlived its timeout")
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(err.is_job_state_unknown());
}

#[tokio::test]
async fn complete_stalled_ack_ends_within_timeout() {
    let domain = MockDomain::new(|_| MockReply::Stall);

    let err = tokio::time::timeout(
        Duration::from_secs(2),
        BlockJob::new("drive0").complete(&domain, Duration::from_millis(100)),
    )
    .await
    .expect("complete outlived its timeout")
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(err.is_job_state_unknown());
}

#[tokio::test]
async fn mirror_and_cancel_stalled_ack_is_timeout() {
    let domain = MockDomain::new(|_| MockReply::Stall);
    let short = Duration::from_millis(50);

    let err = disk("drive0", "node-A")
        .mirror(&domain, "/tmp/foo.img", short)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    let err = BlockJob::new("drive0")
        .cancel(&domain, short)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    assert_eq!(domain.commands().len(), 2);
}

#[tokio::test]
async fn mirror_sends_device_and_target() {
    let domain = MockDomain::new(|cmd| {
        assert_eq!(cmd.name, "drive-mirror");
        assert_eq!(
            cmd.args,
            json!({"device": "drive-virtio-disk0", "target": "/tmp/foo.img"})
        );
        MockReply::ok()
    });

    disk("drive-virtio-disk0", "node-A")
        .mirror(&domain, "/tmp/foo.img", TIMEOUT)
        .await
        .unwrap();
}

#[tokio::test]
async fn mirror_relative_path_sends_nothing() {
    let domain = MockDomain::acknowledging();

    let err = disk("drive-virtio-disk0", "node-A")
        .mirror(&domain, "relative-path.img", TIMEOUT)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(domain.commands().is_empty());
}

#[tokio::test]
async fn snapshot_sends_node_names_and_file() {
    let domain = MockDomain::new(|cmd| {
        assert_eq!(cmd.name, "blockdev-snapshot-sync");
        assert_eq!(
            cmd.args,
            json!({
                "node-name": "drive-virtio-disk0",
                "snapshot-file": "/tmp/foo.img",
                "snapshot-node-name": "my-node"
            })
        );
        MockReply::ok()
    });

    disk("", "drive-virtio-disk0")
        .snapshot(&domain, "/tmp/foo.img", "my-node")
        .await
        .unwrap();
}

#[tokio::test]
async fn concurrent_waits_only_see_their_own_job() {
    let domain = MockDomain::acknowledging();
    let committing = disk("drive0", "node-A");
    let pivoting = BlockJob::new("drive1");

    let (commit, complete, ()) = tokio::join!(
        committing.commit(&domain, "/tmp/a.img", "job-a", TIMEOUT),
        pivoting.complete(&domain, TIMEOUT),
        async {
            tokio::task::yield_now().await;
            domain.publish(job_event(BLOCK_JOB_COMPLETED, json!({"device": "drive1"})));
            domain.publish(job_event(
                BLOCK_JOB_COMPLETED,
                json!({"device": "job-a", "error": "No space left on device"}),
            ));
        }
    );

    complete.unwrap();
    match commit.unwrap_err() {
        qmp_block::Error::JobFailed { reason, .. } => {
            assert_eq!(reason, "No space left on device")
        }
        other => panic!("expected job failure, got {other:?}"),
    }
}

#[tokio::test]
async fn lists_devices_and_jobs() {
    let domain = MockDomain::new(|cmd| match cmd.name.as_str() {
        "query-block" => MockReply::Return(json!([
            {
                "device": "drive-virtio-disk0",
                "locked": false,
                "removable": false,
                "inserted": {
                    "node-name": "#block123",
                    "file": "/var/lib/vm/disk0.qcow2",
                    "drv": "qcow2",
                    "backing_file": "/var/lib/vm/base.qcow2",
                    "ro": false
                },
                "type": "unknown"
            },
            {"device": "ide1-cd0", "locked": false, "removable": true, "type": "unknown"}
        ])),
        "query-block-jobs" => MockReply::Return(json!([
            {"device": "job-1", "type": "commit", "len": 10, "offset": 4, "busy": true, "paused": false, "speed": 0, "ready": false}
        ])),
        other => MockReply::error("CommandNotFound", format!("unexpected {other}")),
    });

    let devices = block::block_devices(&domain).await.unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].inserted.node_name, "#block123");
    assert_eq!(devices[0].inserted.driver, "qcow2");
    assert_eq!(
        devices[0].inserted.backing_file.as_deref(),
        Some("/var/lib/vm/base.qcow2")
    );
    assert!(devices[1].removable);
    assert!(devices[1].inserted.node_name.is_empty());

    let jobs = block::block_jobs(&domain).await.unwrap();
    assert_eq!(jobs, vec![BlockJob::new("job-1")]);
}
