//! Integration test: overwrite / skip / rename against an existing destination.

mod common;

use common::{fixture, write_file, Fixture};
use ferry_core::types::{ConflictPolicy, TransferRef};
use ferry_transfer::{JobStatus, TaskSpec, TaskStatus, TransferJob};

async fn run(fx: &Fixture, policy: ConflictPolicy) -> TransferJob {
    let receipt = fx
        .engine
        .submit(
            vec![TaskSpec::new(
                TransferRef::local("local-0", "incoming/report.txt"),
                TransferRef::local("local-0", "reports/report.txt"),
            )],
            policy,
        )
        .unwrap();
    fx.wait_terminal(&receipt.job_id).await
}

fn setup() -> Fixture {
    let fx = fixture().build();
    write_file(&fx.root, "reports/report.txt", b"original");
    write_file(&fx.root, "incoming/report.txt", b"updated report");
    fx
}

#[tokio::test]
async fn overwrite_replaces_destination() {
    let fx = setup();
    let job = run(&fx, ConflictPolicy::Overwrite).await;

    assert_eq!(job.status, JobStatus::Completed);
    let task = &job.tasks[0];
    assert_eq!(task.dest.path, "reports/report.txt");
    assert_eq!(task.bytes_transferred, 14);
    assert!(!task.skipped);
    assert_eq!(
        std::fs::read(fx.root.join("reports/report.txt")).unwrap(),
        b"updated report"
    );
}

#[tokio::test]
async fn skip_completes_with_zero_bytes() {
    let fx = setup();
    let job = run(&fx, ConflictPolicy::Skip).await;

    assert_eq!(job.status, JobStatus::Completed);
    let task = &job.tasks[0];
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.skipped);
    assert_eq!(task.bytes_transferred, 0);
    assert_eq!(job.progress.total_bytes, 0);
    assert_eq!(
        std::fs::read(fx.root.join("reports/report.txt")).unwrap(),
        b"original"
    );
}

#[tokio::test]
async fn rename_targets_next_free_name() {
    let fx = setup();
    let job = run(&fx, ConflictPolicy::Rename).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.tasks[0].dest.path, "reports/report (1).txt");
    assert_eq!(
        std::fs::read(fx.root.join("reports/report.txt")).unwrap(),
        b"original"
    );
    assert_eq!(
        std::fs::read(fx.root.join("reports/report (1).txt")).unwrap(),
        b"updated report"
    );

    // A second rename lands on the next marker
    let job = run(&fx, ConflictPolicy::Rename).await;
    assert_eq!(job.tasks[0].dest.path, "reports/report (2).txt");
}

#[tokio::test]
async fn rename_into_object_storage() {
    let fx = setup();
    fx.put_object("reports/report.txt", b"remote".to_vec()).await;

    let receipt = fx
        .engine
        .submit(
            vec![TaskSpec::new(
                TransferRef::local("local-0", "incoming/report.txt"),
                TransferRef::object("models", "reports/report.txt"),
            )],
            ConflictPolicy::Rename,
        )
        .unwrap();
    let job = fx.wait_terminal(&receipt.job_id).await;
    assert_eq!(job.tasks[0].dest.path, "reports/report (1).txt");
    assert_eq!(fx.read_object("reports/report.txt").await, b"remote");
    assert_eq!(
        fx.read_object("reports/report (1).txt").await,
        b"updated report"
    );
}

#[tokio::test]
async fn per_entry_policy_wins() {
    let fx = setup();
    write_file(&fx.root, "reports/other.txt", b"keep");
    write_file(&fx.root, "incoming/other.txt", b"new other");

    let receipt = fx
        .engine
        .submit(
            vec![
                TaskSpec::new(
                    TransferRef::local("local-0", "incoming/report.txt"),
                    TransferRef::local("local-0", "reports/report.txt"),
                ),
                TaskSpec::new(
                    TransferRef::local("local-0", "incoming/other.txt"),
                    TransferRef::local("local-0", "reports/other.txt"),
                )
                .with_policy(ConflictPolicy::Skip),
            ],
            ConflictPolicy::Overwrite,
        )
        .unwrap();
    let job = fx.wait_terminal(&receipt.job_id).await;
    assert!(!job.tasks[0].skipped);
    assert!(job.tasks[1].skipped);
    assert_eq!(std::fs::read(fx.root.join("reports/other.txt")).unwrap(), b"keep");
}

#[tokio::test]
async fn check_conflicts_reports_existing_names() {
    let fx = setup();
    fx.put_object("reports/remote.txt", b"r".to_vec()).await;
    let names: Vec<String> = ["report.txt", "missing.txt", "remote.txt"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let local = fx
        .engine
        .check_conflicts(&TransferRef::local("local-0", "reports"), &names)
        .await
        .unwrap();
    assert_eq!(local, vec!["report.txt"]);

    let remote = fx
        .engine
        .check_conflicts(&TransferRef::object("models", "reports"), &names)
        .await
        .unwrap();
    assert_eq!(remote, vec!["remote.txt"]);

    let err = fx
        .engine
        .check_conflicts(&TransferRef::local("local-0", "../etc"), &names)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "security");
}
