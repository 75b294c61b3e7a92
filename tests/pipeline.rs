use chrono::TimeZone;
use opslog::aggregator::{self, AggregatorOptions, DashboardStatus, MalformedPolicy};
use opslog::record::builder::RecordBuilder;
use opslog::record::{Action, TelemetryRecord};
use opslog::store::fs::FsRemoteLog;
use opslog::store::{AppendOnlyRemoteLog, Layout};
use opslog::validator::{validate_tree, ValidatorOptions};
use opslog::writer::{AppendOutcome, LogWriter, WriterPolicy};
use std::time::Duration;
use tempfile::tempdir;

fn record(date: (i32, u32, u32), correlation: &str, category: &str) -> TelemetryRecord {
    RecordBuilder::new()
        .schema_version("1.0")
        .generated_at(
            chrono::Utc
                .with_ymd_and_hms(date.0, date.1, date.2, 10, 30, 0)
                .unwrap(),
        )
        .correlation_id(correlation)
        .source("ci", "prepare", "77")
        .entity("repository", "acme", "demo")
        .category(category)
        .action(Action::Success)
        .build()
        .unwrap()
}

fn quick_policy(layout: Layout) -> WriterPolicy {
    WriterPolicy {
        layout,
        backoff_base: Duration::from_millis(1),
        ..WriterPolicy::default()
    }
}

#[test]
fn emitted_record_validates_and_aggregates_healthy() {
    let tmp = tempdir().unwrap();
    let log = FsRemoteLog::init(tmp.path()).unwrap();
    let writer = LogWriter::new(Box::new(log), quick_policy(Layout::Hierarchical));

    let outcome = writer.append(&record((2026, 1, 1), "run-1", "build")).unwrap();
    match outcome {
        AppendOutcome::Published { attempts, path } => {
            assert_eq!(attempts, 1);
            assert_eq!(path, "demo/2026-01-01/run-1/build.json");
        }
        other => panic!("expected published outcome, got {other:?}"),
    }

    let published = FsRemoteLog::open(tmp.path()).unwrap().published_root();

    let report = validate_tree(&published, ValidatorOptions::default()).unwrap();
    assert!(report.ok, "unexpected violations: {:?}", report.violations);
    assert_eq!(report.files_checked, 1);

    let snapshot = aggregator::aggregate_at(
        &published,
        "demo",
        AggregatorOptions::default(),
        chrono::Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap(),
    );
    assert_eq!(snapshot.status, DashboardStatus::Healthy);
    assert_eq!(snapshot.metrics.total_events, 1);
    assert_eq!(snapshot.metrics.total_runs, Some(1));
    assert_eq!(snapshot.metrics.categories, vec!["build"]);
    assert_eq!(snapshot.coverage.days_present, 1);
    assert_eq!(snapshot.diagnostics.notes, vec!["No destructive actions taken"]);
}

#[test]
fn days_present_tracks_distinct_dates_not_events() {
    let tmp = tempdir().unwrap();
    let log = FsRemoteLog::init(tmp.path()).unwrap();
    let writer = LogWriter::new(Box::new(log), quick_policy(Layout::Hierarchical));

    writer.append(&record((2026, 1, 1), "run-1", "build")).unwrap();
    writer.append(&record((2026, 1, 1), "run-2", "deploy")).unwrap();
    writer.append(&record((2026, 1, 4), "run-3", "build")).unwrap();

    let published = FsRemoteLog::open(tmp.path()).unwrap().published_root();
    let snapshot = aggregator::aggregate(&published, "demo", AggregatorOptions::default());
    assert_eq!(snapshot.metrics.total_events, 3);
    assert_eq!(snapshot.metrics.total_runs, Some(3));
    assert_eq!(snapshot.coverage.days_present, 2);
    assert_eq!(snapshot.coverage.first.as_deref(), Some("2026-01-01"));
    assert_eq!(snapshot.coverage.last.as_deref(), Some("2026-01-04"));
}

#[test]
fn published_records_are_listed_back_verbatim() {
    let tmp = tempdir().unwrap();
    let log = FsRemoteLog::init(tmp.path()).unwrap();
    let writer = LogWriter::new(Box::new(log), quick_policy(Layout::Hierarchical));

    let original = record((2026, 1, 1), "run-1", "build");
    writer.append(&original).unwrap();

    let records = FsRemoteLog::open(tmp.path()).unwrap().list("demo").unwrap();
    assert_eq!(records.len(), 1);
    let read_back: TelemetryRecord = serde_json::from_value(records[0].value.clone()).unwrap();
    assert_eq!(read_back, original);
}

#[test]
fn flat_layout_pipeline_appends_lines_and_aggregates() {
    let tmp = tempdir().unwrap();
    let log = FsRemoteLog::init(tmp.path()).unwrap();
    let writer = LogWriter::new(Box::new(log), quick_policy(Layout::Flat));

    writer.append(&record((2026, 1, 1), "run-1", "build")).unwrap();
    writer.append(&record((2026, 1, 1), "run-2", "deploy")).unwrap();

    let published = FsRemoteLog::open(tmp.path()).unwrap().published_root();
    assert!(published.join("demo/2026-01-01.jsonl").exists());

    let options = ValidatorOptions {
        layout: Layout::Flat,
        parse_json: true,
    };
    let report = validate_tree(&published, options).unwrap();
    assert!(report.ok, "unexpected violations: {:?}", report.violations);

    let snapshot = aggregator::aggregate(
        &published,
        "demo",
        AggregatorOptions {
            layout: Layout::Flat,
            on_malformed: MalformedPolicy::Fail,
        },
    );
    assert_eq!(snapshot.status, DashboardStatus::Healthy);
    assert_eq!(snapshot.metrics.total_events, 2);
    assert_eq!(snapshot.metrics.total_runs, None);
}

#[test]
fn fan_out_builds_dashboards_for_every_published_repo() {
    let tmp = tempdir().unwrap();
    let out = tempdir().unwrap();
    let log = FsRemoteLog::init(tmp.path()).unwrap();
    let writer = LogWriter::new(Box::new(log), quick_policy(Layout::Hierarchical));
    writer.append(&record((2026, 1, 1), "run-1", "build")).unwrap();

    let published = FsRemoteLog::open(tmp.path()).unwrap().published_root();
    let built =
        aggregator::build_all(&published, out.path(), AggregatorOptions::default()).unwrap();
    assert_eq!(built.len(), 1);
    assert!(out.path().join("demo/dashboard.json").exists());
}
