//! The start and finish lines of a pass name the view, the pid and whether
//! the pass was incremental or a full reindex.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use mview_core::db::migrations;
use mview_core::{EntityId, MviewConfig, SqliteChangelog, SqliteStateStore, UpdateCoordinator};
use rusqlite::Connection;
use tracing::Subscriber;
use tracing::field::{Field, Visit};
use tracing_subscriber::Registry;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

type Events = Arc<Mutex<Vec<BTreeMap<String, String>>>>;

#[derive(Default)]
struct FieldVisitor {
    fields: BTreeMap<String, String>,
}

impl FieldVisitor {
    fn record(&mut self, field: &Field, value: String) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.record(field, format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record(field, value.to_string());
    }
}

struct CaptureLayer {
    events: Events,
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        self.events.lock().expect("event capture").push(visitor.fields);
    }
}

fn captured<T>(run: impl FnOnce() -> T) -> (T, Vec<BTreeMap<String, String>>) {
    let events = Events::default();
    let subscriber = Registry::default().with(CaptureLayer {
        events: Arc::clone(&events),
    });
    let result = tracing::dispatcher::with_default(&tracing::Dispatch::new(subscriber), run);
    let events = events.lock().expect("event capture").clone();
    (result, events)
}

fn find<'e>(events: &'e [BTreeMap<String, String>], message: &str) -> &'e BTreeMap<String, String> {
    events
        .iter()
        .find(|fields| fields.get("message").is_some_and(|m| m == message))
        .unwrap_or_else(|| panic!("no `{message}` event in {events:?}"))
}

fn setup(trace_passes: bool) -> (Connection, MviewConfig) {
    let mut conn = Connection::open_in_memory().expect("open in-memory db");
    migrations::migrate(&mut conn).expect("migrate schema");
    {
        let changelog = SqliteChangelog::new(&conn, "catalog").expect("valid view id");
        changelog.create().expect("create changelog");
        changelog.append(&[5, 6, 7]).expect("append");
    }
    let mut config = MviewConfig::default();
    config.logging.trace_passes = trace_passes;
    (conn, config)
}

#[test]
fn full_reindex_logs_start_and_finish_with_mode_and_pid() {
    let (conn, config) = setup(false);
    let changelog = SqliteChangelog::new(&conn, "catalog").expect("valid view id");
    let coordinator = UpdateCoordinator::new(SqliteStateStore::new(&conn), &config);
    let mut noop = |_: &[EntityId]| -> anyhow::Result<()> { Ok(()) };

    let (report, events) = captured(|| coordinator.reindex_all(&changelog, &mut noop));
    report.expect("full reindex");

    let pid = std::process::id().to_string();
    for message in ["update pass started", "update pass finished"] {
        let fields = find(&events, message);
        assert_eq!(fields["mode"], "full", "{message}");
        assert_eq!(fields["view"], "catalog", "{message}");
        assert_eq!(fields["pid"], pid, "{message}");
    }
    assert_eq!(find(&events, "update pass started")["from"], "0");
    assert!(
        !events
            .iter()
            .any(|fields| fields.contains_key("backtrace")),
        "backtrace logged without trace_passes"
    );
}

#[test]
fn incremental_pass_is_labelled_incremental() {
    let (conn, config) = setup(false);
    let changelog = SqliteChangelog::new(&conn, "catalog").expect("valid view id");
    let coordinator = UpdateCoordinator::new(SqliteStateStore::new(&conn), &config);
    let mut noop = |_: &[EntityId]| -> anyhow::Result<()> { Ok(()) };

    let (report, events) = captured(|| coordinator.update(&changelog, &mut noop));
    report.expect("update");

    assert_eq!(find(&events, "update pass started")["mode"], "incremental");
    assert_eq!(find(&events, "update pass finished")["mode"], "incremental");
}

#[test]
fn trace_passes_logs_the_caller_backtrace() {
    let (conn, config) = setup(true);
    let changelog = SqliteChangelog::new(&conn, "catalog").expect("valid view id");
    let coordinator = UpdateCoordinator::new(SqliteStateStore::new(&conn), &config);
    let mut noop = |_: &[EntityId]| -> anyhow::Result<()> { Ok(()) };

    let (report, events) = captured(|| coordinator.reindex_all(&changelog, &mut noop));
    report.expect("full reindex");

    let caller = find(&events, "update pass caller");
    assert_eq!(caller["mode"], "full");
    assert!(!caller["backtrace"].is_empty());
}
