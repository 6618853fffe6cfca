//! Property tests for progress tracking across interrupted passes.

use std::collections::BTreeSet;

use mview_core::db::migrations;
use mview_core::{
    CancelToken, EntityId, MviewConfig, SqliteChangelog, SqliteStateStore, UpdateCoordinator,
    UpdateError, UpdateOutcome, Version,
};
use proptest::prelude::*;
use rusqlite::Connection;

const VIEW: &str = "stock_index";

fn test_db() -> Connection {
    let mut conn = Connection::open_in_memory().expect("open in-memory db");
    migrations::migrate(&mut conn).expect("migrate schema");
    conn
}

fn config(chunk: usize, batch: u64) -> MviewConfig {
    let mut config = MviewConfig::default();
    config.update.default_chunk_size = chunk;
    config.update.version_batch_size = batch;
    config
}

/// How a single pass misbehaves: fail the nth action call, cancel after it,
/// or run cleanly.
#[derive(Debug, Clone, Copy)]
enum Disruption {
    None,
    FailAt(usize),
    CancelAt(usize),
}

fn arb_disruption() -> impl Strategy<Value = Disruption> {
    prop_oneof![
        Just(Disruption::None),
        (1usize..6).prop_map(Disruption::FailAt),
        (1usize..6).prop_map(Disruption::CancelAt),
    ]
}

proptest! {
    #![proptest_config(proptest::test_runner::Config::with_cases(128))]

    #[test]
    fn every_changed_id_is_applied_and_checkpoints_only_grow(
        ids in prop::collection::vec(0u64..40, 1..60),
        chunk in 1usize..6,
        batch in 1u64..12,
        disruptions in prop::collection::vec(arb_disruption(), 0..6),
    ) {
        let conn = test_db();
        let changelog = SqliteChangelog::new(&conn, VIEW).expect("valid view id");
        changelog.create().expect("create changelog");
        let head = changelog.append(&ids).expect("append");

        let cancel = CancelToken::new();
        let coordinator = UpdateCoordinator::new(SqliteStateStore::new(&conn), &config(chunk, batch))
            .with_cancel_token(cancel.clone());

        let mut applied: BTreeSet<EntityId> = BTreeSet::new();
        let mut checkpoints: Vec<Version> = vec![0];

        // Disrupted passes first, then clean passes until caught up.
        let clean_passes = std::iter::repeat_n(Disruption::None, 3);
        for disruption in disruptions.into_iter().chain(clean_passes) {
            let mut calls = 0usize;
            let mut action = |chunk_ids: &[EntityId]| -> anyhow::Result<()> {
                calls += 1;
                if matches!(disruption, Disruption::FailAt(n) if n == calls) {
                    anyhow::bail!("injected failure");
                }
                applied.extend(chunk_ids.iter().copied());
                if matches!(disruption, Disruption::CancelAt(n) if n == calls) {
                    cancel.cancel();
                }
                Ok(())
            };

            match coordinator.update(&changelog, &mut action) {
                Ok(report) => {
                    prop_assert!(!matches!(report.outcome, UpdateOutcome::Skipped { .. }), "expected non-skipped outcome");
                }
                Err(err) => prop_assert!(matches!(err, UpdateError::ActionFailure { .. }), "expected ActionFailure"),
            }
            cancel.flag().store(false, std::sync::atomic::Ordering::SeqCst);

            let state = coordinator.state(VIEW).expect("load");
            prop_assert_eq!(state.status, mview_core::ViewStatus::Idle);
            let last = *checkpoints.last().expect("seeded with 0");
            prop_assert!(state.last_processed_version >= last);
            checkpoints.push(state.last_processed_version);
        }

        let state = coordinator.state(VIEW).expect("load");
        prop_assert_eq!(state.last_processed_version, head);
        let expected: BTreeSet<EntityId> = ids.iter().copied().collect();
        prop_assert_eq!(applied, expected);
    }

    #[test]
    fn checkpoint_after_each_pass_matches_applied_ranges(
        first in prop::collection::vec(0u64..20, 1..20),
        second in prop::collection::vec(0u64..20, 0..20),
        batch in 1u64..8,
    ) {
        let conn = test_db();
        let changelog = SqliteChangelog::new(&conn, VIEW).expect("valid view id");
        changelog.create().expect("create changelog");
        let coordinator = UpdateCoordinator::new(SqliteStateStore::new(&conn), &config(3, batch));

        let head_one = changelog.append(&first).expect("append");
        let mut seen = BTreeSet::new();
        let mut action = |chunk_ids: &[EntityId]| -> anyhow::Result<()> {
            seen.extend(chunk_ids.iter().copied());
            Ok(())
        };
        let report = coordinator.update(&changelog, &mut action).expect("first pass");
        prop_assert_eq!(report.checkpoint_version, head_one);
        prop_assert_eq!(seen, first.iter().copied().collect::<BTreeSet<_>>());

        let head_two = if second.is_empty() { head_one } else { changelog.append(&second).expect("append") };
        let mut seen = BTreeSet::new();
        let mut action = |chunk_ids: &[EntityId]| -> anyhow::Result<()> {
            seen.extend(chunk_ids.iter().copied());
            Ok(())
        };
        let report = coordinator.update(&changelog, &mut action).expect("second pass");
        prop_assert_eq!(report.checkpoint_version, head_two);
        prop_assert_eq!(seen, second.iter().copied().collect::<BTreeSet<_>>());
    }
}
