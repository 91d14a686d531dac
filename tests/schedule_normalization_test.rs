//! Schedule normalization and next-run behavior.

use chrono::{TimeZone, Utc};
use praktor::domain::models::schedule::Schedule;
use praktor::domain::GatewayError;
use proptest::prelude::*;
use serde_json::json;

#[test]
fn plain_cron_normalizes_to_cron_kind() {
    let schedule = Schedule::normalize(&json!("*/5 * * * *")).unwrap();
    assert_eq!(
        serde_json::to_value(&schedule).unwrap(),
        json!({"kind": "cron", "cron_expr": "*/5 * * * *"})
    );
}

#[test]
fn daily_tag_normalizes_to_cron_kind() {
    let schedule = Schedule::normalize(&json!("@daily")).unwrap();
    assert_eq!(
        serde_json::to_value(&schedule).unwrap(),
        json!({"kind": "cron", "cron_expr": "@daily"})
    );
}

#[test]
fn invalid_expression_is_bad_schedule() {
    let err = Schedule::normalize(&json!("not a cron")).unwrap_err();
    assert!(matches!(err, GatewayError::BadSchedule(_)));
}

#[test]
fn json_kinds_validate_and_pass_through() {
    let interval = Schedule::normalize(&json!({"kind": "interval", "interval_ms": 60000})).unwrap();
    assert_eq!(interval, Schedule::Interval { interval_ms: 60000 });

    let once = Schedule::normalize(&json!({"kind": "once", "at_ms": 1_700_000_000_000i64})).unwrap();
    assert_eq!(once, Schedule::Once { at_ms: 1_700_000_000_000 });

    assert!(Schedule::normalize(&json!({"kind": "interval", "interval_ms": 0})).is_err());
    assert!(Schedule::normalize(&json!({"kind": "once", "at_ms": 0})).is_err());
    assert!(Schedule::normalize(&json!({"kind": "cron", "cron_expr": "nope"})).is_err());
    assert!(Schedule::normalize(&json!({"kind": "mystery"})).is_err());
}

#[test]
fn interval_next_run_is_now_plus_interval() {
    let now = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
    let schedule = Schedule::Interval { interval_ms: 60_000 };
    assert_eq!(
        schedule.next_run(now).unwrap().unwrap().timestamp_millis(),
        1_700_000_060_000
    );
}

#[test]
fn once_in_the_past_is_finished() {
    let now = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
    let past = Schedule::Once { at_ms: 1_600_000_000_000 };
    assert_eq!(past.next_run(now).unwrap(), None);

    let future = Schedule::Once { at_ms: 1_800_000_000_000 };
    assert_eq!(
        future.next_run(now).unwrap().unwrap().timestamp_millis(),
        1_800_000_000_000
    );
}

#[test]
fn cron_next_run_is_strictly_after_now() {
    // Even when now sits exactly on a tick boundary.
    let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let schedule = Schedule::Cron {
        cron_expr: "0 * * * *".into(),
    };
    let next = schedule.next_run(now).unwrap().unwrap();
    assert!(next > now);
}

#[test]
fn cron_next_runs_strictly_increase() {
    let schedule = Schedule::Cron {
        cron_expr: "*/5 * * * *".into(),
    };
    let mut now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    let mut previous = None;
    for _ in 0..10 {
        let next = schedule.next_run(now).unwrap().unwrap();
        if let Some(previous) = previous {
            assert!(next > previous);
        }
        previous = Some(next);
        now = next;
    }
}

#[test]
fn minute_and_hour_tags_are_translated() {
    for tag in ["@5minutes", "@1minute", "@2hours", "@hourly", "@weekly"] {
        let schedule = Schedule::normalize(&json!(tag)).unwrap();
        assert!(
            schedule.next_run(Utc::now()).unwrap().is_some(),
            "tag {tag} should produce a next run"
        );
    }
    assert!(Schedule::normalize(&json!("@sometimes")).is_err());
    assert!(Schedule::normalize(&json!("@0minutes")).is_err());
}

proptest! {
    // Normalization is idempotent: re-normalizing a normalized schedule
    // yields the same value.
    #[test]
    fn normalize_is_idempotent_for_intervals(interval_ms in 1u64..u64::from(u32::MAX)) {
        let first = Schedule::normalize(&json!({"kind": "interval", "interval_ms": interval_ms})).unwrap();
        let again = Schedule::normalize(&serde_json::to_value(&first).unwrap()).unwrap();
        prop_assert_eq!(first, again);
    }

    #[test]
    fn normalize_is_idempotent_for_once(at_ms in 1i64..4_102_444_800_000i64) {
        let first = Schedule::normalize(&json!({"kind": "once", "at_ms": at_ms})).unwrap();
        let again = Schedule::normalize(&serde_json::to_value(&first).unwrap()).unwrap();
        prop_assert_eq!(first, again);
    }

    #[test]
    fn interval_next_run_never_regresses(interval_ms in 1u64..31_536_000_000u64) {
        let now = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let schedule = Schedule::Interval { interval_ms };
        let next = schedule.next_run(now).unwrap().unwrap();
        prop_assert!(next > now);
    }
}
