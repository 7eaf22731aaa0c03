//! Full-vs-incremental decision table (§4.4).

use b2s_api_types::{PlanDecision, SubvolumeState};
use chrono::{NaiveDateTime, TimeZone, Utc};

const SECONDS_PER_DAY: i64 = 86_400;

pub struct PlanInput<'a> {
    pub state: &'a SubvolumeState,
    pub now: i64,
    pub once: bool,
    pub full_every_days: u32,
    pub incremental_every_days: u32,
}

/// Evaluates the decision table top-to-bottom; the first matching row wins.
pub fn plan(input: &PlanInput) -> PlanDecision {
    let last_backup_at = input
        .state
        .last_snapshot_name
        .as_deref()
        .and_then(parse_timestamp_from_snapshot_name);

    let full_due = match input.state.last_full_at {
        None => true,
        Some(last_full_at) => {
            input.now - last_full_at >= input.full_every_days as i64 * SECONDS_PER_DAY
        }
    };
    let incremental_due = match last_backup_at {
        None => true,
        Some(last) => input.now - last >= input.incremental_every_days as i64 * SECONDS_PER_DAY,
    };

    if !input.once && !full_due && !incremental_due {
        return PlanDecision::Skip;
    }

    if input.state.last_full_at.is_none() {
        return PlanDecision::Full;
    }

    if full_due {
        return PlanDecision::Full;
    }

    let (last_manifest_key, last_snapshot_path) = match (
        &input.state.last_manifest_key,
        &input.state.last_snapshot_path,
    ) {
        (Some(k), Some(p)) => (k.clone(), p.clone()),
        _ => {
            log::info!("planner: falling back to full — no recorded manifest/snapshot to chain from");
            return PlanDecision::Full;
        }
    };

    if !std::path::Path::new(&last_snapshot_path).exists() {
        log::info!(
            "planner: falling back to full — parent snapshot {last_snapshot_path:?} is missing on disk"
        );
        return PlanDecision::Full;
    }

    PlanDecision::Incremental {
        parent_snapshot_path: last_snapshot_path,
        parent_manifest: last_manifest_key,
    }
}

fn parse_timestamp_from_snapshot_name(name: &str) -> Option<i64> {
    let caps = b2s_api_types::SNAPSHOT_NAME_REGEX.captures(name)?;
    let timestamp = caps.name("timestamp")?.as_str();
    let naive = NaiveDateTime::parse_from_str(timestamp, b2s_api_types::TIMESTAMP_FORMAT).ok()?;
    Some(Utc.from_utc_datetime(&naive).timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_state() -> SubvolumeState {
        SubvolumeState {
            last_snapshot_name: Some("data__20260101T000000Z__full".into()),
            last_snapshot_path: Some("/tmp/definitely-exists-for-test".into()),
            last_manifest_key: Some("subvol/data/full/20260101T000000Z/manifest.json".into()),
            last_full_at: Some(1_767_225_600),
        }
    }

    #[test]
    fn no_last_full_forces_full() {
        let state = SubvolumeState::default();
        let input = PlanInput {
            state: &state,
            now: 1_800_000_000,
            once: false,
            full_every_days: 30,
            incremental_every_days: 1,
        };
        assert_eq!(plan(&input), PlanDecision::Full);
    }

    #[test]
    fn full_cadence_due_forces_full() {
        let state = base_state();
        let input = PlanInput {
            state: &state,
            now: state.last_full_at.unwrap() + 31 * SECONDS_PER_DAY,
            once: false,
            full_every_days: 30,
            incremental_every_days: 1,
        };
        assert_eq!(plan(&input), PlanDecision::Full);
    }

    #[test]
    fn neither_cadence_due_skips_without_once() {
        let state = base_state();
        let now = state.last_full_at.unwrap() + 60;
        let input = PlanInput {
            state: &state,
            now,
            once: false,
            full_every_days: 30,
            incremental_every_days: 1,
        };
        assert_eq!(plan(&input), PlanDecision::Skip);
    }

    #[test]
    fn once_forces_evaluation_even_if_not_due() {
        let state = base_state();
        let now = state.last_full_at.unwrap() + 60;
        let input = PlanInput {
            state: &state,
            now,
            once: true,
            full_every_days: 30,
            incremental_every_days: 1,
        };
        match plan(&input) {
            PlanDecision::Incremental { .. } => {}
            other => panic!("expected incremental, got {other:?}"),
        }
    }

    #[test]
    fn missing_parent_snapshot_falls_back_to_full() {
        let mut state = base_state();
        state.last_snapshot_path = Some("/definitely/does/not/exist/anywhere".into());
        let now = state.last_full_at.unwrap() + 2 * SECONDS_PER_DAY;
        let input = PlanInput {
            state: &state,
            now,
            once: false,
            full_every_days: 30,
            incremental_every_days: 1,
        };
        assert_eq!(plan(&input), PlanDecision::Full);
    }

    #[test]
    fn missing_manifest_falls_back_to_full() {
        let mut state = base_state();
        state.last_manifest_key = None;
        let now = state.last_full_at.unwrap() + 2 * SECONDS_PER_DAY;
        let input = PlanInput {
            state: &state,
            now,
            once: false,
            full_every_days: 30,
            incremental_every_days: 1,
        };
        assert_eq!(plan(&input), PlanDecision::Full);
    }
}
