//! Snapshot retention (§4.3): keep the newest `keep_count` snapshots of a
//! subvolume, unconditionally preserving the snapshot an in-flight
//! incremental chain still depends on.

use b2s_api_types::SnapshotRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneMark {
    /// Still referenced by an in-progress incremental chain; never deleted.
    RequiredParent,
    Keep,
    Remove,
}

impl PruneMark {
    pub fn keep(self) -> bool {
        self != PruneMark::Remove
    }
}

/// Decides which of `snapshots` to keep and which to remove.
///
/// `snapshots` need not be sorted; this function sorts a local copy newest
/// first by `timestamp` and keeps the first `keep_count` of them, plus
/// `required_parent` (matched by path) regardless of its age rank.
pub fn compute_prune_marks(
    snapshots: &[SnapshotRecord],
    keep_count: usize,
    required_parent: Option<&str>,
) -> Vec<(SnapshotRecord, PruneMark)> {
    let mut sorted: Vec<&SnapshotRecord> = snapshots.iter().collect();
    sorted.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    sorted
        .into_iter()
        .enumerate()
        .map(|(i, snap)| {
            let mark = if Some(snap.path.as_str()) == required_parent {
                PruneMark::RequiredParent
            } else if i < keep_count {
                PruneMark::Keep
            } else {
                PruneMark::Remove
            };
            (snap.clone(), mark)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use b2s_api_types::SnapshotKind;

    fn snap(ts: &str) -> SnapshotRecord {
        SnapshotRecord {
            subvol: "data".into(),
            timestamp: ts.into(),
            kind: SnapshotKind::Full,
            path: format!("/snap/data__{ts}__full"),
            uuid: None,
            parent_uuid: None,
        }
    }

    #[test]
    fn keeps_newest_keep_count_snapshots() {
        let snaps = vec![snap("20260101T000000Z"), snap("20260102T000000Z"), snap("20260103T000000Z")];
        let marks = compute_prune_marks(&snaps, 2, None);
        let keep: Vec<_> = marks
            .iter()
            .filter(|(_, m)| m.keep())
            .map(|(s, _)| s.timestamp.clone())
            .collect();
        assert_eq!(keep, vec!["20260103T000000Z", "20260102T000000Z"]);
    }

    #[test]
    fn required_parent_survives_past_keep_count() {
        let snaps = vec![snap("20260101T000000Z"), snap("20260102T000000Z"), snap("20260103T000000Z")];
        let required = "/snap/data__20260101T000000Z__full";
        let marks = compute_prune_marks(&snaps, 1, Some(required));
        let oldest = marks
            .iter()
            .find(|(s, _)| s.path == required)
            .unwrap();
        assert_eq!(oldest.1, PruneMark::RequiredParent);
        assert!(oldest.1.keep());
    }

    #[test]
    fn keep_count_zero_still_preserves_required_parent() {
        let snaps = vec![snap("20260101T000000Z")];
        let marks = compute_prune_marks(&snaps, 0, Some("/snap/data__20260101T000000Z__full"));
        assert_eq!(marks[0].1, PruneMark::RequiredParent);
    }
}
