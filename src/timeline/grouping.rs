//! Clusters simultaneous presses into note groups and frames them with padding.

use super::{NoteGroup, NotePress};

/// Cluster presses whose start offset is zero into the preceding group.
///
/// Group times are relative: each is the delay since the previous group.
pub fn group_notes(presses: &[NotePress]) -> Vec<NoteGroup> {
    let mut groups = Vec::new();
    let mut current: Option<NoteGroup> = None;

    for press in presses {
        if press.start_offset_ms == 0 {
            if let Some(group) = current.as_mut() {
                group.max_duration_ms = group.max_duration_ms.max(press.duration_ms);
                group.notes.push(*press);
                continue;
            }
        }

        groups.extend(current.take());
        current = Some(NoteGroup {
            time_ms: press.start_offset_ms,
            notes: vec![*press],
            max_duration_ms: press.duration_ms,
        });
    }

    groups.extend(current);
    groups
}

/// Frame relative groups with a lead-in and a lead-out.
///
/// Prepends an empty group at 0, moves the first real group to `lead_in_ms`
/// and appends an empty group after the longest note of the last real group,
/// so playback never ends in the middle of a sustain.
pub fn add_time_padding(mut groups: Vec<NoteGroup>, lead_in_ms: i64) -> Vec<NoteGroup> {
    if groups.is_empty() {
        return groups;
    }

    let lead_out_ms = groups
        .last()
        .and_then(|g| g.notes.iter().map(|n| n.duration_ms).max())
        .unwrap_or(0);

    groups[0].time_ms = lead_in_ms;

    let mut padded = Vec::with_capacity(groups.len() + 2);
    padded.push(NoteGroup::empty(0));
    padded.extend(groups);
    padded.push(NoteGroup::empty(lead_out_ms));
    padded
}

/// Running sum of relative group times.
pub fn to_absolute_time(groups: Vec<NoteGroup>) -> Vec<NoteGroup> {
    let mut time_acc = 0;
    groups
        .into_iter()
        .map(|mut group| {
            time_acc += group.time_ms;
            group.time_ms = time_acc;
            group
        })
        .collect()
}
