//! Merges independently timed tracks into one time-ordered stream.

use std::collections::VecDeque;

use super::RawEvent;

/// K-way merge of per-track event lists by absolute tick.
///
/// Each track keeps a running absolute time. At every step the track whose
/// next event lands earliest is dequeued (ties go to the lowest track index)
/// and the event is re-emitted with a delta relative to the previously
/// merged event, so summing the output deltas reproduces true absolute time.
pub fn merge_tracks(tracks: Vec<Vec<RawEvent>>) -> Vec<RawEvent> {
    let total: usize = tracks.iter().map(Vec::len).sum();
    let mut queues: Vec<VecDeque<RawEvent>> = tracks.into_iter().map(VecDeque::from).collect();
    let mut timelines = vec![0u64; queues.len()];
    let mut merged_time = 0u64;
    let mut merged = Vec::with_capacity(total);

    loop {
        let next = queues
            .iter()
            .enumerate()
            .filter_map(|(i, queue)| queue.front().map(|e| (i, timelines[i] + e.delta_ticks)))
            .min_by_key(|&(_, time)| time);

        let Some((idx, time)) = next else {
            break;
        };
        let Some(mut event) = queues[idx].pop_front() else {
            break;
        };

        timelines[idx] = time;
        event.delta_ticks = time.saturating_sub(merged_time);
        merged_time = time;
        merged.push(event);
    }

    merged
}
