// src/feed.rs
//! Pure helpers that turn the two direction buffers into one ordered feed.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};

use crate::models::{Direction, TaggedTransfer};

#[derive(Default)]
struct HashGroup {
    members: usize,
    has_token: bool,
    has_native: bool,
}

/// Removes redundant records from a direction-tagged union.
///
/// * Records re-delivered with the same `uniqueId` in the same direction
///   collapse to the first copy.
/// * Within a hash group holding both token and native records, native
///   records with zero value are dropped; indexers emit one of those beside
///   every token transfer. Non-zero native records stay.
///
/// Anything else is kept, including the `IN` and `OUT` halves of a
/// self-transfer. Applying this twice gives the same result as once.
pub fn dedupe_transfers(records: Vec<TaggedTransfer>) -> Vec<TaggedTransfer> {
    let mut seen_ids: HashSet<(String, Direction)> = HashSet::new();
    let records: Vec<TaggedTransfer> = records
        .into_iter()
        .filter(|r| match &r.transfer.unique_id {
            Some(id) => seen_ids.insert((id.clone(), r.direction)),
            None => true,
        })
        .collect();

    let mut groups: HashMap<&str, HashGroup> = HashMap::new();
    for r in &records {
        let group = groups.entry(r.hash()).or_default();
        group.members += 1;
        if r.transfer.category.is_native() {
            group.has_native = true;
        } else {
            group.has_token = true;
        }
    }

    let dropped: Vec<bool> = records
        .iter()
        .map(|r| {
            let group = &groups[r.hash()];
            group.members > 1
                && group.has_token
                && group.has_native
                && r.transfer.category.is_native()
                && r.transfer.is_zero_value()
        })
        .collect();

    records
        .into_iter()
        .zip(dropped)
        .filter_map(|(r, skip)| (!skip).then_some(r))
        .collect()
}

/// Newest block first; inside a block newest timestamp first, then
/// ascending transaction index. Missing hints sort last. Stable, so records
/// that tie keep their buffer order.
pub fn sort_chronologically(records: &mut [TaggedTransfer]) {
    records.sort_by_cached_key(|r| {
        (
            Reverse(r.transfer.block_number()),
            Reverse(r.transfer.block_timestamp()),
            r.transfer.transaction_index().unwrap_or(u64::MAX),
        )
    });
}

/// Union of both buffers, deduplicated and sorted.
pub fn build_feed(outgoing: &[TaggedTransfer], incoming: &[TaggedTransfer]) -> Vec<TaggedTransfer> {
    let union: Vec<TaggedTransfer> = outgoing.iter().chain(incoming).cloned().collect();
    let mut feed = dedupe_transfers(union);
    sort_chronologically(&mut feed);
    feed
}

/// Position in `feed` just past the last record whose hash was already
/// served. Late pages can insert records above served ones; this keeps the
/// cursor behind everything the caller has seen.
pub fn realign_position(served: &[TaggedTransfer], feed: &[TaggedTransfer]) -> usize {
    if served.is_empty() {
        return 0;
    }
    let hashes: HashSet<&str> = served.iter().map(TaggedTransfer::hash).collect();
    feed.iter()
        .rposition(|r| hashes.contains(r.hash()))
        .map_or(0, |i| i + 1)
}
