use crate::core::Snapshot;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, btree_map, btree_set};
use std::ops::{Bound, RangeBounds};

/// Rows that carry a position in the change-number order.
pub trait Ordinal {
    fn ordinal(&self) -> i64;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MvccRow<R> {
    pub row: R,
    pub xmin: u64,         // Transaction ID that created this version
    pub xmax: Option<u64>, // Transaction ID that replaced/deleted this version
}

/// What a single write did to a key's version chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    /// A new head version was pushed.
    pub created: bool,
    /// The previous head was expired.
    pub expired: bool,
}

/// Multi-versioned table keyed by `K`, with an index on the row ordinal.
///
/// Writers must hold the row lock for `key`; under that lock the last
/// version in a chain is always the head, so writes and undo only ever
/// touch the tail.
#[derive(Debug, Clone)]
pub struct Table<K, R> {
    name: &'static str,
    rows: BTreeMap<K, Vec<MvccRow<R>>>,
    ordinal_index: BTreeMap<i64, BTreeSet<K>>,
    // Keys whose newest version is unexpired, committed or not.
    live_heads: usize,
}

impl<K, R> Table<K, R>
where
    K: Ord + Clone,
    R: Ordinal + Clone,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            rows: BTreeMap::new(),
            ordinal_index: BTreeMap::new(),
            live_heads: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Upserts (`Some`) or deletes (`None`) the row for `key` as `tx_id`.
    ///
    /// Returns the head that was expired, if there was a live one.
    pub fn write(&mut self, key: &K, row: Option<R>, tx_id: u64) -> (Option<R>, WriteOutcome) {
        let versions = self.rows.entry(key.clone()).or_default();
        let was_live = has_live_head(versions);

        let mut previous = None;
        let mut expired = false;
        if let Some(head) = versions.last_mut()
            && head.xmax.is_none()
        {
            head.xmax = Some(tx_id);
            previous = Some(head.row.clone());
            expired = true;
        }

        let created = match row {
            Some(row) => {
                let ordinal = row.ordinal();
                versions.push(MvccRow {
                    row,
                    xmin: tx_id,
                    xmax: None,
                });
                self.ordinal_index
                    .entry(ordinal)
                    .or_default()
                    .insert(key.clone());
                true
            }
            None => false,
        };

        let is_live = has_live_head(versions);
        if versions.is_empty() {
            self.rows.remove(key);
        }
        self.adjust_live(was_live, is_live);

        (previous, WriteOutcome { created, expired })
    }

    /// Reverts one write made by `tx_id`. Undo must run newest-first.
    pub fn undo(&mut self, key: &K, tx_id: u64, outcome: WriteOutcome) {
        let Some(versions) = self.rows.get_mut(key) else {
            return;
        };
        let was_live = has_live_head(versions);

        if outcome.created
            && let Some(head) = versions.last()
            && head.xmin == tx_id
        {
            let ordinal = head.row.ordinal();
            versions.pop();
            let still_indexed = versions.iter().any(|v| v.row.ordinal() == ordinal);
            if !still_indexed {
                Self::unindex(&mut self.ordinal_index, ordinal, key);
            }
        }

        if outcome.expired
            && let Some(head) = versions.last_mut()
            && head.xmax == Some(tx_id)
        {
            head.xmax = None;
        }

        let is_live = has_live_head(versions);
        if versions.is_empty() {
            self.rows.remove(key);
        }
        self.adjust_live(was_live, is_live);
    }

    pub fn get(&self, key: &K, snapshot: &Snapshot) -> Option<&R> {
        self.rows
            .get(key)
            .and_then(|versions| Self::visible(versions, snapshot))
    }

    /// Visible rows whose ordinal falls in `range`, ascending by ordinal.
    ///
    /// A key rewritten under a new ordinal keeps its old index entry until
    /// vacuum; those stale entries are skipped because the visible version
    /// no longer carries the indexed ordinal.
    pub fn scan_ordinal_range<B>(&self, range: B, snapshot: &Snapshot) -> OrdinalScan<'_, K, R>
    where
        B: RangeBounds<i64>,
    {
        let ordinals = if is_inverted(&range) {
            None
        } else {
            Some(self.ordinal_index.range(range))
        };
        OrdinalScan {
            table: self,
            snapshot: snapshot.clone(),
            ordinals,
            current: None,
        }
    }

    pub fn scan(&self, snapshot: &Snapshot) -> Vec<R> {
        self.rows
            .values()
            .filter_map(|versions| Self::visible(versions, snapshot).cloned())
            .collect()
    }

    pub fn count(&self, snapshot: &Snapshot) -> usize {
        self.rows
            .values()
            .filter(|versions| Self::visible(versions, snapshot).is_some())
            .count()
    }

    /// Keys with an unexpired head version, including uncommitted writes.
    ///
    /// Kept up to date by every write, so reading it costs nothing. Use it
    /// for sizing decisions; [`Table::count`] is the exact visible count.
    pub fn estimated_len(&self) -> usize {
        self.live_heads
    }

    pub fn min_ordinal(&self, snapshot: &Snapshot) -> Option<i64> {
        self.scan_ordinal_range(.., snapshot)
            .next()
            .map(|row| row.ordinal())
    }

    pub fn max_ordinal(&self, snapshot: &Snapshot) -> Option<i64> {
        self.max_ordinal_in(.., snapshot)
    }

    /// Highest visible ordinal inside `range`.
    pub fn max_ordinal_in<B>(&self, range: B, snapshot: &Snapshot) -> Option<i64>
    where
        B: RangeBounds<i64>,
    {
        if is_inverted(&range) {
            return None;
        }
        for (ordinal, keys) in self.ordinal_index.range(range).rev() {
            for key in keys {
                if self.is_visible_at(key, *ordinal, snapshot) {
                    return Some(*ordinal);
                }
            }
        }
        None
    }

    /// Replaces the whole chain for `key` with one committed version, or
    /// drops it. Only used while nothing else can see the table.
    pub fn restore(&mut self, key: K, row: Option<R>) {
        if let Some(old) = self.rows.remove(&key) {
            if has_live_head(&old) {
                self.live_heads -= 1;
            }
            for version in old {
                Self::unindex(&mut self.ordinal_index, version.row.ordinal(), &key);
            }
        }
        if let Some(row) = row {
            self.ordinal_index
                .entry(row.ordinal())
                .or_default()
                .insert(key.clone());
            self.live_heads += 1;
            self.rows.insert(
                key,
                vec![MvccRow {
                    row,
                    xmin: 0,
                    xmax: None,
                }],
            );
        }
    }

    /// Drops versions expired before `horizon` and their index entries.
    pub fn vacuum(&mut self, horizon: u64) -> usize {
        let mut freed = 0;
        let mut emptied = Vec::new();

        for (key, versions) in self.rows.iter_mut() {
            let before = versions.len();
            let mut dropped = Vec::new();
            versions.retain(|version| {
                let dead = matches!(version.xmax, Some(xmax) if xmax < horizon);
                if dead {
                    dropped.push(version.row.ordinal());
                }
                !dead
            });
            freed += before - versions.len();

            for ordinal in dropped {
                if !versions.iter().any(|v| v.row.ordinal() == ordinal) {
                    Self::unindex(&mut self.ordinal_index, ordinal, key);
                }
            }
            if versions.is_empty() {
                emptied.push(key.clone());
            }
        }

        for key in emptied {
            self.rows.remove(&key);
        }
        freed
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.ordinal_index.clear();
        self.live_heads = 0;
    }

    /// Total versions held, live or dead.
    pub fn version_count(&self) -> usize {
        self.rows.values().map(|v| v.len()).sum()
    }

    fn adjust_live(&mut self, was_live: bool, is_live: bool) {
        match (was_live, is_live) {
            (false, true) => self.live_heads += 1,
            (true, false) => self.live_heads -= 1,
            _ => {}
        }
    }

    fn unindex(index: &mut BTreeMap<i64, BTreeSet<K>>, ordinal: i64, key: &K) {
        if let Some(keys) = index.get_mut(&ordinal) {
            keys.remove(key);
            if keys.is_empty() {
                index.remove(&ordinal);
            }
        }
    }

    fn is_visible_at(&self, key: &K, ordinal: i64, snapshot: &Snapshot) -> bool {
        self.get(key, snapshot)
            .is_some_and(|row| row.ordinal() == ordinal)
    }

    fn visible<'a>(versions: &'a [MvccRow<R>], snapshot: &Snapshot) -> Option<&'a R> {
        versions
            .iter()
            .rev()
            .find(|version| Self::is_visible(version, snapshot))
            .map(|version| &version.row)
    }

    fn is_visible(row: &MvccRow<R>, snapshot: &Snapshot) -> bool {
        if row.xmin == snapshot.tx_id {
            if let Some(xmax) = row.xmax
                && xmax == snapshot.tx_id
            {
                return false;
            }
            return true;
        }

        if !snapshot.is_committed(row.xmin) {
            return false;
        }

        if let Some(xmax) = row.xmax {
            if xmax == snapshot.tx_id {
                return false;
            }
            if snapshot.is_committed(xmax) {
                return false;
            }
        }

        true
    }
}

fn has_live_head<R>(versions: &[MvccRow<R>]) -> bool {
    versions.last().is_some_and(|head| head.xmax.is_none())
}

/// `BTreeMap::range` panics on a range whose start lies past its end.
fn is_inverted<B: RangeBounds<i64>>(range: &B) -> bool {
    match (range.start_bound(), range.end_bound()) {
        (Bound::Included(start), Bound::Included(end)) => start > end,
        (Bound::Included(start), Bound::Excluded(end))
        | (Bound::Excluded(start), Bound::Included(end))
        | (Bound::Excluded(start), Bound::Excluded(end)) => start >= end,
        _ => false,
    }
}

/// Iterator returned by [`Table::scan_ordinal_range`].
///
/// Walks the ordinal index lazily, so a caller that stops after a few rows
/// never touches the rest of the range.
pub struct OrdinalScan<'a, K, R> {
    table: &'a Table<K, R>,
    snapshot: Snapshot,
    ordinals: Option<btree_map::Range<'a, i64, BTreeSet<K>>>,
    current: Option<(i64, btree_set::Iter<'a, K>)>,
}

impl<'a, K, R> Iterator for OrdinalScan<'a, K, R>
where
    K: Ord + Clone,
    R: Ordinal + Clone,
{
    type Item = &'a R;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((ordinal, keys)) = self.current.as_mut() {
                for key in keys.by_ref() {
                    if let Some(row) = self.table.get(key, &self.snapshot)
                        && row.ordinal() == *ordinal
                    {
                        return Some(row);
                    }
                }
            }
            let (ordinal, keys) = self.ordinals.as_mut()?.next()?;
            self.current = Some((*ordinal, keys.iter()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    struct Row {
        seq: i64,
        label: &'static str,
    }

    impl Ordinal for Row {
        fn ordinal(&self) -> i64 {
            self.seq
        }
    }

    fn snapshot(tx_id: u64, active: &[u64]) -> Snapshot {
        Snapshot {
            tx_id,
            active: Arc::new(active.iter().copied().collect::<HashSet<_>>()),
            max_tx_id: 100,
        }
    }

    #[test]
    fn test_upsert_hides_previous_version() {
        let mut table: Table<&str, Row> = Table::new("t");
        table.write(&"a", Some(Row { seq: 1, label: "v1" }), 1);
        table.write(&"a", Some(Row { seq: 2, label: "v2" }), 2);

        let reader = snapshot(50, &[]);
        assert_eq!(table.get(&"a", &reader).unwrap().label, "v2");
        let scanned: Vec<i64> = table.scan_ordinal_range(.., &reader).map(|r| r.seq).collect();
        assert_eq!(scanned, vec![2]);
        assert_eq!(table.min_ordinal(&reader), Some(2));
        assert_eq!(table.max_ordinal(&reader), Some(2));
    }

    #[test]
    fn test_uncommitted_write_invisible_to_others() {
        let mut table: Table<&str, Row> = Table::new("t");
        table.write(&"a", Some(Row { seq: 1, label: "v1" }), 1);
        table.write(&"a", Some(Row { seq: 2, label: "v2" }), 5);

        let other = snapshot(6, &[5]);
        assert_eq!(table.get(&"a", &other).unwrap().label, "v1");
        let own = snapshot(5, &[5]);
        assert_eq!(table.get(&"a", &own).unwrap().label, "v2");
    }

    #[test]
    fn test_undo_restores_previous_head() {
        let mut table: Table<&str, Row> = Table::new("t");
        table.write(&"a", Some(Row { seq: 1, label: "v1" }), 1);
        let (previous, outcome) = table.write(&"a", Some(Row { seq: 2, label: "v2" }), 5);
        assert_eq!(previous.unwrap().seq, 1);

        table.undo(&"a", 5, outcome);
        let reader = snapshot(9, &[]);
        assert_eq!(table.get(&"a", &reader).unwrap().seq, 1);
        let scanned: Vec<i64> = table.scan_ordinal_range(.., &reader).map(|r| r.seq).collect();
        assert_eq!(scanned, vec![1]);
    }

    #[test]
    fn test_undo_of_delete() {
        let mut table: Table<&str, Row> = Table::new("t");
        table.write(&"a", Some(Row { seq: 1, label: "v1" }), 1);
        let (_, outcome) = table.write(&"a", None, 3);
        assert!(table.get(&"a", &snapshot(9, &[])).is_none());

        table.undo(&"a", 3, outcome);
        assert!(table.get(&"a", &snapshot(9, &[])).is_some());
    }

    #[test]
    fn test_vacuum_frees_dead_versions() {
        let mut table: Table<&str, Row> = Table::new("t");
        for seq in 1..=5 {
            table.write(&"a", Some(Row { seq, label: "v" }), seq as u64);
        }
        assert_eq!(table.version_count(), 5);

        let freed = table.vacuum(10);
        assert_eq!(freed, 4);
        assert_eq!(table.version_count(), 1);
        assert_eq!(table.min_ordinal(&snapshot(20, &[])), Some(5));
    }

    #[test]
    fn test_restore_replaces_chain() {
        let mut table: Table<&str, Row> = Table::new("t");
        table.write(&"a", Some(Row { seq: 1, label: "v1" }), 1);
        table.write(&"a", Some(Row { seq: 2, label: "v2" }), 2);
        table.restore("a", Some(Row { seq: 7, label: "restored" }));

        let reader = snapshot(50, &[]);
        assert_eq!(table.version_count(), 1);
        assert_eq!(table.min_ordinal(&reader), Some(7));

        table.restore("a", None);
        assert_eq!(table.count(&reader), 0);
        assert_eq!(table.max_ordinal(&reader), None);
    }

    #[test]
    fn test_range_scan_bounds() {
        let mut table: Table<i64, Row> = Table::new("t");
        for seq in 1..=10 {
            table.write(&seq, Some(Row { seq, label: "v" }), 1);
        }
        let reader = snapshot(50, &[]);
        let scanned: Vec<i64> = table
            .scan_ordinal_range(3..=5, &reader)
            .map(|r| r.seq)
            .collect();
        assert_eq!(scanned, vec![3, 4, 5]);
        assert_eq!(table.count(&reader), 10);
    }

    #[test]
    fn test_inverted_range_is_empty() {
        let mut table: Table<i64, Row> = Table::new("t");
        for seq in 1..=10 {
            table.write(&seq, Some(Row { seq, label: "v" }), 1);
        }
        let reader = snapshot(50, &[]);
        let (lower, upper) = (8, 3);
        assert_eq!(table.scan_ordinal_range(lower..=upper, &reader).count(), 0);
        assert_eq!(table.max_ordinal_in(lower..=upper, &reader), None);
        assert_eq!(table.max_ordinal_in(..=6, &reader), Some(6));
    }

    #[test]
    fn test_estimated_len_tracks_live_heads() {
        let mut table: Table<&str, Row> = Table::new("t");
        table.write(&"a", Some(Row { seq: 1, label: "v1" }), 1);
        table.write(&"a", Some(Row { seq: 2, label: "v2" }), 2);
        let (_, outcome) = table.write(&"b", Some(Row { seq: 3, label: "v1" }), 3);
        assert_eq!(table.estimated_len(), 2);

        table.undo(&"b", 3, outcome);
        assert_eq!(table.estimated_len(), 1);

        let (_, outcome) = table.write(&"a", None, 4);
        assert_eq!(table.estimated_len(), 0);
        table.undo(&"a", 4, outcome);
        assert_eq!(table.estimated_len(), 1);

        table.vacuum(10);
        assert_eq!(table.estimated_len(), 1);
        table.restore("c", Some(Row { seq: 9, label: "r" }));
        table.restore("a", None);
        assert_eq!(table.estimated_len(), 1);
        table.clear();
        assert_eq!(table.estimated_len(), 0);
    }

    #[test]
    fn test_small_prefix_of_large_table_is_cheap() {
        let mut table: Table<i64, Row> = Table::new("t");
        for seq in 1..=200_000 {
            table.write(&seq, Some(Row { seq, label: "v" }), 1);
        }
        let reader = snapshot(50, &[]);

        let started = std::time::Instant::now();
        for _ in 0..1_000 {
            let first: Vec<i64> = table
                .scan_ordinal_range(.., &reader)
                .take(3)
                .map(|r| r.seq)
                .collect();
            assert_eq!(first, vec![1, 2, 3]);
            assert_eq!(table.min_ordinal(&reader), Some(1));
            assert_eq!(table.estimated_len(), 200_000);
        }
        // Materializing the index on every call would take far longer.
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
    }
}
