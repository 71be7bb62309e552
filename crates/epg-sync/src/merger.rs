use std::collections::{BTreeMap, HashMap};

use chrono::{NaiveDate, NaiveDateTime};
use epg_core::{parse_date_label, record_count, DayBucket, ProgramRecord, TimeResolver};
use serde::{Deserialize, Serialize};

use crate::analyzer::CoveragePolicy;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub existing_records: usize,
    pub incoming_records: usize,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub unkeyed: usize,
    pub merged_records: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub buckets: Vec<DayBucket>,
    pub stats: MergeStats,
}

/// A record lifted out of its bucket, with the bucket it came from.
#[derive(Debug, Clone)]
struct Tagged {
    record: ProgramRecord,
    source_date_label: String,
    source_title: String,
}

fn flatten(buckets: Vec<DayBucket>) -> impl Iterator<Item = Tagged> {
    buckets.into_iter().flat_map(|bucket| {
        let DayBucket {
            date_label,
            title,
            records,
            ..
        } = bucket;
        records.into_iter().map(move |record| Tagged {
            record,
            source_date_label: date_label.clone(),
            source_title: title.clone(),
        })
    })
}

#[derive(Debug)]
struct Entry {
    key: Option<String>,
    start: Option<NaiveDateTime>,
    item: Tagged,
}

impl Entry {
    fn sort_key(&self) -> (bool, Option<NaiveDateTime>, &str) {
        (self.start.is_none(), self.start, self.key.as_deref().unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Absorbed {
    Inserted,
    Replaced,
    Kept,
    Unkeyed,
    Duplicate,
}

#[derive(Debug, Default)]
struct RecordIndex {
    entries: Vec<Entry>,
    by_key: HashMap<String, usize>,
}

impl RecordIndex {
    fn absorb(&mut self, item: Tagged, resolver: &TimeResolver) -> Absorbed {
        let start = resolver.resolve_start(&item.record);
        let Some(key) = item.record.identity_key(resolver) else {
            let seen = self
                .entries
                .iter()
                .any(|e| e.key.is_none() && e.item.record == item.record);
            if seen {
                return Absorbed::Duplicate;
            }
            self.entries.push(Entry {
                key: None,
                start,
                item,
            });
            return Absorbed::Unkeyed;
        };

        match self.by_key.get(&key) {
            Some(&slot) => {
                let current = &mut self.entries[slot];
                if item.record.completeness() > current.item.record.completeness() {
                    current.item = item;
                    current.start = start;
                    Absorbed::Replaced
                } else {
                    Absorbed::Kept
                }
            }
            None => {
                self.by_key.insert(key.clone(), self.entries.len());
                self.entries.push(Entry {
                    key: Some(key),
                    start,
                    item,
                });
                Absorbed::Inserted
            }
        }
    }
}

/// Deduplicating, pruning merge of an incoming batch into the existing store.
#[derive(Debug, Clone, Copy)]
pub struct Merger {
    policy: CoveragePolicy,
    resolver: TimeResolver,
}

impl Merger {
    pub fn new(policy: CoveragePolicy, resolver: TimeResolver) -> Self {
        Self { policy, resolver }
    }

    pub fn merge(
        &self,
        existing: Vec<DayBucket>,
        incoming: Vec<DayBucket>,
        now: NaiveDateTime,
    ) -> MergeOutcome {
        let mut stats = MergeStats {
            existing_records: record_count(&existing),
            incoming_records: record_count(&incoming),
            ..MergeStats::default()
        };

        let mut index = RecordIndex::default();
        for item in flatten(existing) {
            index.absorb(item, &self.resolver);
        }
        for item in flatten(incoming) {
            match index.absorb(item, &self.resolver) {
                Absorbed::Inserted => stats.added += 1,
                Absorbed::Replaced => stats.updated += 1,
                Absorbed::Kept | Absorbed::Unkeyed | Absorbed::Duplicate => {}
            }
        }

        let cutoff = self.policy.retention_cutoff(now);
        let mut entries = index.entries;
        entries.retain(|entry| match entry.start {
            Some(start) if start.date() < cutoff => {
                stats.removed += 1;
                false
            }
            _ => true,
        });

        stats.unkeyed = entries.iter().filter(|e| e.key.is_none()).count();
        stats.merged_records = entries.len();

        MergeOutcome {
            buckets: regroup(entries, now.date()),
            stats,
        }
    }
}

/// Dated buckets ascending, then buckets whose label is not a date.
fn regroup(entries: Vec<Entry>, today: NaiveDate) -> Vec<DayBucket> {
    let mut dated: BTreeMap<NaiveDate, Vec<Entry>> = BTreeMap::new();
    let mut undated: Vec<(String, String, Vec<Entry>)> = Vec::new();

    for entry in entries {
        let day = entry
            .start
            .map(|start| start.date())
            .or_else(|| parse_date_label(&entry.item.source_date_label));
        match day {
            Some(day) => dated.entry(day).or_default().push(entry),
            None => {
                let label = &entry.item.source_date_label;
                match undated.iter_mut().find(|(l, _, _)| l == label) {
                    Some((_, _, group)) => group.push(entry),
                    None => undated.push((
                        label.clone(),
                        entry.item.source_title.clone(),
                        vec![entry],
                    )),
                }
            }
        }
    }

    let mut buckets = Vec::with_capacity(dated.len() + undated.len());
    for (day, group) in dated {
        buckets.push(DayBucket::for_date(day, into_sorted_records(group), day == today));
    }
    for (date_label, title, group) in undated {
        buckets.push(DayBucket {
            date_label,
            title,
            records: into_sorted_records(group),
            is_current: false,
        });
    }
    buckets
}

fn into_sorted_records(mut group: Vec<Entry>) -> Vec<ProgramRecord> {
    group.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    group.into_iter().map(|entry| entry.item.record).collect()
}
