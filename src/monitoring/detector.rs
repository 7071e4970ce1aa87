use std::collections::{HashMap, HashSet};

use super::database::HistoryRecord;
use crate::listing::{ChangeKind, ClassifiedListing, Listing};

/// Read-only view of the history the detector classifies against.
pub trait HistoryLookup {
    fn lookup(&self, identity_key: &str) -> Option<&HistoryRecord>;
}

impl HistoryLookup for HashMap<String, HistoryRecord> {
    fn lookup(&self, identity_key: &str) -> Option<&HistoryRecord> {
        self.get(identity_key)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    pub entries: Vec<ClassifiedListing>,
    /// Fetch-level duplicates dropped before classification.
    pub duplicates: usize,
}

impl Classification {
    pub fn count(&self, kind: ChangeKind) -> usize {
        self.entries.iter().filter(|e| e.kind == kind).count()
    }

    /// NEW and UPDATED entries, in fetch order.
    pub fn notifiable(&self) -> impl Iterator<Item = &ClassifiedListing> {
        self.entries.iter().filter(|e| e.kind.is_notifiable())
    }
}

/// Hash-based change detection. Pure: no I/O, no clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChangeDetector;

impl ChangeDetector {
    pub fn new() -> Self {
        Self
    }

    /// Drops repeated identity keys, keeping the first occurrence.
    pub fn collapse_duplicates(current: Vec<Listing>) -> (Vec<Listing>, usize) {
        let mut seen = HashSet::with_capacity(current.len());
        let before = current.len();
        let unique: Vec<Listing> = current
            .into_iter()
            .filter(|l| seen.insert(l.identity_key.clone()))
            .collect();
        let dropped = before - unique.len();
        (unique, dropped)
    }

    pub fn classify_one(listing: &Listing, lookup: &impl HistoryLookup) -> ChangeKind {
        match lookup.lookup(&listing.identity_key) {
            None => ChangeKind::New,
            Some(record) if record.content_hash != listing.content_hash => ChangeKind::Updated,
            // the notified flag plays no part here
            Some(_) => ChangeKind::Unchanged,
        }
    }

    pub fn classify(&self, current: Vec<Listing>, lookup: &impl HistoryLookup) -> Classification {
        let (unique, duplicates) = Self::collapse_duplicates(current);
        if duplicates > 0 {
            tracing::debug!("Collapsed {} duplicate listings from fetch", duplicates);
        }

        let entries = unique
            .into_iter()
            .map(|listing| {
                let kind = Self::classify_one(&listing, lookup);
                ClassifiedListing::new(listing, kind)
            })
            .collect();

        Classification { entries, duplicates }
    }
}
