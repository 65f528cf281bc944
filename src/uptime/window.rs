//! Fixed-capacity ring of recent buckets at one resolution.

use crate::db::{Bucket, Resolution};

use super::bucket::window_end;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct SlidingWindow {
    resolution: Resolution,
    capacity: usize,
    /// Ordered by bucket start, oldest first.
    entries: VecDeque<Bucket>,
    /// The window holds every bucket starting at or after this instant.
    covered_from: Option<DateTime<Utc>>,
}

impl SlidingWindow {
    pub fn new(resolution: Resolution, capacity: usize) -> Self {
        Self {
            resolution,
            capacity: capacity.max(1),
            entries: VecDeque::new(),
            covered_from: None,
        }
    }

    /// Load buckets read from storage for everything since `covered_from`.
    pub fn hydrate(&mut self, covered_from: DateTime<Utc>, buckets: Vec<Bucket>) {
        self.covered_from = Some(covered_from);
        for bucket in buckets {
            self.upsert(bucket);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn covered_from(&self) -> Option<DateTime<Utc>> {
        self.covered_from
    }

    /// Insert a bucket, replacing the entry with the same start.
    pub fn upsert(&mut self, bucket: Bucket) {
        match self.entries.back().map(|b| b.start) {
            Some(last) if last == bucket.start => {
                if let Some(slot) = self.entries.back_mut() {
                    *slot = bucket;
                }
                return;
            }
            Some(last) if last > bucket.start => {
                match self.entries.binary_search_by_key(&bucket.start, |b| b.start) {
                    Ok(idx) => self.entries[idx] = bucket,
                    Err(0) if self.entries.len() >= self.capacity => return,
                    Err(idx) => self.entries.insert(idx, bucket),
                }
            }
            _ => self.entries.push_back(bucket),
        }

        while self.entries.len() > self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                let next = window_end(evicted.start, self.resolution);
                if self.covered_from.map_or(true, |c| c < next) {
                    self.covered_from = Some(next);
                }
            }
        }
    }

    /// Buckets with `start <= bucket.start < end`, oldest first.
    pub fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Bucket> {
        self.entries
            .iter()
            .filter(|b| b.start >= start && b.start < end)
            .cloned()
            .collect()
    }
}
