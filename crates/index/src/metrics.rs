use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Counters for one indexing run, updated from concurrent chunk tasks.
#[derive(Default)]
pub struct IndexMetrics {
    documents: AtomicUsize,
    processed: AtomicUsize,
    skipped: AtomicUsize,
    chunks: AtomicUsize,
    extraction_calls: AtomicUsize,
    cache_hits: AtomicUsize,
    entities_written: AtomicUsize,
    relations_written: AtomicUsize,

    // Timing (in microseconds)
    total_extract_time_us: AtomicU64,
}

impl IndexMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_scan(&self, documents: usize) {
        self.documents.fetch_add(documents, Ordering::Relaxed);
    }

    pub fn record_document(&self, skipped: bool) {
        if skipped {
            self.skipped.fetch_add(1, Ordering::Relaxed);
        } else {
            self.processed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_chunk(&self, entities: usize, relations: usize) {
        self.chunks.fetch_add(1, Ordering::Relaxed);
        self.entities_written.fetch_add(entities, Ordering::Relaxed);
        self.relations_written.fetch_add(relations, Ordering::Relaxed);
    }

    pub fn record_extract(&self, duration: Duration) {
        self.extraction_calls.fetch_add(1, Ordering::Relaxed);
        self.total_extract_time_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IndexSummary {
        let extraction_calls = self.extraction_calls.load(Ordering::Relaxed);
        let total_us = self.total_extract_time_us.load(Ordering::Relaxed) as f64;

        IndexSummary {
            documents: self.documents.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            chunks: self.chunks.load(Ordering::Relaxed),
            extraction_calls,
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            entities_written: self.entities_written.load(Ordering::Relaxed),
            relations_written: self.relations_written.load(Ordering::Relaxed),
            avg_extract_time_ms: if extraction_calls > 0 {
                total_us / extraction_calls as f64 / 1000.0
            } else {
                0.0
            },
        }
    }
}

/// Outcome of one `index` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexSummary {
    pub documents: usize,
    pub processed: usize,
    pub skipped: usize,
    pub chunks: usize,
    pub extraction_calls: usize,
    pub cache_hits: usize,
    pub entities_written: usize,
    pub relations_written: usize,
    pub avg_extract_time_ms: f64,
}

pub struct TimedOperation {
    start: Instant,
}

impl TimedOperation {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
