//! Tracks delivered and processed positions per source and yields the highest
//! contiguous processed position that is safe to commit.

use crate::types::RecordSource;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default)]
struct SourceTrack {
    /// Delivered to the caller, not yet processed.
    outstanding: BTreeSet<i64>,
    /// Processed, above the last commit.
    processed: BTreeSet<i64>,
    committed: Option<i64>,
}

impl SourceTrack {
    /// Highest processed position with nothing outstanding below it.
    fn watermark(&self) -> Option<i64> {
        let floor = self.outstanding.first().copied();
        let candidate = match floor {
            Some(floor) => self.processed.range(..floor).next_back().copied(),
            None => self.processed.last().copied(),
        }?;
        match self.committed {
            Some(done) if done >= candidate => None,
            _ => Some(candidate),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct CommitTracker {
    generation: u64,
    sources: HashMap<RecordSource, SourceTrack>,
}

impl CommitTracker {
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Forget everything and accept only records of `generation` from now on.
    /// For queues the generation is the connection session.
    pub(crate) fn reset(&mut self, generation: u64) {
        self.generation = generation;
        self.sources.clear();
    }

    pub(crate) fn delivered(&mut self, source: &RecordSource, position: i64) {
        self.sources
            .entry(source.clone())
            .or_default()
            .outstanding
            .insert(position);
    }

    /// Mark a delivered record processed. Returns false for records this tracker
    /// never delivered, including those of an older generation.
    pub(crate) fn processed(&mut self, source: &RecordSource, position: i64, generation: u64) -> bool {
        if generation != self.generation {
            return false;
        }
        let Some(track) = self.sources.get_mut(source) else {
            return false;
        };
        if !track.outstanding.remove(&position) {
            return false;
        }
        track.processed.insert(position);
        true
    }

    /// Positions ready to commit, one per source.
    pub(crate) fn ready(&self) -> Vec<(RecordSource, i64)> {
        self.sources
            .iter()
            .filter_map(|(source, track)| track.watermark().map(|w| (source.clone(), w)))
            .collect()
    }

    pub(crate) fn committed(&mut self, source: &RecordSource, position: i64) {
        if let Some(track) = self.sources.get_mut(source) {
            track.processed.retain(|&p| p > position);
            track.committed = Some(track.committed.map_or(position, |c| c.max(position)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p0() -> RecordSource {
        RecordSource::Partition {
            topic: "t".into(),
            partition: 0,
        }
    }

    #[test]
    fn watermark_stops_at_first_gap() {
        let mut t = CommitTracker::default();
        for pos in 0..4 {
            t.delivered(&p0(), pos);
        }
        assert!(t.processed(&p0(), 0, 0));
        assert!(t.processed(&p0(), 2, 0));
        assert_eq!(t.ready(), vec![(p0(), 0)]);

        assert!(t.processed(&p0(), 1, 0));
        assert_eq!(t.ready(), vec![(p0(), 2)]);

        t.committed(&p0(), 2);
        assert!(t.ready().is_empty());
    }

    #[test]
    fn nothing_ready_until_first_is_processed() {
        let mut t = CommitTracker::default();
        t.delivered(&p0(), 10);
        t.delivered(&p0(), 11);
        t.processed(&p0(), 11, 0);
        assert!(t.ready().is_empty());
    }

    #[test]
    fn stale_generation_is_ignored() {
        let mut t = CommitTracker::default();
        t.reset(3);
        t.delivered(&p0(), 5);
        assert!(!t.processed(&p0(), 5, 2));
        assert!(!t.processed(&p0(), 6, 3));
        assert!(t.processed(&p0(), 5, 3));
        t.reset(4);
        assert!(t.ready().is_empty());
    }

    #[test]
    fn queue_tags_track_independently() {
        let mut t = CommitTracker::default();
        let q = RecordSource::Queue("weather_queue".into());
        t.delivered(&q, 1);
        t.delivered(&p0(), 7);
        t.processed(&q, 1, 0);
        assert_eq!(t.ready(), vec![(q, 1)]);
    }

    #[test]
    fn new_session_drops_tags_of_the_old_one() {
        let mut t = CommitTracker::default();
        let q = RecordSource::Queue("weather_queue".into());
        t.reset(1);
        t.delivered(&q, 1);
        t.delivered(&q, 2);
        assert!(t.processed(&q, 1, 1));

        // tags restart at 1 on the new session
        t.reset(2);
        t.delivered(&q, 1);
        t.delivered(&q, 2);
        assert!(!t.processed(&q, 2, 1));
        assert!(t.ready().is_empty());
        assert!(t.processed(&q, 1, 2));
        assert_eq!(t.ready(), vec![(q, 1)]);
        assert_eq!(t.generation(), 2);
    }
}
