use std::collections::BTreeMap;

use tracing::{debug, info, warn};

/// Non-fatal reasons to drop an image or a single detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SkipReason {
    ImageMissing,
    ImageUndecodable,
    NoCategory,
    MultipleCategories,
    ExcludedCategory,
    EmptyCrop,
}

impl SkipReason {
    pub fn describe(&self) -> &'static str {
        match self {
            SkipReason::ImageMissing => "image file not found",
            SkipReason::ImageUndecodable => "image could not be decoded",
            SkipReason::NoCategory => "image has no ground-truth category",
            SkipReason::MultipleCategories => "image has more than one ground-truth category",
            SkipReason::ExcludedCategory => "category is excluded",
            SkipReason::EmptyCrop => "crop box is empty after clamping",
        }
    }
}

/// Counts skips; warns on the first occurrence of each reason and drops to
/// debug level afterwards.
#[derive(Debug, Default)]
pub struct SkipLog {
    counts: BTreeMap<SkipReason, usize>,
}

impl SkipLog {
    pub fn record(&mut self, reason: SkipReason, subject: &str) {
        let n = self.counts.entry(reason).or_insert(0);
        *n += 1;
        if *n == 1 {
            warn!("skip: {subject}: {} (further occurrences logged at debug level)", reason.describe());
        } else {
            debug!("skip: {subject}: {}", reason.describe());
        }
    }

    pub fn count(&self, reason: SkipReason) -> usize {
        self.counts.get(&reason).copied().unwrap_or(0)
    }

    pub fn counts(&self) -> &BTreeMap<SkipReason, usize> {
        &self.counts
    }

    pub fn log_summary(&self) {
        for (reason, n) in &self.counts {
            info!("skip summary: {n} x {}", reason.describe());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_per_reason() {
        let mut log = SkipLog::default();
        log.record(SkipReason::ImageMissing, "a.jpg");
        log.record(SkipReason::ImageMissing, "b.jpg");
        log.record(SkipReason::EmptyCrop, "c.jpg#0");
        assert_eq!(log.count(SkipReason::ImageMissing), 2);
        assert_eq!(log.count(SkipReason::EmptyCrop), 1);
        assert_eq!(log.count(SkipReason::ExcludedCategory), 0);
        assert_eq!(log.counts().len(), 2);
    }
}
