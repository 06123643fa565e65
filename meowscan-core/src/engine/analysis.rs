//! The pure half of a tick: segment samples → features → best template.
//!
//! `Analyzer` holds only shared read-only state, so it can run on any thread;
//! outcomes are handed back to `DetectionEngine::complete`, which owns every
//! state transition.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::features::{FeatureExtractor, FeatureVector};
use crate::library::TemplateLibrary;
use crate::matcher::{MatchResult, Matcher};
use crate::segment::Segment;

/// A finalized segment with its samples copied out of the buffer.
#[derive(Debug, Clone)]
pub struct AnalysisJob {
    /// Session generation the segment belongs to.
    pub generation: u64,
    pub segment: Segment,
    pub samples: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct Analysis {
    pub features: FeatureVector,
    pub matched: MatchResult,
}

#[derive(Debug)]
pub struct AnalysisOutcome {
    pub generation: u64,
    pub segment: Segment,
    pub result: Result<Analysis>,
    pub elapsed: Duration,
}

/// Extractor + matcher pair shared by the engine and its workers.
#[derive(Debug, Clone)]
pub struct Analyzer {
    extractor: Arc<FeatureExtractor>,
    matcher: Matcher,
}

impl Analyzer {
    pub fn new(extractor: Arc<FeatureExtractor>, library: Arc<TemplateLibrary>) -> Self {
        Self {
            extractor,
            matcher: Matcher::new(library),
        }
    }

    pub fn analyze(&self, job: AnalysisJob) -> AnalysisOutcome {
        let started = Instant::now();
        let result = self.extractor.extract(&job.samples).and_then(|features| {
            let matched = self.matcher.best_match(&features)?;
            Ok(Analysis { features, matched })
        });
        AnalysisOutcome {
            generation: job.generation,
            segment: job.segment,
            result,
            elapsed: started.elapsed(),
        }
    }
}
