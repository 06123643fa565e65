//! Nearest-template classification by cosine similarity.
//!
//! Only the cepstral coefficients take part in scoring. Spectrum and pitch
//! travel with the `FeatureVector` but are not weighted here.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{MeowError, Result};
use crate::features::FeatureVector;
use crate::library::TemplateLibrary;

/// `dot(a, b) / (‖a‖·‖b‖)` in `[-1, 1]`.
///
/// Zero norm on either side, mismatched lengths, or a non-finite result
/// all give 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom == 0.0 || !denom.is_finite() {
        return 0.0;
    }
    let sim = (dot / denom).clamp(-1.0, 1.0);
    if sim.is_finite() {
        sim as f32
    } else {
        0.0
    }
}

/// One template's score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedMatch {
    pub label: String,
    pub template_name: String,
    pub similarity: f32,
}

/// Best template for one feature vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    /// Id of the winning template.
    pub label: String,
    pub category: String,
    pub template_name: String,
    /// Raw cosine similarity in `[-1, 1]`.
    pub similarity: f32,
    /// Similarity clamped to `[0, 1]` for reporting.
    pub score: f32,
    /// Every template, best first; equal scores keep load order.
    pub ranked: Vec<RankedMatch>,
}

/// Scores vectors against a shared library. Never applies a threshold.
#[derive(Debug, Clone)]
pub struct Matcher {
    library: Arc<TemplateLibrary>,
}

impl Matcher {
    pub fn new(library: Arc<TemplateLibrary>) -> Self {
        Self { library }
    }

    pub fn library(&self) -> &Arc<TemplateLibrary> {
        &self.library
    }

    pub fn best_match(&self, features: &FeatureVector) -> Result<MatchResult> {
        let templates = self.library.templates();

        let mut best: Option<(usize, f32)> = None;
        let mut ranked: Vec<RankedMatch> = Vec::with_capacity(templates.len());
        for (i, t) in templates.iter().enumerate() {
            let sim = cosine_similarity(&features.cepstral, &t.features.cepstral);
            // Strictly greater: the first of equal scores stays.
            if best.map_or(true, |(_, s)| sim > s) {
                best = Some((i, sim));
            }
            ranked.push(RankedMatch {
                label: t.id.clone(),
                template_name: t.name.clone(),
                similarity: sim,
            });
        }

        let Some((index, similarity)) = best else {
            return Err(MeowError::Processing("template library is empty".into()));
        };
        // Stable sort keeps load order among ties.
        ranked.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));

        let winner = &templates[index];
        Ok(MatchResult {
            label: winner.id.clone(),
            category: winner.category.clone(),
            template_name: winner.name.clone(),
            similarity,
            score: similarity.clamp(0.0, 1.0),
            ranked,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::Template;
    use approx::assert_relative_eq;

    fn fv(cepstral: Vec<f32>) -> FeatureVector {
        FeatureVector {
            cepstral,
            spectrum: vec![],
            pitch_hz: 0.0,
            descriptors: Default::default(),
        }
    }

    fn matcher(entries: &[(&str, Vec<f32>)]) -> Matcher {
        let templates = entries
            .iter()
            .enumerate()
            .map(|(i, (id, c))| Template::new(*id, format!("t{i}"), fv(c.clone())))
            .collect();
        Matcher::new(Arc::new(
            TemplateLibrary::from_templates(templates, 44_100).unwrap(),
        ))
    }

    #[test]
    fn self_similarity_is_one() {
        let v = [0.3, -1.2, 4.0, 0.01, -0.7];
        assert_relative_eq!(cosine_similarity(&v, &v), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn opposite_and_orthogonal() {
        assert_relative_eq!(cosine_similarity(&[1.0, 2.0], &[-1.0, -2.0]), -1.0, epsilon = 1e-6);
        assert_relative_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 3.0]), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn degenerate_inputs_are_zero_not_nan() {
        assert_eq!(cosine_similarity(&[0.0; 4], &[1.0, 2.0, 3.0, 4.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0; 4], &[0.0; 4]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0, 2.0, 3.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[f32::NAN, 1.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn picks_most_similar_and_ranks_all() {
        let m = matcher(&[
            ("angry_hiss", vec![-1.0, 0.0, 0.0]),
            ("happy_purr", vec![1.0, 0.1, 0.0]),
            ("hungry_chirp", vec![0.0, 1.0, 0.0]),
        ]);
        let r = m.best_match(&fv(vec![1.0, 0.0, 0.0])).unwrap();
        assert_eq!(r.label, "happy_purr");
        assert_eq!(r.category, "happy");
        assert!(r.similarity > 0.99);
        let order: Vec<&str> = r.ranked.iter().map(|x| x.label.as_str()).collect();
        assert_eq!(order, vec!["happy_purr", "hungry_chirp", "angry_hiss"]);
    }

    #[test]
    fn ties_go_to_first_loaded() {
        let m = matcher(&[
            ("first", vec![1.0, 1.0]),
            ("second", vec![2.0, 2.0]),
        ]);
        let r = m.best_match(&fv(vec![3.0, 3.0])).unwrap();
        assert_eq!(r.label, "first");
        assert_eq!(r.ranked[0].label, "first");
        assert_eq!(r.ranked[1].label, "second");
    }

    #[test]
    fn negative_similarity_reports_zero_score() {
        let m = matcher(&[("only", vec![1.0, 0.0])]);
        let r = m.best_match(&fv(vec![-1.0, 0.0])).unwrap();
        assert_relative_eq!(r.similarity, -1.0, epsilon = 1e-6);
        assert_eq!(r.score, 0.0);
    }

    #[test]
    fn zero_query_never_nan() {
        let m = matcher(&[("a", vec![1.0, 0.0]), ("b", vec![0.0, 1.0])]);
        let r = m.best_match(&fv(vec![0.0, 0.0])).unwrap();
        assert_eq!(r.similarity, 0.0);
        assert_eq!(r.label, "a");
        assert!(r.ranked.iter().all(|x| !x.similarity.is_nan()));
    }
}
