use serde::Serialize;
use tracing::debug;

use crate::deadline::Deadline;
use crate::error::ErrorKind;
use crate::features::FeatureSet;
use crate::matcher::{MatchScore, Matcher};
use crate::store::Template;

/// Outcome of one verification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Accept {
        template: String,
        index: usize,
        score: MatchScore,
    },
    Reject {
        best: Option<MatchScore>,
    },
    /// No decision could be reached. Never grants access.
    Inconclusive { kind: ErrorKind },
}

impl Verdict {
    pub fn inconclusive(kind: ErrorKind) -> Self {
        Verdict::Inconclusive { kind }
    }

    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Accept { .. } => "accept",
            Verdict::Reject { .. } => "reject",
            Verdict::Inconclusive { .. } => "inconclusive",
        }
    }

    /// Best score seen, whatever the outcome.
    pub fn score(&self) -> Option<f64> {
        match self {
            Verdict::Accept { score, .. } => Some(score.score),
            Verdict::Reject { best } => best.map(|s| s.score),
            Verdict::Inconclusive { .. } => None,
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Verdict::Inconclusive { kind } => Some(*kind),
            _ => None,
        }
    }
}

/// Turns match scores into a verdict.
///
/// Every template is scored; the maximum wins, ties going to the lowest
/// template index. Accept requires the winner to reach the threshold with
/// at least one paired minutia, so a zero threshold never admits an empty
/// match.
#[derive(Debug, Clone)]
pub struct DecisionEngine {
    matcher: Matcher,
    threshold: f64,
    max_comparisons: usize,
}

impl DecisionEngine {
    pub fn new(matcher: Matcher, threshold: f64, max_comparisons: usize) -> Self {
        Self {
            matcher,
            threshold,
            max_comparisons: max_comparisons.max(1),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn decide(
        &self,
        candidate: &FeatureSet,
        templates: &[Template],
        deadline: &Deadline,
    ) -> Verdict {
        if templates.is_empty() {
            return Verdict::inconclusive(ErrorKind::NotEnrolled);
        }

        let mut scores = Vec::with_capacity(templates.len().min(self.max_comparisons));
        for template in templates.iter().take(self.max_comparisons) {
            match self.matcher.compare(candidate, template, deadline) {
                Ok(score) => {
                    debug!(
                        template = template.id(),
                        score = score.score,
                        matched = score.matched,
                        "compared template"
                    );
                    scores.push(score);
                }
                Err(_) => return Verdict::inconclusive(ErrorKind::Timeout),
            }
        }

        self.verdict_from_scores(templates, &scores)
    }

    /// Aggregation step on its own: `scores[i]` belongs to `templates[i]`.
    pub fn verdict_from_scores(&self, templates: &[Template], scores: &[MatchScore]) -> Verdict {
        let mut best: Option<(usize, MatchScore)> = None;
        for (index, score) in scores.iter().enumerate() {
            if !score.score.is_finite() {
                continue;
            }
            // strict comparison keeps the lowest index on ties
            if best.map_or(true, |(_, b)| score.score > b.score) {
                best = Some((index, *score));
            }
        }

        match best {
            Some((index, score))
                if score.score >= self.threshold
                    && score.matched > 0
                    && index < templates.len() =>
            {
                Verdict::Accept {
                    template: templates[index].id().to_owned(),
                    index,
                    score,
                }
            }
            Some((_, score)) => Verdict::Reject { best: Some(score) },
            None => Verdict::Reject { best: None },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Minutia, MinutiaKind};

    fn score(value: f64) -> MatchScore {
        MatchScore {
            score: value,
            matched: 20,
            candidate_points: 20,
            template_points: 20,
            rotation: 0.0,
            translation: (0.0, 0.0),
        }
    }

    fn templates(count: usize) -> Vec<Template> {
        (0..count)
            .map(|i| {
                let set = FeatureSet::from_points(
                    vec![Minutia::new(0.0, 0.0, 0.0, MinutiaKind::Ending, 1.0)],
                    0.0,
                    1.0,
                );
                Template::new(format!("0-{i:03}"), 0, set)
            })
            .collect()
    }

    fn engine(threshold: f64) -> DecisionEngine {
        DecisionEngine::new(Matcher::default(), threshold, 10)
    }

    #[test]
    fn highest_score_wins() {
        let scores = [score(0.4), score(0.9), score(0.7)];
        let verdict = engine(0.5).verdict_from_scores(&templates(3), &scores);
        assert!(matches!(verdict, Verdict::Accept { index: 1, .. }));
    }

    #[test]
    fn ties_go_to_lowest_index() {
        let scores = [score(0.3), score(0.8), score(0.8)];
        let verdict = engine(0.5).verdict_from_scores(&templates(3), &scores);
        match verdict {
            Verdict::Accept { index, template, .. } => {
                assert_eq!(index, 1);
                assert_eq!(template, "0-001");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn threshold_is_inclusive() {
        let t = templates(1);
        assert!(engine(0.75).verdict_from_scores(&t, &[score(0.75)]).is_accept());
        let below = engine(0.75).verdict_from_scores(&t, &[score(0.75 - 1e-9)]);
        assert_eq!(below.label(), "reject");
    }

    #[test]
    fn nan_never_accepts() {
        let verdict = engine(0.0).verdict_from_scores(&templates(1), &[score(f64::NAN)]);
        assert_eq!(verdict, Verdict::Reject { best: None });
    }

    #[test]
    fn zero_threshold_still_needs_a_paired_point() {
        let empty = MatchScore {
            matched: 0,
            ..score(0.0)
        };
        let verdict = engine(0.0).verdict_from_scores(&templates(1), &[empty]);
        assert_eq!(verdict, Verdict::Reject { best: Some(empty) });

        let one = MatchScore {
            matched: 1,
            ..score(0.0)
        };
        assert!(engine(0.0).verdict_from_scores(&templates(1), &[one]).is_accept());
    }

    #[test]
    fn no_templates_is_inconclusive() {
        let candidate = templates(1)[0].features().clone();
        let verdict = engine(0.5).decide(&candidate, &[], &Deadline::unbounded());
        assert_eq!(verdict.kind(), Some(ErrorKind::NotEnrolled));
    }

    #[test]
    fn timeout_is_inconclusive() {
        let t = templates(2);
        let verdict = engine(0.5).decide(
            t[0].features(),
            &t,
            &Deadline::after(std::time::Duration::ZERO),
        );
        assert_eq!(verdict.kind(), Some(ErrorKind::Timeout));
    }
}
