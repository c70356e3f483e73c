//! Critical/safe distribution checks.
//!
//! Critical status needs explicit evidence: a why-needed text that names a
//! graded deliverable. Everything else defaults to safe. When the critical
//! share of a large enough gap list leaves the configured band, a
//! [`Reclassifier`] is asked for per-gap rationale; only rationale-backed
//! changes are applied. If the band still cannot be met, every gap carries an
//! override justification instead of a fabricated category.

use std::fmt::Write;
use std::future::Future;
use std::sync::Arc;

use lacuna_llm::{LlmProvider, Message};
use serde::Deserialize;

use crate::analysis::AnalysisEngine;
use crate::analysis::parser::{MAX_WHY_NEEDED_CHARS, cap, strip_fences};
use crate::assignment::names_artifact;
use crate::config::BalanceConfig;
use crate::error::{AnalysisError, Result};
use crate::gap::{Gap, GapCategory};

const SHARE_EPSILON: f64 = 1e-9;

/// A proposed category for one gap with its reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rationale {
    pub category: GapCategory,
    pub justification: String,
}

/// Source of per-gap category rationale.
pub trait Reclassifier: Send + Sync {
    /// One entry per gap, in order. `None` means no opinion.
    ///
    /// # Errors
    ///
    /// Returns an error when no rationale could be obtained.
    fn reclassify(
        &self,
        gaps: &[Gap],
        assignments: &[String],
    ) -> impl Future<Output = Result<Vec<Option<Rationale>>>> + Send;
}

/// Never proposes a change.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReclassifier;

impl Reclassifier for NoReclassifier {
    async fn reclassify(&self, gaps: &[Gap], _: &[String]) -> Result<Vec<Option<Rationale>>> {
        Ok(vec![None; gaps.len()])
    }
}

/// Asks the analysis model chain to justify each gap's category.
#[derive(Debug)]
pub struct LlmReclassifier<P> {
    engine: Arc<AnalysisEngine<P>>,
}

impl<P> LlmReclassifier<P> {
    #[must_use]
    pub fn new(engine: Arc<AnalysisEngine<P>>) -> Self {
        Self { engine }
    }
}

#[derive(Debug, Deserialize)]
struct Decision {
    index: usize,
    category: GapCategory,
    #[serde(default)]
    justification: String,
}

#[derive(Debug, Deserialize)]
struct Decisions {
    decisions: Vec<Decision>,
}

fn reclassify_messages(gaps: &[Gap], assignments: &[String]) -> Vec<Message> {
    let mut user = String::from(
        "Review the category of each study gap below. A gap is critical only when a specific \
assignment question or stated exam topic requires it; name that item in the justification. \
Otherwise it is safe.\n\n",
    );
    if !assignments.is_empty() {
        user.push_str("Assignment items:\n");
        for item in assignments {
            let _ = writeln!(user, "- {item}");
        }
        user.push('\n');
    }
    for (i, gap) in gaps.iter().enumerate() {
        let _ = writeln!(
            user,
            "{}. {} [{}]: {}",
            i + 1,
            gap.concept,
            gap.category,
            gap.why_needed
        );
    }
    user.push_str(
        "\nRespond with JSON only: {\"decisions\": [{\"index\": 1, \"category\": \"critical\" or \
\"safe\", \"justification\": \"...\"}]}",
    );
    vec![
        Message::system("You are an academic advisor reviewing study priorities."),
        Message::user(user),
    ]
}

fn parse_decisions(text: &str, count: usize) -> Option<Vec<Option<Rationale>>> {
    let body = strip_fences(text);
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    let parsed: Decisions = serde_json::from_str(body.get(start..=end)?).ok()?;
    let mut out = vec![None; count];
    for d in parsed.decisions {
        if let Some(slot) = d.index.checked_sub(1).and_then(|i| out.get_mut(i)) {
            *slot = Some(Rationale {
                category: d.category,
                justification: d.justification,
            });
        }
    }
    Some(out)
}

impl<P: LlmProvider> Reclassifier for LlmReclassifier<P> {
    async fn reclassify(
        &self,
        gaps: &[Gap],
        assignments: &[String],
    ) -> Result<Vec<Option<Rationale>>> {
        let reply = self
            .engine
            .complete(&reclassify_messages(gaps, assignments))
            .await
            .map_err(AnalysisError::from_llm)?;
        Ok(parse_decisions(&reply.text, gaps.len()).unwrap_or_else(|| {
            tracing::warn!(model = %reply.model, "reclassification response could not be parsed");
            vec![None; gaps.len()]
        }))
    }
}

/// Outcome of one validation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalanceReport {
    pub total: usize,
    pub critical: usize,
    /// Critical gaps without deliverable evidence, relabeled safe.
    pub defaulted_to_safe: usize,
    /// Relabels backed by reclassification rationale.
    pub reclassified: usize,
    /// The band could not be met and override justifications were attached.
    pub overridden: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BalanceValidator {
    config: BalanceConfig,
}

impl BalanceValidator {
    #[must_use]
    pub fn new(config: BalanceConfig) -> Self {
        Self { config }
    }

    /// Allowed critical count range for `total` gaps.
    #[must_use]
    pub fn band(&self, total: usize) -> (usize, usize) {
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        {
            let n = total as f64;
            let min = (n * self.config.min_critical_share - SHARE_EPSILON).ceil() as usize;
            let max = (n * self.config.max_critical_share + SHARE_EPSILON).floor() as usize;
            (min, max)
        }
    }

    /// Check and adjust categories in place. Explanations are never changed.
    pub async fn validate<R: Reclassifier>(
        &self,
        gaps: &mut [Gap],
        assignments: &[String],
        reclassifier: &R,
    ) -> BalanceReport {
        let mut report = BalanceReport {
            total: gaps.len(),
            ..BalanceReport::default()
        };

        for gap in gaps.iter_mut() {
            if gap.is_critical() && !names_artifact(&gap.why_needed) {
                tracing::debug!(gap_id = %gap.id, "critical gap without deliverable evidence, using safe");
                gap.category = GapCategory::Safe;
                report.defaulted_to_safe += 1;
            }
        }
        report.critical = count_critical(gaps);

        if gaps.len() < self.config.min_gaps {
            return report;
        }
        let (min, max) = self.band(gaps.len());
        if (min..=max).contains(&report.critical) {
            return report;
        }

        tracing::info!(
            critical = report.critical,
            total = gaps.len(),
            min,
            max,
            "critical share outside band"
        );
        if self.config.reclassify {
            match reclassifier.reclassify(gaps, assignments).await {
                Ok(rationale) => {
                    report.reclassified = apply_rationale(gaps, &rationale, min, max);
                    report.critical = count_critical(gaps);
                }
                Err(e) => tracing::warn!(error = %e, "reclassification failed"),
            }
        }

        if !(min..=max).contains(&report.critical) {
            tracing::warn!(
                critical = report.critical,
                total = gaps.len(),
                "critical share kept outside band, attaching overrides"
            );
            attach_overrides(gaps, report.critical, min, max);
            report.overridden = true;
        }
        report
    }
}

fn count_critical(gaps: &[Gap]) -> usize {
    gaps.iter().filter(|g| g.is_critical()).count()
}

/// Apply rationale-backed relabels in list order, only in the direction that
/// moves the critical count toward the band, and stop once inside it.
fn apply_rationale(gaps: &mut [Gap], rationale: &[Option<Rationale>], min: usize, max: usize) -> usize {
    let mut critical = count_critical(gaps);
    let mut changed = 0;
    for (gap, r) in gaps.iter_mut().zip(rationale) {
        let Some(r) = r else { continue };
        if critical > max && gap.is_critical() && r.category == GapCategory::Safe {
            gap.category = GapCategory::Safe;
            critical -= 1;
            changed += 1;
        } else if critical < min
            && !gap.is_critical()
            && r.category == GapCategory::Critical
            && names_artifact(&r.justification)
        {
            gap.category = GapCategory::Critical;
            gap.why_needed = cap(&r.justification, MAX_WHY_NEEDED_CHARS);
            critical += 1;
            changed += 1;
        }
        if (min..=max).contains(&critical) {
            break;
        }
    }
    changed
}

fn attach_overrides(gaps: &mut [Gap], critical: usize, min: usize, max: usize) {
    let total = gaps.len();
    for gap in gaps.iter_mut() {
        let reason = if gap.is_critical() {
            format!("kept critical because it is required by: {}", gap.why_needed)
        } else {
            "kept safe because no required deliverable names this concept".to_owned()
        };
        gap.override_justification = Some(format!(
            "{critical} of {total} gaps are critical, outside the expected {min} to {max}; {reason}"
        ));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use lacuna_llm::mock::MockProvider;
    use lacuna_llm::{BackoffPolicy, ModelChain};

    use super::*;
    use crate::config::AnalysisConfig;

    fn gap(n: usize, category: GapCategory, why: &str) -> Gap {
        Gap {
            id: format!("doc_gap_{n}"),
            concept: format!("Concept {n}"),
            category,
            explanation: format!("Explanation {n}."),
            why_needed: why.into(),
            estimated_time: None,
            supporting_context: None,
            page_references: Vec::new(),
            override_justification: None,
        }
    }

    fn evidenced(n: usize) -> Gap {
        gap(n, GapCategory::Critical, &format!("Assignment 1, Question {n} requires it."))
    }

    struct Scripted(Vec<Option<Rationale>>);

    impl Reclassifier for Scripted {
        async fn reclassify(&self, _: &[Gap], _: &[String]) -> Result<Vec<Option<Rationale>>> {
            Ok(self.0.clone())
        }
    }

    fn safe_because(reason: &str) -> Option<Rationale> {
        Some(Rationale {
            category: GapCategory::Safe,
            justification: reason.into(),
        })
    }

    #[test]
    fn band_scales_with_count() {
        let v = BalanceValidator::default();
        assert_eq!(v.band(5), (1, 3));
        assert_eq!(v.band(9), (2, 5));
        assert_eq!(v.band(10), (2, 6));
    }

    #[tokio::test]
    async fn ambiguous_critical_defaults_to_safe() {
        let mut gaps = vec![
            evidenced(1),
            gap(2, GapCategory::Critical, "Useful for general understanding."),
            gap(3, GapCategory::Safe, "Background."),
        ];
        let report = BalanceValidator::default()
            .validate(&mut gaps, &[], &NoReclassifier)
            .await;
        assert_eq!(report.defaulted_to_safe, 1);
        assert_eq!(report.critical, 1);
        assert_eq!(gaps[1].category, GapCategory::Safe);
        assert_eq!(gaps[1].explanation, "Explanation 2.");
        assert!(gaps.iter().all(|g| g.override_justification.is_none()));
    }

    #[tokio::test]
    async fn topical_wording_does_not_keep_a_gap_critical() {
        let mut gaps = vec![
            gap(1, GapCategory::Critical, "A fundamental problem in linear algebra."),
            gap(2, GapCategory::Critical, "Needed for the final step of most derivations."),
            gap(3, GapCategory::Critical, "Raises the question of convergence."),
        ];
        let report = BalanceValidator::default()
            .validate(&mut gaps, &[], &NoReclassifier)
            .await;
        assert_eq!(report.defaulted_to_safe, 3);
        assert!(gaps.iter().all(|g| !g.is_critical()));
    }

    #[tokio::test]
    async fn in_band_list_is_untouched() {
        let mut gaps: Vec<Gap> = (1..=6)
            .map(|n| if n <= 2 { evidenced(n) } else { gap(n, GapCategory::Safe, "Background.") })
            .collect();
        let before = gaps.clone();
        let report = BalanceValidator::default()
            .validate(&mut gaps, &[], &NoReclassifier)
            .await;
        assert_eq!(gaps, before);
        assert!(!report.overridden);
        assert_eq!(report.reclassified, 0);
    }

    #[tokio::test]
    async fn rationale_moves_only_enough_gaps() {
        let mut gaps: Vec<Gap> = (1..=6).map(evidenced).collect();
        let rationale = vec![
            None,
            None,
            safe_because("supplementary"),
            safe_because("supplementary"),
            safe_because("supplementary"),
            safe_because("supplementary"),
        ];
        let report = BalanceValidator::default()
            .validate(&mut gaps, &[], &Scripted(rationale))
            .await;
        assert_eq!(report.reclassified, 3);
        assert_eq!(report.critical, 3);
        assert!(!report.overridden);
        assert!(gaps[5].is_critical());
        assert_eq!(gaps[2].explanation, "Explanation 3.");
        assert!(gaps.iter().all(|g| g.override_justification.is_none()));
    }

    #[tokio::test]
    async fn unmet_band_attaches_overrides_instead_of_relabeling() {
        let mut gaps: Vec<Gap> = (1..=6).map(evidenced).collect();
        let report = BalanceValidator::default()
            .validate(&mut gaps, &[], &NoReclassifier)
            .await;
        assert!(report.overridden);
        assert_eq!(report.critical, 6);
        assert!(gaps.iter().all(Gap::is_critical));
        assert!(gaps.iter().all(|g| g.override_justification.is_some()));
    }

    #[tokio::test]
    async fn promotion_requires_deliverable_evidence() {
        let mut gaps: Vec<Gap> = (1..=6)
            .map(|n| gap(n, GapCategory::Safe, "Background."))
            .collect();
        let rationale = vec![
            Some(Rationale {
                category: GapCategory::Critical,
                justification: "Homework 2, Question 1 asks for it.".into(),
            }),
            Some(Rationale {
                category: GapCategory::Critical,
                justification: "It seems important.".into(),
            }),
            None,
            None,
            None,
            None,
        ];
        let report = BalanceValidator::default()
            .validate(&mut gaps, &[], &Scripted(rationale))
            .await;
        assert_eq!(report.reclassified, 1);
        assert!(gaps[0].is_critical());
        assert_eq!(gaps[0].why_needed, "Homework 2, Question 1 asks for it.");
        assert!(!gaps[1].is_critical());
        assert!(report.overridden);
        assert!(gaps.iter().all(|g| g.override_justification.is_some()));
    }

    #[tokio::test]
    async fn small_lists_skip_band() {
        let mut gaps: Vec<Gap> = (1..=4).map(evidenced).collect();
        let report = BalanceValidator::default()
            .validate(&mut gaps, &[], &NoReclassifier)
            .await;
        assert_eq!(report.critical, 4);
        assert!(!report.overridden);
    }

    #[tokio::test]
    async fn llm_rationale_is_parsed_and_applied() {
        let reply = "```json\n{\"decisions\": [\
            {\"index\": 1, \"category\": \"safe\", \"justification\": \"not graded\"},\
            {\"index\": 2, \"category\": \"safe\", \"justification\": \"not graded\"},\
            {\"index\": 3, \"category\": \"safe\", \"justification\": \"not graded\"},\
            {\"index\": 9, \"category\": \"safe\", \"justification\": \"out of range\"}]}\n```";
        let provider = MockProvider::with_responses(vec![reply.into()]);
        let chain = ModelChain::new(provider.clone(), vec!["mock-model".into()])
            .with_policy(BackoffPolicy::exponential(1, Duration::ZERO));
        let engine = Arc::new(AnalysisEngine::new(chain, AnalysisConfig::default()));
        let assignments = vec!["Compute the SVD of the given matrix by hand.".to_owned()];

        let mut gaps: Vec<Gap> = (1..=5).map(evidenced).collect();
        let report = BalanceValidator::default()
            .validate(&mut gaps, &assignments, &LlmReclassifier::new(engine))
            .await;

        assert_eq!(report.reclassified, 2);
        assert_eq!(report.critical, 3);
        assert!(!report.overridden);
        let prompt = &provider.calls()[0].1[1].content;
        assert!(prompt.contains("- Compute the SVD"));
        assert!(prompt.contains("1. Concept 1 [critical]"));
    }

    #[test]
    fn unparseable_decisions_are_ignored() {
        assert!(parse_decisions("no json here", 3).is_none());
        let parsed = parse_decisions(r#"{"decisions": []}"#, 2).unwrap();
        assert_eq!(parsed, vec![None, None]);
    }
}
