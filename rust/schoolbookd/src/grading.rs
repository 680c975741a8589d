use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Every evaluation is scored out of this total; custom criteria weights
/// must add up to it.
pub const CRITERIA_TOTAL: f64 = 20.0;
pub const DEFAULT_CRITERION_NAME: &str = "GENERAL";
const WEIGHT_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Criterion {
    pub number: i64,
    pub name: String,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GradingError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl GradingError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

pub fn default_criteria() -> Vec<Criterion> {
    vec![Criterion {
        number: 1,
        name: DEFAULT_CRITERION_NAME.to_string(),
        weight: CRITERIA_TOTAL,
    }]
}

/// An empty list means "no custom criteria" and yields the single default
/// criterion. A custom list must carry positive weights totalling
/// `CRITERIA_TOTAL`, with distinct positive numbers.
pub fn normalize_criteria(custom: Vec<Criterion>) -> Result<Vec<Criterion>, GradingError> {
    if custom.is_empty() {
        return Ok(default_criteria());
    }

    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(custom.len());
    for c in custom {
        if c.number < 1 {
            return Err(GradingError::new("bad_params", "criterion number must be >= 1")
                .with_details(serde_json::json!({ "number": c.number })));
        }
        if !seen.insert(c.number) {
            return Err(GradingError::new("bad_params", "duplicate criterion number")
                .with_details(serde_json::json!({ "number": c.number })));
        }
        let name = c.name.trim().to_uppercase();
        if name.is_empty() {
            return Err(GradingError::new("bad_params", "criterion name must not be empty")
                .with_details(serde_json::json!({ "number": c.number })));
        }
        if !c.weight.is_finite() || c.weight <= 0.0 {
            return Err(GradingError::new("bad_params", "criterion weight must be > 0")
                .with_details(serde_json::json!({ "number": c.number, "weight": c.weight })));
        }
        out.push(Criterion {
            number: c.number,
            name,
            weight: c.weight,
        });
    }

    let total = total_weight(&out);
    if (total - CRITERIA_TOTAL).abs() > WEIGHT_EPSILON {
        return Err(GradingError::new(
            "bad_params",
            format!("criteria weights must total {}", CRITERIA_TOTAL),
        )
        .with_details(serde_json::json!({ "total": total })));
    }

    out.sort_by_key(|c| c.number);
    Ok(out)
}

pub fn total_weight(criteria: &[Criterion]) -> f64 {
    criteria.iter().map(|c| c.weight).sum()
}

/// Scores are on the evaluation scale `0..=CRITERIA_TOTAL`; every criterion
/// must be known to the evaluation.
pub fn validate_scores(
    criteria: &[Criterion],
    scores: &BTreeMap<i64, f64>,
) -> Result<(), GradingError> {
    for (number, score) in scores {
        if !criteria.iter().any(|c| c.number == *number) {
            return Err(GradingError::new("bad_params", "unknown criterion")
                .with_details(serde_json::json!({ "criterion": number })));
        }
        if !score.is_finite() || *score < 0.0 || *score > CRITERIA_TOTAL {
            return Err(GradingError::new(
                "bad_params",
                format!("scores must be in 0..={}", CRITERIA_TOTAL),
            )
            .with_details(serde_json::json!({ "criterion": number, "score": score })));
        }
    }
    Ok(())
}

/// `Σ score_i · weight_i / Σ weight_j`. Missing scores count as zero.
pub fn final_score(criteria: &[Criterion], scores: &BTreeMap<i64, f64>) -> f64 {
    let total = total_weight(criteria);
    if total <= 0.0 {
        return 0.0;
    }
    criteria
        .iter()
        .map(|c| scores.get(&c.number).copied().unwrap_or(0.0) * c.weight / total)
        .sum()
}

/// Score sheet shown for a student with no stored grade record.
pub fn placeholder_scores(criteria: &[Criterion]) -> BTreeMap<i64, f64> {
    criteria.iter().map(|c| (c.number, 0.0)).collect()
}

/// Accumulated lapse grade: each evaluation contributes its final score in
/// proportion to its percentage. Ungraded evaluations contribute zero.
pub fn lapse_grade<I>(items: I) -> f64
where
    I: IntoIterator<Item = (Option<f64>, f64)>,
{
    items
        .into_iter()
        .map(|(score, percentage)| score.unwrap_or(0.0) * percentage / 100.0)
        .sum()
}

pub fn check_percentage_budget(already_used: f64, requested: f64) -> Result<(), GradingError> {
    if !requested.is_finite() || requested <= 0.0 || requested > 100.0 {
        return Err(GradingError::new("bad_params", "percentage must be in (0, 100]")
            .with_details(serde_json::json!({ "percentage": requested })));
    }
    if already_used + requested > 100.0 + WEIGHT_EPSILON {
        return Err(GradingError::new(
            "conflict",
            "evaluation percentages for the lapse would exceed 100",
        )
        .with_details(serde_json::json!({
            "alreadyUsed": already_used,
            "requested": requested
        })));
    }
    Ok(())
}

pub fn require_reason(reason: Option<&str>) -> Result<String, GradingError> {
    match reason.map(str::trim) {
        Some(r) if !r.is_empty() => Ok(r.to_string()),
        _ => Err(GradingError::new(
            "bad_params",
            "a justification is required to change a grade",
        )),
    }
}

#[derive(Debug, Clone)]
pub struct CutoffWindow {
    pub status: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

pub fn edit_window_open(window: Option<&CutoffWindow>, today: NaiveDate) -> bool {
    match window {
        Some(w) => w.status == "ACTIVE" && w.start_date <= today && today <= w.end_date,
        None => false,
    }
}

pub fn round_2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crit(number: i64, weight: f64) -> Criterion {
        Criterion {
            number,
            name: format!("C{}", number),
            weight,
        }
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("date")
    }

    #[test]
    fn two_equal_criteria_average() {
        let criteria = vec![crit(1, 10.0), crit(2, 10.0)];
        let scores = BTreeMap::from([(1, 8.0), (2, 6.0)]);
        assert!((final_score(&criteria, &scores) - 7.0).abs() < 1e-9);
    }

    #[test]
    fn bounds_of_the_scale() {
        let criteria = vec![crit(1, 5.0), crit(2, 7.0), crit(3, 8.0)];
        assert_eq!(final_score(&criteria, &placeholder_scores(&criteria)), 0.0);

        let full: BTreeMap<i64, f64> = criteria.iter().map(|c| (c.number, CRITERIA_TOTAL)).collect();
        assert!((final_score(&criteria, &full) - CRITERIA_TOTAL).abs() < 1e-9);
    }

    #[test]
    fn missing_scores_count_as_zero() {
        let criteria = vec![crit(1, 15.0), crit(2, 5.0)];
        let scores = BTreeMap::from([(2, 20.0)]);
        assert!((final_score(&criteria, &scores) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn empty_criteria_become_default() {
        let c = normalize_criteria(vec![]).expect("default");
        assert_eq!(c, default_criteria());
        assert_eq!(c[0].weight, CRITERIA_TOTAL);
    }

    #[test]
    fn custom_criteria_must_total_twenty() {
        let e = normalize_criteria(vec![crit(1, 10.0), crit(2, 9.0)]).unwrap_err();
        assert_eq!(e.code, "bad_params");

        let ok = normalize_criteria(vec![crit(2, 12.5), crit(1, 7.5)]).expect("valid");
        assert_eq!(ok.iter().map(|c| c.number).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn custom_criteria_reject_duplicates_and_zero_weights() {
        assert!(normalize_criteria(vec![crit(1, 10.0), crit(1, 10.0)]).is_err());
        assert!(normalize_criteria(vec![crit(1, 20.0), crit(2, 0.0)]).is_err());
    }

    #[test]
    fn scores_outside_scale_are_rejected() {
        let criteria = vec![crit(1, 20.0)];
        assert!(validate_scores(&criteria, &BTreeMap::from([(1, 20.5)])).is_err());
        assert!(validate_scores(&criteria, &BTreeMap::from([(1, -1.0)])).is_err());
        assert!(validate_scores(&criteria, &BTreeMap::from([(2, 3.0)])).is_err());
        assert!(validate_scores(&criteria, &BTreeMap::from([(1, 20.0)])).is_ok());
    }

    #[test]
    fn lapse_grade_weights_by_percentage() {
        let g = lapse_grade(vec![(Some(15.0), 30.0), (Some(10.0), 50.0), (None, 20.0)]);
        assert!((g - 9.5).abs() < 1e-9);
    }

    #[test]
    fn percentage_budget_caps_at_hundred() {
        assert!(check_percentage_budget(70.0, 30.0).is_ok());
        assert_eq!(check_percentage_budget(80.0, 30.0).unwrap_err().code, "conflict");
        assert!(check_percentage_budget(0.0, 0.0).is_err());
    }

    #[test]
    fn reason_is_required() {
        assert!(require_reason(None).is_err());
        assert!(require_reason(Some("   ")).is_err());
        assert_eq!(require_reason(Some(" typo ")).expect("reason"), "typo");
    }

    #[test]
    fn edit_window_needs_active_status_and_date_in_range() {
        let w = CutoffWindow {
            status: "ACTIVE".to_string(),
            start_date: date("2026-01-10"),
            end_date: date("2026-01-20"),
        };
        assert!(edit_window_open(Some(&w), date("2026-01-10")));
        assert!(edit_window_open(Some(&w), date("2026-01-20")));
        assert!(!edit_window_open(Some(&w), date("2026-01-21")));
        assert!(!edit_window_open(None, date("2026-01-15")));

        let inactive = CutoffWindow {
            status: "INACTIVE".to_string(),
            ..w
        };
        assert!(!edit_window_open(Some(&inactive), date("2026-01-15")));
    }
}
