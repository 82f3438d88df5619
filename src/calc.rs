use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Minimum competency threshold (KKM). Fixed for every subject.
pub const KKM: f64 = 75.0;

/// Display rounding used on report cards: `floor(10*x + 0.5) / 10`.
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Pengetahuan,
    Keterampilan,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Pengetahuan => "Pengetahuan",
            Category::Keterampilan => "Keterampilan",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "Pengetahuan" => Some(Category::Pengetahuan),
            "Keterampilan" => Some(Category::Keterampilan),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedEntry {
    pub weight: f64,
    pub value: Option<f64>,
}

/// Weighted mean over the entries that carry a value.
///
/// Returns `None` when no entry is graded. Graded entries whose weights sum
/// to zero yield `Some(0.0)`; negative weights count as zero.
pub fn weighted_average<I>(entries: I) -> Option<f64>
where
    I: IntoIterator<Item = WeightedEntry>,
{
    let mut any_value = false;
    let mut total_weight = 0.0_f64;
    let mut weighted_sum = 0.0_f64;

    for e in entries {
        let Some(v) = e.value else {
            continue;
        };
        any_value = true;
        let w = if e.weight.is_finite() && e.weight > 0.0 {
            e.weight
        } else {
            0.0
        };
        total_weight += w;
        weighted_sum += w * v;
    }

    if !any_value {
        return None;
    }
    if total_weight <= 0.0 {
        return Some(0.0);
    }
    Some(weighted_sum / total_weight)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Competency {
    Above,
    Below,
}

impl Competency {
    pub fn as_str(self) -> &'static str {
        match self {
            Competency::Above => "above",
            Competency::Below => "below",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Competency::Above => "Tuntas",
            Competency::Below => "Belum Tuntas",
        }
    }
}

pub fn classify(knowledge: f64, skill: f64) -> Competency {
    if knowledge >= KKM && skill >= KKM {
        Competency::Above
    } else {
        Competency::Below
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreSummary {
    pub knowledge: Option<f64>,
    pub skill: Option<f64>,
}

/// `None` while either category is still ungraded.
pub fn classify_summary(summary: &ScoreSummary) -> Option<Competency> {
    match (summary.knowledge, summary.skill) {
        (Some(k), Some(s)) => Some(classify(k, s)),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDef {
    pub id: String,
    pub name: String,
    pub weight: f64,
    pub category: Category,
}

/// Grade values for one student keyed by component id. A missing key or a
/// `None` value both mean ungraded.
pub type StudentGrades = HashMap<String, Option<f64>>;

/// Weighted average of the components accepted by `filter`.
pub fn aggregate_with<F>(components: &[ComponentDef], grades: &StudentGrades, filter: F) -> Option<f64>
where
    F: Fn(&ComponentDef) -> bool,
{
    weighted_average(components.iter().filter(|c| filter(c)).map(|c| WeightedEntry {
        weight: c.weight,
        value: grades.get(&c.id).copied().flatten(),
    }))
}

pub fn category_average(
    components: &[ComponentDef],
    grades: &StudentGrades,
    category: Category,
) -> Option<f64> {
    aggregate_with(components, grades, |c| c.category == category)
}

pub fn subject_summary(components: &[ComponentDef], grades: &StudentGrades) -> ScoreSummary {
    ScoreSummary {
        knowledge: category_average(components, grades, Category::Pengetahuan),
        skill: category_average(components, grades, Category::Keterampilan),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub label: String,
    pub upper: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BucketSet {
    name: String,
    buckets: Vec<Bucket>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketCount {
    pub label: String,
    pub lower: Option<f64>,
    pub upper: f64,
    pub count: usize,
}

impl BucketSet {
    pub fn new(name: impl Into<String>, buckets: Vec<Bucket>) -> Result<Self, CalcError> {
        if buckets.is_empty() {
            return Err(CalcError::new("bad_params", "bucket set must not be empty"));
        }
        for (i, b) in buckets.iter().enumerate() {
            if b.label.trim().is_empty() {
                return Err(CalcError::new("bad_params", "bucket label must not be empty")
                    .with_details(serde_json::json!({ "index": i })));
            }
            if !b.upper.is_finite() {
                return Err(CalcError::new("bad_params", "bucket upper bound must be finite")
                    .with_details(serde_json::json!({ "index": i })));
            }
            if i > 0 && b.upper <= buckets[i - 1].upper {
                return Err(CalcError::new(
                    "bad_params",
                    "bucket upper bounds must be strictly increasing",
                )
                .with_details(serde_json::json!({ "index": i, "label": b.label })));
            }
        }
        Ok(Self {
            name: name.into(),
            buckets,
        })
    }

    /// Ten 10-point bins: `0-10`, `11-20`, ..., `91-100`.
    pub fn deciles() -> Self {
        let buckets = (1..=10)
            .map(|i| {
                let upper = (i * 10) as f64;
                let label = if i == 1 {
                    "0-10".to_string()
                } else {
                    format!("{}-{}", (i - 1) * 10 + 1, i * 10)
                };
                Bucket { label, upper }
            })
            .collect();
        Self {
            name: "deciles".to_string(),
            buckets,
        }
    }

    /// Qualitative bands around the KKM.
    pub fn bands() -> Self {
        let buckets = [
            ("<51", 50.0),
            ("51-75", 75.0),
            ("76-83", 83.0),
            ("84-92", 92.0),
            ("93-100", 100.0),
        ]
        .into_iter()
        .map(|(label, upper)| Bucket {
            label: label.to_string(),
            upper,
        })
        .collect();
        Self {
            name: "bands".to_string(),
            buckets,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Index of the single bucket a score belongs to.
    pub fn index_of(&self, score: f64) -> usize {
        self.buckets
            .iter()
            .position(|b| score <= b.upper)
            .unwrap_or(self.buckets.len() - 1)
    }
}

pub fn distribution<I>(set: &BucketSet, scores: I) -> Vec<BucketCount>
where
    I: IntoIterator<Item = f64>,
{
    let mut counts = vec![0usize; set.buckets.len()];
    for s in scores {
        counts[set.index_of(s)] += 1;
    }
    set.buckets
        .iter()
        .enumerate()
        .map(|(i, b)| BucketCount {
            label: b.label.clone(),
            lower: if i == 0 {
                None
            } else {
                Some(set.buckets[i - 1].upper)
            },
            upper: b.upper,
            count: counts[i],
        })
        .collect()
}

/// Accepts `"deciles"`, `"bands"`, or an array of `{label, upper}`.
/// Absent means `bands`.
pub fn parse_bucket_set(raw: Option<&serde_json::Value>) -> Result<BucketSet, CalcError> {
    let Some(v) = raw else {
        return Ok(BucketSet::bands());
    };
    if v.is_null() {
        return Ok(BucketSet::bands());
    }
    if let Some(s) = v.as_str() {
        return match s.trim().to_ascii_lowercase().as_str() {
            "deciles" => Ok(BucketSet::deciles()),
            "bands" => Ok(BucketSet::bands()),
            other => Err(CalcError::new(
                "bad_params",
                "buckets must be 'deciles', 'bands' or an array",
            )
            .with_details(serde_json::json!({ "buckets": other }))),
        };
    }
    let buckets: Vec<Bucket> = serde_json::from_value(v.clone())
        .map_err(|e| CalcError::new("bad_params", format!("invalid buckets: {}", e)))?;
    BucketSet::new("custom", buckets)
}

pub fn compute_median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut v = values.to_vec();
    v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let mid = v.len() / 2;
    if v.len() % 2 == 0 {
        Some((v[mid - 1] + v[mid]) / 2.0)
    } else {
        Some(v[mid])
    }
}

pub fn compute_mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / (values.len() as f64))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryStats {
    pub average: Option<f64>,
    pub median: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub graded_count: usize,
    pub ungraded_count: usize,
    pub distribution: Vec<BucketCount>,
}

pub fn category_stats(scores: &[Option<f64>], set: &BucketSet) -> CategoryStats {
    let graded: Vec<f64> = scores.iter().filter_map(|s| *s).collect();
    CategoryStats {
        average: compute_mean(&graded),
        median: compute_median(&graded),
        min: graded.iter().copied().reduce(f64::min),
        max: graded.iter().copied().reduce(f64::max),
        graded_count: graded.len(),
        ungraded_count: scores.len() - graded.len(),
        distribution: distribution(set, graded.iter().copied()),
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompetencyTally {
    pub above: usize,
    pub below: usize,
    pub ungraded: usize,
}

pub fn competency_tally<'a, I>(summaries: I) -> CompetencyTally
where
    I: IntoIterator<Item = &'a ScoreSummary>,
{
    let mut t = CompetencyTally::default();
    for s in summaries {
        match classify_summary(s) {
            Some(Competency::Above) => t.above += 1,
            Some(Competency::Below) => t.below += 1,
            None => t.ungraded += 1,
        }
    }
    t
}

#[cfg(test)]
mod tests {
    use super::*;

    fn e(weight: f64, value: Option<f64>) -> WeightedEntry {
        WeightedEntry { weight, value }
    }

    fn comp(id: &str, weight: f64, category: Category) -> ComponentDef {
        ComponentDef {
            id: id.to_string(),
            name: id.to_uppercase(),
            weight,
            category,
        }
    }

    #[test]
    fn round_off_half_up() {
        assert_eq!(round_off_1_decimal(0.0), 0.0);
        assert_eq!(round_off_1_decimal(3.54), 3.5);
        assert_eq!(round_off_1_decimal(3.55), 3.6);
        assert_eq!(round_off_1_decimal(82.6666), 82.7);
    }

    #[test]
    fn weighted_average_ignores_ungraded_entries() {
        let avg = weighted_average(vec![e(30.0, Some(80.0)), e(70.0, Some(90.0)), e(50.0, None)])
            .expect("graded");
        assert!((avg - 87.0).abs() < 1e-9);
    }

    #[test]
    fn weighted_average_of_nothing_graded_is_none() {
        assert_eq!(weighted_average(Vec::new()), None);
        assert_eq!(weighted_average(vec![e(40.0, None), e(60.0, None)]), None);
    }

    #[test]
    fn weighted_average_zero_total_weight_is_zero() {
        assert_eq!(weighted_average(vec![e(0.0, Some(90.0)), e(0.0, Some(70.0))]), Some(0.0));
        assert_eq!(weighted_average(vec![e(-5.0, Some(90.0))]), Some(0.0));
    }

    #[test]
    fn weighted_average_stays_within_value_range() {
        let sets: Vec<Vec<WeightedEntry>> = vec![
            vec![e(1.0, Some(10.0)), e(99.0, Some(100.0))],
            vec![e(33.0, Some(75.0)), e(33.0, Some(75.0)), e(34.0, Some(75.0))],
            vec![e(5.0, Some(0.0)), e(0.0, Some(100.0)), e(12.5, Some(61.2))],
            vec![e(100.0, Some(42.0))],
        ];
        for entries in sets {
            let values: Vec<f64> = entries.iter().filter_map(|x| x.value).collect();
            let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
            let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let avg = weighted_average(entries.clone()).expect("graded");
            assert!(avg >= lo - 1e-9 && avg <= hi + 1e-9, "{avg} outside [{lo}, {hi}]");
        }
    }

    #[test]
    fn classify_requires_both_scores_at_kkm() {
        assert_eq!(classify(75.0, 75.0), Competency::Above);
        assert_eq!(classify(74.9, 100.0), Competency::Below);
        assert_eq!(classify(100.0, 74.0), Competency::Below);
    }

    #[test]
    fn classify_summary_keeps_ungraded_distinct() {
        let s = ScoreSummary {
            knowledge: Some(90.0),
            skill: None,
        };
        assert_eq!(classify_summary(&s), None);
        let s = ScoreSummary {
            knowledge: Some(0.0),
            skill: Some(0.0),
        };
        assert_eq!(classify_summary(&s), Some(Competency::Below));
    }

    #[test]
    fn subject_summary_splits_by_category() {
        let components = vec![
            comp("uh1", 40.0, Category::Pengetahuan),
            comp("uts", 60.0, Category::Pengetahuan),
            comp("praktik", 100.0, Category::Keterampilan),
        ];
        let mut grades = StudentGrades::new();
        grades.insert("uh1".into(), Some(70.0));
        grades.insert("uts".into(), Some(80.0));
        grades.insert("praktik".into(), None);

        let s = subject_summary(&components, &grades);
        assert!((s.knowledge.expect("knowledge") - 76.0).abs() < 1e-9);
        assert_eq!(s.skill, None);
    }

    #[test]
    fn bands_boundary_score_lands_in_one_bucket() {
        let set = BucketSet::bands();
        let d = distribution(&set, vec![75.0]);
        let hits: Vec<&str> = d
            .iter()
            .filter(|b| b.count > 0)
            .map(|b| b.label.as_str())
            .collect();
        assert_eq!(hits, vec!["51-75"]);
    }

    #[test]
    fn fractional_scores_between_labels_are_not_lost() {
        let set = BucketSet::bands();
        assert_eq!(set.buckets()[set.index_of(75.5)].label, "76-83");
        assert_eq!(set.buckets()[set.index_of(50.01)].label, "51-75");
        let deciles = BucketSet::deciles();
        assert_eq!(deciles.buckets()[deciles.index_of(10.5)].label, "11-20");
        assert_eq!(deciles.buckets()[deciles.index_of(0.0)].label, "0-10");
        assert_eq!(deciles.buckets()[deciles.index_of(100.0)].label, "91-100");
    }

    #[test]
    fn bucket_counts_sum_to_input_len() {
        let scores = vec![0.0, 10.0, 10.1, 49.9, 50.0, 75.0, 83.0, 83.5, 92.0, 99.9, 100.0, 120.0];
        for set in [BucketSet::bands(), BucketSet::deciles()] {
            let total: usize = distribution(&set, scores.iter().copied())
                .iter()
                .map(|b| b.count)
                .sum();
            assert_eq!(total, scores.len(), "set {}", set.name());
        }
    }

    #[test]
    fn distribution_preserves_bucket_order() {
        let d = distribution(&BucketSet::deciles(), Vec::new());
        let labels: Vec<&str> = d.iter().map(|b| b.label.as_str()).collect();
        assert_eq!(labels.first(), Some(&"0-10"));
        assert_eq!(labels.last(), Some(&"91-100"));
        assert_eq!(labels.len(), 10);
        assert_eq!(d[0].lower, None);
        assert_eq!(d[1].lower, Some(10.0));
    }

    #[test]
    fn custom_bucket_set_rejects_unsorted_bounds() {
        let raw = serde_json::json!([
            { "label": "low", "upper": 60 },
            { "label": "mid", "upper": 60 }
        ]);
        let e = parse_bucket_set(Some(&raw)).expect_err("must reject");
        assert_eq!(e.code, "bad_params");

        let raw = serde_json::json!([
            { "label": "fail", "upper": 74.99 },
            { "label": "pass", "upper": 100 }
        ]);
        let set = parse_bucket_set(Some(&raw)).expect("valid custom set");
        assert_eq!(set.name(), "custom");
        assert_eq!(set.buckets()[set.index_of(75.0)].label, "pass");
    }

    #[test]
    fn aggregation_is_deterministic() {
        let components = vec![
            comp("a", 25.0, Category::Pengetahuan),
            comp("b", 75.0, Category::Pengetahuan),
        ];
        let mut grades = StudentGrades::new();
        grades.insert("a".into(), Some(66.6));
        grades.insert("b".into(), Some(91.3));
        let first = subject_summary(&components, &grades);
        let second = subject_summary(&components, &grades);
        assert_eq!(first, second);
    }

    #[test]
    fn tally_counts_ungraded_separately() {
        let summaries = vec![
            ScoreSummary {
                knowledge: Some(80.0),
                skill: Some(90.0),
            },
            ScoreSummary {
                knowledge: Some(60.0),
                skill: Some(90.0),
            },
            ScoreSummary::default(),
        ];
        let t = competency_tally(summaries.iter());
        assert_eq!((t.above, t.below, t.ungraded), (1, 1, 1));
    }
}
