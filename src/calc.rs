use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

pub const SEMESTERS: [i64; 2] = [1, 2];
pub const MAX_SCORE: f64 = 20.0;
pub const PASS_THRESHOLD: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentType {
    Homework1,
    Homework2,
    Homework3,
    Quiz,
    Exam,
    FinalExam,
}

impl AssessmentType {
    pub const ALL: [AssessmentType; 6] = [
        AssessmentType::Homework1,
        AssessmentType::Homework2,
        AssessmentType::Homework3,
        AssessmentType::Quiz,
        AssessmentType::Exam,
        AssessmentType::FinalExam,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AssessmentType::Homework1 => "homework1",
            AssessmentType::Homework2 => "homework2",
            AssessmentType::Homework3 => "homework3",
            AssessmentType::Quiz => "quiz",
            AssessmentType::Exam => "exam",
            AssessmentType::FinalExam => "final_exam",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let t = raw.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str().eq_ignore_ascii_case(t))
    }

    pub fn is_exam(self) -> bool {
        matches!(self, AssessmentType::Exam | AssessmentType::FinalExam)
    }

    /// Fixed averaging weight per assessment type. The stored per-grade
    /// weight does not enter the average.
    pub fn type_weight(self) -> f64 {
        if self.is_exam() {
            2.0
        } else {
            1.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRecord {
    pub id: String,
    pub student_id: String,
    pub course_id: String,
    pub subject_id: String,
    pub school_year_id: String,
    pub semester: i64,
    pub assessment_type: AssessmentType,
    pub score: f64,
    pub weight: f64,
    pub evaluation_date: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl GradeRecord {
    /// Zero scores are placeholders for "not graded yet" and never count.
    pub fn is_graded(&self) -> bool {
        self.score > 0.0
    }
}

/// A subject that applies to a level, with its bulletin coefficient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectInfo {
    pub subject_id: String,
    pub name: String,
    pub coefficient: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAverage {
    pub subject_id: String,
    pub school_year_id: String,
    pub semester: i64,
    pub average: Option<f64>,
    pub grade_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mention {
    TresBien,
    Bien,
    AssezBien,
    Passable,
    Insuffisant,
}

impl Serialize for Mention {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

impl Mention {
    pub fn label(self) -> &'static str {
        match self {
            Mention::TresBien => "Très Bien",
            Mention::Bien => "Bien",
            Mention::AssezBien => "Assez Bien",
            Mention::Passable => "Passable",
            Mention::Insuffisant => "Insuffisant",
        }
    }

    /// Inclusive lower bounds: 16, 14, 12, 10.
    pub fn for_average(average: Option<f64>) -> Option<Mention> {
        let avg = average?;
        Some(if avg >= 16.0 {
            Mention::TresBien
        } else if avg >= 14.0 {
            Mention::Bien
        } else if avg >= 12.0 {
            Mention::AssezBien
        } else if avg >= PASS_THRESHOLD {
            Mention::Passable
        } else {
            Mention::Insuffisant
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodReport {
    pub student_id: String,
    pub school_year_id: String,
    pub semester: i64,
    pub subjects: Vec<SubjectAverage>,
    pub overall_average: Option<f64>,
    pub mention: Option<Mention>,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnualReport {
    pub student_id: String,
    pub school_year_id: String,
    pub semesters: Vec<PeriodReport>,
    pub annual_average: Option<f64>,
    pub mention: Option<Mention>,
    pub passed: bool,
}

/// school_year_id -> semester -> subject_id -> grades
pub type NoteGroups = BTreeMap<String, BTreeMap<i64, BTreeMap<String, Vec<GradeRecord>>>>;

#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{code}: {message}")]
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

/// Round half up to 2 decimals: `Int(100*x + 0.5) / 100`.
/// The epsilon absorbs binary representation error (e.g. 14.125 stored as 14.12499..).
pub fn round_half_up_2(x: f64) -> f64 {
    ((100.0 * x) + 0.5 + 1e-9).floor() / 100.0
}

fn seeded_year(subjects: &[SubjectInfo]) -> BTreeMap<i64, BTreeMap<String, Vec<GradeRecord>>> {
    SEMESTERS
        .iter()
        .map(|sem| {
            let buckets = subjects
                .iter()
                .map(|s| (s.subject_id.clone(), Vec::new()))
                .collect();
            (*sem, buckets)
        })
        .collect()
}

pub fn group_notes(
    records: &[GradeRecord],
    school_years: &[String],
    subjects: &[SubjectInfo],
) -> NoteGroups {
    let mut groups = NoteGroups::new();
    for year in school_years {
        groups
            .entry(year.clone())
            .or_insert_with(|| seeded_year(subjects));
    }

    for r in records {
        groups
            .entry(r.school_year_id.clone())
            .or_insert_with(|| seeded_year(subjects))
            .entry(r.semester)
            .or_default()
            .entry(r.subject_id.clone())
            .or_default()
            .push(r.clone());
    }

    groups
}

pub fn compute_subject_average(records: &[GradeRecord]) -> Option<f64> {
    let mut sum = 0.0_f64;
    let mut denom = 0.0_f64;
    for r in records.iter().filter(|r| r.is_graded()) {
        let w = r.assessment_type.type_weight();
        sum += r.score * w;
        denom += w;
    }
    if denom > 0.0 {
        Some(round_half_up_2(sum / denom))
    } else {
        None
    }
}

pub fn subject_average(
    school_year_id: &str,
    semester: i64,
    subject_id: &str,
    records: &[GradeRecord],
) -> SubjectAverage {
    SubjectAverage {
        subject_id: subject_id.to_string(),
        school_year_id: school_year_id.to_string(),
        semester,
        average: compute_subject_average(records),
        grade_count: records.iter().filter(|r| r.is_graded()).count(),
    }
}

pub fn coefficient_map(subjects: &[SubjectInfo]) -> HashMap<String, f64> {
    subjects
        .iter()
        .map(|s| (s.subject_id.clone(), s.coefficient))
        .collect()
}

pub fn assemble_period_report(
    student_id: &str,
    school_year_id: &str,
    semester: i64,
    subject_averages: Vec<SubjectAverage>,
    coefficients: &HashMap<String, f64>,
) -> PeriodReport {
    let mut sum = 0.0_f64;
    let mut denom = 0.0_f64;
    for sa in &subject_averages {
        let Some(avg) = sa.average else {
            continue;
        };
        let coeff = coefficients.get(&sa.subject_id).copied().unwrap_or(1.0);
        if coeff <= 0.0 {
            continue;
        }
        sum += avg * coeff;
        denom += coeff;
    }

    let overall_average = if denom > 0.0 {
        Some(round_half_up_2(sum / denom))
    } else {
        None
    };

    PeriodReport {
        student_id: student_id.to_string(),
        school_year_id: school_year_id.to_string(),
        semester,
        subjects: subject_averages,
        overall_average,
        mention: Mention::for_average(overall_average),
        passed: overall_average.map(|a| a >= PASS_THRESHOLD).unwrap_or(false),
        rank: None,
    }
}

pub fn assemble_annual_report(
    student_id: &str,
    school_year_id: &str,
    period_reports: &[PeriodReport],
) -> AnnualReport {
    let counted: Vec<f64> = period_reports
        .iter()
        .filter_map(|p| p.overall_average)
        .filter(|a| *a > 0.0)
        .collect();

    let annual_average = if counted.is_empty() {
        None
    } else {
        Some(round_half_up_2(
            counted.iter().sum::<f64>() / (counted.len() as f64),
        ))
    };

    AnnualReport {
        student_id: student_id.to_string(),
        school_year_id: school_year_id.to_string(),
        semesters: period_reports.to_vec(),
        annual_average,
        mention: Mention::for_average(annual_average),
        passed: annual_average
            .map(|a| a >= PASS_THRESHOLD)
            .unwrap_or(false),
    }
}

/// Group a student's grades and turn every (year, semester) bucket into a
/// bulletin. Subjects keep the order of `subjects`; subjects only seen in
/// grades follow, sorted by id.
pub fn group_notes_by_year(
    student_id: &str,
    records: &[GradeRecord],
    school_years: &[String],
    subjects: &[SubjectInfo],
) -> Vec<PeriodReport> {
    let own: Vec<GradeRecord> = records
        .iter()
        .filter(|r| r.student_id == student_id)
        .cloned()
        .collect();
    let coefficients = coefficient_map(subjects);
    let position: HashMap<&str, usize> = subjects
        .iter()
        .enumerate()
        .map(|(i, s)| (s.subject_id.as_str(), i))
        .collect();

    let groups = group_notes(&own, school_years, subjects);
    let mut out = Vec::new();
    for (year, semesters) in &groups {
        for (semester, buckets) in semesters {
            let mut averages: Vec<SubjectAverage> = buckets
                .iter()
                .map(|(subject_id, recs)| subject_average(year, *semester, subject_id, recs))
                .collect();
            averages.sort_by(|a, b| {
                let pa = position.get(a.subject_id.as_str()).unwrap_or(&usize::MAX);
                let pb = position.get(b.subject_id.as_str()).unwrap_or(&usize::MAX);
                pa.cmp(pb).then_with(|| a.subject_id.cmp(&b.subject_id))
            });
            out.push(assemble_period_report(
                student_id,
                year,
                *semester,
                averages,
                &coefficients,
            ));
        }
    }
    out
}

/// One annual report per school year found in `period_reports`.
pub fn annual_reports(student_id: &str, period_reports: &[PeriodReport]) -> Vec<AnnualReport> {
    let mut by_year: BTreeMap<&str, Vec<PeriodReport>> = BTreeMap::new();
    for p in period_reports {
        by_year
            .entry(p.school_year_id.as_str())
            .or_default()
            .push(p.clone());
    }
    by_year
        .into_iter()
        .map(|(year, reports)| assemble_annual_report(student_id, year, &reports))
        .collect()
}

/// Competition ranking (1, 2, 2, 4) on the overall average. Reports without
/// an average get no rank. Returned in rank order, unranked last.
pub fn rank_period_reports(mut reports: Vec<PeriodReport>) -> Vec<PeriodReport> {
    let averages: Vec<f64> = reports.iter().filter_map(|r| r.overall_average).collect();
    for r in reports.iter_mut() {
        r.rank = r
            .overall_average
            .map(|avg| 1 + averages.iter().filter(|other| **other > avg).count());
    }
    reports.sort_by(|a, b| match (a.rank, b.rank) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.student_id.cmp(&b.student_id)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.student_id.cmp(&b.student_id),
    });
    reports
}
