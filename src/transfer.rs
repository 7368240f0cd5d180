use crate::calc::AnnualReport;
use serde::{Deserialize, Serialize};

/// Promotion rule. Only the most recently stored rule applies; it is loaded
/// per request and handed to the evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRule {
    pub minimum_average: f64,
    pub required_status: String,
    pub direct_transfer: bool,
    pub deactivate_year_after_transfer: bool,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferDecision {
    pub eligible: bool,
    pub auto_promote: bool,
}

pub fn evaluate_transfer(annual: &AnnualReport, status: &str, rule: &TransferRule) -> TransferDecision {
    let eligible = rule.active
        && annual
            .annual_average
            .map(|avg| avg >= rule.minimum_average)
            .unwrap_or(false)
        && status == rule.required_status;

    TransferDecision {
        eligible,
        auto_promote: eligible && rule.direct_transfer,
    }
}

#[derive(Debug, Clone)]
pub struct TransferCandidate {
    pub student_id: String,
    pub display_name: String,
    pub status: String,
    pub annual: AnnualReport,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentTransfer {
    pub student_id: String,
    pub display_name: String,
    pub status: String,
    pub annual_average: Option<f64>,
    pub eligible: bool,
    pub auto_promote: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferPlan {
    pub decisions: Vec<StudentTransfer>,
    pub promoted: Vec<String>,
    pub deactivate_year: bool,
}

pub fn plan_class_transfer(candidates: &[TransferCandidate], rule: &TransferRule) -> TransferPlan {
    let decisions: Vec<StudentTransfer> = candidates
        .iter()
        .map(|c| {
            let d = evaluate_transfer(&c.annual, &c.status, rule);
            StudentTransfer {
                student_id: c.student_id.clone(),
                display_name: c.display_name.clone(),
                status: c.status.clone(),
                annual_average: c.annual.annual_average,
                eligible: d.eligible,
                auto_promote: d.auto_promote,
            }
        })
        .collect();

    let promoted: Vec<String> = decisions
        .iter()
        .filter(|d| d.auto_promote)
        .map(|d| d.student_id.clone())
        .collect();

    TransferPlan {
        deactivate_year: rule.deactivate_year_after_transfer && !promoted.is_empty(),
        decisions,
        promoted,
    }
}
