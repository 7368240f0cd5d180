use crate::calc::{self, PeriodReport};
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{
    db_conn, ensure_exists, next_sort_order, optional_bool, optional_str, required_f64,
    required_str,
};
use crate::ipc::types::{AppState, Request};
use crate::records::{self, StoredTransferRule};
use crate::transfer::{self, TransferCandidate, TransferRule};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn load_rule(conn: &Connection, req: &Request) -> Result<StoredTransferRule, serde_json::Value> {
    match records::active_transfer_rule(conn) {
        Ok(Some(rule)) => Ok(rule),
        Ok(None) => Err(err(
            &req.id,
            "not_found",
            "no transfer rule configured",
            None,
        )),
        Err(e) => Err(calc_err(&req.id, e)),
    }
}

fn annual_for_year(
    conn: &Connection,
    req: &Request,
    student_id: &str,
    school_year_id: &str,
) -> Result<calc::AnnualReport, serde_json::Value> {
    let bulletins =
        records::load_student_bulletins(conn, student_id).map_err(|e| calc_err(&req.id, e))?;
    let semesters: Vec<PeriodReport> = bulletins
        .period_reports
        .into_iter()
        .filter(|p| p.school_year_id == school_year_id)
        .collect();
    Ok(calc::assemble_annual_report(
        student_id,
        school_year_id,
        &semesters,
    ))
}

fn handle_rule_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match records::active_transfer_rule(conn) {
        Ok(rule) => ok(&req.id, json!({ "rule": rule })),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_rule_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let minimum_average = match required_f64(req, "minimumAverage") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if !(0.0..=calc::MAX_SCORE).contains(&minimum_average) {
        return err(
            &req.id,
            "bad_params",
            format!("minimumAverage must be within [0, {}]", calc::MAX_SCORE),
            Some(json!({ "minimumAverage": minimum_average })),
        );
    }
    let required_status = match required_str(req, "requiredStatus") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let direct_transfer = match optional_bool(req, "directTransfer", false) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let deactivate_year_after_transfer =
        match optional_bool(req, "deactivateYearAfterTransfer", false) {
            Ok(v) => v,
            Err(e) => return e,
        };
    let active = match optional_bool(req, "active", true) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let stored = StoredTransferRule {
        id: Uuid::new_v4().to_string(),
        created_at: chrono::Utc::now().to_rfc3339(),
        rule: TransferRule {
            minimum_average,
            required_status,
            direct_transfer,
            deactivate_year_after_transfer,
            active,
        },
    };
    if let Err(e) = conn.execute(
        "INSERT INTO transfer_rules(id, minimum_average, required_status, direct_transfer,
                                    deactivate_year_after_transfer, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &stored.id,
            stored.rule.minimum_average,
            &stored.rule.required_status,
            stored.rule.direct_transfer as i64,
            stored.rule.deactivate_year_after_transfer as i64,
            stored.rule.active as i64,
            &stored.created_at,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "transfer_rules" })),
        );
    }
    tracing::info!(rule_id = %stored.id, minimum_average, "transfer rule replaced");
    ok(&req.id, json!({ "rule": stored }))
}

fn handle_evaluate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let school_year_id = match optional_str(req, "schoolYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Some(year) = school_year_id.as_deref() {
        if let Err(e) = ensure_exists(conn, req, "school_years", year, "school year") {
            return e;
        }
    }
    let rule = match load_rule(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student = match records::student_profile(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let year = school_year_id.unwrap_or_else(|| student.school_year_id.clone());
    let annual = match annual_for_year(conn, req, &student_id, &year) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let decision = transfer::evaluate_transfer(&annual, &student.status, &rule.rule);
    ok(
        &req.id,
        json!({
            "studentId": student_id,
            "status": student.status,
            "annualAverage": annual.annual_average,
            "eligible": decision.eligible,
            "autoPromote": decision.auto_promote,
            "rule": rule,
        }),
    )
}

fn handle_apply(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let dry_run = match optional_bool(req, "dryRun", false) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let target_class_id = match optional_str(req, "targetClassId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "classes", &class_id, "class") {
        return e;
    }
    if let Some(target) = target_class_id.as_deref() {
        if target == class_id {
            return err(
                &req.id,
                "bad_params",
                "targetClassId must differ from classId",
                None,
            );
        }
        if let Err(e) = ensure_exists(conn, req, "classes", target, "target class") {
            return e;
        }
    }

    let rule = match load_rule(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let school_year_id: String = match conn.query_row(
        "SELECT school_year_id FROM classes WHERE id = ?",
        [&class_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let students = match records::class_students(conn, &class_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };

    let mut candidates: Vec<TransferCandidate> = Vec::new();
    for s in students.into_iter().filter(|s| s.active) {
        let annual = match annual_for_year(conn, req, &s.student_id, &school_year_id) {
            Ok(v) => v,
            Err(e) => return e,
        };
        candidates.push(TransferCandidate {
            student_id: s.student_id,
            display_name: s.display_name,
            status: s.status,
            annual,
        });
    }
    let plan = transfer::plan_class_transfer(&candidates, &rule.rule);

    if dry_run || plan.promoted.is_empty() {
        return ok(
            &req.id,
            json!({
                "dryRun": dry_run,
                "applied": false,
                "schoolYearId": school_year_id,
                "plan": plan,
            }),
        );
    }
    let Some(target_class_id) = target_class_id else {
        return err(
            &req.id,
            "bad_params",
            "missing targetClassId",
            Some(json!({ "promotedCount": plan.promoted.len() })),
        );
    };

    let mut sort_order = match next_sort_order(
        conn,
        req,
        "students",
        Some(("class_id", &target_class_id)),
    ) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let now = chrono::Utc::now().to_rfc3339();
    for student_id in &plan.promoted {
        if let Err(e) = tx.execute(
            "UPDATE students SET class_id = ?, sort_order = ?, updated_at = ? WHERE id = ?",
            (&target_class_id, sort_order, &now, student_id),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "students", "studentId": student_id })),
            );
        }
        sort_order += 1;
    }
    if plan.deactivate_year {
        if let Err(e) = tx.execute(
            "UPDATE school_years SET active = 0 WHERE id = ?",
            [&school_year_id],
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "school_years" })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    tracing::info!(
        class_id = %class_id,
        target_class_id = %target_class_id,
        promoted = plan.promoted.len(),
        deactivate_year = plan.deactivate_year,
        "transfer applied"
    );
    state.dashboard_cache.invalidate_all();
    ok(
        &req.id,
        json!({
            "dryRun": false,
            "applied": true,
            "schoolYearId": school_year_id,
            "targetClassId": target_class_id,
            "plan": plan,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "transferRule.get" => Some(handle_rule_get(state, req)),
        "transferRule.set" => Some(handle_rule_set(state, req)),
        "transfer.evaluate" => Some(handle_evaluate(state, req)),
        "transfer.apply" => Some(handle_apply(state, req)),
        _ => None,
    }
}
