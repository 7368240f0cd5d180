use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

const ALL_YEARS_KEY: &str = "*";

fn compute_summary(conn: &Connection, school_year_id: Option<&str>) -> rusqlite::Result<serde_json::Value> {
    let class_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM classes WHERE ?1 IS NULL OR school_year_id = ?1",
        [school_year_id],
        |r| r.get(0),
    )?;
    let student_count: i64 = conn.query_row(
        "SELECT COUNT(*)
         FROM students s
         JOIN classes c ON c.id = s.class_id
         WHERE s.active = 1 AND (?1 IS NULL OR c.school_year_id = ?1)",
        [school_year_id],
        |r| r.get(0),
    )?;
    // Zero scores are ungraded placeholders, same as in averaging.
    let (graded_count, mean_score): (i64, Option<f64>) = conn.query_row(
        "SELECT COUNT(*), AVG(score)
         FROM grades
         WHERE score > 0 AND (?1 IS NULL OR school_year_id = ?1)",
        [school_year_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    let placeholder_count: i64 = conn.query_row(
        "SELECT COUNT(*)
         FROM grades
         WHERE score = 0 AND (?1 IS NULL OR school_year_id = ?1)",
        [school_year_id],
        |r| r.get(0),
    )?;

    let mut stmt = conn.prepare(
        "SELECT g.semester, COUNT(*), AVG(g.score)
         FROM grades g
         WHERE g.score > 0 AND (?1 IS NULL OR g.school_year_id = ?1)
         GROUP BY g.semester
         ORDER BY g.semester",
    )?;
    let per_semester = stmt
        .query_map([school_year_id], |r| {
            let avg: Option<f64> = r.get(2)?;
            Ok(json!({
                "semester": r.get::<_, i64>(0)?,
                "gradedCount": r.get::<_, i64>(1)?,
                "meanScore": avg.map(calc::round_half_up_2),
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({
        "schoolYearId": school_year_id,
        "classCount": class_count,
        "studentCount": student_count,
        "gradedCount": graded_count,
        "placeholderCount": placeholder_count,
        "meanScore": mean_score.map(calc::round_half_up_2),
        "perSemester": per_semester,
        "generatedAt": chrono::Utc::now().to_rfc3339(),
    }))
}

fn handle_dashboard_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let school_year_id = match optional_str(req, "schoolYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let key = school_year_id
        .clone()
        .unwrap_or_else(|| ALL_YEARS_KEY.to_string());

    if state.db.is_some() {
        if let Some(summary) = state.dashboard_cache.get(&key) {
            return ok(&req.id, json!({ "summary": summary, "cached": true }));
        }
    }

    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let summary = match compute_summary(conn, school_year_id.as_deref()) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    state.dashboard_cache.insert(key, summary.clone());
    ok(&req.id, json!({ "summary": summary, "cached": false }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "dashboard.summary" => Some(handle_dashboard_summary(state, req)),
        _ => None,
    }
}
