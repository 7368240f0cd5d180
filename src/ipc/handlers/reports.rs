use crate::calc::{self, PeriodReport, SEMESTERS};
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{db_conn, ensure_exists, optional_str, required_i64, required_str};
use crate::ipc::types::{AppState, Request};
use crate::records;
use serde_json::json;
use std::collections::HashMap;

fn parse_semester(req: &Request) -> Result<i64, serde_json::Value> {
    let semester = required_i64(req, "semester")?;
    if !SEMESTERS.contains(&semester) {
        return Err(err(
            &req.id,
            "bad_params",
            "semester must be 1 or 2",
            Some(json!({ "semester": semester })),
        ));
    }
    Ok(semester)
}

fn handle_notes_by_year(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let bulletins = match records::load_student_bulletins(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let annual_reports = calc::annual_reports(&student_id, &bulletins.period_reports);
    ok(
        &req.id,
        json!({
            "student": bulletins.student,
            "subjects": bulletins.subjects,
            "groups": bulletins.groups,
            "periodReports": bulletins.period_reports,
            "annualReports": annual_reports,
        }),
    )
}

fn handle_period_report(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let semester = match parse_semester(req) {
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

    let bulletins = match records::load_student_bulletins(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let year = school_year_id.unwrap_or_else(|| bulletins.student.school_year_id.clone());
    let report = bulletins
        .period_reports
        .iter()
        .find(|p| p.school_year_id == year && p.semester == semester)
        .cloned()
        .unwrap_or_else(|| {
            // A year with no grades and not the current one: still a valid, empty bulletin.
            calc::assemble_period_report(&student_id, &year, semester, Vec::new(), &HashMap::new())
        });

    ok(
        &req.id,
        json!({
            "student": bulletins.student,
            "subjects": bulletins.subjects,
            "report": report,
        }),
    )
}

fn handle_annual_report(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let bulletins = match records::load_student_bulletins(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let year = school_year_id.unwrap_or_else(|| bulletins.student.school_year_id.clone());
    let semesters: Vec<PeriodReport> = bulletins
        .period_reports
        .iter()
        .filter(|p| p.school_year_id == year)
        .cloned()
        .collect();
    let annual = calc::assemble_annual_report(&student_id, &year, &semesters);

    ok(
        &req.id,
        json!({
            "student": bulletins.student,
            "subjects": bulletins.subjects,
            "report": annual,
        }),
    )
}

fn handle_class_bulletins(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let semester = match parse_semester(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "classes", &class_id, "class") {
        return e;
    }
    let school_year_id = match optional_str(req, "schoolYearId") {
        Ok(Some(v)) => match ensure_exists(conn, req, "school_years", &v, "school year") {
            Ok(()) => v,
            Err(e) => return e,
        },
        Ok(None) => match conn.query_row(
            "SELECT school_year_id FROM classes WHERE id = ?",
            [&class_id],
            |r| r.get::<_, String>(0),
        ) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        },
        Err(e) => return e,
    };

    let students = match records::class_students(conn, &class_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };

    let mut reports: Vec<PeriodReport> = Vec::with_capacity(students.len());
    for s in students.iter().filter(|s| s.active) {
        let bulletins = match records::load_student_bulletins(conn, &s.student_id) {
            Ok(v) => v,
            Err(e) => return calc_err(&req.id, e),
        };
        let report = bulletins
            .period_reports
            .into_iter()
            .find(|p| p.school_year_id == school_year_id && p.semester == semester)
            .unwrap_or_else(|| {
                calc::assemble_period_report(
                    &s.student_id,
                    &school_year_id,
                    semester,
                    Vec::new(),
                    &HashMap::new(),
                )
            });
        reports.push(report);
    }

    let names: HashMap<&str, &str> = students
        .iter()
        .map(|s| (s.student_id.as_str(), s.display_name.as_str()))
        .collect();
    let ranked = calc::rank_period_reports(reports);
    let averages: Vec<f64> = ranked.iter().filter_map(|r| r.overall_average).collect();
    let class_average = if averages.is_empty() {
        None
    } else {
        Some(calc::round_half_up_2(
            averages.iter().sum::<f64>() / (averages.len() as f64),
        ))
    };
    let rows: Vec<serde_json::Value> = ranked
        .iter()
        .map(|r| {
            json!({
                "displayName": names.get(r.student_id.as_str()).copied().unwrap_or(""),
                "report": r,
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "classId": class_id,
            "schoolYearId": school_year_id,
            "semester": semester,
            "classAverage": class_average,
            "passCount": ranked.iter().filter(|r| r.passed).count(),
            "bulletins": rows,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.notesByYear" => Some(handle_notes_by_year(state, req)),
        "reports.periodReport" => Some(handle_period_report(state, req)),
        "reports.annualReport" => Some(handle_annual_report(state, req)),
        "reports.classBulletins" => Some(handle_class_bulletins(state, req)),
        _ => None,
    }
}
