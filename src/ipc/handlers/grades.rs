use crate::calc::{AssessmentType, GradeRecord, MAX_SCORE, SEMESTERS};
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{
    db_conn, ensure_exists, optional_f64, optional_i64, optional_str, required_f64, required_i64,
    required_str,
};
use crate::ipc::types::{AppState, Request};
use crate::records;
use chrono::NaiveDate;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

/// Rejects grades that break the record invariants before they reach storage.
fn validate_grade(g: &GradeRecord) -> Result<(), (String, serde_json::Value)> {
    if !(0.0..=MAX_SCORE).contains(&g.score) {
        return Err((
            format!("score must be within [0, {}]", MAX_SCORE),
            json!({ "score": g.score }),
        ));
    }
    if !(g.weight.is_finite() && g.weight > 0.0) {
        return Err(("weight must be > 0".to_string(), json!({ "weight": g.weight })));
    }
    if !SEMESTERS.contains(&g.semester) {
        return Err((
            "semester must be 1 or 2".to_string(),
            json!({ "semester": g.semester }),
        ));
    }
    Ok(())
}

fn parse_assessment_type(req: &Request, raw: &str) -> Result<AssessmentType, serde_json::Value> {
    AssessmentType::parse(raw).ok_or_else(|| {
        err(
            &req.id,
            "bad_params",
            "unknown assessmentType",
            Some(json!({
                "assessmentType": raw,
                "allowed": AssessmentType::ALL.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
            })),
        )
    })
}

fn parse_date(req: &Request, raw: &str) -> Result<NaiveDate, serde_json::Value> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| {
        err(
            &req.id,
            "bad_params",
            "evaluationDate must be YYYY-MM-DD",
            Some(json!({ "evaluationDate": raw, "reason": e.to_string() })),
        )
    })
}

fn handle_grades_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let semester = match required_i64(req, "semester") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let assessment_type = match required_str(req, "assessmentType") {
        Ok(v) => match parse_assessment_type(req, &v) {
            Ok(t) => t,
            Err(e) => return e,
        },
        Err(e) => return e,
    };
    let score = match required_f64(req, "score") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let weight = match optional_f64(req, "weight") {
        Ok(v) => v.unwrap_or(1.0),
        Err(e) => return e,
    };
    let evaluation_date = match required_str(req, "evaluationDate") {
        Ok(v) => match parse_date(req, &v) {
            Ok(d) => d,
            Err(e) => return e,
        },
        Err(e) => return e,
    };
    let comment = match optional_str(req, "comment") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let student = match records::student_profile(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let subject_level: Option<String> = match conn
        .query_row(
            "SELECT level_id FROM subjects WHERE id = ?",
            [&subject_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(subject_level) = subject_level else {
        return err(
            &req.id,
            "not_found",
            "subject not found",
            Some(json!({ "id": subject_id })),
        );
    };
    if subject_level != student.level_id {
        return err(
            &req.id,
            "bad_params",
            "subject does not apply to the student's level",
            Some(json!({ "subjectLevelId": subject_level, "studentLevelId": student.level_id })),
        );
    }

    let school_year_id = match optional_str(req, "schoolYearId") {
        Ok(v) => v.unwrap_or_else(|| student.school_year_id.clone()),
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "school_years", &school_year_id, "school year") {
        return e;
    }
    let course_id = match optional_str(req, "courseId") {
        Ok(v) => v.unwrap_or_else(|| format!("{}:{}", student.class_id, subject_id)),
        Err(e) => return e,
    };

    let grade = GradeRecord {
        id: Uuid::new_v4().to_string(),
        student_id,
        course_id,
        subject_id,
        school_year_id,
        semester,
        assessment_type,
        score,
        weight,
        evaluation_date,
        comment,
    };
    if let Err((message, details)) = validate_grade(&grade) {
        return err(&req.id, "bad_params", message, Some(details));
    }

    if let Err(e) = conn.execute(
        "INSERT INTO grades(id, student_id, course_id, subject_id, school_year_id, semester,
                            assessment_type, score, weight, evaluation_date, comment, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &grade.id,
            &grade.student_id,
            &grade.course_id,
            &grade.subject_id,
            &grade.school_year_id,
            grade.semester,
            grade.assessment_type.as_str(),
            grade.score,
            grade.weight,
            grade.evaluation_date.format("%Y-%m-%d").to_string(),
            &grade.comment,
            chrono::Utc::now().to_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }

    state.dashboard_cache.invalidate_all();
    ok(&req.id, json!({ "grade": grade }))
}

fn handle_grades_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match optional_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let course_id = match optional_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let school_year_id = match optional_str(req, "schoolYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let semester = match optional_i64(req, "semester") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let loaded = match (student_id, course_id) {
        (Some(sid), None) => records::grades_for_student(conn, &sid),
        (None, Some(cid)) => records::grades_for_course(conn, &cid),
        _ => {
            return err(
                &req.id,
                "bad_params",
                "provide exactly one of studentId or courseId",
                None,
            )
        }
    };
    let grades = match loaded {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };

    let grades: Vec<GradeRecord> = grades
        .into_iter()
        .filter(|g| {
            school_year_id
                .as_ref()
                .map(|y| &g.school_year_id == y)
                .unwrap_or(true)
                && semester.map(|s| g.semester == s).unwrap_or(true)
        })
        .collect();
    ok(&req.id, json!({ "grades": grades }))
}

fn handle_grades_correct(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grade_id = match required_str(req, "gradeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut grade = match records::grade_by_id(conn, &grade_id) {
        Ok(Some(g)) => g,
        Ok(None) => return err(&req.id, "not_found", "grade not found", None),
        Err(e) => return calc_err(&req.id, e),
    };

    match optional_f64(req, "score") {
        Ok(Some(v)) => grade.score = v,
        Ok(None) => {}
        Err(e) => return e,
    }
    match optional_f64(req, "weight") {
        Ok(Some(v)) => grade.weight = v,
        Ok(None) => {}
        Err(e) => return e,
    }
    match optional_str(req, "assessmentType") {
        Ok(Some(v)) => match parse_assessment_type(req, &v) {
            Ok(t) => grade.assessment_type = t,
            Err(e) => return e,
        },
        Ok(None) => {}
        Err(e) => return e,
    }
    match optional_str(req, "evaluationDate") {
        Ok(Some(v)) => match parse_date(req, &v) {
            Ok(d) => grade.evaluation_date = d,
            Err(e) => return e,
        },
        Ok(None) => {}
        Err(e) => return e,
    }
    // An explicit null clears the comment.
    if let Some(v) = req.params.get("comment") {
        grade.comment = v.as_str().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    }

    if let Err((message, details)) = validate_grade(&grade) {
        return err(&req.id, "bad_params", message, Some(details));
    }

    if let Err(e) = conn.execute(
        "UPDATE grades
         SET score = ?, weight = ?, assessment_type = ?, evaluation_date = ?, comment = ?, updated_at = ?
         WHERE id = ?",
        (
            grade.score,
            grade.weight,
            grade.assessment_type.as_str(),
            grade.evaluation_date.format("%Y-%m-%d").to_string(),
            &grade.comment,
            chrono::Utc::now().to_rfc3339(),
            &grade.id,
        ),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    tracing::info!(grade_id = %grade.id, score = grade.score, "grade corrected");
    state.dashboard_cache.invalidate_all();
    ok(&req.id, json!({ "grade": grade }))
}

fn handle_grades_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grade_id = match required_str(req, "gradeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match conn.execute("DELETE FROM grades WHERE id = ?", [&grade_id]) {
        Ok(0) => err(&req.id, "not_found", "grade not found", None),
        Ok(_) => {
            state.dashboard_cache.invalidate_all();
            ok(&req.id, json!({ "gradeId": grade_id, "deleted": true }))
        }
        Err(e) => err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.add" => Some(handle_grades_add(state, req)),
        "grades.list" => Some(handle_grades_list(state, req)),
        "grades.correct" => Some(handle_grades_correct(state, req)),
        "grades.delete" => Some(handle_grades_delete(state, req)),
        _ => None,
    }
}
