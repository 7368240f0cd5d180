use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, ensure_exists, next_sort_order, optional_bool, optional_f64, optional_str,
    required_bool, required_str,
};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

fn insert_failed(req: &Request, table: &str, e: rusqlite::Error) -> serde_json::Value {
    let code = match e.sqlite_error_code() {
        Some(rusqlite::ErrorCode::ConstraintViolation) => "conflict",
        _ => "db_insert_failed",
    };
    err(&req.id, code, e.to_string(), Some(json!({ "table": table })))
}

fn handle_school_years_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let label = match required_str(req, "label") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let active = match optional_bool(req, "active", true) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let sort_order = match next_sort_order(conn, req, "school_years", None) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO school_years(id, label, active, sort_order) VALUES(?, ?, ?, ?)",
        (&id, &label, active as i64, sort_order),
    ) {
        return insert_failed(req, "school_years", e);
    }
    state.dashboard_cache.invalidate_all();
    ok(&req.id, json!({ "schoolYearId": id, "label": label }))
}

fn handle_school_years_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "schoolYears": [] }));
    };
    let mut stmt = match conn.prepare(
        "SELECT id, label, active, sort_order FROM school_years ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "label": r.get::<_, String>(1)?,
                "active": r.get::<_, i64>(2)? != 0,
                "sortOrder": r.get::<_, i64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(years) => ok(&req.id, json!({ "schoolYears": years })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_school_years_set_active(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let id = match required_str(req, "schoolYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let active = match required_bool(req, "active") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match conn.execute(
        "UPDATE school_years SET active = ? WHERE id = ?",
        (active as i64, &id),
    ) {
        Ok(0) => err(&req.id, "not_found", "school year not found", None),
        Ok(_) => {
            state.dashboard_cache.invalidate_all();
            ok(&req.id, json!({ "schoolYearId": id, "active": active }))
        }
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_levels_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let sort_order = match next_sort_order(conn, req, "levels", None) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO levels(id, name, sort_order) VALUES(?, ?, ?)",
        (&id, &name, sort_order),
    ) {
        return insert_failed(req, "levels", e);
    }
    ok(&req.id, json!({ "levelId": id, "name": name }))
}

fn handle_levels_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "levels": [] }));
    };
    let mut stmt = match conn.prepare(
        "SELECT
           l.id,
           l.name,
           (SELECT COUNT(*) FROM subjects s WHERE s.level_id = l.id) AS subject_count
         FROM levels l
         ORDER BY l.sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "subjectCount": r.get::<_, i64>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(levels) => ok(&req.id, json!({ "levels": levels })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let level_id = match required_str(req, "levelId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let coefficient = match optional_f64(req, "coefficient") {
        Ok(v) => v.unwrap_or(1.0),
        Err(e) => return e,
    };
    if coefficient <= 0.0 {
        return err(
            &req.id,
            "bad_params",
            "coefficient must be > 0",
            Some(json!({ "coefficient": coefficient })),
        );
    }
    if let Err(e) = ensure_exists(conn, req, "levels", &level_id, "level") {
        return e;
    }
    let sort_order = match next_sort_order(conn, req, "subjects", Some(("level_id", &level_id))) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, level_id, name, coefficient, sort_order) VALUES(?, ?, ?, ?, ?)",
        (&id, &level_id, &name, coefficient, sort_order),
    ) {
        return insert_failed(req, "subjects", e);
    }
    ok(
        &req.id,
        json!({ "subjectId": id, "levelId": level_id, "name": name, "coefficient": coefficient }),
    )
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let level_id = match required_str(req, "levelId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match crate::records::subjects_for_level(conn, &level_id) {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => crate::ipc::error::calc_err(&req.id, e),
    }
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let level_id = match required_str(req, "levelId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let school_year_id = match required_str(req, "schoolYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "levels", &level_id, "level") {
        return e;
    }
    if let Err(e) = ensure_exists(conn, req, "school_years", &school_year_id, "school year") {
        return e;
    }

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, name, level_id, school_year_id) VALUES(?, ?, ?, ?)",
        (&id, &name, &level_id, &school_year_id),
    ) {
        return insert_failed(req, "classes", e);
    }
    state.dashboard_cache.invalidate_all();
    ok(&req.id, json!({ "classId": id, "name": name }))
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };
    let school_year_id = match optional_str(req, "schoolYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    // Correlated subquery so the count is not multiplied by joins.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.level_id,
           c.school_year_id,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count
         FROM classes c
         WHERE ?1 IS NULL OR c.school_year_id = ?1
         ORDER BY c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&school_year_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "levelId": r.get::<_, String>(2)?,
                "schoolYearId": r.get::<_, String>(3)?,
                "studentCount": r.get::<_, i64>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let last_name = match required_str(req, "lastName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let status = match optional_str(req, "status") {
        Ok(v) => v.unwrap_or_else(|| "regular".to_string()),
        Err(e) => return e,
    };
    let active = match optional_bool(req, "active", true) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "classes", &class_id, "class") {
        return e;
    }
    let sort_order = match next_sort_order(conn, req, "students", Some(("class_id", &class_id))) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, class_id, last_name, first_name, status, active, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &class_id,
            &last_name,
            &first_name,
            &status,
            active as i64,
            sort_order,
            chrono::Utc::now().to_rfc3339(),
        ),
    ) {
        return insert_failed(req, "students", e);
    }
    state.dashboard_cache.invalidate_all();
    ok(&req.id, json!({ "studentId": id, "status": status }))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match crate::records::class_students(conn, &class_id) {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => crate::ipc::error::calc_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "schoolYears.create" => Some(handle_school_years_create(state, req)),
        "schoolYears.list" => Some(handle_school_years_list(state, req)),
        "schoolYears.setActive" => Some(handle_school_years_set_active(state, req)),
        "levels.create" => Some(handle_levels_create(state, req)),
        "levels.list" => Some(handle_levels_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.list" => Some(handle_classes_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        _ => None,
    }
}
