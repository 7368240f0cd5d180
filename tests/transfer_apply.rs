use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_bulletind");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn bulletind");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().expect("error object")
}

fn str_field(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}

struct School {
    year_id: String,
    level_id: String,
    class_id: String,
    math_id: String,
    french_id: String,
    students: Vec<String>,
}

/// One year, one level with Maths (coeff 4) and French (coeff 4), one class.
fn seed_school(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    student_names: &[(&str, &str)],
) -> School {
    let year = request_ok(
        stdin,
        reader,
        "seed-year",
        "schoolYears.create",
        json!({ "label": "2024-2025" }),
    );
    let year_id = str_field(&year, "schoolYearId");
    let level = request_ok(stdin, reader, "seed-level", "levels.create", json!({ "name": "6e" }));
    let level_id = str_field(&level, "levelId");
    let math = request_ok(
        stdin,
        reader,
        "seed-math",
        "subjects.create",
        json!({ "levelId": level_id, "name": "Maths", "coefficient": 4 }),
    );
    let french = request_ok(
        stdin,
        reader,
        "seed-french",
        "subjects.create",
        json!({ "levelId": level_id, "name": "Francais", "coefficient": 4 }),
    );
    let class = request_ok(
        stdin,
        reader,
        "seed-class",
        "classes.create",
        json!({ "name": "6e A", "levelId": level_id, "schoolYearId": year_id }),
    );
    let class_id = str_field(&class, "classId");

    let mut students = Vec::new();
    for (i, (last, first)) in student_names.iter().enumerate() {
        let s = request_ok(
            stdin,
            reader,
            &format!("seed-student-{}", i),
            "students.create",
            json!({ "classId": class_id, "lastName": last, "firstName": first }),
        );
        students.push(str_field(&s, "studentId"));
    }

    School {
        year_id,
        level_id,
        class_id,
        math_id: str_field(&math, "subjectId"),
        french_id: str_field(&french, "subjectId"),
        students,
    }
}

fn add_grade(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    student_id: &str,
    subject_id: &str,
    semester: i64,
    assessment_type: &str,
    score: f64,
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        id,
        "grades.add",
        json!({
            "studentId": student_id,
            "subjectId": subject_id,
            "semester": semester,
            "assessmentType": assessment_type,
            "score": score,
            "evaluationDate": "2024-11-18",
        }),
    )
}

fn class_member_ids(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    class_id: &str,
) -> Vec<String> {
    let listed = request_ok(stdin, reader, id, "students.list", json!({ "classId": class_id }));
    listed["students"]
        .as_array()
        .expect("students")
        .iter()
        .map(|s| str_field(s, "studentId"))
        .collect()
}

fn set_rule(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    minimum_average: f64,
    direct_transfer: bool,
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        id,
        "transferRule.set",
        json!({
            "minimumAverage": minimum_average,
            "requiredStatus": "regular",
            "directTransfer": direct_transfer,
            "deactivateYearAfterTransfer": true,
        }),
    )
}

#[test]
fn transfer_rule_latest_row_wins_and_bounds_are_checked() {
    let workspace = temp_dir("bulletind-transfer-rule");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let empty = request_ok(&mut stdin, &mut reader, "r0", "transferRule.get", json!({}));
    assert!(empty["rule"].is_null());

    let _ = set_rule(&mut stdin, &mut reader, "r1", 10.0, false);
    let second = set_rule(&mut stdin, &mut reader, "r2", 12.0, true);
    let current = request_ok(&mut stdin, &mut reader, "r3", "transferRule.get", json!({}));
    assert_eq!(current["rule"]["id"], second["rule"]["id"]);
    assert_eq!(current["rule"]["minimumAverage"], json!(12.0));
    assert_eq!(current["rule"]["directTransfer"], json!(true));
    assert_eq!(current["rule"]["active"], json!(true));

    let e = request_err(
        &mut stdin,
        &mut reader,
        "r4",
        "transferRule.set",
        json!({ "minimumAverage": 21, "requiredStatus": "regular" }),
    );
    assert_eq!(e["code"], json!("bad_params"));
    let e = request_err(
        &mut stdin,
        &mut reader,
        "r5",
        "transferRule.set",
        json!({ "minimumAverage": 10 }),
    );
    assert_eq!(e["code"], json!("bad_params"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn evaluate_checks_minimum_status_and_direct_transfer() {
    let workspace = temp_dir("bulletind-transfer-eval");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school = seed_school(&mut stdin, &mut reader, &[("Sow", "Binta"), ("Kane", "Modou")]);
    let (strong, weak) = (school.students[0].clone(), school.students[1].clone());
    let repeating = request_ok(
        &mut stdin,
        &mut reader,
        "s-rep",
        "students.create",
        json!({
            "classId": school.class_id,
            "lastName": "Gueye",
            "firstName": "Awa",
            "status": "repeating",
        }),
    );
    let repeating = str_field(&repeating, "studentId");

    add_grade(&mut stdin, &mut reader, "g1", &strong, &school.math_id, 1, "exam", 12.0);
    add_grade(&mut stdin, &mut reader, "g2", &weak, &school.math_id, 1, "exam", 9.9);
    add_grade(&mut stdin, &mut reader, "g3", &repeating, &school.math_id, 1, "exam", 15.0);

    let e = request_err(
        &mut stdin,
        &mut reader,
        "e0",
        "transfer.evaluate",
        json!({ "studentId": strong }),
    );
    assert_eq!(e["code"], json!("not_found"));

    let _ = set_rule(&mut stdin, &mut reader, "r1", 10.0, false);
    let eval = request_ok(
        &mut stdin,
        &mut reader,
        "e1",
        "transfer.evaluate",
        json!({ "studentId": strong }),
    );
    assert_eq!(eval["annualAverage"], json!(12.0));
    assert_eq!(eval["eligible"], json!(true));
    assert_eq!(eval["autoPromote"], json!(false));

    let _ = set_rule(&mut stdin, &mut reader, "r2", 10.0, true);
    let eval = request_ok(
        &mut stdin,
        &mut reader,
        "e2",
        "transfer.evaluate",
        json!({ "studentId": strong }),
    );
    assert_eq!(eval["autoPromote"], json!(true));

    let eval = request_ok(
        &mut stdin,
        &mut reader,
        "e3",
        "transfer.evaluate",
        json!({ "studentId": weak }),
    );
    assert_eq!(eval["annualAverage"], json!(9.9));
    assert_eq!(eval["eligible"], json!(false));
    assert_eq!(eval["autoPromote"], json!(false));

    let eval = request_ok(
        &mut stdin,
        &mut reader,
        "e4",
        "transfer.evaluate",
        json!({ "studentId": repeating }),
    );
    assert_eq!(eval["status"], json!("repeating"));
    assert_eq!(eval["eligible"], json!(false));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn apply_moves_promoted_students_and_closes_the_year() {
    let workspace = temp_dir("bulletind-transfer-apply");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school = seed_school(&mut stdin, &mut reader, &[("Sow", "Binta"), ("Kane", "Modou")]);
    let (strong, weak) = (school.students[0].clone(), school.students[1].clone());
    add_grade(&mut stdin, &mut reader, "g1", &strong, &school.math_id, 1, "exam", 13.0);
    add_grade(&mut stdin, &mut reader, "g2", &weak, &school.math_id, 1, "exam", 8.0);

    let next_year = request_ok(
        &mut stdin,
        &mut reader,
        "y2",
        "schoolYears.create",
        json!({ "label": "2025-2026" }),
    );
    let next_level = request_ok(&mut stdin, &mut reader, "l2", "levels.create", json!({ "name": "5e" }));
    let target = request_ok(
        &mut stdin,
        &mut reader,
        "c2",
        "classes.create",
        json!({
            "name": "5e A",
            "levelId": str_field(&next_level, "levelId"),
            "schoolYearId": str_field(&next_year, "schoolYearId"),
        }),
    );
    let target_id = str_field(&target, "classId");
    let _ = set_rule(&mut stdin, &mut reader, "r1", 10.0, true);

    let dry = request_ok(
        &mut stdin,
        &mut reader,
        "a1",
        "transfer.apply",
        json!({ "classId": school.class_id, "targetClassId": target_id, "dryRun": true }),
    );
    assert_eq!(dry["applied"], json!(false));
    assert_eq!(dry["plan"]["promoted"], json!([strong]));
    assert_eq!(dry["plan"]["deactivateYear"], json!(true));
    assert_eq!(
        class_member_ids(&mut stdin, &mut reader, "m1", &school.class_id).len(),
        2
    );

    let e = request_err(
        &mut stdin,
        &mut reader,
        "a2",
        "transfer.apply",
        json!({ "classId": school.class_id }),
    );
    assert_eq!(e["code"], json!("bad_params"));
    assert_eq!(e["details"]["promotedCount"], json!(1));

    let applied = request_ok(
        &mut stdin,
        &mut reader,
        "a3",
        "transfer.apply",
        json!({ "classId": school.class_id, "targetClassId": target_id }),
    );
    assert_eq!(applied["applied"], json!(true));
    assert_eq!(applied["targetClassId"], json!(target_id));

    assert_eq!(
        class_member_ids(&mut stdin, &mut reader, "m2", &school.class_id),
        vec![weak.clone()]
    );
    assert_eq!(
        class_member_ids(&mut stdin, &mut reader, "m3", &target_id),
        vec![strong.clone()]
    );

    let years = request_ok(&mut stdin, &mut reader, "y3", "schoolYears.list", json!({}));
    let closed = years["schoolYears"]
        .as_array()
        .expect("years")
        .iter()
        .find(|y| y["id"] == json!(school.year_id))
        .expect("seeded year")
        .clone();
    assert_eq!(closed["active"], json!(false));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn promotion_leaves_past_bulletins_untouched() {
    let workspace = temp_dir("bulletind-transfer-history");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school = seed_school(&mut stdin, &mut reader, &[("Sow", "Binta")]);
    let student = school.students[0].clone();
    let art = request_ok(
        &mut stdin,
        &mut reader,
        "art",
        "subjects.create",
        json!({ "levelId": school.level_id, "name": "Dessin", "coefficient": 1 }),
    );
    let art_id = str_field(&art, "subjectId");
    add_grade(&mut stdin, &mut reader, "g1", &student, &school.math_id, 1, "exam", 16.0);
    add_grade(&mut stdin, &mut reader, "g2", &student, &art_id, 1, "quiz", 6.0);

    let old_year = json!({ "studentId": student, "semester": 1, "schoolYearId": school.year_id });
    let before = request_ok(&mut stdin, &mut reader, "p1", "reports.periodReport", old_year.clone());
    // (16 * 4 + 6 * 1) / 5
    assert_eq!(before["report"]["overallAverage"], json!(14.0));

    let next_year = request_ok(
        &mut stdin,
        &mut reader,
        "y2",
        "schoolYears.create",
        json!({ "label": "2025-2026" }),
    );
    let next_level = request_ok(&mut stdin, &mut reader, "l2", "levels.create", json!({ "name": "5e" }));
    let next_level_id = str_field(&next_level, "levelId");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "m5",
        "subjects.create",
        json!({ "levelId": next_level_id, "name": "Maths", "coefficient": 5 }),
    );
    let target = request_ok(
        &mut stdin,
        &mut reader,
        "c2",
        "classes.create",
        json!({
            "name": "5e A",
            "levelId": next_level_id,
            "schoolYearId": str_field(&next_year, "schoolYearId"),
        }),
    );
    let _ = set_rule(&mut stdin, &mut reader, "r1", 10.0, true);
    let applied = request_ok(
        &mut stdin,
        &mut reader,
        "a1",
        "transfer.apply",
        json!({ "classId": school.class_id, "targetClassId": str_field(&target, "classId") }),
    );
    assert_eq!(applied["applied"], json!(true));

    let after = request_ok(&mut stdin, &mut reader, "p2", "reports.periodReport", old_year);
    assert_eq!(after["report"]["overallAverage"], before["report"]["overallAverage"]);
    let subject_ids: Vec<String> = after["report"]["subjects"]
        .as_array()
        .expect("subjects")
        .iter()
        .map(|s| str_field(s, "subjectId"))
        .collect();
    assert_eq!(subject_ids, vec![school.math_id.clone(), art_id.clone()]);

    let annual = request_ok(
        &mut stdin,
        &mut reader,
        "a2",
        "reports.annualReport",
        json!({ "studentId": student, "schoolYearId": school.year_id }),
    );
    assert_eq!(annual["report"]["annualAverage"], json!(14.0));

    let eval = request_ok(
        &mut stdin,
        &mut reader,
        "e1",
        "transfer.evaluate",
        json!({ "studentId": student, "schoolYearId": school.year_id }),
    );
    assert_eq!(eval["annualAverage"], json!(14.0));

    let e = request_err(
        &mut stdin,
        &mut reader,
        "e2",
        "transfer.evaluate",
        json!({ "studentId": student, "schoolYearId": "2052-2053" }),
    );
    assert_eq!(e["code"], json!("not_found"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
