//! Read side of the workspace: loads grades, subjects, students and the
//! current transfer rule, and builds bulletins from them.

use crate::calc::{
    self, AssessmentType, CalcError, GradeRecord, NoteGroups, PeriodReport, SubjectInfo,
};
use crate::transfer::TransferRule;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;

fn query_err(e: rusqlite::Error) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentProfile {
    pub student_id: String,
    pub display_name: String,
    pub class_id: String,
    pub class_name: String,
    pub level_id: String,
    pub school_year_id: String,
    pub status: String,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredTransferRule {
    pub id: String,
    pub created_at: String,
    #[serde(flatten)]
    pub rule: TransferRule,
}

const GRADE_COLUMNS: &str = "id, student_id, course_id, subject_id, school_year_id, semester,
     assessment_type, score, weight, evaluation_date, comment";

type RawGrade = (
    String,
    String,
    String,
    String,
    String,
    i64,
    String,
    f64,
    f64,
    String,
    Option<String>,
);

fn raw_grade(r: &Row<'_>) -> rusqlite::Result<RawGrade> {
    Ok((
        r.get(0)?,
        r.get(1)?,
        r.get(2)?,
        r.get(3)?,
        r.get(4)?,
        r.get(5)?,
        r.get(6)?,
        r.get(7)?,
        r.get(8)?,
        r.get(9)?,
        r.get(10)?,
    ))
}

fn grade_from_raw(raw: RawGrade) -> Result<GradeRecord, CalcError> {
    let (
        id,
        student_id,
        course_id,
        subject_id,
        school_year_id,
        semester,
        kind,
        score,
        weight,
        date,
        comment,
    ) = raw;
    let Some(assessment_type) = AssessmentType::parse(&kind) else {
        return Err(CalcError::new("bad_data", format!("unknown assessment type: {}", kind))
            .with_details(serde_json::json!({ "gradeId": id })));
    };
    let evaluation_date = NaiveDate::parse_from_str(&date, "%Y-%m-%d").map_err(|e| {
        CalcError::new("bad_data", format!("bad evaluation date {:?}: {}", date, e))
            .with_details(serde_json::json!({ "gradeId": id }))
    })?;
    Ok(GradeRecord {
        id,
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
    })
}

fn load_grades(conn: &Connection, filter_column: &str, key: &str) -> Result<Vec<GradeRecord>, CalcError> {
    let sql = format!(
        "SELECT {} FROM grades WHERE {} = ? ORDER BY evaluation_date, id",
        GRADE_COLUMNS, filter_column
    );
    let mut stmt = conn.prepare(&sql).map_err(query_err)?;
    let rows = stmt
        .query_map([key], raw_grade)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    rows.into_iter().map(grade_from_raw).collect()
}

pub fn grades_for_student(conn: &Connection, student_id: &str) -> Result<Vec<GradeRecord>, CalcError> {
    load_grades(conn, "student_id", student_id)
}

pub fn grades_for_course(conn: &Connection, course_id: &str) -> Result<Vec<GradeRecord>, CalcError> {
    load_grades(conn, "course_id", course_id)
}

pub fn grade_by_id(conn: &Connection, grade_id: &str) -> Result<Option<GradeRecord>, CalcError> {
    let sql = format!("SELECT {} FROM grades WHERE id = ?", GRADE_COLUMNS);
    let raw = conn
        .query_row(&sql, [grade_id], raw_grade)
        .optional()
        .map_err(query_err)?;
    raw.map(grade_from_raw).transpose()
}

pub fn subjects_for_level(conn: &Connection, level_id: &str) -> Result<Vec<SubjectInfo>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, coefficient
             FROM subjects
             WHERE level_id = ?
             ORDER BY sort_order, name",
        )
        .map_err(query_err)?;
    let subjects = stmt
        .query_map([level_id], |r| {
            Ok(SubjectInfo {
                subject_id: r.get(0)?,
                name: r.get(1)?,
                coefficient: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(subjects)
}

pub fn active_transfer_rule(conn: &Connection) -> Result<Option<StoredTransferRule>, CalcError> {
    conn.query_row(
        "SELECT id, created_at, minimum_average, required_status, direct_transfer,
                deactivate_year_after_transfer, active
         FROM transfer_rules
         ORDER BY seq DESC
         LIMIT 1",
        [],
        |r| {
            Ok(StoredTransferRule {
                id: r.get(0)?,
                created_at: r.get(1)?,
                rule: TransferRule {
                    minimum_average: r.get(2)?,
                    required_status: r.get(3)?,
                    direct_transfer: r.get::<_, i64>(4)? != 0,
                    deactivate_year_after_transfer: r.get::<_, i64>(5)? != 0,
                    active: r.get::<_, i64>(6)? != 0,
                },
            })
        },
    )
    .optional()
    .map_err(query_err)
}

const PROFILE_SELECT: &str = "SELECT s.id, s.last_name, s.first_name, s.class_id, c.name,
        c.level_id, c.school_year_id, s.status, s.active
     FROM students s
     JOIN classes c ON c.id = s.class_id";

fn profile_row(r: &Row<'_>) -> rusqlite::Result<StudentProfile> {
    let last: String = r.get(1)?;
    let first: String = r.get(2)?;
    Ok(StudentProfile {
        student_id: r.get(0)?,
        display_name: format!("{}, {}", last, first),
        class_id: r.get(3)?,
        class_name: r.get(4)?,
        level_id: r.get(5)?,
        school_year_id: r.get(6)?,
        status: r.get(7)?,
        active: r.get::<_, i64>(8)? != 0,
    })
}

pub fn student_profile(conn: &Connection, student_id: &str) -> Result<StudentProfile, CalcError> {
    let sql = format!("{} WHERE s.id = ?", PROFILE_SELECT);
    conn.query_row(&sql, [student_id], profile_row)
        .optional()
        .map_err(query_err)?
        .ok_or_else(|| CalcError::new("not_found", "student not found"))
}

pub fn class_students(conn: &Connection, class_id: &str) -> Result<Vec<StudentProfile>, CalcError> {
    let sql = format!("{} WHERE s.class_id = ? ORDER BY s.sort_order", PROFILE_SELECT);
    let mut stmt = conn.prepare(&sql).map_err(query_err)?;
    let students = stmt
        .query_map([class_id], profile_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(students)
}

/// The student's current class year plus every year they have grades in,
/// in school-year order.
pub fn student_school_years(
    conn: &Connection,
    profile: &StudentProfile,
) -> Result<Vec<String>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT sy.id
             FROM school_years sy
             WHERE sy.id = ?1
                OR sy.id IN (SELECT DISTINCT g.school_year_id FROM grades g WHERE g.student_id = ?2)
             ORDER BY sy.sort_order",
        )
        .map_err(query_err)?;
    let years = stmt
        .query_map((&profile.school_year_id, &profile.student_id), |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<String>, _>>())
        .map_err(query_err)?;
    Ok(years)
}

/// Subjects the student has grades for in `school_year_id`, whatever level
/// they belong to. Past years keep their own coefficients this way.
pub fn graded_subjects(
    conn: &Connection,
    student_id: &str,
    school_year_id: &str,
) -> Result<Vec<SubjectInfo>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT sub.id, sub.name, sub.coefficient
             FROM subjects sub
             WHERE sub.id IN (
                SELECT DISTINCT g.subject_id
                FROM grades g
                WHERE g.student_id = ?1 AND g.school_year_id = ?2
             )
             ORDER BY sub.sort_order, sub.name",
        )
        .map_err(query_err)?;
    let subjects = stmt
        .query_map((student_id, school_year_id), |r| {
            Ok(SubjectInfo {
                subject_id: r.get(0)?,
                name: r.get(1)?,
                coefficient: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(subjects)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentBulletins {
    pub student: StudentProfile,
    /// Subjects of the student's current level.
    pub subjects: Vec<SubjectInfo>,
    pub groups: NoteGroups,
    pub period_reports: Vec<PeriodReport>,
}

/// Bulletins for every year the student has. The current year is seeded
/// with the current level's subjects; other years only carry the subjects
/// that were graded, each with its own coefficient.
pub fn load_student_bulletins(conn: &Connection, student_id: &str) -> Result<StudentBulletins, CalcError> {
    let student = student_profile(conn, student_id)?;
    let subjects = subjects_for_level(conn, &student.level_id)?;
    let years = student_school_years(conn, &student)?;
    let grades = grades_for_student(conn, student_id)?;

    let mut groups = NoteGroups::new();
    let mut period_reports = Vec::new();
    for year in &years {
        let mut year_subjects = if *year == student.school_year_id {
            subjects.clone()
        } else {
            Vec::new()
        };
        for s in graded_subjects(conn, student_id, year)? {
            if !year_subjects.iter().any(|known| known.subject_id == s.subject_id) {
                year_subjects.push(s);
            }
        }
        let year_grades: Vec<GradeRecord> = grades
            .iter()
            .filter(|g| &g.school_year_id == year)
            .cloned()
            .collect();
        let one_year = std::slice::from_ref(year);
        groups.extend(calc::group_notes(&year_grades, one_year, &year_subjects));
        period_reports.extend(calc::group_notes_by_year(
            student_id,
            &year_grades,
            one_year,
            &year_subjects,
        ));
    }

    Ok(StudentBulletins {
        student,
        subjects,
        groups,
        period_reports,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use std::path::PathBuf;
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

    fn seeded() -> Connection {
        let conn = db::open_db(&temp_dir("bulletind-records")).expect("open");
        conn.execute_batch(
            "INSERT INTO school_years(id, label, active, sort_order) VALUES('y1', '2023-2024', 0, 0);
             INSERT INTO school_years(id, label, active, sort_order) VALUES('y2', '2024-2025', 1, 1);
             INSERT INTO levels(id, name, sort_order) VALUES('l6', '6e', 0);
             INSERT INTO subjects(id, level_id, name, coefficient, sort_order) VALUES('math', 'l6', 'Maths', 4, 0);
             INSERT INTO subjects(id, level_id, name, coefficient, sort_order) VALUES('fr', 'l6', 'Francais', 3, 1);
             INSERT INTO classes(id, name, level_id, school_year_id) VALUES('c6a', '6e A', 'l6', 'y2');
             INSERT INTO students(id, class_id, last_name, first_name, status, active, sort_order)
               VALUES('s1', 'c6a', 'Diallo', 'Awa', 'regular', 1, 0);
             INSERT INTO grades(id, student_id, course_id, subject_id, school_year_id, semester, assessment_type, score, weight, evaluation_date)
               VALUES('g1', 's1', 'math-6a', 'math', 'y2', 1, 'homework1', 12, 1, '2024-10-01');
             INSERT INTO grades(id, student_id, course_id, subject_id, school_year_id, semester, assessment_type, score, weight, evaluation_date)
               VALUES('g2', 's1', 'math-6a', 'math', 'y2', 1, 'homework2', 14, 1, '2024-10-15');
             INSERT INTO grades(id, student_id, course_id, subject_id, school_year_id, semester, assessment_type, score, weight, evaluation_date)
               VALUES('g3', 's1', 'math-6a', 'math', 'y2', 1, 'exam', 16, 1, '2024-12-10');",
        )
        .expect("seed");
        conn
    }

    #[test]
    fn loads_grades_and_profile() {
        let conn = seeded();
        let grades = grades_for_student(&conn, "s1").expect("grades");
        assert_eq!(grades.len(), 3);
        assert_eq!(grades[2].assessment_type, AssessmentType::Exam);
        assert_eq!(grades_for_course(&conn, "math-6a").expect("course").len(), 3);

        let profile = student_profile(&conn, "s1").expect("profile");
        assert_eq!(profile.display_name, "Diallo, Awa");
        assert_eq!(profile.level_id, "l6");
        assert_eq!(student_school_years(&conn, &profile).expect("years"), vec!["y2"]);
    }

    #[test]
    fn missing_student_is_not_found() {
        let conn = seeded();
        let e = student_profile(&conn, "nobody").expect_err("missing");
        assert_eq!(e.code, "not_found");
    }

    #[test]
    fn latest_transfer_rule_wins() {
        let conn = seeded();
        assert!(active_transfer_rule(&conn).expect("rule").is_none());
        conn.execute_batch(
            "INSERT INTO transfer_rules(id, minimum_average, required_status, direct_transfer, deactivate_year_after_transfer, active, created_at)
               VALUES('r1', 10, 'regular', 0, 0, 1, '2024-06-01T00:00:00Z');
             INSERT INTO transfer_rules(id, minimum_average, required_status, direct_transfer, deactivate_year_after_transfer, active, created_at)
               VALUES('r2', 11.5, 'regular', 1, 1, 1, '2024-06-02T00:00:00Z');",
        )
        .expect("rules");
        let rule = active_transfer_rule(&conn).expect("rule").expect("some");
        assert_eq!(rule.id, "r2");
        assert_eq!(rule.rule.minimum_average, 11.5);
        assert!(rule.rule.direct_transfer);
    }

    #[test]
    fn bulletins_cover_every_applicable_subject() {
        let conn = seeded();
        let b = load_student_bulletins(&conn, "s1").expect("bulletins");
        assert_eq!(b.period_reports.len(), 2);
        let s1 = &b.period_reports[0];
        assert_eq!(s1.overall_average, Some(14.5));
        assert_eq!(s1.subjects.len(), 2);
        assert_eq!(s1.subjects[1].subject_id, "fr");
        assert_eq!(s1.subjects[1].average, None);
        assert_eq!(b.period_reports[1].overall_average, None);
    }

    #[test]
    fn past_year_keeps_its_coefficients_after_class_change() {
        let conn = seeded();
        conn.execute_batch(
            "INSERT INTO subjects(id, level_id, name, coefficient, sort_order) VALUES('art', 'l6', 'Dessin', 1, 2);
             INSERT INTO grades(id, student_id, course_id, subject_id, school_year_id, semester, assessment_type, score, weight, evaluation_date)
               VALUES('g4', 's1', 'art-6a', 'art', 'y2', 1, 'quiz', 6, 1, '2024-11-05');",
        )
        .expect("art");
        let before = load_student_bulletins(&conn, "s1").expect("before");
        let y2_before = before.period_reports[0].clone();
        // (14.5 * 4 + 6 * 1) / 5
        assert_eq!(y2_before.overall_average, Some(12.8));

        conn.execute_batch(
            "INSERT INTO school_years(id, label, active, sort_order) VALUES('y3', '2025-2026', 1, 2);
             INSERT INTO levels(id, name, sort_order) VALUES('l5', '5e', 1);
             INSERT INTO subjects(id, level_id, name, coefficient, sort_order) VALUES('math5', 'l5', 'Maths', 2, 0);
             INSERT INTO classes(id, name, level_id, school_year_id) VALUES('c5a', '5e A', 'l5', 'y3');
             UPDATE students SET class_id = 'c5a' WHERE id = 's1';",
        )
        .expect("promote");
        let after = load_student_bulletins(&conn, "s1").expect("after");
        assert_eq!(after.subjects[0].subject_id, "math5");

        let y2_after = after
            .period_reports
            .iter()
            .find(|p| p.school_year_id == "y2" && p.semester == 1)
            .expect("y2 semester 1");
        assert_eq!(y2_after.overall_average, y2_before.overall_average);
        let ids: Vec<&str> = y2_after.subjects.iter().map(|s| s.subject_id.as_str()).collect();
        assert_eq!(ids, vec!["math", "art"]);
        assert!(!after.groups["y2"][&1].contains_key("math5"));

        let y3 = after
            .period_reports
            .iter()
            .find(|p| p.school_year_id == "y3" && p.semester == 1)
            .expect("y3 seeded");
        assert_eq!(y3.subjects.len(), 1);
        assert_eq!(y3.overall_average, None);
    }

    #[test]
    fn corrupt_assessment_type_is_reported() {
        let conn = seeded();
        conn.execute(
            "UPDATE grades SET assessment_type = 'oral' WHERE id = 'g1'",
            [],
        )
        .expect("update");
        let e = grades_for_student(&conn, "s1").expect_err("bad data");
        assert_eq!(e.code, "bad_data");
    }
}
