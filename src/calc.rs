use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;

pub const FORMATIVE_WEIGHT: f64 = 0.70;
pub const PROJECT_WEIGHT: f64 = 0.15;
pub const EXAM_WEIGHT: f64 = 0.15;

/// Exam relief never lifts a grade past this mark; an exam already at or above
/// it is taken as-is.
pub const EXAM_RELIEF_CAP: f64 = 9.0;

pub const SCORE_MIN: f64 = 0.0;
pub const SCORE_MAX: f64 = 10.0;

pub fn clamp_score(v: f64) -> f64 {
    v.clamp(SCORE_MIN, SCORE_MAX)
}

/// Text-entry parsing for score cells. Comma is accepted as the decimal
/// separator; anything non-numeric means "not graded".
pub fn parse_score(raw: &str) -> Option<f64> {
    let t = raw.trim();
    if t.is_empty() {
        return None;
    }
    t.replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(clamp_score)
}

/// One student's raw scores for one evaluation term. Absent means not yet
/// graded; present values are clamped to [0,10] on the way in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawScores {
    pub insumos: Vec<Option<f64>>,
    pub project: Option<f64>,
    pub exam: Option<f64>,
    pub remediation: Option<f64>,
    pub improvement: Option<f64>,
}

impl RawScores {
    /// Adapter for the positional layout: `insumos_count` insumo slots followed
    /// by project, exam, remediation, improvement. Slots past the end of the
    /// sequence read as absent.
    #[allow(dead_code)]
    pub fn from_slots(slots: &[Option<f64>], insumos_count: usize) -> Self {
        let slot = |i: usize| slots.get(i).copied().flatten().map(clamp_score);
        RawScores {
            insumos: (0..insumos_count).map(slot).collect(),
            project: slot(insumos_count),
            exam: slot(insumos_count + 1),
            remediation: slot(insumos_count + 2),
            improvement: slot(insumos_count + 3),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedGrades {
    pub formative_average: Option<f64>,
    pub enhanced_exam: Option<f64>,
    pub formative_weighted: Option<f64>,
    pub summative_weighted: Option<f64>,
    pub final_average: Option<f64>,
    pub qualitative: Option<String>,
    pub qualitative_band: Option<String>,
}

pub fn formative_average(insumos: &[Option<f64>]) -> Option<f64> {
    let mut sum = 0.0_f64;
    let mut count = 0_usize;
    for v in insumos.iter().flatten() {
        sum += clamp_score(*v);
        count += 1;
    }
    if count == 0 {
        None
    } else {
        Some(clamp_score(sum / count as f64))
    }
}

/// Exam grade after remediation/improvement relief. Without an exam there is
/// nothing to relieve. Relief never lowers the raw exam and never reaches past
/// the cap.
pub fn enhanced_exam(
    exam: Option<f64>,
    remediation: Option<f64>,
    improvement: Option<f64>,
) -> Option<f64> {
    let exam = clamp_score(exam?);
    if exam >= EXAM_RELIEF_CAP {
        return Some(exam);
    }
    let mut sum = exam;
    let mut count = 1_usize;
    for v in [remediation, improvement].into_iter().flatten() {
        sum += clamp_score(v);
        count += 1;
    }
    let mean = sum / count as f64;
    Some(EXAM_RELIEF_CAP.min(exam.max(mean)))
}

/// Fine letter scale over the rounded final average. The clamp invariant keeps
/// inputs in 0..=10; everything at 1 or below collapses to the bottom letter.
fn letter_fine(rounded: i64) -> &'static str {
    match rounded {
        10 => "A+",
        9 => "A-",
        8 => "B+",
        7 => "B-",
        6 => "C+",
        5 => "C-",
        4 => "D+",
        3 => "D-",
        2 => "E+",
        _ => "E-",
    }
}

/// Coarse five-band scale. A rounded value outside 1..=10 has no band.
fn letter_band(rounded: i64) -> Option<&'static str> {
    match rounded {
        9 | 10 => Some("A"),
        7 | 8 => Some("B"),
        5 | 6 => Some("C"),
        3 | 4 => Some("D"),
        1 | 2 => Some("E"),
        _ => None,
    }
}

/// Recomputes every derived field from raw scores. Missing inputs propagate as
/// None; nothing here errors or panics.
pub fn derive(raw: &RawScores) -> DerivedGrades {
    let formative_average = formative_average(&raw.insumos);
    let enhanced = enhanced_exam(raw.exam, raw.remediation, raw.improvement);

    let formative_weighted = formative_average.map(|a| a * FORMATIVE_WEIGHT);
    let project_part = raw.project.map(|p| clamp_score(p) * PROJECT_WEIGHT);
    let exam_part = enhanced.map(|e| e * EXAM_WEIGHT);
    let summative_weighted = match (project_part, exam_part) {
        (None, None) => None,
        (p, e) => Some(clamp_score(p.unwrap_or(0.0) + e.unwrap_or(0.0))),
    };

    let final_average = match (formative_weighted, summative_weighted) {
        (Some(f), Some(s)) => Some(clamp_score(f + s)),
        _ => None,
    };

    let rounded = final_average.map(|v| v.round() as i64);
    DerivedGrades {
        formative_average,
        enhanced_exam: enhanced,
        formative_weighted,
        summative_weighted,
        final_average,
        qualitative: rounded.map(|r| letter_fine(r).to_string()),
        qualitative_band: rounded.and_then(letter_band).map(|s| s.to_string()),
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
}

#[derive(Debug, Clone)]
pub struct CalcContext<'a> {
    pub conn: &'a Connection,
    pub class_id: &'a str,
    pub term_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassSummary {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TermInfo {
    pub id: String,
    pub name: String,
    pub insumos_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawScoresModel {
    pub insumos: Vec<Option<f64>>,
    pub project: Option<f64>,
    pub exam: Option<f64>,
    pub remediation: Option<f64>,
    pub improvement: Option<f64>,
}

impl From<&RawScores> for RawScoresModel {
    fn from(raw: &RawScores) -> Self {
        RawScoresModel {
            insumos: raw.insumos.clone(),
            project: raw.project,
            exam: raw.exam,
            remediation: raw.remediation,
            improvement: raw.improvement,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentDerived {
    pub student_id: String,
    pub display_name: String,
    pub sort_order: i64,
    pub active: bool,
    pub raw: RawScoresModel,
    pub derived: DerivedGrades,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TermSummary {
    pub class: ClassSummary,
    pub term: TermInfo,
    pub per_student: Vec<StudentDerived>,
    /// Mean of final averages over active students that have one.
    pub class_final_average: Option<f64>,
}

#[derive(Debug, Clone)]
struct RosterStudent {
    id: String,
    display_name: String,
    sort_order: i64,
    active: bool,
}

fn load_roster(conn: &Connection, class_id: &str) -> Result<Vec<RosterStudent>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, sort_order, active
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    stmt.query_map([class_id], |r| {
        let last: String = r.get(1)?;
        let first: String = r.get(2)?;
        Ok(RosterStudent {
            id: r.get(0)?,
            display_name: format!("{}, {}", last, first),
            sort_order: r.get(3)?,
            active: r.get::<_, i64>(4)? != 0,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| CalcError::new("db_query_failed", e.to_string()))
}

/// Loads every stored score for the term, keyed by student. Rows with an
/// unknown slot name or an out-of-range insumo index are skipped rather than
/// failing the whole summary.
pub fn load_term_scores(
    conn: &Connection,
    term_id: &str,
    insumos_count: usize,
) -> Result<HashMap<String, RawScores>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT student_id, slot, idx, value
             FROM scores
             WHERE term_id = ?",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let rows = stmt
        .query_map([term_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, f64>(3)?,
            ))
        })
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let mut by_student: HashMap<String, RawScores> = HashMap::new();
    for row in rows {
        let (student_id, slot, idx, value) =
            row.map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
        let entry = by_student.entry(student_id).or_insert_with(|| RawScores {
            insumos: vec![None; insumos_count],
            ..RawScores::default()
        });
        let value = clamp_score(value);
        match slot.as_str() {
            "insumo" => {
                if idx >= 0 && (idx as usize) < insumos_count {
                    entry.insumos[idx as usize] = Some(value);
                }
            }
            "project" => entry.project = Some(value),
            "exam" => entry.exam = Some(value),
            "remediation" => entry.remediation = Some(value),
            "improvement" => entry.improvement = Some(value),
            _ => {}
        }
    }
    Ok(by_student)
}

pub fn load_term_info(ctx: &CalcContext<'_>) -> Result<TermInfo, CalcError> {
    let row: Option<(String, i64)> = ctx
        .conn
        .query_row(
            "SELECT name, insumos_count FROM terms WHERE id = ? AND class_id = ?",
            (ctx.term_id, ctx.class_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let Some((name, insumos_count)) = row else {
        return Err(CalcError::new("not_found", "term not found"));
    };
    Ok(TermInfo {
        id: ctx.term_id.to_string(),
        name,
        insumos_count: insumos_count.max(0) as usize,
    })
}

/// Full derived-grade summary for one class + term. Derived fields are always
/// recomputed from the stored raw scores; they are never read back from disk.
pub fn compute_term_summary(ctx: &CalcContext<'_>) -> Result<TermSummary, CalcError> {
    let class_name: Option<String> = ctx
        .conn
        .query_row("SELECT name FROM classes WHERE id = ?", [ctx.class_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let Some(class_name) = class_name else {
        return Err(CalcError::new("not_found", "class not found"));
    };

    let term = load_term_info(ctx)?;
    let roster = load_roster(ctx.conn, ctx.class_id)?;
    let mut scores = load_term_scores(ctx.conn, ctx.term_id, term.insumos_count)?;

    let mut per_student = Vec::with_capacity(roster.len());
    let mut final_sum = 0.0_f64;
    let mut final_count = 0_usize;
    for s in roster {
        let raw = scores.remove(&s.id).unwrap_or_else(|| RawScores {
            insumos: vec![None; term.insumos_count],
            ..RawScores::default()
        });
        let derived = derive(&raw);
        if s.active {
            if let Some(fa) = derived.final_average {
                final_sum += fa;
                final_count += 1;
            }
        }
        per_student.push(StudentDerived {
            student_id: s.id,
            display_name: s.display_name,
            sort_order: s.sort_order,
            active: s.active,
            raw: RawScoresModel::from(&raw),
            derived,
        });
    }

    let class_final_average = if final_count > 0 {
        Some(clamp_score(final_sum / final_count as f64))
    } else {
        None
    };

    Ok(TermSummary {
        class: ClassSummary {
            id: ctx.class_id.to_string(),
            name: class_name,
        },
        term,
        per_student,
        class_final_average,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "expected {}, got {}", b, a);
    }

    #[test]
    fn parse_score_accepts_comma_decimal() {
        assert_eq!(parse_score("7,5"), Some(7.5));
        assert_eq!(parse_score(" 8.25 "), Some(8.25));
        assert_eq!(parse_score("diez"), None);
        assert_eq!(parse_score(""), None);
        assert_eq!(parse_score("12"), Some(10.0));
        assert_eq!(parse_score("-3,0"), Some(0.0));
    }

    #[test]
    fn formative_average_ignores_absent_slots() {
        assert_eq!(formative_average(&[None, None, None]), None);
        assert_eq!(formative_average(&[None, Some(7.0), None]), Some(7.0));
        approx(
            formative_average(&[Some(6.0), Some(8.0), None, Some(10.0)]).unwrap(),
            8.0,
        );
    }

    #[test]
    fn formative_average_clamps_out_of_range_values() {
        approx(formative_average(&[Some(15.0), Some(5.0)]).unwrap(), 7.5);
    }

    #[test]
    fn enhanced_exam_requires_an_exam() {
        assert_eq!(enhanced_exam(None, Some(9.0), Some(9.0)), None);
    }

    #[test]
    fn enhanced_exam_short_circuits_at_nine() {
        assert_eq!(enhanced_exam(Some(9.5), Some(1.0), Some(1.0)), Some(9.5));
        assert_eq!(enhanced_exam(Some(9.0), None, Some(0.0)), Some(9.0));
    }

    #[test]
    fn enhanced_exam_averages_relief_scores() {
        // mean(5.0, 8.0) = 6.5, above the raw exam and below the cap
        approx(enhanced_exam(Some(5.0), Some(8.0), None).unwrap(), 6.5);
        // mean(8.5, 10, 10) = 9.5 hits the cap
        approx(
            enhanced_exam(Some(8.5), Some(10.0), Some(10.0)).unwrap(),
            9.0,
        );
        // relief never drags the exam down
        approx(enhanced_exam(Some(6.0), Some(1.0), Some(1.0)).unwrap(), 6.0);
    }

    #[test]
    fn derive_weights_formative_and_summative() {
        let raw = RawScores {
            insumos: vec![Some(8.0); 10],
            project: Some(9.0),
            exam: Some(10.0),
            remediation: None,
            improvement: None,
        };
        let d = derive(&raw);
        approx(d.formative_average.unwrap(), 8.0);
        approx(d.formative_weighted.unwrap(), 5.6);
        approx(d.enhanced_exam.unwrap(), 10.0);
        approx(d.summative_weighted.unwrap(), 2.85);
        approx(d.final_average.unwrap(), 8.45);
        assert_eq!(d.qualitative.as_deref(), Some("B+"));
        assert_eq!(d.qualitative_band.as_deref(), Some("B"));
    }

    #[test]
    fn derive_propagates_missing_inputs_as_null() {
        let d = derive(&RawScores::default());
        assert_eq!(d, DerivedGrades::default());

        // Formative present but no summative input at all: no final average.
        let d = derive(&RawScores {
            insumos: vec![Some(7.0)],
            ..RawScores::default()
        });
        approx(d.formative_average.unwrap(), 7.0);
        assert_eq!(d.summative_weighted, None);
        assert_eq!(d.final_average, None);
        assert_eq!(d.qualitative, None);

        // Project alone is enough for a summative composite.
        let d = derive(&RawScores {
            insumos: vec![Some(7.0)],
            project: Some(8.0),
            ..RawScores::default()
        });
        approx(d.summative_weighted.unwrap(), 1.2);
        approx(d.final_average.unwrap(), 6.1);
    }

    #[test]
    fn derived_fields_stay_in_range() {
        let raw = RawScores {
            insumos: vec![Some(10.0); 4],
            project: Some(10.0),
            exam: Some(10.0),
            remediation: Some(10.0),
            improvement: Some(10.0),
        };
        let d = derive(&raw);
        for v in [
            d.formative_average,
            d.enhanced_exam,
            d.formative_weighted,
            d.summative_weighted,
            d.final_average,
        ]
        .into_iter()
        .flatten()
        {
            assert!((SCORE_MIN..=SCORE_MAX).contains(&v), "out of range: {}", v);
        }
        approx(d.final_average.unwrap(), 10.0);
        assert_eq!(d.qualitative.as_deref(), Some("A+"));
        assert_eq!(d.qualitative_band.as_deref(), Some("A"));
    }

    #[test]
    fn letter_tables_cover_the_scale() {
        let cases = [
            (10, "A+", Some("A")),
            (9, "A-", Some("A")),
            (8, "B+", Some("B")),
            (7, "B-", Some("B")),
            (6, "C+", Some("C")),
            (5, "C-", Some("C")),
            (4, "D+", Some("D")),
            (3, "D-", Some("D")),
            (2, "E+", Some("E")),
            (1, "E-", Some("E")),
        ];
        for (r, fine, band) in cases {
            assert_eq!(letter_fine(r), fine);
            assert_eq!(letter_band(r), band);
        }
        // Below 0.5 the final rounds to 0: the fine scale bottoms out, the
        // coarse scale has no band.
        assert_eq!(letter_fine(0), "E-");
        assert_eq!(letter_band(0), None);
    }

    #[test]
    fn qualitative_band_is_null_when_final_rounds_to_zero() {
        let raw = RawScores {
            insumos: vec![Some(0.0)],
            project: Some(0.5),
            exam: None,
            remediation: None,
            improvement: None,
        };
        let d = derive(&raw);
        approx(d.final_average.unwrap(), 0.075);
        assert_eq!(d.qualitative.as_deref(), Some("E-"));
        assert_eq!(d.qualitative_band, None);
    }

    #[test]
    fn from_slots_matches_positional_layout() {
        let slots = vec![
            Some(6.0),
            None,
            Some(9.0), // insumos 0..3
            Some(8.0), // project
            Some(5.0), // exam
            Some(7.0), // remediation
            None,      // improvement
        ];
        let raw = RawScores::from_slots(&slots, 3);
        assert_eq!(raw.insumos, vec![Some(6.0), None, Some(9.0)]);
        assert_eq!(raw.project, Some(8.0));
        assert_eq!(raw.exam, Some(5.0));
        assert_eq!(raw.remediation, Some(7.0));
        assert_eq!(raw.improvement, None);

        // Short sequences read as not-yet-graded, never out of bounds.
        let raw = RawScores::from_slots(&[Some(4.0)], 3);
        assert_eq!(raw.insumos, vec![Some(4.0), None, None]);
        assert_eq!(raw.exam, None);
    }

    #[test]
    fn derive_is_idempotent() {
        let raw = RawScores {
            insumos: vec![Some(7.5), Some(8.0), None],
            project: Some(6.0),
            exam: Some(5.0),
            remediation: Some(8.0),
            improvement: None,
        };
        assert_eq!(derive(&raw), derive(&raw));
    }
}
