use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const SCORES_BULK_UPDATE_MAX_EDITS: usize = 5000;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

#[derive(Debug, Clone)]
struct SlotRef {
    slot: String,
    idx: i64,
}

/// Validates a slot reference against the term's insumo block. Summative slots
/// take no index; insumo cells must address an in-range column.
fn resolve_slot(
    obj: &serde_json::Value,
    insumos_count: i64,
) -> Result<SlotRef, HandlerErr> {
    let slot = obj
        .get("slot")
        .and_then(|v| v.as_str())
        .map(|s| s.to_ascii_lowercase())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing slot".to_string(),
            details: None,
        })?;
    let idx = obj.get("idx").and_then(|v| v.as_i64()).unwrap_or(0);

    match slot.as_str() {
        "insumo" => {
            if !(0..insumos_count).contains(&idx) {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: "insumo idx out of range for this term".to_string(),
                    details: Some(json!({ "idx": idx, "insumosCount": insumos_count })),
                });
            }
        }
        "project" | "exam" | "remediation" | "improvement" => {
            if idx != 0 {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: format!("{} takes no idx", slot),
                    details: Some(json!({ "idx": idx })),
                });
            }
        }
        other => {
            return Err(HandlerErr {
                code: "bad_params",
                message: "slot must be one of: insumo, project, exam, remediation, improvement"
                    .to_string(),
                details: Some(json!({ "slot": other })),
            });
        }
    }

    Ok(SlotRef { slot, idx })
}

/// A score cell accepts a JSON number, a text entry (comma decimal allowed), or
/// null to clear. Numbers are clamped to [0,10] at this boundary; a non-numeric,
/// non-empty text entry is rejected rather than silently cleared.
fn resolve_score_value(value: Option<&serde_json::Value>) -> Result<Option<f64>, HandlerErr> {
    let Some(v) = value else {
        return Ok(None);
    };
    if v.is_null() {
        return Ok(None);
    }
    if let Some(n) = v.as_f64() {
        if !n.is_finite() {
            return Err(HandlerErr {
                code: "bad_params",
                message: "value must be a finite number".to_string(),
                details: None,
            });
        }
        return Ok(Some(calc::clamp_score(n)));
    }
    if let Some(s) = v.as_str() {
        if s.trim().is_empty() {
            return Ok(None);
        }
        return match calc::parse_score(s) {
            Some(n) => Ok(Some(n)),
            None => Err(HandlerErr {
                code: "bad_params",
                message: "value is not a numeric score".to_string(),
                details: Some(json!({ "value": s })),
            }),
        };
    }
    Err(HandlerErr {
        code: "bad_params",
        message: "value must be a number, string, or null".to_string(),
        details: None,
    })
}

fn term_insumos_count(
    conn: &Connection,
    class_id: &str,
    term_id: &str,
) -> Result<Option<i64>, HandlerErr> {
    conn.query_row(
        "SELECT insumos_count FROM terms WHERE id = ? AND class_id = ?",
        (term_id, class_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn student_in_class(
    conn: &Connection,
    class_id: &str,
    student_id: &str,
) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM students WHERE id = ? AND class_id = ?",
        (student_id, class_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

/// Writes or clears one cell. Clearing deletes the row: absence is the only
/// representation of "not yet graded".
fn write_score(
    conn: &Connection,
    term_id: &str,
    student_id: &str,
    slot: &SlotRef,
    value: Option<f64>,
) -> Result<(), HandlerErr> {
    match value {
        Some(v) => {
            let score_id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO scores(id, term_id, student_id, slot, idx, value, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(term_id, student_id, slot, idx) DO UPDATE SET
                   value = excluded.value,
                   updated_at = excluded.updated_at",
                (
                    &score_id,
                    term_id,
                    student_id,
                    &slot.slot,
                    slot.idx,
                    v,
                    Utc::now().to_rfc3339(),
                ),
            )
            .map_err(|e| HandlerErr {
                code: "db_insert_failed",
                message: e.to_string(),
                details: Some(json!({ "table": "scores" })),
            })?;
        }
        None => {
            conn.execute(
                "DELETE FROM scores WHERE term_id = ? AND student_id = ? AND slot = ? AND idx = ?",
                (term_id, student_id, &slot.slot, slot.idx),
            )
            .map_err(|e| HandlerErr {
                code: "db_delete_failed",
                message: e.to_string(),
                details: Some(json!({ "table": "scores" })),
            })?;
        }
    }
    Ok(())
}

fn handle_scores_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match get_required_str(&req.params, "classId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let term_id = match get_required_str(&req.params, "termId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let insumos_count = match term_insumos_count(conn, &class_id, &term_id) {
        Ok(Some(v)) => v.max(0) as usize,
        Ok(None) => return err(&req.id, "not_found", "term not found", None),
        Err(e) => return e.response(&req.id),
    };

    let mut scores = match calc::load_term_scores(conn, &term_id, insumos_count) {
        Ok(v) => v,
        Err(e) => {
            let calc::CalcError {
                code,
                message,
                details,
            } = e;
            return err(&req.id, &code, message, details);
        }
    };

    let mut stmt = match conn.prepare(
        "SELECT id, last_name, first_name, active, sort_order
         FROM students
         WHERE class_id = ?
         ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let roster = stmt
        .query_map([&class_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)? != 0,
                r.get::<_, i64>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let roster = match roster {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows: Vec<serde_json::Value> = roster
        .into_iter()
        .map(|(id, last, first, active, sort_order)| {
            let raw = scores.remove(&id).unwrap_or_else(|| calc::RawScores {
                insumos: vec![None; insumos_count],
                ..calc::RawScores::default()
            });
            json!({
                "studentId": id,
                "displayName": format!("{}, {}", last, first),
                "active": active,
                "sortOrder": sort_order,
                "insumos": raw.insumos,
                "project": raw.project,
                "exam": raw.exam,
                "remediation": raw.remediation,
                "improvement": raw.improvement
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "termId": term_id,
            "insumosCount": insumos_count,
            "students": rows
        }),
    )
}

fn handle_scores_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match get_required_str(&req.params, "classId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let term_id = match get_required_str(&req.params, "termId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let student_id = match get_required_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let insumos_count = match term_insumos_count(conn, &class_id, &term_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "term not found", None),
        Err(e) => return e.response(&req.id),
    };
    match student_in_class(conn, &class_id, &student_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return e.response(&req.id),
    }

    let slot = match resolve_slot(&req.params, insumos_count) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let value = match resolve_score_value(req.params.get("value")) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    if let Err(e) = write_score(conn, &term_id, &student_id, &slot, value) {
        return e.response(&req.id);
    }

    ok(&req.id, json!({ "ok": true, "value": value }))
}

fn handle_scores_bulk_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match get_required_str(&req.params, "classId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let term_id = match get_required_str(&req.params, "termId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(edits_arr) = req.params.get("edits").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing edits[]", None);
    };

    if edits_arr.len() > SCORES_BULK_UPDATE_MAX_EDITS {
        let rejected = edits_arr.len();
        return ok(
            &req.id,
            json!({
                "ok": true,
                "updated": 0,
                "rejected": rejected,
                "limitExceeded": true,
                "errors": [{
                    "index": -1,
                    "code": "too_many_edits",
                    "message": format!(
                        "bulk payload exceeds max edits: {} > {}",
                        rejected, SCORES_BULK_UPDATE_MAX_EDITS
                    )
                }]
            }),
        );
    }

    let insumos_count = match term_insumos_count(conn, &class_id, &term_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "term not found", None),
        Err(e) => return e.response(&req.id),
    };

    let mut updated: usize = 0;
    let mut errors: Vec<serde_json::Value> = Vec::new();

    for (i, edit) in edits_arr.iter().enumerate() {
        let Some(obj) = edit.as_object() else {
            errors.push(json!({
                "index": i,
                "code": "bad_params",
                "message": format!("edit at index {} must be an object", i),
            }));
            continue;
        };

        let student_id = match obj.get("studentId").and_then(|v| v.as_str()) {
            Some(v) => v.to_string(),
            None => {
                errors.push(json!({
                    "index": i,
                    "code": "bad_params",
                    "message": format!("edit at index {} missing studentId", i),
                }));
                continue;
            }
        };

        match student_in_class(conn, &class_id, &student_id) {
            Ok(true) => {}
            Ok(false) => {
                errors.push(json!({
                    "index": i,
                    "code": "not_found",
                    "message": "student not found",
                }));
                continue;
            }
            Err(e) => {
                errors.push(json!({
                    "index": i,
                    "code": e.code,
                    "message": e.message,
                }));
                continue;
            }
        }

        let slot = match resolve_slot(edit, insumos_count) {
            Ok(v) => v,
            Err(e) => {
                errors.push(json!({
                    "index": i,
                    "code": e.code,
                    "message": e.message,
                }));
                continue;
            }
        };
        let value = match resolve_score_value(obj.get("value")) {
            Ok(v) => v,
            Err(e) => {
                errors.push(json!({
                    "index": i,
                    "code": e.code,
                    "message": e.message,
                }));
                continue;
            }
        };

        match write_score(conn, &term_id, &student_id, &slot, value) {
            Ok(()) => updated += 1,
            Err(e) => errors.push(json!({
                "index": i,
                "code": e.code,
                "message": e.message,
            })),
        }
    }

    let rejected = errors.len();
    let mut result = json!({ "ok": true, "updated": updated });
    if rejected > 0 {
        result
            .as_object_mut()
            .expect("result should be object")
            .insert("rejected".into(), json!(rejected));
        result
            .as_object_mut()
            .expect("result should be object")
            .insert("errors".into(), json!(errors));
    }

    ok(&req.id, result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scores.get" => Some(handle_scores_get(state, req)),
        "scores.update" => Some(handle_scores_update(state, req)),
        "scores.bulkUpdate" => Some(handle_scores_bulk_update(state, req)),
        _ => None,
    }
}
