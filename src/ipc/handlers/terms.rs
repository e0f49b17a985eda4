use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const TERM_MAX_INSUMOS: i64 = 50;

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

fn validate_insumos_count(v: i64) -> Result<i64, HandlerErr> {
    if !(1..=TERM_MAX_INSUMOS).contains(&v) {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("insumosCount must be between 1 and {}", TERM_MAX_INSUMOS),
            details: Some(json!({ "insumosCount": v })),
        });
    }
    Ok(v)
}

fn class_exists(conn: &Connection, class_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
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

fn handle_terms_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match get_required_str(&req.params, "classId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, name, insumos_count, sort_order
         FROM terms
         WHERE class_id = ?
         ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&class_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "insumosCount": r.get::<_, i64>(2)?,
                "sortOrder": r.get::<_, i64>(3)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(terms) => ok(&req.id, json!({ "terms": terms })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_terms_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match get_required_str(&req.params, "classId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let name = match get_required_str(&req.params, "name") {
        Ok(v) => v.trim().to_string(),
        Err(e) => return e.response(&req.id),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let insumos_count = match req.params.get("insumosCount").and_then(|v| v.as_i64()) {
        Some(v) => match validate_insumos_count(v) {
            Ok(v) => v,
            Err(e) => return e.response(&req.id),
        },
        None => return err(&req.id, "bad_params", "missing insumosCount", None),
    };

    match class_exists(conn, &class_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return e.response(&req.id),
    }

    let next_order: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM terms WHERE class_id = ?",
        [&class_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let term_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO terms(id, class_id, name, insumos_count, sort_order)
         VALUES(?, ?, ?, ?, ?)",
        (&term_id, &class_id, &name, insumos_count, next_order),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "terms" })),
        );
    }

    ok(
        &req.id,
        json!({ "termId": term_id, "insumosCount": insumos_count }),
    )
}

fn handle_terms_update(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
    };

    let old_count = match term_insumos_count(conn, &class_id, &term_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "term not found", None),
        Err(e) => return e.response(&req.id),
    };

    let new_name = match patch.get("name") {
        None => None,
        Some(v) => match v.as_str().map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => Some(s.to_string()),
            None => return err(&req.id, "bad_params", "name must be a non-empty string", None),
        },
    };
    let new_count = match patch.get("insumosCount") {
        None => None,
        Some(v) => match v.as_i64().map(validate_insumos_count) {
            Some(Ok(n)) => Some(n),
            Some(Err(e)) => return e.response(&req.id),
            None => return err(&req.id, "bad_params", "insumosCount must be an integer", None),
        },
    };

    if new_name.is_none() && new_count.is_none() {
        return err(&req.id, "bad_params", "patch has no supported fields", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Some(name) = &new_name {
        if let Err(e) = tx.execute(
            "UPDATE terms SET name = ? WHERE id = ?",
            (name, &term_id),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    let mut pruned = 0_usize;
    if let Some(count) = new_count {
        if let Err(e) = tx.execute(
            "UPDATE terms SET insumos_count = ? WHERE id = ?",
            (count, &term_id),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
        // Shrinking the insumo block orphans the trailing cells; drop them so
        // the formative average only ever sees in-range slots.
        if count < old_count {
            match tx.execute(
                "DELETE FROM scores WHERE term_id = ? AND slot = 'insumo' AND idx >= ?",
                (&term_id, count),
            ) {
                Ok(n) => pruned = n,
                Err(e) => {
                    let _ = tx.rollback();
                    return err(&req.id, "db_delete_failed", e.to_string(), None);
                }
            }
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true, "prunedScores": pruned }))
}

fn handle_terms_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    match term_insumos_count(conn, &class_id, &term_id) {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "term not found", None),
        Err(e) => return e.response(&req.id),
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("DELETE FROM scores WHERE term_id = ?", [&term_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "scores" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM terms WHERE id = ?", [&term_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "terms" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "terms.list" => Some(handle_terms_list(state, req)),
        "terms.create" => Some(handle_terms_create(state, req)),
        "terms.update" => Some(handle_terms_update(state, req)),
        "terms.delete" => Some(handle_terms_delete(state, req)),
        _ => None,
    }
}
