use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn calc_error_response(id: &str, e: calc::CalcError) -> serde_json::Value {
    let calc::CalcError {
        code,
        message,
        details,
    } = e;
    err(id, &code, message, details)
}

fn handle_term_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let term_id = match req.params.get("termId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing termId", None),
    };

    let ctx = calc::CalcContext {
        conn,
        class_id: &class_id,
        term_id: &term_id,
    };
    match calc::compute_term_summary(&ctx) {
        Ok(summary) => match serde_json::to_value(&summary) {
            Ok(v) => ok(&req.id, v),
            Err(e) => err(&req.id, "serialize_failed", e.to_string(), None),
        },
        Err(e) => calc_error_response(&req.id, e),
    }
}

fn handle_student_derived(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let term_id = match req.params.get("termId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing termId", None),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    let ctx = calc::CalcContext {
        conn,
        class_id: &class_id,
        term_id: &term_id,
    };
    let summary = match calc::compute_term_summary(&ctx) {
        Ok(v) => v,
        Err(e) => return calc_error_response(&req.id, e),
    };

    let Some(row) = summary
        .per_student
        .into_iter()
        .find(|s| s.student_id == student_id)
    else {
        return err(&req.id, "not_found", "student not found", None);
    };

    match serde_json::to_value(&row) {
        Ok(v) => ok(&req.id, v),
        Err(e) => err(&req.id, "serialize_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "calc.termSummary" => Some(handle_term_summary(state, req)),
        "calc.studentDerived" => Some(handle_student_derived(state, req)),
        _ => None,
    }
}
