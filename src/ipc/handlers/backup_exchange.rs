use crate::backup;
use crate::calc;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;

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

fn get_required_path(params: &serde_json::Value, key: &str) -> Result<PathBuf, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn csv_opt(v: Option<f64>) -> String {
    v.map(|n| format!("{}", n)).unwrap_or_default()
}

fn handle_export_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let workspace_path = match get_required_path(&req.params, "workspacePath") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let out_path = match get_required_path(&req.params, "outPath") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    // Flush any pending writes so the bundle sees a consistent file.
    if state.workspace.as_deref() == Some(workspace_path.as_path()) {
        state.db = None;
    }

    let result = backup::export_workspace_bundle(&workspace_path, &out_path);

    if state.workspace.as_deref() == Some(workspace_path.as_path()) {
        match db::open_db(&workspace_path) {
            Ok(conn) => state.db = Some(conn),
            Err(e) => return err(&req.id, "db_open_failed", format!("{e:?}"), None),
        }
    }

    match result {
        Ok(summary) => ok(
            &req.id,
            json!({
                "bundleFormat": summary.bundle_format,
                "entryCount": summary.entry_count,
                "dbSha256": summary.db_sha256,
                "outPath": out_path.to_string_lossy()
            }),
        ),
        Err(e) => err(&req.id, "backup_export_failed", format!("{e:?}"), None),
    }
}

fn handle_import_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let workspace_path = match get_required_path(&req.params, "workspacePath") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let in_path = match get_required_path(&req.params, "inPath") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    // The live connection must not straddle a database replacement.
    if state.workspace.as_deref() == Some(workspace_path.as_path()) {
        state.db = None;
    }

    let result = backup::import_workspace_bundle(&in_path, &workspace_path);

    if state.workspace.as_deref() == Some(workspace_path.as_path()) {
        match db::open_db(&workspace_path) {
            Ok(conn) => state.db = Some(conn),
            Err(e) => return err(&req.id, "db_open_failed", format!("{e:?}"), None),
        }
    }

    match result {
        Ok(summary) => ok(
            &req.id,
            json!({ "bundleFormatDetected": summary.bundle_format_detected }),
        ),
        Err(e) => err(&req.id, "backup_import_failed", format!("{e:?}"), None),
    }
}

/// One row per student: raw scores followed by every derived field, so the
/// exported sheet matches what the grade screen shows.
fn handle_export_term_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let out_path = match get_required_path(&req.params, "outPath") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let ctx = calc::CalcContext {
        conn,
        class_id: &class_id,
        term_id: &term_id,
    };
    let summary = match calc::compute_term_summary(&ctx) {
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

    let mut header: Vec<String> = vec!["student".to_string(), "active".to_string()];
    for i in 0..summary.term.insumos_count {
        header.push(format!("insumo{}", i + 1));
    }
    header.extend(
        [
            "project",
            "exam",
            "remediation",
            "improvement",
            "formativeAverage",
            "enhancedExam",
            "formativeWeighted",
            "summativeWeighted",
            "finalAverage",
            "qualitative",
            "qualitativeBand",
        ]
        .map(str::to_string),
    );

    let mut lines: Vec<String> = vec![header.join(",")];
    for s in &summary.per_student {
        let mut fields: Vec<String> = vec![
            csv_quote(&s.display_name),
            if s.active { "1" } else { "0" }.to_string(),
        ];
        for v in &s.raw.insumos {
            fields.push(csv_opt(*v));
        }
        fields.push(csv_opt(s.raw.project));
        fields.push(csv_opt(s.raw.exam));
        fields.push(csv_opt(s.raw.remediation));
        fields.push(csv_opt(s.raw.improvement));
        fields.push(csv_opt(s.derived.formative_average));
        fields.push(csv_opt(s.derived.enhanced_exam));
        fields.push(csv_opt(s.derived.formative_weighted));
        fields.push(csv_opt(s.derived.summative_weighted));
        fields.push(csv_opt(s.derived.final_average));
        fields.push(s.derived.qualitative.clone().unwrap_or_default());
        fields.push(s.derived.qualitative_band.clone().unwrap_or_default());
        lines.push(fields.join(","));
    }

    if let Some(parent) = out_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return err(&req.id, "io_failed", e.to_string(), None);
        }
    }
    let mut file = match std::fs::File::create(&out_path) {
        Ok(f) => f,
        Err(e) => return err(&req.id, "io_failed", e.to_string(), None),
    };
    for line in &lines {
        if let Err(e) = writeln!(file, "{}", line) {
            return err(&req.id, "io_failed", e.to_string(), None);
        }
    }

    ok(
        &req.id,
        json!({
            "outPath": out_path.to_string_lossy(),
            "rowCount": summary.per_student.len()
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_export_workspace_bundle(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_import_workspace_bundle(state, req)),
        "exchange.exportTermCsv" => Some(handle_export_term_csv(state, req)),
        _ => None,
    }
}
