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
    let exe = env!("CARGO_BIN_EXE_cuadernod");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn cuadernod");
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
        "request {} failed: {}",
        id,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("missing code")
}

fn student_row<'a>(grid: &'a serde_json::Value, student_id: &str) -> &'a serde_json::Value {
    grid.get("students")
        .and_then(|v| v.as_array())
        .expect("students")
        .iter()
        .find(|s| s.get("studentId").and_then(|v| v.as_str()) == Some(student_id))
        .expect("student row")
}

#[test]
fn grid_writes_read_back_and_bad_edits_are_rejected() {
    let workspace = temp_dir("cuaderno-grid-roundtrip");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_id = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "Grid Class" }),
    )
    .get("classId")
    .and_then(|v| v.as_str())
    .expect("classId")
    .to_string();
    let student_id = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "classId": class_id, "lastName": "Diaz", "firstName": "Luz" }),
    )
    .get("studentId")
    .and_then(|v| v.as_str())
    .expect("studentId")
    .to_string();
    let term_id = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "terms.create",
        json!({ "classId": class_id, "name": "T1", "insumosCount": 2 }),
    )
    .get("termId")
    .and_then(|v| v.as_str())
    .expect("termId")
    .to_string();

    // Comma-decimal text entry lands as a number.
    let upd = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "scores.update",
        json!({
            "classId": class_id,
            "termId": term_id,
            "studentId": student_id,
            "slot": "insumo",
            "idx": 0,
            "value": "7,5"
        }),
    );
    assert_eq!(upd.get("value").and_then(|v| v.as_f64()), Some(7.5));

    // Values past the scale clamp at the storage boundary.
    let upd = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "scores.update",
        json!({
            "classId": class_id,
            "termId": term_id,
            "studentId": student_id,
            "slot": "exam",
            "value": 12.0
        }),
    );
    assert_eq!(upd.get("value").and_then(|v| v.as_f64()), Some(10.0));

    let grid = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "scores.get",
        json!({ "classId": class_id, "termId": term_id }),
    );
    assert_eq!(grid.get("insumosCount").and_then(|v| v.as_i64()), Some(2));
    let row = student_row(&grid, &student_id);
    assert_eq!(
        row.get("insumos").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(2)
    );
    assert_eq!(row.get("insumos").unwrap()[0].as_f64(), Some(7.5));
    assert!(row.get("insumos").unwrap()[1].is_null());
    assert_eq!(row.get("exam").and_then(|v| v.as_f64()), Some(10.0));
    assert!(row.get("project").map(|v| v.is_null()).unwrap_or(false));

    // Null clears the cell back to not-yet-graded.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "scores.update",
        json!({
            "classId": class_id,
            "termId": term_id,
            "studentId": student_id,
            "slot": "insumo",
            "idx": 0,
            "value": serde_json::Value::Null
        }),
    );
    let grid = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "scores.get",
        json!({ "classId": class_id, "termId": term_id }),
    );
    assert!(student_row(&grid, &student_id).get("insumos").unwrap()[0].is_null());

    // Bad writes never land.
    let bad = request(
        &mut stdin,
        &mut reader,
        "10",
        "scores.update",
        json!({
            "classId": class_id,
            "termId": term_id,
            "studentId": student_id,
            "slot": "homework",
            "value": 5.0
        }),
    );
    assert_eq!(error_code(&bad), "bad_params");

    let bad = request(
        &mut stdin,
        &mut reader,
        "11",
        "scores.update",
        json!({
            "classId": class_id,
            "termId": term_id,
            "studentId": student_id,
            "slot": "insumo",
            "idx": 5,
            "value": 5.0
        }),
    );
    assert_eq!(error_code(&bad), "bad_params");

    let bad = request(
        &mut stdin,
        &mut reader,
        "12",
        "scores.update",
        json!({
            "classId": class_id,
            "termId": term_id,
            "studentId": student_id,
            "slot": "insumo",
            "idx": 0,
            "value": "muy bien"
        }),
    );
    assert_eq!(error_code(&bad), "bad_params");

    // Bulk updates apply what they can and report the rest.
    let bulk = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "scores.bulkUpdate",
        json!({
            "classId": class_id,
            "termId": term_id,
            "edits": [
                { "studentId": student_id, "slot": "insumo", "idx": 1, "value": 6.0 },
                { "studentId": "nobody", "slot": "insumo", "idx": 0, "value": 6.0 },
                { "studentId": student_id, "slot": "homework", "value": 6.0 }
            ]
        }),
    );
    assert_eq!(bulk.get("updated").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(bulk.get("rejected").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(
        bulk.get("errors").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(2)
    );

    let grid = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "scores.get",
        json!({ "classId": class_id, "termId": term_id }),
    );
    assert_eq!(
        student_row(&grid, &student_id).get("insumos").unwrap()[1].as_f64(),
        Some(6.0)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
