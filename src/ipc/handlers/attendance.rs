use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::{Datelike, Duration, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;

const ATTENDANCE_STATUSES: [&str; 4] = ["present", "absent", "late", "excused"];

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

/// Month keys come in as MM (current year) or YYYY-MM.
fn parse_month_key(month: &str) -> Result<(i32, u32), HandlerErr> {
    let t = month.trim();
    if let Ok(m) = t.parse::<u32>() {
        if (1..=12).contains(&m) {
            return Ok((Utc::now().year(), m));
        }
    }
    let Some((y, m)) = t.split_once('-') else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "month must be MM or YYYY-MM".to_string(),
            details: None,
        });
    };
    let year = y.parse::<i32>().map_err(|_| HandlerErr {
        code: "bad_params",
        message: "month year must be numeric".to_string(),
        details: None,
    })?;
    let month_num = m.parse::<u32>().map_err(|_| HandlerErr {
        code: "bad_params",
        message: "month must be YYYY-MM".to_string(),
        details: None,
    })?;
    if !(1..=12).contains(&month_num) {
        return Err(HandlerErr {
            code: "bad_params",
            message: "month must be between 01 and 12".to_string(),
            details: None,
        });
    }
    Ok((year, month_num))
}

fn month_bounds(year: i32, month: u32) -> Result<(NaiveDate, NaiveDate), HandlerErr> {
    let first = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: "invalid month".to_string(),
        details: None,
    })?;
    let next_first = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: "invalid month".to_string(),
        details: None,
    })?;
    Ok((first, next_first - Duration::days(1)))
}

fn handle_attendance_month_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match get_required_str(&req.params, "classId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let month = match get_required_str(&req.params, "month") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    match class_exists(conn, &class_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return e.response(&req.id),
    }

    let (year, month_num) = match parse_month_key(&month) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let (first, last) = match month_bounds(year, month_num) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    // All marked days for the month, keyed by student.
    let mut day_maps: HashMap<String, serde_json::Map<String, serde_json::Value>> = HashMap::new();
    let mut counts: HashMap<String, HashMap<&'static str, i64>> = HashMap::new();
    {
        let mut stmt = match conn.prepare(
            "SELECT student_id, date, status
             FROM attendance
             WHERE class_id = ? AND date >= ? AND date <= ?
             ORDER BY date",
        ) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let rows = stmt.query_map(
            (&class_id, first.to_string(), last.to_string()),
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            },
        );
        let rows = match rows {
            Ok(it) => it,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        for row in rows {
            let (student_id, date, status) = match row {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            if let Some(known) = ATTENDANCE_STATUSES.iter().copied().find(|s| *s == status) {
                *counts
                    .entry(student_id.clone())
                    .or_default()
                    .entry(known)
                    .or_insert(0) += 1;
            }
            day_maps
                .entry(student_id)
                .or_default()
                .insert(date, json!(status));
        }
    }

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

    let students: Vec<serde_json::Value> = roster
        .into_iter()
        .map(|(id, last, first, active, sort_order)| {
            let days = day_maps.remove(&id).unwrap_or_default();
            let c = counts.remove(&id).unwrap_or_default();
            let count_obj: serde_json::Map<String, serde_json::Value> = ATTENDANCE_STATUSES
                .iter()
                .map(|s| (s.to_string(), json!(c.get(s).copied().unwrap_or(0))))
                .collect();
            json!({
                "studentId": id,
                "displayName": format!("{}, {}", last, first),
                "active": active,
                "sortOrder": sort_order,
                "days": days,
                "counts": count_obj
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "month": format!("{:04}-{:02}", year, month_num),
            "firstDay": first.to_string(),
            "lastDay": last.to_string(),
            "dayCount": (last - first).num_days() + 1,
            "students": students
        }),
    )
}

fn handle_attendance_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match get_required_str(&req.params, "classId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let student_id = match get_required_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let date_raw = match get_required_str(&req.params, "date") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let date = match NaiveDate::parse_from_str(date_raw.trim(), "%Y-%m-%d") {
        Ok(d) => d,
        Err(_) => {
            return err(
                &req.id,
                "bad_params",
                "date must be YYYY-MM-DD",
                Some(json!({ "date": date_raw })),
            )
        }
    };

    match student_in_class(conn, &class_id, &student_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return e.response(&req.id),
    }

    let status = req.params.get("status");
    match status {
        None | Some(serde_json::Value::Null) => {
            // Clearing removes the mark entirely.
            if let Err(e) = conn.execute(
                "DELETE FROM attendance WHERE class_id = ? AND student_id = ? AND date = ?",
                (&class_id, &student_id, date.to_string()),
            ) {
                return err(&req.id, "db_delete_failed", e.to_string(), None);
            }
            ok(&req.id, json!({ "ok": true, "status": serde_json::Value::Null }))
        }
        Some(v) => {
            let Some(s) = v.as_str().map(|s| s.to_ascii_lowercase()) else {
                return err(&req.id, "bad_params", "status must be a string or null", None);
            };
            if !ATTENDANCE_STATUSES.contains(&s.as_str()) {
                return err(
                    &req.id,
                    "bad_params",
                    "status must be one of: present, absent, late, excused",
                    Some(json!({ "status": s })),
                );
            }
            if let Err(e) = conn.execute(
                "INSERT INTO attendance(class_id, student_id, date, status, updated_at)
                 VALUES(?, ?, ?, ?, ?)
                 ON CONFLICT(class_id, student_id, date) DO UPDATE SET
                   status = excluded.status,
                   updated_at = excluded.updated_at",
                (
                    &class_id,
                    &student_id,
                    date.to_string(),
                    &s,
                    Utc::now().to_rfc3339(),
                ),
            ) {
                return err(&req.id, "db_insert_failed", e.to_string(), None);
            }
            ok(&req.id, json!({ "ok": true, "status": s }))
        }
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.monthOpen" => Some(handle_attendance_month_open(state, req)),
        "attendance.set" => Some(handle_attendance_set(state, req)),
        _ => None,
    }
}
