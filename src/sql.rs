use sqlparser::ast::{self, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertHall {
        id: Ulid,
        name: String,
        kind: HallKind,
        capacity: u32,
    },
    InsertBooking {
        id: Ulid,
        hall_id: Ulid,
        requester: Requester,
        start: Ms,
        end: Ms,
        purpose: String,
    },
    /// `UPDATE bookings SET status = '<target>', acting_role = '<role>'`.
    /// The target status encodes the action: APPROVED_* is an approval,
    /// REJECTED a rejection.
    SetBookingStatus {
        id: Ulid,
        action: Action,
        role: Role,
    },
    InsertExam {
        id: Ulid,
        name: String,
        date: Ms,
        hall_id: Ulid,
    },
    UpdateExam {
        id: Ulid,
        name: Option<String>,
        date: Option<Ms>,
        hall_id: Option<Ulid>,
    },
    InsertAllotment {
        id: Ulid,
        exam_id: Ulid,
        student_id: Ulid,
        seat: String,
    },
    UpdateAllotment {
        id: Ulid,
        exam_id: Option<Ulid>,
        student_id: Option<Ulid>,
        seat: Option<String>,
    },
    SelectHalls,
    SelectBookings {
        hall_id: Option<Ulid>,
        requester_id: Option<Ulid>,
    },
    SelectExams,
    SelectAllotments {
        exam_id: Ulid,
    },
    SelectAvailability {
        hall_id: Ulid,
        start: Ms,
        end: Ms,
    },
    Listen {
        channel: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.to_uppercase().starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "halls" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("halls", 4, values.len()));
            }
            Ok(Command::InsertHall {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                kind: parse_hall_kind(&values[2])?,
                capacity: parse_u32(&values[3])?,
            })
        }
        "bookings" => {
            if values.len() < 7 {
                return Err(SqlError::WrongArity("bookings", 7, values.len()));
            }
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                hall_id: parse_ulid(&values[1])?,
                requester: Requester {
                    user_id: parse_ulid(&values[2])?,
                    role: parse_role(&values[3])?,
                },
                start: parse_i64(&values[4])?,
                end: parse_i64(&values[5])?,
                purpose: parse_string(&values[6])?,
            })
        }
        "exams" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("exams", 4, values.len()));
            }
            Ok(Command::InsertExam {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                date: parse_i64(&values[2])?,
                hall_id: parse_ulid(&values[3])?,
            })
        }
        "allotments" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("allotments", 4, values.len()));
            }
            Ok(Command::InsertAllotment {
                id: parse_ulid(&values[0])?,
                exam_id: parse_ulid(&values[1])?,
                student_id: parse_ulid(&values[2])?,
                seat: parse_string(&values[3])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    match table.as_str() {
        "bookings" => {
            let mut status = None;
            let mut role = None;
            for a in assignments {
                match assignment_column(a).as_deref() {
                    Some("status") => {
                        let s = parse_string(&a.value)?;
                        status = Some(
                            BookingStatus::parse(&s)
                                .ok_or_else(|| SqlError::Parse(format!("bad status: {s}")))?,
                        );
                    }
                    Some("acting_role") => {
                        let s = parse_string(&a.value)?;
                        role = Some(
                            Role::parse(&s)
                                .ok_or_else(|| SqlError::Parse(format!("bad role: {s}")))?,
                        );
                    }
                    _ => return Err(SqlError::Unsupported(format!("{a}"))),
                }
            }
            let status = status.ok_or(SqlError::MissingColumn("status"))?;
            let role = role.ok_or(SqlError::MissingColumn("acting_role"))?;
            let action = match status {
                BookingStatus::ApprovedStaff | BookingStatus::ApprovedAdmin => Action::Approve,
                BookingStatus::Rejected => Action::Reject,
                BookingStatus::Pending => {
                    return Err(SqlError::Unsupported("cannot set status to PENDING".into()));
                }
            };
            Ok(Command::SetBookingStatus { id, action, role })
        }
        "exams" => {
            let (mut name, mut date, mut hall_id) = (None, None, None);
            for a in assignments {
                match assignment_column(a).as_deref() {
                    Some("name") => name = Some(parse_string(&a.value)?),
                    Some("date") => date = Some(parse_i64(&a.value)?),
                    Some("hall_id") => hall_id = Some(parse_ulid(&a.value)?),
                    _ => return Err(SqlError::Unsupported(format!("{a}"))),
                }
            }
            Ok(Command::UpdateExam {
                id,
                name,
                date,
                hall_id,
            })
        }
        "allotments" => {
            let (mut exam_id, mut student_id, mut seat) = (None, None, None);
            for a in assignments {
                match assignment_column(a).as_deref() {
                    Some("exam_id") => exam_id = Some(parse_ulid(&a.value)?),
                    Some("student_id") => student_id = Some(parse_ulid(&a.value)?),
                    Some("seat") => seat = Some(parse_string(&a.value)?),
                    _ => return Err(SqlError::Unsupported(format!("{a}"))),
                }
            }
            Ok(Command::UpdateAllotment {
                id,
                exam_id,
                student_id,
                seat,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    match table.as_str() {
        "halls" => Ok(Command::SelectHalls),
        "exams" => Ok(Command::SelectExams),
        "bookings" => {
            let (mut hall_id, mut requester_id) = (None, None);
            if let Some(selection) = &select.selection {
                extract_eq_filters(selection, &mut |col, value| {
                    match col {
                        "hall_id" => hall_id = Some(parse_ulid_expr(value)?),
                        "requester_id" => requester_id = Some(parse_ulid_expr(value)?),
                        _ => {}
                    }
                    Ok(())
                })?;
            }
            Ok(Command::SelectBookings {
                hall_id,
                requester_id,
            })
        }
        "allotments" => {
            let mut exam_id = None;
            if let Some(selection) = &select.selection {
                extract_eq_filters(selection, &mut |col, value| {
                    if col == "exam_id" {
                        exam_id = Some(parse_ulid_expr(value)?);
                    }
                    Ok(())
                })?;
            }
            Ok(Command::SelectAllotments {
                exam_id: exam_id.ok_or(SqlError::MissingFilter("exam_id"))?,
            })
        }
        "availability" => {
            let (mut hall_id, mut start, mut end) = (None, None, None);
            if let Some(selection) = &select.selection {
                extract_availability_filters(selection, &mut hall_id, &mut start, &mut end)?;
            }
            Ok(Command::SelectAvailability {
                hall_id: hall_id.ok_or(SqlError::MissingFilter("hall_id"))?,
                start: start.ok_or(SqlError::MissingFilter("start"))?,
                end: end.ok_or(SqlError::MissingFilter("end"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Walk an AND-chain of `col = value` predicates.
fn extract_eq_filters(
    expr: &Expr,
    apply: &mut impl FnMut(&str, &Expr) -> Result<(), SqlError>,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_eq_filters(left, apply)?;
                extract_eq_filters(right, apply)?;
            }
            ast::BinaryOperator::Eq => {
                if let Some(col) = expr_column_name(left) {
                    apply(&col, right)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn extract_availability_filters(
    expr: &Expr,
    hall_id: &mut Option<Ulid>,
    start: &mut Option<Ms>,
    end: &mut Option<Ms>,
) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_availability_filters(left, hall_id, start, end)?;
                extract_availability_filters(right, hall_id, start, end)?;
            }
            ast::BinaryOperator::Eq => {
                if expr_column_name(left).as_deref() == Some("hall_id") {
                    *hall_id = Some(parse_ulid_expr(right)?);
                }
            }
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    *start = Some(parse_i64_expr(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    *end = Some(parse_i64_expr(right)?);
                }
            }
            _ => {}
        },
        _ => {}
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn assignment_column(a: &ast::Assignment) -> Option<String> {
    match &a.target {
        ast::AssignmentTarget::ColumnName(name) => object_name_last(name),
        _ => None,
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows[0].clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_expr(expr)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    parse_i64_expr(expr)
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_hall_kind(expr: &Expr) -> Result<HallKind, SqlError> {
    let s = parse_string(expr)?;
    HallKind::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad hall kind: {s}")))
}

fn parse_role(expr: &Expr) -> Result<Role, SqlError> {
    let s = parse_string(expr)?;
    Role::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad role: {s}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingColumn(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingColumn(col) => write!(f, "missing SET column: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
