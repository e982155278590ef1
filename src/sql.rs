use std::collections::HashMap;

use chrono::{NaiveDate, NaiveTime, Weekday};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

const OFF_DAY_COLUMNS: &[&str] = &["id", "specialist_id", "date", "reason"];
const BREAK_COLUMNS: &[&str] = &[
    "id",
    "specialist_id",
    "day_of_week",
    "start",
    "end",
    "is_recurring",
    "specific_date",
    "description",
];
const BOOKING_COLUMNS: &[&str] = &[
    "id",
    "specialist_id",
    "client_id",
    "date",
    "start",
    "end",
    "service",
    "notes",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingFilter {
    /// A specialist's bookings; with a date, only the confirmed ones on it.
    Specialist {
        specialist_id: Ulid,
        date: Option<NaiveDate>,
    },
    Client {
        client_id: Ulid,
    },
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertOffDay {
        id: Ulid,
        specialist_id: Ulid,
        date: NaiveDate,
        reason: Option<String>,
    },
    DeleteOffDay {
        specialist_id: Ulid,
        id: Ulid,
    },
    DeleteOffDays {
        specialist_id: Ulid,
        ids: Vec<Ulid>,
    },
    InsertBreak {
        id: Ulid,
        specialist_id: Ulid,
        schedule: BreakSchedule,
        interval: TimeInterval,
        description: Option<String>,
    },
    DeleteBreak {
        specialist_id: Ulid,
        id: Ulid,
    },
    InsertBooking(NewBooking),
    CancelBooking {
        id: Ulid,
        client_id: Ulid,
    },
    CompleteBooking {
        id: Ulid,
        specialist_id: Ulid,
    },
    SelectSlots {
        specialist_id: Ulid,
        date: NaiveDate,
        duration_minutes: u32,
    },
    SelectSlotBoard {
        specialist_id: Ulid,
        date: NaiveDate,
        duration_minutes: u32,
    },
    SelectAvailability {
        specialist_id: Ulid,
    },
    SelectOffDays {
        specialist_id: Ulid,
    },
    SelectBreaks {
        specialist_id: Ulid,
    },
    SelectBookings(BookingFilter),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql)
        .map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection.as_ref()),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table a SELECT reads from, without interpreting the filters. Used to
/// describe result columns of prepared statements whose `$n` parameters are
/// not bound yet.
pub fn select_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let Statement::Query(query) = stmts.first()? else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    table_factor_name(&select.from.first()?.relation).ok()
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row addressed by column name.
struct Row<'a> {
    table: &'static str,
    columns: Vec<String>,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        let pos = self.columns.iter().position(|c| c == column)?;
        self.values.get(pos)
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let (table, defaults): (&'static str, &[&str]) = match table.as_str() {
        "off_days" => ("off_days", OFF_DAY_COLUMNS),
        "breaks" => ("breaks", BREAK_COLUMNS),
        "bookings" => ("bookings", BOOKING_COLUMNS),
        _ => return Err(SqlError::UnknownTable(table)),
    };

    let values = extract_insert_values(insert)?;
    // without a column list, values are positional in the table's column order
    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().take(values.len()).map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() != columns.len() {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    let row = Row {
        table,
        columns,
        values,
    };

    match table {
        "off_days" => Ok(Command::InsertOffDay {
            id: parse_ulid(row.required("id")?)?,
            specialist_id: parse_ulid(row.required("specialist_id")?)?,
            date: parse_date_expr(row.required("date")?)?,
            reason: row.get("reason").map(parse_text_or_null).transpose()?.flatten(),
        }),
        "breaks" => {
            let day_of_week = row
                .get("day_of_week")
                .map(parse_weekday_or_null)
                .transpose()?
                .flatten();
            let is_recurring = parse_bool(row.required("is_recurring")?)?;
            let specific_date = row
                .get("specific_date")
                .map(parse_date_or_null)
                .transpose()?
                .flatten();
            let schedule = BreakSchedule::from_parts(is_recurring, day_of_week, specific_date)
                .map_err(|e| SqlError::InvalidValue(e.to_string()))?;
            Ok(Command::InsertBreak {
                id: parse_ulid(row.required("id")?)?,
                specialist_id: parse_ulid(row.required("specialist_id")?)?,
                schedule,
                interval: parse_interval(&row)?,
                description: row
                    .get("description")
                    .map(parse_text_or_null)
                    .transpose()?
                    .flatten(),
            })
        }
        _ => Ok(Command::InsertBooking(NewBooking {
            id: parse_ulid(row.required("id")?)?,
            specialist_id: parse_ulid(row.required("specialist_id")?)?,
            client_id: parse_ulid(row.required("client_id")?)?,
            date: parse_date_expr(row.required("date")?)?,
            interval: parse_interval(&row)?,
            service_name: parse_text(row.required("service")?)?,
            notes: row.get("notes").map(parse_text_or_null).transpose()?.flatten(),
        })),
    }
}

fn parse_interval(row: &Row<'_>) -> Result<TimeInterval, SqlError> {
    let start = parse_time_expr(row.required("start")?)?;
    let end = parse_time_expr(row.required("end")?)?;
    TimeInterval::new(start, end).map_err(SqlError::InvalidInterval)
}

// ── DELETE / UPDATE ───────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;

    match table.as_str() {
        "off_days" => {
            let specialist_id = filters.ulid("specialist_id")?;
            match filters.ulid_list("id")? {
                Some(ids) => Ok(Command::DeleteOffDays { specialist_id, ids }),
                None => Ok(Command::DeleteOffDay {
                    specialist_id,
                    id: filters.ulid("id")?,
                }),
            }
        }
        "breaks" => Ok(Command::DeleteBreak {
            specialist_id: filters.ulid("specialist_id")?,
            id: filters.ulid("id")?,
        }),
        "bookings" => Ok(Command::CancelBooking {
            id: filters.ulid("id")?,
            client_id: filters.ulid("client_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &TableFactor,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(table)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }

    let mut status = None;
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        };
        match column.as_deref() {
            Some("status") => status = Some(parse_text(&assignment.value)?.to_lowercase()),
            Some(other) => return Err(SqlError::Unsupported(format!("UPDATE of {other}"))),
            None => return Err(SqlError::Unsupported("UPDATE target".into())),
        }
    }

    let filters = Filters::from_selection(selection)?;
    match status.as_deref() {
        Some("cancelled") => Ok(Command::CancelBooking {
            id: filters.ulid("id")?,
            client_id: filters.ulid("client_id")?,
        }),
        Some("completed") => Ok(Command::CompleteBooking {
            id: filters.ulid("id")?,
            specialist_id: filters.ulid("specialist_id")?,
        }),
        Some(other) => Err(SqlError::InvalidValue(format!(
            "status must be 'cancelled' or 'completed', got '{other}'"
        ))),
        None => Err(SqlError::MissingColumn("bookings", "status")),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let from = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots {
            specialist_id: filters.ulid("specialist_id")?,
            date: filters.date("date")?,
            duration_minutes: filters.u32("duration")?,
        }),
        "slot_board" => Ok(Command::SelectSlotBoard {
            specialist_id: filters.ulid("specialist_id")?,
            date: filters.date("date")?,
            duration_minutes: filters.u32("duration")?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            specialist_id: filters.ulid("specialist_id")?,
        }),
        "off_days" => Ok(Command::SelectOffDays {
            specialist_id: filters.ulid("specialist_id")?,
        }),
        "breaks" => Ok(Command::SelectBreaks {
            specialist_id: filters.ulid("specialist_id")?,
        }),
        "bookings" => {
            if filters.has("client_id") {
                Ok(Command::SelectBookings(BookingFilter::Client {
                    client_id: filters.ulid("client_id")?,
                }))
            } else {
                Ok(Command::SelectBookings(BookingFilter::Specialist {
                    specialist_id: filters.ulid("specialist_id")?,
                    date: filters.optional_date("date")?,
                }))
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = value` and `col IN (...)` terms of an AND-only WHERE clause.
#[derive(Debug, Default)]
struct Filters {
    eq: HashMap<String, Expr>,
    lists: HashMap<String, Vec<Expr>>,
}

impl Filters {
    fn from_selection(selection: Option<&Expr>) -> Result<Self, SqlError> {
        let mut filters = Filters::default();
        if let Some(expr) = selection {
            filters.collect(expr)?;
        }
        Ok(filters)
    }

    fn collect(&mut self, expr: &Expr) -> Result<(), SqlError> {
        match expr {
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::And,
                right,
            } => {
                self.collect(left)?;
                self.collect(right)
            }
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::Eq,
                right,
            } => {
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                self.eq.insert(column, right.as_ref().clone());
                Ok(())
            }
            Expr::InList {
                expr,
                list,
                negated: false,
            } => {
                let column = expr_column_name(expr)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {expr}")))?;
                self.lists.insert(column, list.clone());
                Ok(())
            }
            Expr::Nested(inner) => self.collect(inner),
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    fn has(&self, column: &str) -> bool {
        self.eq.contains_key(column)
    }

    fn required(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.eq.get(column).ok_or(SqlError::MissingFilter(column))
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(self.required(column)?)
    }

    fn ulid_list(&self, column: &str) -> Result<Option<Vec<Ulid>>, SqlError> {
        self.lists
            .get(column)
            .map(|exprs| exprs.iter().map(parse_ulid).collect())
            .transpose()
    }

    fn date(&self, column: &'static str) -> Result<NaiveDate, SqlError> {
        parse_date_expr(self.required(column)?)
    }

    fn optional_date(&self, column: &str) -> Result<Option<NaiveDate>, SqlError> {
        self.eq.get(column).map(parse_date_expr).transpose()
    }

    fn u32(&self, column: &'static str) -> Result<u32, SqlError> {
        parse_u32(self.required(column)?)
    }
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

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row.as_slice()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_text(expr).map(Some)
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s}: {e}")))
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text(expr)?;
    parse_date(&s).ok_or_else(|| SqlError::InvalidValue(format!("bad date {s}, expected yyyy-MM-dd")))
}

fn parse_date_or_null(expr: &Expr) -> Result<Option<NaiveDate>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_date_expr(expr).map(Some)
}

fn parse_time_expr(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_text(expr)?;
    parse_time(&s).ok_or_else(|| SqlError::InvalidValue(format!("bad time {s}, expected HH:mm")))
}

/// Weekday name (`monday`, `mon`) or number with 0 = Sunday.
fn parse_weekday_or_null(expr: &Expr) -> Result<Option<Weekday>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    let s = parse_text(expr)?;
    let day = match s.trim().parse::<u32>() {
        Ok(n) => weekday_from_number(n),
        Err(_) => s.trim().parse::<Weekday>().ok(),
    };
    day.map(Some)
        .ok_or_else(|| SqlError::InvalidValue(format!("bad day of week {s}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let s = parse_text(expr)?;
    s.trim()
        .parse()
        .map_err(|_| SqlError::Parse(format!("expected non-negative integer, got {s}")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
    /// Malformed date, time, weekday or enum value.
    InvalidValue(String),
    InvalidInterval(InvalidInterval),
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
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing column {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::InvalidValue(s) => write!(f, "invalid value: {s}"),
            SqlError::InvalidInterval(e) => write!(f, "invalid interval: {e}"),
        }
    }
}

impl std::error::Error for SqlError {}
