use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::PaymentOutcome;
use crate::model::*;

/// Which slots a `DELETE FROM slots` targets.
#[derive(Debug, PartialEq)]
pub enum SlotFilter {
    Ids(Vec<Ulid>),
    Range { start: Ms, end: Ms },
    All,
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertAvailability {
        start: String,
        end: Option<String>,
        tz: String,
        frequency: Option<String>,
        occurrences: Option<i64>,
    },
    DeleteSlots(SlotFilter),
    InsertHold {
        slot_id: Ulid,
    },
    InsertHeartbeat {
        slot_id: Ulid,
        token: Ulid,
    },
    DeleteHold {
        slot_id: Ulid,
        token: Ulid,
    },
    InsertBooking {
        slot_id: Ulid,
        token: Ulid,
        details: BookingDetails,
    },
    InsertPayment {
        slot_id: Ulid,
        token: Ulid,
        outcome: PaymentOutcome,
    },
    SelectSlots {
        tz: Option<String>,
    },
    SelectHolds,
    SelectBookings,
}

const AVAILABILITY_COLUMNS: &[&str] = &["start", "end", "tz", "frequency", "occurrences"];
const HOLD_COLUMNS: &[&str] = &["slot_id"];
const HEARTBEAT_COLUMNS: &[&str] = &["slot_id", "token"];
const BOOKING_COLUMNS: &[&str] = &[
    "slot_id",
    "token",
    "customer_name",
    "customer_email",
    "client_ref",
    "metadata",
];
const PAYMENT_COLUMNS: &[&str] = &[
    "slot_id",
    "token",
    "status",
    "customer_name",
    "customer_email",
    "client_ref",
    "metadata",
];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "availability" => {
            let row = Row::new("availability", insert, &values, AVAILABILITY_COLUMNS, 1)?;
            Ok(Command::InsertAvailability {
                start: parse_string(row.required("start")?)?,
                end: row.optional("end").map(parse_string_or_null).transpose()?.flatten(),
                tz: row
                    .optional("tz")
                    .map(parse_string_or_null)
                    .transpose()?
                    .flatten()
                    .unwrap_or_else(|| "UTC".into()),
                frequency: row
                    .optional("frequency")
                    .map(parse_string_or_null)
                    .transpose()?
                    .flatten(),
                occurrences: row
                    .optional("occurrences")
                    .map(parse_i64_or_null)
                    .transpose()?
                    .flatten(),
            })
        }
        "holds" => {
            let row = Row::new("holds", insert, &values, HOLD_COLUMNS, 1)?;
            Ok(Command::InsertHold {
                slot_id: parse_ulid(row.required("slot_id")?)?,
            })
        }
        "heartbeats" => {
            let row = Row::new("heartbeats", insert, &values, HEARTBEAT_COLUMNS, 2)?;
            Ok(Command::InsertHeartbeat {
                slot_id: parse_ulid(row.required("slot_id")?)?,
                token: parse_ulid(row.required("token")?)?,
            })
        }
        "bookings" => {
            let row = Row::new("bookings", insert, &values, BOOKING_COLUMNS, 4)?;
            Ok(Command::InsertBooking {
                slot_id: parse_ulid(row.required("slot_id")?)?,
                token: parse_ulid(row.required("token")?)?,
                details: parse_details(&row)?,
            })
        }
        "payments" => {
            let row = Row::new("payments", insert, &values, PAYMENT_COLUMNS, 3)?;
            let status = parse_string(row.required("status")?)?;
            let outcome = match status.to_lowercase().as_str() {
                "succeeded" => PaymentOutcome::Succeeded(parse_details(&row)?),
                "failed" => PaymentOutcome::Failed,
                "canceled" | "cancelled" => PaymentOutcome::Canceled,
                _ => return Err(SqlError::Parse(format!("unknown payment status: {status}"))),
            };
            Ok(Command::InsertPayment {
                slot_id: parse_ulid(row.required("slot_id")?)?,
                token: parse_ulid(row.required("token")?)?,
                outcome,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_details(row: &Row<'_>) -> Result<BookingDetails, SqlError> {
    let optional = |col| {
        row.optional(col)
            .map(parse_string_or_null)
            .transpose()
            .map(Option::flatten)
    };
    Ok(BookingDetails {
        customer_name: parse_string(row.required("customer_name")?)?,
        customer_email: parse_string(row.required("customer_email")?)?,
        client_ref: optional("client_ref")?,
        metadata: optional("metadata")?,
    })
}

/// One VALUES row matched against a table's columns. With an explicit
/// column list values are matched by name, otherwise by position.
struct Row<'a> {
    cells: Vec<(&'static str, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn new(
        table: &'static str,
        insert: &ast::Insert,
        values: &'a [Expr],
        columns: &'static [&'static str],
        min_values: usize,
    ) -> Result<Self, SqlError> {
        if values.len() < min_values {
            return Err(SqlError::WrongArity(table, min_values, values.len()));
        }
        if values.len() > columns.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        if insert.columns.is_empty() {
            return Ok(Self {
                cells: columns.iter().copied().zip(values).collect(),
            });
        }
        if insert.columns.len() != values.len() {
            return Err(SqlError::WrongArity(table, insert.columns.len(), values.len()));
        }
        let mut cells = Vec::with_capacity(values.len());
        for (column, value) in insert.columns.iter().zip(values) {
            let raw = column.to_string();
            let name = raw
                .rsplit('.')
                .next()
                .unwrap_or(&raw)
                .trim_matches('"')
                .to_lowercase();
            let col = columns
                .iter()
                .copied()
                .find(|c| *c == name)
                .ok_or_else(|| SqlError::UnknownColumn(table, name.clone()))?;
            cells.push((col, value));
        }
        Ok(Self { cells })
    }

    fn optional(&self, col: &str) -> Option<&'a Expr> {
        self.cells.iter().find(|(c, _)| *c == col).map(|(_, e)| *e)
    }

    fn required(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.optional(col).ok_or(SqlError::MissingColumn(col))
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;

    match table.as_str() {
        "slots" => {
            let filter = match &delete.selection {
                None => SlotFilter::All,
                Some(expr) => parse_slot_filter(expr)?,
            };
            Ok(Command::DeleteSlots(filter))
        }
        "holds" => {
            let sel = delete.selection.as_ref().ok_or(SqlError::MissingFilter("slot_id"))?;
            let (mut slot_id, mut token) = (None, None);
            extract_eq_filters(sel, &mut |col, value| {
                match col {
                    "slot_id" => slot_id = Some(parse_ulid(value)?),
                    "token" => token = Some(parse_ulid(value)?),
                    _ => {}
                }
                Ok(())
            })?;
            Ok(Command::DeleteHold {
                slot_id: slot_id.ok_or(SqlError::MissingFilter("slot_id"))?,
                token: token.ok_or(SqlError::MissingFilter("token"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_slot_filter(expr: &Expr) -> Result<SlotFilter, SqlError> {
    match expr {
        Expr::InList {
            expr,
            list,
            negated: false,
        } if expr_column_name(expr).as_deref() == Some("id") => {
            let ids = list.iter().map(parse_ulid).collect::<Result<_, _>>()?;
            Ok(SlotFilter::Ids(ids))
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => {
            Ok(SlotFilter::Ids(vec![parse_ulid(right)?]))
        }
        Expr::Nested(inner) => parse_slot_filter(inner),
        _ => {
            let (mut start, mut end) = (None, None);
            extract_range_filters(expr, &mut start, &mut end)?;
            Ok(SlotFilter::Range {
                start: start.ok_or(SqlError::MissingFilter("start >="))?,
                end: end.ok_or(SqlError::MissingFilter("start <"))?,
            })
        }
    }
}

fn extract_range_filters(
    expr: &Expr,
    start: &mut Option<Ms>,
    end: &mut Option<Ms>,
) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_range_filters(left, start, end)?;
                extract_range_filters(right, start, end)?;
            }
            ast::BinaryOperator::GtEq if expr_column_name(left).as_deref() == Some("start") => {
                *start = Some(parse_instant(right)?);
            }
            ast::BinaryOperator::Lt if expr_column_name(left).as_deref() == Some("start") => {
                *end = Some(parse_instant(right)?);
            }
            _ => return Err(SqlError::Unsupported(format!("slot filter: {expr}"))),
        },
        Expr::Nested(inner) => extract_range_filters(inner, start, end)?,
        _ => return Err(SqlError::Unsupported(format!("slot filter: {expr}"))),
    }
    Ok(())
}

/// Walk an AND-chain of `column = value` comparisons.
fn extract_eq_filters(
    expr: &Expr,
    on_eq: &mut dyn FnMut(&str, &Expr) -> Result<(), SqlError>,
) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_eq_filters(left, on_eq)?;
                extract_eq_filters(right, on_eq)?;
            }
            ast::BinaryOperator::Eq => {
                if let Some(col) = expr_column_name(left) {
                    on_eq(&col, right)?;
                }
            }
            _ => {}
        },
        Expr::Nested(inner) => extract_eq_filters(inner, on_eq)?,
        _ => {}
    }
    Ok(())
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
        "slots" | "availability" => {
            let mut tz = None;
            if let Some(selection) = &select.selection {
                extract_eq_filters(selection, &mut |col, value| {
                    if col == "tz" {
                        tz = Some(parse_string(value)?);
                    }
                    Ok(())
                })?;
            }
            Ok(Command::SelectSlots { tz })
        }
        "holds" => Ok(Command::SelectHolds),
        "bookings" => Ok(Command::SelectBookings),
        _ => Err(SqlError::UnknownTable(table)),
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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row VALUES".into())),
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_i64(expr).map(Some),
    }
}

/// An instant: integer Unix milliseconds or an RFC 3339 string.
fn parse_instant(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.parse::<i64>().is_err()
    {
        return chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| SqlError::Parse(format!("bad timestamp {s:?}: {e}")));
    }
    parse_i64(expr)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing value for column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
