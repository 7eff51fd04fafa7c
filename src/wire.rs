use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{Sink, SinkExt};
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::response::NoticeResponse;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::SlotleaseAuthSource;
use crate::engine::{
    Engine, EngineError, Frequency, GenerateRequest, RecurrenceRule, Settlement, format_local,
    now_ms, parse_tz,
};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SlotFilter};

pub struct SlotleaseHandler {
    engine: Arc<Engine>,
    query_parser: Arc<SlotleaseQueryParser>,
}

impl SlotleaseHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(SlotleaseQueryParser),
        }
    }

    /// Parse, execute and record RED metrics for one statement.
    async fn run<C>(&self, client: &mut C, query: &str) -> PgWireResult<Response>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let started = Instant::now();
        let cmd = match sql::parse_sql(query) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(observability::QUERIES_TOTAL, "command" => "unparsed", "status" => "error")
                    .increment(1);
                return Err(sql_err(e));
            }
        };
        let label = observability::command_label(&cmd);
        let result = self.execute_command(client, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command<C>(&self, client: &mut C, cmd: Command) -> PgWireResult<Response>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let engine = &self.engine;
        match cmd {
            Command::InsertAvailability {
                start,
                end,
                tz,
                frequency,
                occurrences,
            } => {
                let frequency = match frequency {
                    Some(f) => f.parse::<Frequency>().map_err(engine_err)?,
                    None => Frequency::None,
                };
                let rule = RecurrenceRule::new(frequency, occurrences.unwrap_or(0))
                    .map_err(engine_err)?;
                let req = GenerateRequest {
                    start,
                    end,
                    tz,
                    rule,
                };
                let added = engine.generate_availability(&req).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(added)))
            }
            Command::DeleteSlots(filter) => {
                let outcome = match filter {
                    SlotFilter::Ids(ids) => engine.delete_by_ids(&ids).await,
                    SlotFilter::Range { start, end } => engine.delete_by_range(start, end).await,
                    SlotFilter::All => engine.delete_all().await,
                }
                .map_err(engine_err)?;
                if outcome.skipped > 0 {
                    tracing::info!(skipped = outcome.skipped, "held or booked slots left in place");
                    client
                        .send(PgWireBackendMessage::NoticeResponse(skipped_notice(
                            outcome.skipped,
                        )))
                        .await?;
                }
                Ok(Response::Execution(Tag::new("DELETE").with_rows(outcome.deleted)))
            }
            Command::InsertHold { slot_id } => {
                let grant = engine.acquire(slot_id).await.map_err(engine_err)?;
                self.hold_row(grant.slot_id, grant.token, grant.expires_at)
            }
            Command::InsertHeartbeat { slot_id, token } => {
                let expires_at = engine.extend(slot_id, token).await.map_err(engine_err)?;
                self.hold_row(slot_id, token, expires_at)
            }
            Command::DeleteHold { slot_id, token } => {
                let released = engine.release(slot_id, token).await.map_err(engine_err)?;
                Ok(Response::Execution(
                    Tag::new("DELETE").with_rows(usize::from(released)),
                ))
            }
            Command::InsertBooking {
                slot_id,
                token,
                details,
            } => {
                let booking_id = engine
                    .commit(slot_id, token, details)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(booking_id_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&booking_id.to_string())?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::InsertPayment {
                slot_id,
                token,
                outcome,
            } => {
                let settlement = engine
                    .on_payment_outcome(slot_id, token, outcome)
                    .await
                    .map_err(engine_err)?;
                let (result, booking_id) = match settlement {
                    Settlement::Booked(id) => ("booked", Some(id.to_string())),
                    Settlement::Released(true) => ("released", None),
                    Settlement::Released(false) => ("noop", None),
                };
                let schema = Arc::new(payment_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&slot_id.to_string())?;
                encoder.encode_field(&result.to_string())?;
                encoder.encode_field(&booking_id)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectSlots { tz } => {
                let tz = parse_tz(tz.as_deref().unwrap_or("UTC")).map_err(engine_err)?;
                let slots = engine.list(now_ms()).await;

                let schema = Arc::new(slots_schema());
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let local = format_local(slot.start, &tz).map_err(engine_err)?;
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&slot.id.to_string())?;
                        encoder.encode_field(&slot.start)?;
                        encoder.encode_field(&slot.end)?;
                        encoder.encode_field(&slot.state.as_str().to_string())?;
                        encoder.encode_field(&local)?;
                        encoder.encode_field(&slot.hold_expires_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectHolds => {
                let holds = engine.list_holds().await;
                let schema = Arc::new(holds_schema());
                let rows: Vec<PgWireResult<_>> = holds
                    .into_iter()
                    .map(|h| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&h.slot_id.to_string())?;
                        encoder.encode_field(&h.token.to_string())?;
                        encoder.encode_field(&h.start)?;
                        encoder.encode_field(&h.end)?;
                        encoder.encode_field(&h.issued_at)?;
                        encoder.encode_field(&h.expires_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectBookings => {
                let bookings = engine.list_bookings();
                let schema = Arc::new(bookings_schema());
                let rows: Vec<PgWireResult<_>> = bookings
                    .into_iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.slot_id.to_string())?;
                        encoder.encode_field(&b.span.start)?;
                        encoder.encode_field(&b.span.end)?;
                        encoder.encode_field(&b.details.customer_name)?;
                        encoder.encode_field(&b.details.customer_email)?;
                        encoder.encode_field(&b.details.client_ref)?;
                        encoder.encode_field(&b.details.metadata)?;
                        encoder.encode_field(&b.booked_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }

    fn hold_row(&self, slot_id: ulid::Ulid, token: ulid::Ulid, expires_at: Ms) -> PgWireResult<Response> {
        let schema = Arc::new(hold_schema());
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder.encode_field(&slot_id.to_string())?;
        encoder.encode_field(&token.to_string())?;
        encoder.encode_field(&expires_at)?;
        encoder.encode_field(&self.engine.settings().heartbeat_ms())?;
        let rows = vec![Ok(encoder.take_row())];
        Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        int8("start"),
        int8("end"),
        text("state"),
        text("local_start"),
        int8("hold_expires_at"),
    ]
}

fn hold_schema() -> Vec<FieldInfo> {
    vec![text("slot_id"), text("token"), int8("expires_at"), int8("heartbeat_ms")]
}

fn holds_schema() -> Vec<FieldInfo> {
    vec![
        text("slot_id"),
        text("token"),
        int8("start"),
        int8("end"),
        int8("issued_at"),
        int8("expires_at"),
    ]
}

fn booking_id_schema() -> Vec<FieldInfo> {
    vec![text("booking_id")]
}

fn payment_schema() -> Vec<FieldInfo> {
    vec![text("slot_id"), text("result"), text("booking_id")]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("slot_id"),
        int8("start"),
        int8("end"),
        text("customer_name"),
        text("customer_email"),
        text("client_ref"),
        text("metadata"),
        int8("booked_at"),
    ]
}

/// Result columns of a statement, judged from its verb and table so
/// statements with `$n` placeholders can be described before binding.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let words: Vec<String> = sql
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_ascii_lowercase())
        .collect();
    let verb = words.first().map(String::as_str);
    let table_after = |kw: &str| {
        words
            .iter()
            .position(|w| w == kw)
            .and_then(|i| words.get(i + 1))
            .map(String::as_str)
    };
    match (verb, table_after("from"), table_after("into")) {
        (Some("select"), Some("slots" | "availability"), _) => slots_schema(),
        (Some("select"), Some("holds"), _) => holds_schema(),
        (Some("select"), Some("bookings"), _) => bookings_schema(),
        (Some("insert"), _, Some("holds" | "heartbeats")) => hold_schema(),
        (Some("insert"), _, Some("bookings")) => booking_id_schema(),
        (Some("insert"), _, Some("payments")) => payment_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotleaseHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotleaseQueryParser;

#[async_trait]
impl QueryParser for SlotleaseQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotleaseHandler {
    type Statement = String;
    type QueryParser = SlotleaseQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        self.run(client, &sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

fn substitute_params(portal: &Portal<String>) -> String {
    inline_params(&portal.statement.statement, portal.parameters.as_slice())
}

/// Inline bound text parameters as SQL literals in one left-to-right pass.
/// Placeholders inside quoted text, and any `$n` in an inlined value, are
/// left alone.
fn inline_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut quote = None;
    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                out.push(c);
            }
            '$' => {
                let mut digits = String::new();
                while let Some(d) = chars.next_if(char::is_ascii_digit) {
                    digits.push(d);
                }
                let param = digits
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|i| params.get(i));
                match param {
                    Some(Some(bytes)) => {
                        let text = String::from_utf8_lossy(bytes.as_ref());
                        out.push('\'');
                        out.push_str(&text.replace('\'', "''"));
                        out.push('\'');
                    }
                    Some(None) => out.push_str("NULL"),
                    None => {
                        out.push('$');
                        out.push_str(&digits);
                    }
                }
            }
            _ => out.push(c),
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotleaseFactory {
    handler: Arc<SlotleaseHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SlotleaseAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotleaseFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = SlotleaseAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotleaseHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotleaseFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(SlotleaseFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidTimezone(_)
        | EngineError::InvalidTimestamp(_)
        | EngineError::InvalidRange(_)
        | EngineError::InvalidRecurrence(_)
        | EngineError::InvalidDetails(_)
        | EngineError::LimitExceeded(_) => "22023",
        EngineError::SlotUnavailable(_) | EngineError::SlotNotDeletable(_) => "55000",
        EngineError::HoldNotFound(_) | EngineError::HoldExpired(_) => "55P03",
        EngineError::PaymentProvider(_) => "58000",
        EngineError::Storage(_) => "58030",
    }
}

/// Sent ahead of the `DELETE n` tag when held or booked slots were kept.
fn skipped_notice(skipped: usize) -> NoticeResponse {
    NoticeResponse::from(ErrorInfo::new(
        "NOTICE".into(),
        "01000".into(),
        format!("{skipped} held or booked slots were not deleted"),
    ))
}

fn engine_err(e: EngineError) -> PgWireError {
    if e.is_lease_race() {
        tracing::debug!("client lost a lease race: {e}");
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
