use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
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
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use serde_json::json;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::GlowbookAuthSource;
use crate::engine::{Engine, EngineError, Slot};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, BookingFilter, Command, SqlError};
use crate::tenant::TenantManager;

pub struct GlowbookHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<GlowbookQueryParser>,
}

impl GlowbookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(GlowbookQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// Parse, run and record one statement.
    async fn run_sql(&self, engine: &Engine, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            debug!("{label} failed: {e}");
        }
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertOffDay {
                id,
                specialist_id,
                date,
                reason,
            } => {
                engine
                    .add_off_day(id, specialist_id, date, reason)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteOffDay { specialist_id, id } => {
                engine
                    .remove_off_day(specialist_id, id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::DeleteOffDays { specialist_id, ids } => {
                let removed = engine
                    .remove_off_days(specialist_id, &ids)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(removed)))
            }
            Command::InsertBreak {
                id,
                specialist_id,
                schedule,
                interval,
                description,
            } => {
                engine
                    .add_break(id, specialist_id, schedule, interval, description)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteBreak { specialist_id, id } => {
                engine
                    .remove_break(specialist_id, id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertBooking(req) => {
                engine.create_booking(req).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::CancelBooking { id, client_id } => {
                engine
                    .cancel_booking(id, client_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::CompleteBooking { id, specialist_id } => {
                engine
                    .complete_booking(specialist_id, id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SelectSlots {
                specialist_id,
                date,
                duration_minutes,
            } => {
                let starts = engine
                    .available_slots(specialist_id, date, duration_minutes)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(slots_schema());
                let rows = starts
                    .into_iter()
                    .filter_map(|start| TimeInterval::starting_at(start, duration_minutes))
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&format_time(slot.start()))?;
                        encoder.encode_field(&format_time(slot.end()))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectSlotBoard {
                specialist_id,
                date,
                duration_minutes,
            } => {
                let board = engine
                    .slot_board(specialist_id, date, duration_minutes)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(slot_board_schema());
                let rows = board
                    .iter()
                    .map(|slot| encode_slot(&schema, slot))
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectAvailability { specialist_id } => {
                let snapshot = engine.availability_snapshot(specialist_id).await;
                let schema = Arc::new(availability_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&availability_json(&snapshot).to_string())?;
                Ok(query_response(schema, vec![Ok(encoder.take_row())]))
            }
            Command::SelectOffDays { specialist_id } => {
                let schema = Arc::new(off_days_schema());
                let rows = engine
                    .off_days(specialist_id)
                    .await
                    .iter()
                    .map(|o| encode_off_day(&schema, o))
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectBreaks { specialist_id } => {
                let schema = Arc::new(breaks_schema());
                let rows = engine
                    .breaks(specialist_id)
                    .await
                    .iter()
                    .map(|r| encode_break(&schema, r))
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectBookings(filter) => {
                let bookings = match filter {
                    BookingFilter::Specialist {
                        specialist_id,
                        date: Some(date),
                    } => engine.confirmed_bookings(specialist_id, date).await,
                    BookingFilter::Specialist {
                        specialist_id,
                        date: None,
                    } => engine.specialist_bookings(specialist_id).await,
                    BookingFilter::Client { client_id } => engine.client_bookings(client_id).await,
                };
                let schema = Arc::new(bookings_schema());
                let rows = bookings
                    .iter()
                    .map(|b| encode_booking(&schema, b))
                    .collect();
                Ok(query_response(schema, rows))
            }
        }
    }
}

// ── Result encoding ──────────────────────────────────────────────

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_slot(schema: &Arc<Vec<FieldInfo>>, slot: &Slot) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&format_time(slot.start))?;
    encoder.encode_field(&format_time(slot.end))?;
    encoder.encode_field(&slot.state.as_str().to_string())?;
    Ok(encoder.take_row())
}

fn encode_off_day(schema: &Arc<Vec<FieldInfo>>, off_day: &OffDay) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&off_day.id.to_string())?;
    encoder.encode_field(&off_day.specialist_id.to_string())?;
    encoder.encode_field(&format_date(off_day.date))?;
    encoder.encode_field(&off_day.reason)?;
    Ok(encoder.take_row())
}

fn encode_break(schema: &Arc<Vec<FieldInfo>>, rule: &BreakRule) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&rule.id.to_string())?;
    encoder.encode_field(&rule.specialist_id.to_string())?;
    encoder.encode_field(&rule.schedule.day_of_week().map(|d| weekday_number(d) as i32))?;
    encoder.encode_field(&format_time(rule.interval.start()))?;
    encoder.encode_field(&format_time(rule.interval.end()))?;
    encoder.encode_field(&rule.schedule.is_recurring())?;
    encoder.encode_field(&rule.schedule.specific_date().map(format_date))?;
    encoder.encode_field(&rule.description)?;
    Ok(encoder.take_row())
}

fn encode_booking(schema: &Arc<Vec<FieldInfo>>, booking: &Booking) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&booking.id.to_string())?;
    encoder.encode_field(&booking.specialist_id.to_string())?;
    encoder.encode_field(&booking.client_id.to_string())?;
    encoder.encode_field(&format_date(booking.date))?;
    encoder.encode_field(&format_time(booking.interval.start()))?;
    encoder.encode_field(&format_time(booking.interval.end()))?;
    encoder.encode_field(&booking.service_name)?;
    encoder.encode_field(&booking.notes)?;
    encoder.encode_field(&booking.status.as_str().to_string())?;
    encoder.encode_field(&booking.created_at)?;
    Ok(encoder.take_row())
}

/// `{"offDays": [...], "breaks": [...]}` for calendar rendering.
pub fn availability_json(snapshot: &AvailabilitySnapshot) -> serde_json::Value {
    let off_days: Vec<_> = snapshot
        .off_days
        .iter()
        .map(|o| {
            json!({
                "id": o.id.to_string(),
                "date": format_date(o.date),
                "reason": o.reason,
            })
        })
        .collect();
    let breaks: Vec<_> = snapshot
        .breaks
        .iter()
        .map(|r| {
            json!({
                "id": r.id.to_string(),
                "dayOfWeek": r.schedule.day_of_week().map(weekday_number),
                "startTime": format_time(r.interval.start()),
                "endTime": format_time(r.interval.end()),
                "isRecurring": r.schedule.is_recurring(),
                "specificDate": r.schedule.specific_date().map(format_date),
                "description": r.description,
            })
        })
        .collect();
    json!({ "offDays": off_days, "breaks": breaks })
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![text_field("start"), text_field("end")]
}

fn slot_board_schema() -> Vec<FieldInfo> {
    vec![text_field("start"), text_field("end"), text_field("state")]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![FieldInfo::new(
        "availability".into(),
        None,
        None,
        Type::TEXT,
        FieldFormat::Text,
    )]
}

fn off_days_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("specialist_id"),
        text_field("date"),
        text_field("reason"),
    ]
}

fn breaks_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("specialist_id"),
        FieldInfo::new("day_of_week".into(), None, None, Type::INT4, FieldFormat::Text),
        text_field("start"),
        text_field("end"),
        FieldInfo::new("is_recurring".into(), None, None, Type::BOOL, FieldFormat::Text),
        text_field("specific_date"),
        text_field("description"),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("specialist_id"),
        text_field("client_id"),
        text_field("date"),
        text_field("start"),
        text_field("end"),
        text_field("service"),
        text_field("notes"),
        text_field("status"),
        FieldInfo::new("created_at".into(), None, None, Type::INT8, FieldFormat::Text),
    ]
}

/// Result columns of a statement, known before its parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match sql::select_table(sql).as_deref() {
        Some("slots") => slots_schema(),
        Some("slot_board") => slot_board_schema(),
        Some("availability") => availability_schema(),
        Some("off_days") => off_days_schema(),
        Some("breaks") => breaks_schema(),
        Some("bookings") => bookings_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for GlowbookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        Ok(vec![self.run_sql(&engine, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct GlowbookQueryParser;

#[async_trait]
impl QueryParser for GlowbookQueryParser {
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
impl ExtendedQueryHandler for GlowbookHandler {
    type Statement = String;
    type QueryParser = GlowbookQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        self.run_sql(&engine, &sql).await
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

/// Highest `$N` placeholder in the SQL string.
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

/// Substitute `$1`, `$2`, ... with the bound parameter values as quoted text.
fn substitute_params(portal: &Portal<String>) -> String {
    substitute(&portal.statement.statement, &portal.parameters)
}

/// One left-to-right pass over `sql`: inserted values are never rescanned, so
/// a value containing `$2` stays literal text.
fn substitute<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let param = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match param {
            Some(Some(bytes)) => {
                out.push('\'');
                out.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&rest[pos..pos + 1 + digits]),
        }
        rest = &after[digits..];
    }
    out.push_str(rest);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct GlowbookFactory {
    handler: Arc<GlowbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<GlowbookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl GlowbookFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(GlowbookHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                GlowbookAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for GlowbookFactory {
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
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = GlowbookFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Conflict(_) => "23P01",
        EngineError::NotFound(_) => "02000",
        EngineError::SpecialistUnavailable(_)
        | EngineError::OnBreak(_)
        | EngineError::BookingClosed(_) => "55000",
        EngineError::InvalidInterval(_) => "22007",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::StorageFailure(_) => "58030",
        EngineError::OffDayExists(_) | EngineError::AlreadyExists(_) => "23505",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::InvalidValue(_) | SqlError::InvalidInterval(_) => "22007",
        _ => "42601",
    }
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(sql_sqlstate(&e), e.to_string())
}
