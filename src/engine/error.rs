use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{format_date, InvalidInterval};

#[derive(Debug)]
pub enum EngineError {
    InvalidInterval(String),
    /// The whole date is an off-day.
    SpecialistUnavailable(NaiveDate),
    /// The requested interval overlaps this break rule.
    OnBreak(Ulid),
    /// The requested interval overlaps this confirmed booking.
    Conflict(Ulid),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    OffDayExists(NaiveDate),
    /// The booking is already in a different terminal state.
    BookingClosed(Ulid),
    LimitExceeded(&'static str),
    StorageFailure(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInterval(msg) => write!(f, "invalid interval: {msg}"),
            EngineError::SpecialistUnavailable(date) => {
                write!(f, "specialist is unavailable on {}", format_date(*date))
            }
            EngineError::OnBreak(id) => write!(f, "requested time falls into break: {id}"),
            EngineError::Conflict(id) => write!(f, "time slot already booked: {id}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::OffDayExists(date) => {
                write!(f, "off day already exists for {}", format_date(*date))
            }
            EngineError::BookingClosed(id) => write!(f, "booking {id} is already closed"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::StorageFailure(e) => write!(f, "storage failure: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<InvalidInterval> for EngineError {
    fn from(e: InvalidInterval) -> Self {
        EngineError::InvalidInterval(e.to_string())
    }
}
