use ulid::Ulid;

use crate::model::{Action, BookingStatus, Role};

/// Which allotment invariant was violated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllotmentViolation {
    SeatTaken(String),
    StudentAlreadySeated(Ulid),
    CapacityExceeded(u32),
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Malformed input, reported with the offending field.
    Validation {
        field: &'static str,
        reason: &'static str,
    },
    /// The hall is taken for the requested interval. The Display form
    /// carries the word "unavailable" — presentation layers match on it.
    Conflict(Ulid),
    /// Role/state pair not in the transition table.
    ForbiddenTransition {
        role: Role,
        from: BookingStatus,
        action: Action,
    },
    /// Transition attempted from a terminal status; the client is stale.
    InvalidState(BookingStatus),
    AllotmentConflict(AllotmentViolation),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Validation { field, reason } => {
                write!(f, "invalid {field}: {reason}")
            }
            EngineError::Conflict(id) => {
                write!(
                    f,
                    "hall currently unavailable: conflicts with booking {id}"
                )
            }
            EngineError::ForbiddenTransition { role, from, action } => {
                write!(
                    f,
                    "role {} may not {} a booking in state {}",
                    role.as_str(),
                    action.as_str(),
                    from.as_str()
                )
            }
            EngineError::InvalidState(status) => {
                write!(f, "booking is in terminal state {}", status.as_str())
            }
            EngineError::AllotmentConflict(violation) => match violation {
                AllotmentViolation::SeatTaken(seat) => {
                    write!(f, "allotment conflict: seat {seat} is already taken")
                }
                AllotmentViolation::StudentAlreadySeated(student) => {
                    write!(
                        f,
                        "allotment conflict: student {student} already has a seat"
                    )
                }
                AllotmentViolation::CapacityExceeded(cap) => {
                    write!(f, "allotment conflict: hall capacity {cap} exceeded")
                }
            },
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
