use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.end <= span.start {
        return Err(EngineError::Validation {
            field: "end",
            reason: "end time must be after start time",
        });
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Scan a hall for a booking in the blocking set whose interval overlaps
/// `span`, skipping `exclude` (used when re-validating an existing booking
/// during approval). Pure read; safe to call repeatedly.
pub(crate) fn find_conflict(
    hall: &HallState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Option<Ulid> {
    hall.overlapping(span)
        .find(|b| Some(b.id) != exclude && b.status.blocks())
        .map(|b| b.id)
}

/// `find_conflict` lifted to the error type the mutation paths want.
pub(crate) fn check_no_conflict(
    hall: &HallState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(hall, span, exclude) {
        Some(blocking) => Err(EngineError::Conflict(blocking)),
        None => Ok(()),
    }
}
