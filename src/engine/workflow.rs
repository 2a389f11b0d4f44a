use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, validate_span};
use super::{Engine, EngineError, SharedHallState};

/// The transition table. Terminal statuses refuse everything before role
/// gating, so a stale client sees "terminal state" rather than a role error.
///
/// STAFF:  PENDING → APPROVED_STAFF | REJECTED
/// ADMIN:  PENDING | APPROVED_STAFF → APPROVED_ADMIN | REJECTED
pub fn next_status(
    current: BookingStatus,
    action: Action,
    role: Role,
) -> Result<BookingStatus, EngineError> {
    if current.is_terminal() {
        return Err(EngineError::InvalidState(current));
    }
    let next = match (role, current, action) {
        (Role::Staff, BookingStatus::Pending, Action::Approve) => BookingStatus::ApprovedStaff,
        (Role::Staff, BookingStatus::Pending, Action::Reject) => BookingStatus::Rejected,
        (Role::Admin, BookingStatus::Pending, Action::Approve)
        | (Role::Admin, BookingStatus::ApprovedStaff, Action::Approve) => {
            BookingStatus::ApprovedAdmin
        }
        (Role::Admin, BookingStatus::Pending, Action::Reject)
        | (Role::Admin, BookingStatus::ApprovedStaff, Action::Reject) => BookingStatus::Rejected,
        (role, from, action) => {
            return Err(EngineError::ForbiddenTransition { role, from, action });
        }
    };
    Ok(next)
}

impl Engine {
    pub async fn create_hall(
        &self,
        id: Ulid,
        name: String,
        kind: HallKind,
        capacity: u32,
    ) -> Result<(), EngineError> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(EngineError::Validation {
                field: "name",
                reason: "must be 1..=256 bytes",
            });
        }
        if capacity == 0 {
            return Err(EngineError::Validation {
                field: "capacity",
                reason: "must be positive",
            });
        }
        if self.halls.len() >= MAX_HALLS_PER_CAMPUS {
            return Err(EngineError::LimitExceeded("too many halls"));
        }
        if self.halls.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::HallCreated {
            id,
            name: name.clone(),
            kind,
            capacity,
        };
        self.wal_append(&event).await?;

        let hall = HallState::new(id, name, kind, capacity);
        self.halls
            .insert(id, SharedHallState::new(tokio::sync::RwLock::new(hall)));
        self.notify.send(id, &event);
        metrics::gauge!(crate::observability::HALLS_ACTIVE).increment(1.0);
        Ok(())
    }

    /// Submit a booking request. Always lands in PENDING — nobody, whatever
    /// their role, skips the approval chain. The conflict check and the
    /// insert happen under one write lock, so two racing requests for an
    /// overlapping slot serialize and the loser gets `Conflict`.
    pub async fn submit_booking(
        &self,
        id: Ulid,
        hall_id: Ulid,
        requester: Requester,
        span: Span,
        purpose: String,
    ) -> Result<(), EngineError> {
        validate_span(&span)?;
        if purpose.is_empty() || purpose.len() > MAX_PURPOSE_LEN {
            return Err(EngineError::Validation {
                field: "purpose",
                reason: "must be 1..=1024 bytes",
            });
        }
        if self.booking_to_hall.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let hall = self
            .get_hall(&hall_id)
            .ok_or(EngineError::NotFound(hall_id))?;
        let mut guard = hall.write().await;

        if guard.bookings.len() >= MAX_BOOKINGS_PER_HALL {
            return Err(EngineError::LimitExceeded("too many bookings on hall"));
        }
        check_no_conflict(&guard, &span, None)?;

        let event = Event::BookingSubmitted {
            id,
            hall_id,
            requester,
            span,
            purpose,
        };
        self.persist_and_apply_hall(hall_id, &mut guard, &event)
            .await?;
        metrics::counter!(crate::observability::BOOKINGS_SUBMITTED_TOTAL).increment(1);
        Ok(())
    }

    /// Drive a booking through the approval chain. Approvals re-run the
    /// conflict check (excluding the booking itself) under the same write
    /// lock, so a slot can never end up with two approved bookings even if
    /// both were accepted as PENDING before either approval.
    pub async fn transition_booking(
        &self,
        booking_id: Ulid,
        action: Action,
        role: Role,
    ) -> Result<BookingStatus, EngineError> {
        let (hall_id, mut guard) = self.resolve_booking_write(&booking_id).await?;

        let booking = guard
            .booking(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let target = next_status(booking.status, action, role)?;

        if action == Action::Approve {
            let span = booking.span;
            check_no_conflict(&guard, &span, Some(booking_id))?;
        }

        let event = Event::BookingStatusChanged {
            id: booking_id,
            hall_id,
            status: target,
        };
        self.persist_and_apply_hall(hall_id, &mut guard, &event)
            .await?;
        metrics::counter!(
            crate::observability::BOOKING_TRANSITIONS_TOTAL,
            "target" => target.as_str()
        )
        .increment(1);
        Ok(target)
    }
}
