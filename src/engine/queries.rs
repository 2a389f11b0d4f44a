use ulid::Ulid;

use crate::limits::MAX_QUERY_WINDOW_MS;
use crate::model::*;

use super::availability::free_slots;
use super::{Engine, EngineError};

fn booking_info(hall_id: Ulid, b: &Booking) -> BookingInfo {
    BookingInfo {
        id: b.id,
        hall_id,
        requester: b.requester,
        start: b.span.start,
        end: b.span.end,
        purpose: b.purpose.clone(),
        status: b.status,
    }
}

impl Engine {
    pub async fn list_halls(&self) -> Vec<HallInfo> {
        let arcs: Vec<_> = self.halls.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(arcs.len());
        for arc in arcs {
            let g = arc.read().await;
            out.push(HallInfo {
                id: g.id,
                name: g.name.clone(),
                kind: g.kind,
                capacity: g.capacity,
            });
        }
        out.sort_by_key(|h| h.id);
        out
    }

    pub async fn list_bookings(&self) -> Vec<BookingInfo> {
        let arcs: Vec<_> = self.halls.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for arc in arcs {
            let g = arc.read().await;
            out.extend(g.bookings.iter().map(|b| booking_info(g.id, b)));
        }
        out.sort_by_key(|b| b.id);
        out
    }

    pub async fn bookings_for_hall(&self, hall_id: Ulid) -> Result<Vec<BookingInfo>, EngineError> {
        let hall = self
            .get_hall(&hall_id)
            .ok_or(EngineError::NotFound(hall_id))?;
        let g = hall.read().await;
        Ok(g.bookings.iter().map(|b| booking_info(hall_id, b)).collect())
    }

    /// A requester's own bookings across every hall, any status.
    pub async fn bookings_for_requester(&self, user_id: Ulid) -> Vec<BookingInfo> {
        let arcs: Vec<_> = self.halls.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for arc in arcs {
            let g = arc.read().await;
            out.extend(
                g.bookings
                    .iter()
                    .filter(|b| b.requester.user_id == user_id)
                    .map(|b| booking_info(g.id, b)),
            );
        }
        out.sort_by_key(|b| b.id);
        out
    }

    pub async fn booking(&self, booking_id: Ulid) -> Result<BookingInfo, EngineError> {
        let hall_id = self
            .hall_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let hall = self
            .get_hall(&hall_id)
            .ok_or(EngineError::NotFound(hall_id))?;
        let g = hall.read().await;
        g.booking(booking_id)
            .map(|b| booking_info(hall_id, b))
            .ok_or(EngineError::NotFound(booking_id))
    }

    pub async fn list_exams(&self) -> Vec<ExamInfo> {
        let arcs: Vec<_> = self.exams.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(arcs.len());
        for arc in arcs {
            let g = arc.read().await;
            out.push(ExamInfo {
                id: g.id,
                name: g.name.clone(),
                date: g.date,
                hall_id: g.hall_id,
            });
        }
        out.sort_by_key(|e| e.id);
        out
    }

    pub async fn allotments_for_exam(
        &self,
        exam_id: Ulid,
    ) -> Result<Vec<AllotmentInfo>, EngineError> {
        let exam = self
            .get_exam(&exam_id)
            .ok_or(EngineError::NotFound(exam_id))?;
        let g = exam.read().await;
        Ok(g.allotments
            .iter()
            .map(|a| AllotmentInfo {
                id: a.id,
                exam_id,
                student_id: a.student_id,
                seat: a.seat.clone(),
            })
            .collect())
    }

    /// Free intervals of a hall inside a query window: the window minus the
    /// merged spans of pending and approved bookings.
    pub async fn hall_free_slots(
        &self,
        hall_id: Ulid,
        query: Span,
    ) -> Result<Vec<Span>, EngineError> {
        if query.end <= query.start {
            return Err(EngineError::Validation {
                field: "end",
                reason: "end time must be after start time",
            });
        }
        if query.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let hall = self
            .get_hall(&hall_id)
            .ok_or(EngineError::NotFound(hall_id))?;
        let g = hall.read().await;
        Ok(free_slots(&g, &query))
    }
}
