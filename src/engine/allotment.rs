use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{AllotmentViolation, Engine, EngineError, SharedExamState};

fn validate_exam_fields(name: &str, date: Ms) -> Result<(), EngineError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(EngineError::Validation {
            field: "name",
            reason: "must be 1..=256 bytes",
        });
    }
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&date) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

fn validate_seat(seat: &str) -> Result<(), EngineError> {
    if seat.is_empty() || seat.len() > MAX_SEAT_LEN {
        return Err(EngineError::Validation {
            field: "seat",
            reason: "must be 1..=32 bytes",
        });
    }
    Ok(())
}

impl Engine {
    pub async fn create_exam(
        &self,
        id: Ulid,
        name: String,
        date: Ms,
        hall_id: Ulid,
    ) -> Result<(), EngineError> {
        validate_exam_fields(&name, date)?;
        if self.get_hall(&hall_id).is_none() {
            return Err(EngineError::NotFound(hall_id));
        }
        if self.exams.len() >= MAX_EXAMS_PER_CAMPUS {
            return Err(EngineError::LimitExceeded("too many exams"));
        }
        if self.exams.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ExamCreated {
            id,
            name: name.clone(),
            date,
            hall_id,
        };
        self.wal_append(&event).await?;

        let exam = ExamState::new(id, name, date, hall_id);
        self.exams
            .insert(id, SharedExamState::new(tokio::sync::RwLock::new(exam)));
        self.notify.send(id, &event);
        Ok(())
    }

    /// Rewrite an exam's metadata. Fields left as `None` keep their current
    /// values, resolved under the exam's write lock so concurrent partial
    /// updates serialize instead of overwriting each other. Moving the exam
    /// to another hall re-checks capacity against the allotments already
    /// issued — a move that would orphan seated students is refused.
    pub async fn update_exam(
        &self,
        exam_id: Ulid,
        name: Option<String>,
        date: Option<Ms>,
        hall_id: Option<Ulid>,
    ) -> Result<(), EngineError> {
        let exam = self
            .get_exam(&exam_id)
            .ok_or(EngineError::NotFound(exam_id))?;
        let mut guard = exam.write().await;

        let name = name.unwrap_or_else(|| guard.name.clone());
        let date = date.unwrap_or(guard.date);
        let hall_id = hall_id.unwrap_or(guard.hall_id);
        validate_exam_fields(&name, date)?;

        let hall = self
            .get_hall(&hall_id)
            .ok_or(EngineError::NotFound(hall_id))?;
        if hall_id != guard.hall_id {
            let capacity = hall.read().await.capacity;
            if guard.allotments.len() as u32 > capacity {
                return Err(EngineError::AllotmentConflict(
                    AllotmentViolation::CapacityExceeded(capacity),
                ));
            }
        }

        let event = Event::ExamUpdated {
            id: exam_id,
            name,
            date,
            hall_id,
        };
        self.persist_and_apply_exam(exam_id, &mut guard, &event)
            .await
    }

    /// Seat a student for an exam. Seat uniqueness, one-seat-per-student,
    /// and hall capacity are all checked under the exam's write lock so
    /// racing allotments serialize.
    pub async fn allot_seat(
        &self,
        id: Ulid,
        exam_id: Ulid,
        student_id: Ulid,
        seat: String,
    ) -> Result<(), EngineError> {
        validate_seat(&seat)?;
        if self.allotment_to_exam.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let exam = self
            .get_exam(&exam_id)
            .ok_or(EngineError::NotFound(exam_id))?;
        let mut guard = exam.write().await;

        let hall = self
            .get_hall(&guard.hall_id)
            .ok_or(EngineError::NotFound(guard.hall_id))?;
        let capacity = hall.read().await.capacity;

        check_allotment(&guard, student_id, &seat, None, Some(capacity))?;

        let event = Event::SeatAllotted {
            id,
            exam_id,
            student_id,
            seat,
        };
        self.persist_and_apply_exam(exam_id, &mut guard, &event)
            .await?;
        metrics::counter!(crate::observability::SEATS_ALLOTTED_TOTAL).increment(1);
        Ok(())
    }

    /// Rewrite an allotment, possibly moving it to another exam. Fields left
    /// as `None` keep their current values, resolved under the exam locks.
    /// A cross-exam move takes both locks in sorted id order so two
    /// concurrent moves cannot deadlock.
    pub async fn update_allotment(
        &self,
        allotment_id: Ulid,
        exam_id: Option<Ulid>,
        student_id: Option<Ulid>,
        seat: Option<String>,
    ) -> Result<(), EngineError> {
        if let Some(seat) = &seat {
            validate_seat(seat)?;
        }
        let old_exam_id = self
            .exam_for_allotment(&allotment_id)
            .ok_or(EngineError::NotFound(allotment_id))?;
        let new_exam_id = exam_id.unwrap_or(old_exam_id);

        if old_exam_id == new_exam_id {
            let exam = self
                .get_exam(&new_exam_id)
                .ok_or(EngineError::NotFound(new_exam_id))?;
            let mut guard = exam.write().await;
            let current = guard
                .allotment(allotment_id)
                .ok_or(EngineError::NotFound(allotment_id))?;
            let student_id = student_id.unwrap_or(current.student_id);
            let seat = seat.unwrap_or_else(|| current.seat.clone());
            // Row count doesn't change, so the capacity bound is skipped;
            // the exclusion matters for the seat and student checks.
            check_allotment(&guard, student_id, &seat, Some(allotment_id), None)?;
            let event = Event::AllotmentUpdated {
                id: allotment_id,
                exam_id: new_exam_id,
                student_id,
                seat,
            };
            return self
                .persist_and_apply_exam(new_exam_id, &mut guard, &event)
                .await;
        }

        let old_exam = self
            .get_exam(&old_exam_id)
            .ok_or(EngineError::NotFound(old_exam_id))?;
        let new_exam = self
            .get_exam(&new_exam_id)
            .ok_or(EngineError::NotFound(new_exam_id))?;

        // Sorted id order
        let (mut old_guard, mut new_guard) = if old_exam_id < new_exam_id {
            let o = old_exam.write().await;
            let n = new_exam.write().await;
            (o, n)
        } else {
            let n = new_exam.write().await;
            let o = old_exam.write().await;
            (o, n)
        };

        let current = old_guard
            .allotment(allotment_id)
            .ok_or(EngineError::NotFound(allotment_id))?;
        let student_id = student_id.unwrap_or(current.student_id);
        let seat = seat.unwrap_or_else(|| current.seat.clone());
        let hall = self
            .get_hall(&new_guard.hall_id)
            .ok_or(EngineError::NotFound(new_guard.hall_id))?;
        let capacity = hall.read().await.capacity;
        check_allotment(&new_guard, student_id, &seat, None, Some(capacity))?;

        let event = Event::AllotmentUpdated {
            id: allotment_id,
            exam_id: new_exam_id,
            student_id,
            seat: seat.clone(),
        };
        self.wal_append(&event).await?;
        old_guard.remove_allotment(allotment_id);
        new_guard.allotments.push(Allotment {
            id: allotment_id,
            student_id,
            seat,
        });
        self.allotment_to_exam.insert(allotment_id, new_exam_id);
        self.notify.send(old_exam_id, &event);
        self.notify.send(new_exam_id, &event);
        Ok(())
    }
}

/// All three allotment invariants, in reporting order: seat, student,
/// capacity. `capacity` is the maximum row count after this operation;
/// `None` skips the bound for operations that leave the row count unchanged.
fn check_allotment(
    exam: &ExamState,
    student_id: Ulid,
    seat: &str,
    exclude: Option<Ulid>,
    capacity: Option<u32>,
) -> Result<(), EngineError> {
    if exam.seat_taken(seat, exclude) {
        return Err(EngineError::AllotmentConflict(AllotmentViolation::SeatTaken(
            seat.to_string(),
        )));
    }
    if exam.student_seated(student_id, exclude) {
        return Err(EngineError::AllotmentConflict(
            AllotmentViolation::StudentAlreadySeated(student_id),
        ));
    }
    if let Some(capacity) = capacity
        && exam.allotments.len() as u32 >= capacity
    {
        return Err(EngineError::AllotmentConflict(
            AllotmentViolation::CapacityExceeded(capacity),
        ));
    }
    Ok(())
}
