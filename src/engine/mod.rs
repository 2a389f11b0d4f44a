mod availability;
mod conflict;
mod error;
mod allotment;
mod queries;
mod workflow;

pub use availability::{free_slots, merge_overlapping, subtract_intervals};
pub use error::{AllotmentViolation, EngineError};
pub use workflow::next_status;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedHallState = Arc<RwLock<HallState>>;
pub type SharedExamState = Arc<RwLock<ExamState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// One campus worth of state: every hall and exam, the booking/allotment
/// reverse indexes, and the WAL writer feeding durable storage.
pub struct Engine {
    pub halls: DashMap<Ulid, SharedHallState>,
    pub exams: DashMap<Ulid, SharedExamState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: booking id → hall id.
    pub(super) booking_to_hall: DashMap<Ulid, Ulid>,
    /// Reverse lookup: allotment id → exam id.
    pub(super) allotment_to_exam: DashMap<Ulid, Ulid>,
}

/// Apply a hall-scoped event directly (no locking — caller holds the lock).
fn apply_to_hall(hall: &mut HallState, event: &Event, booking_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::BookingSubmitted {
            id,
            hall_id,
            requester,
            span,
            purpose,
        } => {
            hall.insert_booking(Booking {
                id: *id,
                requester: *requester,
                span: *span,
                purpose: purpose.clone(),
                status: BookingStatus::Pending,
            });
            booking_index.insert(*id, *hall_id);
        }
        Event::BookingStatusChanged { id, status, .. } => {
            if let Some(b) = hall.booking_mut(*id) {
                b.status = *status;
            }
        }
        _ => {}
    }
}

/// Apply an exam-scoped event directly (no locking — caller holds the lock).
/// `AllotmentUpdated` here covers the same-exam case; cross-exam moves are
/// handled by the caller, which holds both exam guards.
fn apply_to_exam(exam: &mut ExamState, event: &Event, allotment_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ExamUpdated {
            name,
            date,
            hall_id,
            ..
        } => {
            exam.name = name.clone();
            exam.date = *date;
            exam.hall_id = *hall_id;
        }
        Event::SeatAllotted {
            id,
            exam_id,
            student_id,
            seat,
        } => {
            exam.allotments.push(Allotment {
                id: *id,
                student_id: *student_id,
                seat: seat.clone(),
            });
            allotment_index.insert(*id, *exam_id);
        }
        Event::AllotmentUpdated {
            id,
            exam_id,
            student_id,
            seat,
        } => {
            exam.remove_allotment(*id);
            exam.allotments.push(Allotment {
                id: *id,
                student_id: *student_id,
                seat: seat.clone(),
            });
            allotment_index.insert(*id, *exam_id);
        }
        _ => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            halls: DashMap::new(),
            exams: DashMap::new(),
            wal_tx,
            notify,
            booking_to_hall: DashMap::new(),
            allotment_to_exam: DashMap::new(),
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this may run inside an async context (e.g. lazy campus
        // creation).
        for event in &events {
            match event {
                Event::HallCreated {
                    id,
                    name,
                    kind,
                    capacity,
                } => {
                    let hall = HallState::new(*id, name.clone(), *kind, *capacity);
                    engine.halls.insert(*id, Arc::new(RwLock::new(hall)));
                }
                Event::ExamCreated {
                    id,
                    name,
                    date,
                    hall_id,
                } => {
                    let exam = ExamState::new(*id, name.clone(), *date, *hall_id);
                    engine.exams.insert(*id, Arc::new(RwLock::new(exam)));
                }
                Event::BookingSubmitted { hall_id, .. }
                | Event::BookingStatusChanged { hall_id, .. } => {
                    if let Some(entry) = engine.halls.get(hall_id) {
                        let hall_arc = entry.value().clone();
                        let mut guard =
                            hall_arc.try_write().expect("replay: uncontended write");
                        apply_to_hall(&mut guard, event, &engine.booking_to_hall);
                    }
                }
                Event::ExamUpdated { id, .. } | Event::SeatAllotted { exam_id: id, .. } => {
                    if let Some(entry) = engine.exams.get(id) {
                        let exam_arc = entry.value().clone();
                        let mut guard =
                            exam_arc.try_write().expect("replay: uncontended write");
                        apply_to_exam(&mut guard, event, &engine.allotment_to_exam);
                    }
                }
                Event::AllotmentUpdated { id, exam_id, .. } => {
                    // May move the row between exams: detach from the old
                    // exam first, then apply to the new one.
                    if let Some(old_exam_id) = engine
                        .allotment_to_exam
                        .get(id)
                        .map(|e| *e.value())
                        && old_exam_id != *exam_id
                        && let Some(entry) = engine.exams.get(&old_exam_id)
                    {
                        let old_arc = entry.value().clone();
                        let mut guard =
                            old_arc.try_write().expect("replay: uncontended write");
                        guard.remove_allotment(*id);
                    }
                    if let Some(entry) = engine.exams.get(exam_id) {
                        let exam_arc = entry.value().clone();
                        let mut guard =
                            exam_arc.try_write().expect("replay: uncontended write");
                        apply_to_exam(&mut guard, event, &engine.allotment_to_exam);
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_hall(&self, id: &Ulid) -> Option<SharedHallState> {
        self.halls.get(id).map(|e| e.value().clone())
    }

    pub fn get_exam(&self, id: &Ulid) -> Option<SharedExamState> {
        self.exams.get(id).map(|e| e.value().clone())
    }

    pub fn hall_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_hall.get(booking_id).map(|e| *e.value())
    }

    pub fn exam_for_allotment(&self, allotment_id: &Ulid) -> Option<Ulid> {
        self.allotment_to_exam.get(allotment_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify in one call for hall-scoped events.
    pub(super) async fn persist_and_apply_hall(
        &self,
        hall_id: Ulid,
        hall: &mut HallState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_hall(hall, event, &self.booking_to_hall);
        self.notify.send(hall_id, event);
        Ok(())
    }

    /// WAL-append + apply + notify in one call for exam-scoped events.
    pub(super) async fn persist_and_apply_exam(
        &self,
        exam_id: Ulid,
        exam: &mut ExamState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_exam(exam, event, &self.allotment_to_exam);
        self.notify.send(exam_id, event);
        Ok(())
    }

    /// Lookup booking → hall, get hall, acquire write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<HallState>), EngineError> {
        let hall_id = self
            .hall_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let hall = self
            .get_hall(&hall_id)
            .ok_or(EngineError::NotFound(hall_id))?;
        let guard = hall.write_owned().await;
        Ok((hall_id, guard))
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        let hall_ids: Vec<Ulid> = self.halls.iter().map(|e| *e.key()).collect();
        for id in hall_ids {
            let Some(entry) = self.halls.get(&id) else {
                continue;
            };
            let hall_arc = entry.value().clone();
            drop(entry);
            let guard = hall_arc.read().await;

            events.push(Event::HallCreated {
                id: guard.id,
                name: guard.name.clone(),
                kind: guard.kind,
                capacity: guard.capacity,
            });
            for b in &guard.bookings {
                events.push(Event::BookingSubmitted {
                    id: b.id,
                    hall_id: guard.id,
                    requester: b.requester,
                    span: b.span,
                    purpose: b.purpose.clone(),
                });
                if b.status != BookingStatus::Pending {
                    events.push(Event::BookingStatusChanged {
                        id: b.id,
                        hall_id: guard.id,
                        status: b.status,
                    });
                }
            }
        }

        let exam_ids: Vec<Ulid> = self.exams.iter().map(|e| *e.key()).collect();
        for id in exam_ids {
            let Some(entry) = self.exams.get(&id) else {
                continue;
            };
            let exam_arc = entry.value().clone();
            drop(entry);
            let guard = exam_arc.read().await;

            events.push(Event::ExamCreated {
                id: guard.id,
                name: guard.name.clone(),
                date: guard.date,
                hall_id: guard.hall_id,
            });
            for a in &guard.allotments {
                events.push(Event::SeatAllotted {
                    id: a.id,
                    exam_id: guard.id,
                    student_id: a.student_id,
                    seat: a.seat.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
