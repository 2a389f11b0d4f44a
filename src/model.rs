use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Principal role snapshot, supplied by the (external) identity source
/// with every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Student,
    Staff,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "STUDENT",
            Role::Staff => "STAFF",
            Role::Admin => "ADMIN",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "STUDENT" => Some(Role::Student),
            "STAFF" => Some(Role::Staff),
            "ADMIN" => Some(Role::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HallKind {
    Classroom,
    Lab,
    EventHall,
}

impl HallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HallKind::Classroom => "CLASSROOM",
            HallKind::Lab => "LAB",
            HallKind::EventHall => "EVENT_HALL",
        }
    }

    pub fn parse(s: &str) -> Option<HallKind> {
        match s {
            "CLASSROOM" => Some(HallKind::Classroom),
            "LAB" => Some(HallKind::Lab),
            "EVENT_HALL" => Some(HallKind::EventHall),
            _ => None,
        }
    }
}

/// Booking lifecycle. Callers see these as the literal strings below and
/// must treat them as an opaque enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    ApprovedStaff,
    ApprovedAdmin,
    Rejected,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::ApprovedStaff => "APPROVED_STAFF",
            BookingStatus::ApprovedAdmin => "APPROVED_ADMIN",
            BookingStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<BookingStatus> {
        match s {
            "PENDING" => Some(BookingStatus::Pending),
            "APPROVED_STAFF" => Some(BookingStatus::ApprovedStaff),
            "APPROVED_ADMIN" => Some(BookingStatus::ApprovedAdmin),
            "REJECTED" => Some(BookingStatus::Rejected),
            _ => None,
        }
    }

    /// No transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::ApprovedAdmin | BookingStatus::Rejected)
    }

    /// Membership in the blocking set: a booking in any of these states
    /// reserves its slot for conflict purposes. A pending request already
    /// blocks, so two simultaneous requesters cannot both be told the hall
    /// is available.
    pub fn blocks(&self) -> bool {
        !matches!(self, BookingStatus::Rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Approve,
    Reject,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Approve => "APPROVE",
            Action::Reject => "REJECT",
        }
    }
}

/// Who asked for a booking: user id plus role snapshot at submit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub user_id: Ulid,
    pub role: Role,
}

/// One booking on one hall. Never physically deleted — rejected bookings
/// are kept for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub requester: Requester,
    pub span: Span,
    pub purpose: String,
    pub status: BookingStatus,
}

#[derive(Debug, Clone)]
pub struct HallState {
    pub id: Ulid,
    pub name: String,
    pub kind: HallKind,
    /// Seat count. Gates exam allotments, not booking concurrency — a hall
    /// hosts one booking at a time.
    pub capacity: u32,
    /// All bookings ever made on this hall, sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl HallState {
    pub fn new(id: Ulid, name: String, kind: HallKind, capacity: u32) -> Self {
        Self {
            id,
            name,
            kind,
            capacity,
            bookings: Vec::new(),
        }
    }

    /// Insert keeping sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings whose span overlaps the query window. Binary search skips
    /// everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

/// One student in one seat for one exam.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allotment {
    pub id: Ulid,
    pub student_id: Ulid,
    pub seat: String,
}

#[derive(Debug, Clone)]
pub struct ExamState {
    pub id: Ulid,
    pub name: String,
    pub date: Ms,
    pub hall_id: Ulid,
    pub allotments: Vec<Allotment>,
}

impl ExamState {
    pub fn new(id: Ulid, name: String, date: Ms, hall_id: Ulid) -> Self {
        Self {
            id,
            name,
            date,
            hall_id,
            allotments: Vec::new(),
        }
    }

    pub fn allotment(&self, id: Ulid) -> Option<&Allotment> {
        self.allotments.iter().find(|a| a.id == id)
    }

    pub fn remove_allotment(&mut self, id: Ulid) -> Option<Allotment> {
        if let Some(pos) = self.allotments.iter().position(|a| a.id == id) {
            Some(self.allotments.remove(pos))
        } else {
            None
        }
    }

    pub fn seat_taken(&self, seat: &str, exclude: Option<Ulid>) -> bool {
        self.allotments
            .iter()
            .any(|a| Some(a.id) != exclude && a.seat == seat)
    }

    pub fn student_seated(&self, student_id: Ulid, exclude: Option<Ulid>) -> bool {
        self.allotments
            .iter()
            .any(|a| Some(a.id) != exclude && a.student_id == student_id)
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    HallCreated {
        id: Ulid,
        name: String,
        kind: HallKind,
        capacity: u32,
    },
    /// New booking request; always lands in PENDING.
    BookingSubmitted {
        id: Ulid,
        hall_id: Ulid,
        requester: Requester,
        span: Span,
        purpose: String,
    },
    BookingStatusChanged {
        id: Ulid,
        hall_id: Ulid,
        status: BookingStatus,
    },
    ExamCreated {
        id: Ulid,
        name: String,
        date: Ms,
        hall_id: Ulid,
    },
    ExamUpdated {
        id: Ulid,
        name: String,
        date: Ms,
        hall_id: Ulid,
    },
    SeatAllotted {
        id: Ulid,
        exam_id: Ulid,
        student_id: Ulid,
        seat: String,
    },
    /// `exam_id` is the post-update exam; apply removes the row from its
    /// previous exam via the allotment index first.
    AllotmentUpdated {
        id: Ulid,
        exam_id: Ulid,
        student_id: Ulid,
        seat: String,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HallInfo {
    pub id: Ulid,
    pub name: String,
    pub kind: HallKind,
    pub capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: Ulid,
    pub hall_id: Ulid,
    pub requester: Requester,
    pub start: Ms,
    pub end: Ms,
    pub purpose: String,
    pub status: BookingStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExamInfo {
    pub id: Ulid,
    pub name: String,
    pub date: Ms,
    pub hall_id: Ulid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllotmentInfo {
    pub id: Ulid,
    pub exam_id: Ulid,
    pub student_id: Ulid,
    pub seat: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    fn booking(start: Ms, end: Ms, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            requester: Requester {
                user_id: Ulid::new(),
                role: Role::Student,
            },
            span: Span::new(start, end),
            purpose: "lecture".into(),
            status,
        }
    }

    #[test]
    fn booking_ordering() {
        let mut hall = HallState::new(Ulid::new(), "H1".into(), HallKind::Classroom, 40);
        hall.insert_booking(booking(300, 400, BookingStatus::Pending));
        hall.insert_booking(booking(100, 200, BookingStatus::Pending));
        hall.insert_booking(booking(200, 300, BookingStatus::Pending));
        assert_eq!(hall.bookings[0].span.start, 100);
        assert_eq!(hall.bookings[1].span.start, 200);
        assert_eq!(hall.bookings[2].span.start, 300);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut hall = HallState::new(Ulid::new(), "H1".into(), HallKind::Lab, 20);
        hall.insert_booking(booking(100, 200, BookingStatus::Pending));
        hall.insert_booking(booking(450, 600, BookingStatus::Pending));
        hall.insert_booking(booking(1000, 1100, BookingStatus::Pending));

        let query = Span::new(500, 800);
        let hits: Vec<_> = hall.overlapping(&query).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        // Booking ending exactly at query.start is NOT overlapping (half-open)
        let mut hall = HallState::new(Ulid::new(), "H1".into(), HallKind::Classroom, 40);
        hall.insert_booking(booking(100, 200, BookingStatus::Pending));
        let query = Span::new(200, 300);
        assert_eq!(hall.overlapping(&query).count(), 0);
    }

    #[test]
    fn status_strings_round_trip() {
        for s in [
            BookingStatus::Pending,
            BookingStatus::ApprovedStaff,
            BookingStatus::ApprovedAdmin,
            BookingStatus::Rejected,
        ] {
            assert_eq!(BookingStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(BookingStatus::parse("approved"), None);
    }

    #[test]
    fn terminal_and_blocking_sets() {
        assert!(!BookingStatus::Pending.is_terminal());
        assert!(!BookingStatus::ApprovedStaff.is_terminal());
        assert!(BookingStatus::ApprovedAdmin.is_terminal());
        assert!(BookingStatus::Rejected.is_terminal());

        assert!(BookingStatus::Pending.blocks());
        assert!(BookingStatus::ApprovedStaff.blocks());
        assert!(BookingStatus::ApprovedAdmin.blocks());
        assert!(!BookingStatus::Rejected.blocks());
    }

    #[test]
    fn seat_and_student_lookup_honors_exclusion() {
        let mut exam = ExamState::new(Ulid::new(), "Algo".into(), 1_700_000_000_000, Ulid::new());
        let student = Ulid::new();
        let row = Allotment {
            id: Ulid::new(),
            student_id: student,
            seat: "A-1".into(),
        };
        let row_id = row.id;
        exam.allotments.push(row);

        assert!(exam.seat_taken("A-1", None));
        assert!(!exam.seat_taken("A-1", Some(row_id)));
        assert!(exam.student_seated(student, None));
        assert!(!exam.student_seated(student, Some(row_id)));
        assert!(!exam.seat_taken("A-2", None));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingSubmitted {
            id: Ulid::new(),
            hall_id: Ulid::new(),
            requester: Requester {
                user_id: Ulid::new(),
                role: Role::Staff,
            },
            span: Span::new(1000, 2000),
            purpose: "seminar".into(),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
