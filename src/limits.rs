//! Hard input limits. Every externally supplied value is bounded so a
//! single client cannot blow up memory or the WAL.

use crate::model::Ms;

/// 2000-01-01T00:00:00Z — anything earlier is a client bug.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;

/// 2100-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single booking may span at most 30 days.
pub const MAX_SPAN_DURATION_MS: Ms = 30 * 24 * 3_600_000;

/// Availability queries are capped to a one-year window.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_HALLS_PER_CAMPUS: usize = 10_000;
pub const MAX_EXAMS_PER_CAMPUS: usize = 100_000;
pub const MAX_BOOKINGS_PER_HALL: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_PURPOSE_LEN: usize = 1024;
pub const MAX_SEAT_LEN: usize = 32;

pub const MAX_CAMPUSES: usize = 1024;
pub const MAX_CAMPUS_NAME_LEN: usize = 256;
