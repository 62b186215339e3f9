use uuid::Uuid;

/// Generate a primary-key UUID.
///
/// V7 UUIDs are time-ordered, which keeps index locality good and makes
/// "greatest id" a chronological tiebreak.
#[inline]
pub fn db_id() -> Uuid {
    Uuid::now_v7()
}
