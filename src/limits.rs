//! Hard caps on tenant-controlled input.

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_SPECIALISTS_PER_TENANT: usize = 100_000;
pub const MAX_BREAKS_PER_SPECIALIST: usize = 512;
pub const MAX_OFF_DAYS_PER_SPECIALIST: usize = 4_096;
pub const MAX_BOOKINGS_PER_DAY: usize = 512;

/// Ids accepted by one bulk off-day delete.
pub const MAX_BULK_IDS: usize = 1_000;

pub const MAX_TEXT_LEN: usize = 2_048;
pub const MAX_SERVICE_NAME_LEN: usize = 256;

/// A service can't be longer than one day.
pub const MAX_SERVICE_MINUTES: u32 = 24 * 60;
