/// Application-level constants
pub const APP_NAME: &str = "Adhera";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Symmetric tolerance around a scheduled slot time within which a recorded
/// dose still satisfies the slot, in minutes (window is ±15, i.e. 30 wide).
pub const DOSE_TOLERANCE_MINUTES: i64 = 15;

/// Length of the rolling adherence window: today plus the 29 preceding days.
pub const ADHERENCE_WINDOW_DAYS: u32 = 30;

/// Safety bound on the backward streak walk. Pathological data only — a
/// genuine streak of 365 days must still be reported exactly.
pub const STREAK_WALK_CAP: u32 = 366;

/// Days covered by the recent-activity feed (today included).
pub const ACTIVITY_FEED_DAYS: u32 = 7;

/// Default tracing filter when RUST_LOG is unset.
pub fn default_log_filter() -> &'static str {
    "info,adhera=debug"
}
