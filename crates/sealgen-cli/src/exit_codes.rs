//! Process exit codes. Core failures map through `CoreError::exit_code`.

pub const SUCCESS: i32 = 0;
/// Verification ran and found a problem (e.g. `audit`).
pub const CHECK_FAILED: i32 = 1;
pub const CONFIG_ERROR: i32 = 2;
