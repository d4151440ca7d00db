//! Stable exit codes for the `autotest` CLI.

/// Command succeeded; for `run`, every test case passed.
pub const OK: i32 = 0;
/// Invalid usage, config or store layout.
pub const INVALID: i32 = 1;
/// At least one test case finished `failed` and none errored.
pub const SOME_FAILED: i32 = 2;
/// At least one test case finished `error`.
pub const SOME_ERRORED: i32 = 3;
