//! Exit codes of the `kvprobe` binary. Scripts rely on these values.

pub const SUCCESS: i32 = 0; // Probe produced a finding, or the control succeeded
pub const PROBE_FAILED: i32 = 1; // Probe failed or was aborted
pub const CONFIG_ERROR: i32 = 2; // Bad config or internal error
pub const RUN_BLOCKED: i32 = 3; // Another connection blocked open or delete
