//! Runtime-configurable tuning parameters for flextree.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `FLEXTREE_`) or by constructing a custom `FlexConfig`.

use crate::reduce::MAX_REDUCE_INPUTS;
use std::time::Duration;

/// Tuning parameters for the staged allreduce and the bundled transports.
#[derive(Debug, Clone, PartialEq)]
pub struct FlexConfig {
    /// Largest stage radix the planner may choose. Clamped to
    /// `2..=MAX_REDUCE_INPUTS` when a plan is built.
    pub max_radix: usize,

    /// Explicit stage radices. When set, the planner is bypassed and these
    /// radices (together with `num_lonely`) are used as-is.
    pub stages: Option<Vec<usize>>,

    /// Lonely rank count used together with `stages`.
    pub num_lonely: usize,

    /// Blocks at least this many bytes long are reduced on the rayon pool.
    pub parallel_reduce_bytes: usize,

    /// Timeout for forming the TCP mesh.
    pub connect_timeout: Duration,
}

impl Default for FlexConfig {
    fn default() -> Self {
        Self {
            max_radix: MAX_REDUCE_INPUTS,
            stages: None,
            num_lonely: 0,
            parallel_reduce_bytes: 256 * 1024, // 256 KiB
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl FlexConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `FLEXTREE_MAX_RADIX`
    /// - `FLEXTREE_STAGES` (comma-separated, e.g. `2,2,4`)
    /// - `FLEXTREE_NUM_LONELY`
    /// - `FLEXTREE_PARALLEL_REDUCE_BYTES`
    /// - `FLEXTREE_CONNECT_TIMEOUT_SECS`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(v) = lookup("FLEXTREE_MAX_RADIX")
            && let Ok(n) = v.trim().parse::<usize>()
        {
            cfg.max_radix = n;
        }
        if let Some(v) = lookup("FLEXTREE_STAGES")
            && let Some(stages) = parse_stage_list(&v)
        {
            cfg.stages = Some(stages);
        }
        if let Some(v) = lookup("FLEXTREE_NUM_LONELY")
            && let Ok(n) = v.trim().parse::<usize>()
        {
            cfg.num_lonely = n;
        }
        if let Some(v) = lookup("FLEXTREE_PARALLEL_REDUCE_BYTES")
            && let Ok(n) = v.trim().parse::<usize>()
        {
            cfg.parallel_reduce_bytes = n;
        }
        if let Some(v) = lookup("FLEXTREE_CONNECT_TIMEOUT_SECS")
            && let Ok(s) = v.trim().parse::<u64>()
        {
            cfg.connect_timeout = Duration::from_secs(s);
        }

        cfg
    }
}

/// Parse `"2, 2,4"` into `[2, 2, 4]`. Any malformed entry rejects the list.
fn parse_stage_list(s: &str) -> Option<Vec<usize>> {
    let stages = s
        .split(',')
        .map(|part| part.trim().parse::<usize>().ok())
        .collect::<Option<Vec<_>>>()?;
    if stages.is_empty() { None } else { Some(stages) }
}
