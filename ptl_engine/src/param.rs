// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Environment-variable tunables, read once at init. The set is
//! closed: adding a knob means adding a field here.

use log::*;

/// Runtime tunables with their `PTL_*` environment overrides.
#[derive(Debug, Clone)]
pub struct Params {
    /// Completions drained per progress-loop pass (`PTL_WC_COUNT`).
    pub wc_count: usize,

    /// Receive buffers reposted to the SRQ in one batch
    /// (`PTL_SRQ_REPOST_SIZE`).
    pub srq_repost_size: usize,

    /// Per-step connection timeout in milliseconds
    /// (`PTL_RDMA_TIMEOUT`).
    pub rdma_timeout_ms: u32,

    /// Largest payload carried in-band after the header
    /// (`PTL_MAX_INLINE`).
    pub max_inline: usize,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            wc_count: 10,
            srq_repost_size: 32,
            rdma_timeout_ms: 2000,
            max_inline: 3584,
        }
    }
}

impl Params {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let params = Self {
            wc_count: get_param("PTL_WC_COUNT", defaults.wc_count),
            srq_repost_size: get_param("PTL_SRQ_REPOST_SIZE", defaults.srq_repost_size),
            rdma_timeout_ms: get_param("PTL_RDMA_TIMEOUT", defaults.rdma_timeout_ms),
            max_inline: get_param("PTL_MAX_INLINE", defaults.max_inline),
        };

        // PTL_LOG_LEVEL feeds the standard logger filter; it is only
        // honored when RUST_LOG has not already claimed the setting.
        if let Ok(level) = std::env::var("PTL_LOG_LEVEL") {
            if std::env::var_os("RUST_LOG").is_none() {
                std::env::set_var("RUST_LOG", level);
            }
        }

        trace!("{params:?}");
        params
    }
}

/// Read one numeric parameter from the environment, falling back to
/// `default` when unset or unparseable (an unparseable value is
/// worth a warning, not a failure).
fn get_param<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    let Ok(raw) = std::env::var(name) else {
        return default;
    };

    match raw.parse() {
        Ok(v) => v,
        Err(_) => {
            warn!("ignoring unparseable {name}={raw}");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        let p = Params::default();
        assert!(p.max_inline < 4096);
        assert!(p.wc_count > 0);
    }

    #[test]
    fn env_override() {
        std::env::set_var("PTL_WC_COUNT", "3");
        assert_eq!(get_param("PTL_WC_COUNT", 10usize), 3);

        std::env::set_var("PTL_WC_COUNT", "not-a-number");
        assert_eq!(get_param("PTL_WC_COUNT", 10usize), 10);
        std::env::remove_var("PTL_WC_COUNT");
    }
}
