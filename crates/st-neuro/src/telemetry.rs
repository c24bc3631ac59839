// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use spiral_config::{InitError, TracingOptions};
use tracing::warn;

/// Installs the workspace subscriber. A subscriber that is already in place
/// is kept; any other failure is logged and returned as `false`.
pub fn init_tracing() -> bool {
    settle(spiral_config::init_tracing())
}

/// Same as [`init_tracing`] with a fallback filter for when `RUST_LOG` is unset.
pub fn init_tracing_with_filter(directive: &str) -> bool {
    settle(spiral_config::init_tracing_with(
        TracingOptions::default().with_default_filter(directive),
    ))
}

fn settle(result: Result<(), InitError>) -> bool {
    match result {
        Ok(()) | Err(InitError::AlreadyInitialised) => true,
        Err(err) => {
            warn!(error = %err, "tracing subscriber not installed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_initialisation_is_tolerated() {
        let _ = init_tracing_with_filter("warn");
        assert!(settle(Err(InitError::AlreadyInitialised)));
        assert!(!settle(Err(InitError::Subscriber("taken".into()))));
    }
}
