//! Configuration validation.
//!
//! Runs before any command touches storage. Missing keys fall back to the
//! documented defaults; present keys must make sense together.

use crate::domain::allocation::DEFAULT_EPSILON;
use crate::domain::error::LedgerError;
use crate::domain::exit_rules::ExitConfig;
use crate::domain::reconciliation::ReconcileConfig;
use crate::ports::config_port::ConfigPort;

const MAX_EPSILON: f64 = 1e-3;

pub fn validate_storage_config(config: &dyn ConfigPort) -> Result<(), LedgerError> {
    config.require_string("sqlite", "path")?;
    if config.get_int("sqlite", "pool_size", 4) < 1 {
        return Err(LedgerError::ConfigInvalid {
            section: "sqlite".to_string(),
            key: "pool_size".to_string(),
            reason: "pool_size must be at least 1".to_string(),
        });
    }
    Ok(())
}

pub fn validate_allocation_config(config: &dyn ConfigPort) -> Result<(), LedgerError> {
    let epsilon = config.get_double("allocation", "epsilon", DEFAULT_EPSILON);
    if !(epsilon > 0.0 && epsilon <= MAX_EPSILON) {
        return Err(LedgerError::ConfigInvalid {
            section: "allocation".to_string(),
            key: "epsilon".to_string(),
            reason: format!("epsilon must be in (0, {MAX_EPSILON}]"),
        });
    }
    Ok(())
}

pub fn validate_reconciliation_config(config: &dyn ConfigPort) -> Result<(), LedgerError> {
    let defaults = ReconcileConfig::default();
    let windows = ReconcileConfig {
        round_trip_window_secs: config.get_int(
            "reconciliation",
            "round_trip_window_secs",
            defaults.round_trip_window_secs,
        ),
        fingerprint_tolerance_secs: config.get_int(
            "reconciliation",
            "fingerprint_tolerance_secs",
            defaults.fingerprint_tolerance_secs,
        ),
        ..defaults
    };
    windows.round_trip_window()?;
    windows.fingerprint_tolerance()?;
    Ok(())
}

pub fn validate_exit_config(config: &dyn ConfigPort) -> Result<(), LedgerError> {
    let defaults = ExitConfig::default();
    let hard = config.get_double("exit", "hard_stop_pct", defaults.hard_stop_pct);
    let soft = config.get_double("exit", "soft_stop_pct", defaults.soft_stop_pct);

    if soft <= 0.0 {
        return Err(invalid_exit("soft_stop_pct", "soft_stop_pct must be positive"));
    }
    if hard <= soft {
        return Err(invalid_exit(
            "hard_stop_pct",
            "hard_stop_pct must be greater than soft_stop_pct",
        ));
    }

    let activation = config.get_double(
        "exit",
        "trailing_activation_pct",
        defaults.trailing_activation_pct,
    );
    if activation <= 0.0 {
        return Err(invalid_exit(
            "trailing_activation_pct",
            "trailing_activation_pct must be positive",
        ));
    }

    let multiplier = config.get_double(
        "exit",
        "trailing_volatility_multiplier",
        defaults.trailing_volatility_multiplier,
    );
    if multiplier <= 0.0 {
        return Err(invalid_exit(
            "trailing_volatility_multiplier",
            "trailing_volatility_multiplier must be positive",
        ));
    }

    let min = config.get_double(
        "exit",
        "trailing_min_distance_pct",
        defaults.trailing_min_distance_pct,
    );
    let max = config.get_double(
        "exit",
        "trailing_max_distance_pct",
        defaults.trailing_max_distance_pct,
    );
    if min <= 0.0 {
        return Err(invalid_exit(
            "trailing_min_distance_pct",
            "trailing_min_distance_pct must be positive",
        ));
    }
    if max < min {
        return Err(invalid_exit(
            "trailing_max_distance_pct",
            "trailing_max_distance_pct must not be below trailing_min_distance_pct",
        ));
    }

    let default_vol = config.get_double(
        "exit",
        "default_volatility_pct",
        defaults.default_volatility_pct,
    );
    if default_vol < 0.0 {
        return Err(invalid_exit(
            "default_volatility_pct",
            "default_volatility_pct must be non-negative",
        ));
    }

    if config.get_int("exit", "signal_max_age_secs", defaults.signal_max_age_secs) < 0 {
        return Err(invalid_exit(
            "signal_max_age_secs",
            "signal_max_age_secs must be non-negative",
        ));
    }

    if config.get_double("exit", "signal_exit_fee_pct", defaults.signal_exit_fee_pct) < 0.0 {
        return Err(invalid_exit(
            "signal_exit_fee_pct",
            "signal_exit_fee_pct must be non-negative",
        ));
    }

    Ok(())
}

pub fn validate_all(config: &dyn ConfigPort) -> Result<(), LedgerError> {
    validate_storage_config(config)?;
    validate_allocation_config(config)?;
    validate_reconciliation_config(config)?;
    validate_exit_config(config)?;
    Ok(())
}

fn invalid_exit(key: &str, reason: &str) -> LedgerError {
    LedgerError::ConfigInvalid {
        section: "exit".to_string(),
        key: key.to_string(),
        reason: reason.to_string(),
    }
}
