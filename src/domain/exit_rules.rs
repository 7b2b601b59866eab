//! Exit decision ladder for one open long position.
//!
//! Rules are checked in a fixed order and the first match wins:
//!
//! 1. hard stop (always, even while trailing)
//! 2. soft stop (skipped once trailing is active)
//! 3. trailing stop (only while trailing is active; signals are ignored)
//! 4. trailing activation (no exit on the activating tick)
//! 5. signal exit (only before trailing, at breakeven or better)
//!
//! Thresholds are expressed in percent of entry price.

use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

use super::position::Position;

/// Slack for percent comparisons so thresholds are inclusive.
const PCT_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub struct ExitConfig {
    pub hard_stop_pct: f64,
    pub soft_stop_pct: f64,
    pub trailing_activation_pct: f64,
    pub trailing_volatility_multiplier: f64,
    pub trailing_min_distance_pct: f64,
    pub trailing_max_distance_pct: f64,
    /// Used when the volatility feed has nothing usable.
    pub default_volatility_pct: f64,
    /// Signals older than this are treated as absent.
    pub signal_max_age_secs: i64,
    /// Round-trip fees netted from the gain before a signal exit.
    pub signal_exit_fee_pct: f64,
}

impl Default for ExitConfig {
    fn default() -> Self {
        ExitConfig {
            hard_stop_pct: 5.0,
            soft_stop_pct: 2.5,
            trailing_activation_pct: 3.5,
            trailing_volatility_multiplier: 2.0,
            trailing_min_distance_pct: 1.0,
            trailing_max_distance_pct: 5.0,
            default_volatility_pct: 1.0,
            signal_max_age_secs: 300,
            signal_exit_fee_pct: 0.0,
        }
    }
}

/// Directional signal from the external signal source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Buy,
    Sell,
    Neutral,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Buy => "buy",
            Signal::Sell => "sell",
            Signal::Neutral => "none",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Signal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Ok(Signal::Buy),
            "sell" => Ok(Signal::Sell),
            "none" | "neutral" | "" => Ok(Signal::Neutral),
            other => Err(format!("unknown signal '{other}'")),
        }
    }
}

/// A signal together with the time it was produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalReading {
    pub signal: Signal,
    pub as_of: DateTime<Utc>,
}

impl SignalReading {
    /// The signal if it is no older than `max_age_secs` at `now`.
    pub fn fresh(&self, now: DateTime<Utc>, max_age_secs: i64) -> Option<Signal> {
        let age = (now - self.as_of).num_seconds();
        (age <= max_age_secs).then_some(self.signal)
    }
}

/// Inputs for one evaluation tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickInputs {
    pub price: f64,
    /// Percent of price; `None` falls back to the configured default.
    pub volatility_pct: Option<f64>,
    /// `None` when the signal feed is unavailable or stale.
    pub signal: Option<Signal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    /// Cross the spread now.
    Aggressive,
    /// Work the order passively.
    Patient,
}

/// Outcome of one tick. At most one exit per tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitDecision {
    Hold,
    HardExit { loss_pct: f64 },
    SoftExit { loss_pct: f64 },
    TrailingActivated { peak_price: f64, stop_price: f64 },
    TrailingExit { price: f64, stop_price: f64, peak_price: f64 },
    SignalExit { gain_pct: f64 },
}

impl ExitDecision {
    pub fn kind(&self) -> &'static str {
        match self {
            ExitDecision::Hold => "none",
            ExitDecision::HardExit { .. } => "hard_exit",
            ExitDecision::SoftExit { .. } => "soft_exit",
            ExitDecision::TrailingActivated { .. } => "trailing_activated",
            ExitDecision::TrailingExit { .. } => "trailing_exit",
            ExitDecision::SignalExit { .. } => "signal_exit",
        }
    }

    pub fn is_exit(&self) -> bool {
        self.urgency().is_some()
    }

    pub fn urgency(&self) -> Option<Urgency> {
        match self {
            ExitDecision::HardExit { .. } => Some(Urgency::Aggressive),
            ExitDecision::SoftExit { .. }
            | ExitDecision::TrailingExit { .. }
            | ExitDecision::SignalExit { .. } => Some(Urgency::Patient),
            ExitDecision::Hold | ExitDecision::TrailingActivated { .. } => None,
        }
    }

    pub fn reason(&self) -> String {
        match self {
            ExitDecision::Hold => "no exit rule fired".to_string(),
            ExitDecision::HardExit { loss_pct } => {
                format!("loss {loss_pct:.2}% reached hard stop")
            }
            ExitDecision::SoftExit { loss_pct } => {
                format!("loss {loss_pct:.2}% reached soft stop")
            }
            ExitDecision::TrailingActivated {
                peak_price,
                stop_price,
            } => format!("trailing stop armed at {stop_price:.4} below peak {peak_price:.4}"),
            ExitDecision::TrailingExit {
                price,
                stop_price,
                peak_price,
            } => format!(
                "price {price:.4} fell through trailing stop {stop_price:.4} (peak {peak_price:.4})"
            ),
            ExitDecision::SignalExit { gain_pct } => {
                format!("sell signal at {gain_pct:.2}% gain before trailing")
            }
        }
    }
}

impl fmt::Display for ExitDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind(), self.reason())
    }
}

/// Distance of the trailing stop below the peak, in percent.
pub fn trailing_distance_pct(volatility_pct: Option<f64>, config: &ExitConfig) -> f64 {
    let volatility = volatility_pct
        .filter(|v| v.is_finite() && *v > 0.0)
        .unwrap_or(config.default_volatility_pct);
    (volatility * config.trailing_volatility_multiplier).clamp(
        config.trailing_min_distance_pct,
        config.trailing_max_distance_pct,
    )
}

fn stop_below(peak_price: f64, distance_pct: f64) -> f64 {
    peak_price * (1.0 - distance_pct / 100.0)
}

/// Run the ladder for one tick.
///
/// Mutates only `peak_price`, `stop_price` and `trailing_active`. A price
/// that is not a positive finite number leaves the position untouched.
pub fn evaluate_position(
    position: &mut Position,
    tick: &TickInputs,
    config: &ExitConfig,
) -> ExitDecision {
    let price = tick.price;
    if !(price.is_finite() && price > 0.0) {
        return ExitDecision::Hold;
    }

    let gain_pct = position.gain_pct(price);
    let loss_pct = -gain_pct;
    position.peak_price = position.peak_price.max(price);

    if loss_pct + PCT_TOLERANCE >= config.hard_stop_pct {
        return ExitDecision::HardExit { loss_pct };
    }

    if !position.trailing_active && loss_pct + PCT_TOLERANCE >= config.soft_stop_pct {
        return ExitDecision::SoftExit { loss_pct };
    }

    let distance_pct = trailing_distance_pct(tick.volatility_pct, config);

    if position.trailing_active {
        let candidate = stop_below(position.peak_price, distance_pct);
        let stop_price = position
            .stop_price
            .map_or(candidate, |current| current.max(candidate));
        position.stop_price = Some(stop_price);

        if price <= stop_price {
            return ExitDecision::TrailingExit {
                price,
                stop_price,
                peak_price: position.peak_price,
            };
        }
        return ExitDecision::Hold;
    }

    if gain_pct + PCT_TOLERANCE >= config.trailing_activation_pct {
        let stop_price = stop_below(position.peak_price, distance_pct);
        position.trailing_active = true;
        position.stop_price = Some(stop_price);
        return ExitDecision::TrailingActivated {
            peak_price: position.peak_price,
            stop_price,
        };
    }

    let net_gain_pct = gain_pct - config.signal_exit_fee_pct;
    if tick.signal == Some(Signal::Sell) && net_gain_pct + PCT_TOLERANCE >= 0.0 {
        return ExitDecision::SignalExit { gain_pct };
    }

    ExitDecision::Hold
}
