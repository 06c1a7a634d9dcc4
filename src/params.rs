//! Runtime-tunable parameter table.
//!
//! Every parameter has a fixed key, a numeric type and an accepted range.
//! Values travel over the host protocol in a canonical ASCII form: floats use
//! the shortest representation that parses back to the same `f32`, integers
//! are plain decimal.

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hard ceiling for `max_line_len`; the line assembler preallocates this much.
pub const MAX_LINE_CAP: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKey {
    SoftStopM,
    HardStopM,
    WatchdogMs,
    OdomHz,
    SlewV,
    SlewW,
    TxBytesPerS,
    MaxLineLen,
    LogLevel,
}

impl ParamKey {
    pub const ALL: [ParamKey; 9] = [
        ParamKey::SoftStopM,
        ParamKey::HardStopM,
        ParamKey::WatchdogMs,
        ParamKey::OdomHz,
        ParamKey::SlewV,
        ParamKey::SlewW,
        ParamKey::TxBytesPerS,
        ParamKey::MaxLineLen,
        ParamKey::LogLevel,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ParamKey::SoftStopM => "soft_stop_m",
            ParamKey::HardStopM => "hard_stop_m",
            ParamKey::WatchdogMs => "watchdog_ms",
            ParamKey::OdomHz => "odom_hz",
            ParamKey::SlewV => "slew_v",
            ParamKey::SlewW => "slew_w",
            ParamKey::TxBytesPerS => "tx_bytes_per_s",
            ParamKey::MaxLineLen => "max_line_len",
            ParamKey::LogLevel => "log_level",
        }
    }

    pub fn lookup(name: &str) -> Option<ParamKey> {
        Self::ALL.iter().copied().find(|key| key.as_str() == name)
    }

    pub fn is_float(self) -> bool {
        matches!(
            self,
            ParamKey::SoftStopM | ParamKey::HardStopM | ParamKey::SlewV | ParamKey::SlewW
        )
    }

    /// Parse `text` according to this key's numeric type. Range checks happen
    /// in [`ParamSet::set`].
    pub fn parse_value(self, text: &str) -> Result<ParamValue, ParamError> {
        let text = text.trim();
        if self.is_float() {
            match f32::from_str(text) {
                Ok(v) if v.is_finite() => Ok(ParamValue::Float(v)),
                _ => Err(ParamError::InvalidNumber),
            }
        } else {
            u32::from_str(text)
                .map(ParamValue::Int)
                .map_err(|_| ParamError::InvalidNumber)
        }
    }

    // Inclusive bounds, expressed as f64 so one table covers both types
    fn bounds(self) -> (f64, f64) {
        match self {
            ParamKey::SoftStopM | ParamKey::HardStopM => (0.0, 5.0),
            ParamKey::WatchdogMs => (50.0, 10_000.0),
            ParamKey::OdomHz => (0.0, 50.0),
            ParamKey::SlewV => (0.01, 10.0),
            ParamKey::SlewW => (0.01, 20.0),
            ParamKey::TxBytesPerS => (0.0, 100_000.0),
            ParamKey::MaxLineLen => (16.0, MAX_LINE_CAP as f64),
            ParamKey::LogLevel => (0.0, 4.0),
        }
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(u32),
    Float(f32),
}

impl ParamValue {
    fn as_f64(self) -> f64 {
        match self {
            ParamValue::Int(v) => f64::from(v),
            ParamValue::Float(v) => f64::from(v),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParamError {
    #[error("unknown parameter")]
    UnknownKey,
    #[error("value is not a valid number for this parameter")]
    InvalidNumber,
    #[error("value for `{0}` is out of range")]
    OutOfRange(ParamKey),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamSet {
    pub soft_stop_m: f32,
    pub hard_stop_m: f32,
    pub watchdog_ms: u32,
    pub odom_hz: u32,
    pub slew_v: f32,
    pub slew_w: f32,
    pub tx_bytes_per_s: u32,
    pub max_line_len: u32,
    pub log_level: u8,
}

impl Default for ParamSet {
    fn default() -> Self {
        Self {
            soft_stop_m: 0.30,
            hard_stop_m: 0.10,
            watchdog_ms: 500,
            odom_hz: 10,
            slew_v: 0.5,
            slew_w: 2.0,
            tx_bytes_per_s: 4000,
            max_line_len: 96,
            log_level: 2,
        }
    }
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: ParamKey) -> ParamValue {
        match key {
            ParamKey::SoftStopM => ParamValue::Float(self.soft_stop_m),
            ParamKey::HardStopM => ParamValue::Float(self.hard_stop_m),
            ParamKey::WatchdogMs => ParamValue::Int(self.watchdog_ms),
            ParamKey::OdomHz => ParamValue::Int(self.odom_hz),
            ParamKey::SlewV => ParamValue::Float(self.slew_v),
            ParamKey::SlewW => ParamValue::Float(self.slew_w),
            ParamKey::TxBytesPerS => ParamValue::Int(self.tx_bytes_per_s),
            ParamKey::MaxLineLen => ParamValue::Int(self.max_line_len),
            ParamKey::LogLevel => ParamValue::Int(u32::from(self.log_level)),
        }
    }

    /// Validate and store a value. Returns the stored value so callers can
    /// echo its canonical encoding.
    pub fn set(&mut self, key: ParamKey, value: ParamValue) -> Result<ParamValue, ParamError> {
        let value = match (key.is_float(), value) {
            (true, ParamValue::Int(v)) => ParamValue::Float(v as f32),
            (false, ParamValue::Float(_)) => return Err(ParamError::InvalidNumber),
            (_, v) => v,
        };

        let (lo, hi) = key.bounds();
        let numeric = value.as_f64();
        if !(lo..=hi).contains(&numeric) {
            return Err(ParamError::OutOfRange(key));
        }

        match (key, value) {
            (ParamKey::SoftStopM, ParamValue::Float(v)) => self.soft_stop_m = v,
            (ParamKey::HardStopM, ParamValue::Float(v)) => self.hard_stop_m = v,
            (ParamKey::SlewV, ParamValue::Float(v)) => self.slew_v = v,
            (ParamKey::SlewW, ParamValue::Float(v)) => self.slew_w = v,
            (ParamKey::WatchdogMs, ParamValue::Int(v)) => self.watchdog_ms = v,
            (ParamKey::OdomHz, ParamValue::Int(v)) => self.odom_hz = v,
            (ParamKey::TxBytesPerS, ParamValue::Int(v)) => self.tx_bytes_per_s = v,
            (ParamKey::MaxLineLen, ParamValue::Int(v)) => self.max_line_len = v,
            (ParamKey::LogLevel, ParamValue::Int(v)) => self.log_level = v as u8,
            _ => return Err(ParamError::InvalidNumber),
        }

        Ok(self.get(key))
    }

    /// Parse-and-set from text, as a `SET,<key>,<value>` line would.
    pub fn set_str(&mut self, name: &str, text: &str) -> Result<ParamValue, ParamError> {
        let key = ParamKey::lookup(name).ok_or(ParamError::UnknownKey)?;
        let value = key.parse_value(text)?;
        self.set(key, value)
    }

    /// Check every field against its bounds, e.g. after loading a config file.
    pub fn validate(&self) -> Result<(), ParamError> {
        for key in ParamKey::ALL {
            let (lo, hi) = key.bounds();
            if !(lo..=hi).contains(&self.get(key).as_f64()) {
                return Err(ParamError::OutOfRange(key));
            }
        }
        Ok(())
    }

    pub fn max_line_len(&self) -> usize {
        (self.max_line_len as usize).min(MAX_LINE_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_in_range() {
        assert!(ParamSet::default().validate().is_ok());
    }

    #[test]
    fn test_key_lookup_round_trip() {
        for key in ParamKey::ALL {
            assert_eq!(ParamKey::lookup(key.as_str()), Some(key));
        }
        assert_eq!(ParamKey::lookup("warp_factor"), None);
    }

    #[test]
    fn test_float_canonical_encoding() {
        let mut params = ParamSet::new();
        let stored = params.set_str("soft_stop_m", "0.250").unwrap();
        assert_eq!(alloc::format!("{}", stored), "0.25");
        assert_eq!(params.soft_stop_m, 0.25);
    }

    #[test]
    fn test_integer_key_rejects_fraction() {
        let mut params = ParamSet::new();
        assert_eq!(params.set_str("watchdog_ms", "12.5"), Err(ParamError::InvalidNumber));
        assert_eq!(params.watchdog_ms, 500);
    }

    #[test]
    fn test_out_of_range_leaves_value_untouched() {
        let mut params = ParamSet::new();
        assert_eq!(
            params.set_str("max_line_len", "4"),
            Err(ParamError::OutOfRange(ParamKey::MaxLineLen))
        );
        assert_eq!(params.max_line_len, 96);
    }
}
