//! Trade intent: what the caller wants bought on each cycle.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Contract types offered by the trading surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractKind {
    #[serde(rename = "CALL")]
    Call,
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "DIGITEVEN")]
    DigitEven,
    #[serde(rename = "DIGITODD")]
    DigitOdd,
    #[serde(rename = "DIGITOVER")]
    DigitOver,
    #[serde(rename = "DIGITUNDER")]
    DigitUnder,
    #[serde(rename = "DIGITMATCH")]
    DigitMatch,
    #[serde(rename = "DIGITDIFF")]
    DigitDiff,
}

impl ContractKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractKind::Call => "CALL",
            ContractKind::Put => "PUT",
            ContractKind::DigitEven => "DIGITEVEN",
            ContractKind::DigitOdd => "DIGITODD",
            ContractKind::DigitOver => "DIGITOVER",
            ContractKind::DigitUnder => "DIGITUNDER",
            ContractKind::DigitMatch => "DIGITMATCH",
            ContractKind::DigitDiff => "DIGITDIFF",
        }
    }

    /// Digit contracts that compare the exit digit against a prediction.
    pub fn requires_prediction(&self) -> bool {
        matches!(
            self,
            ContractKind::DigitOver
                | ContractKind::DigitUnder
                | ContractKind::DigitMatch
                | ContractKind::DigitDiff
        )
    }
}

impl fmt::Display for ContractKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContractKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CALL" | "RISE" => Ok(ContractKind::Call),
            "PUT" | "FALL" => Ok(ContractKind::Put),
            "DIGITEVEN" | "EVEN" => Ok(ContractKind::DigitEven),
            "DIGITODD" | "ODD" => Ok(ContractKind::DigitOdd),
            "DIGITOVER" | "OVER" => Ok(ContractKind::DigitOver),
            "DIGITUNDER" | "UNDER" => Ok(ContractKind::DigitUnder),
            "DIGITMATCH" | "MATCHES" => Ok(ContractKind::DigitMatch),
            "DIGITDIFF" | "DIFFERS" => Ok(ContractKind::DigitDiff),
            other => Err(format!("unknown contract type: {}", other)),
        }
    }
}

/// Unit of the contract duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurationUnit {
    #[serde(rename = "t")]
    Ticks,
    #[serde(rename = "s")]
    Seconds,
    #[serde(rename = "m")]
    Minutes,
    #[serde(rename = "h")]
    Hours,
    #[serde(rename = "d")]
    Days,
}

impl DurationUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            DurationUnit::Ticks => "t",
            DurationUnit::Seconds => "s",
            DurationUnit::Minutes => "m",
            DurationUnit::Hours => "h",
            DurationUnit::Days => "d",
        }
    }
}

impl FromStr for DurationUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "t" | "ticks" => Ok(DurationUnit::Ticks),
            "s" | "seconds" => Ok(DurationUnit::Seconds),
            "m" | "minutes" => Ok(DurationUnit::Minutes),
            "h" | "hours" => Ok(DurationUnit::Hours),
            "d" | "days" => Ok(DurationUnit::Days),
            other => Err(format!("unknown duration unit: {}", other)),
        }
    }
}

/// Caller-supplied description of the contract to buy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeIntent {
    pub kind: ContractKind,
    pub stake: Decimal,
    pub duration: u32,
    pub duration_unit: DurationUnit,
    pub symbol: String,
    /// Prediction digit (0-9) for over/under/match/differ contracts
    #[serde(default)]
    pub prediction: Option<u8>,
}

impl TradeIntent {
    /// Check the intent can be turned into a purchase request.
    pub fn validate(&self) -> EngineResult<()> {
        if self.symbol.trim().is_empty() {
            return Err(EngineError::purchase("symbol is required"));
        }
        if self.stake <= Decimal::ZERO {
            return Err(EngineError::purchase("stake must be positive"));
        }
        if self.duration == 0 {
            return Err(EngineError::purchase("duration must be at least 1"));
        }
        match (self.kind.requires_prediction(), self.prediction) {
            (true, None) => Err(EngineError::purchase(format!(
                "{} requires a prediction digit",
                self.kind
            ))),
            (true, Some(d)) if d > 9 => Err(EngineError::purchase(format!(
                "prediction digit {} is out of range 0-9",
                d
            ))),
            (false, Some(_)) => Err(EngineError::purchase(format!(
                "{} does not take a prediction digit",
                self.kind
            ))),
            _ => Ok(()),
        }
    }
}
