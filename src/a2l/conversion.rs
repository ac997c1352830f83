// Module conversion
// Linear conversion from raw ECU values to physical values
// The rule is kept in its textual form "X*factor" or "X+offset" and parsed when applied

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConversionError {
    #[error("malformed conversion formula `{0}`")]
    Malformed(String),
}

/// Parsed form of a conversion formula
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum LinearRule {
    Factor(f64),
    Offset(f64),
}

impl LinearRule {
    pub fn apply(self, raw: f64) -> f64 {
        match self {
            LinearRule::Factor(factor) => raw * factor,
            LinearRule::Offset(offset) => raw + offset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conversion {
    formula: String,
}

impl Conversion {
    pub fn new(formula: &str) -> Conversion {
        Conversion { formula: formula.to_string() }
    }

    pub fn factor(factor: f64) -> Conversion {
        Conversion { formula: format!("X*{}", factor) }
    }

    pub fn offset(offset: f64) -> Conversion {
        Conversion { formula: format!("X+{}", offset) }
    }

    /// Reduce the two leading rational coefficients of a COMPU_METHOD to a linear rule
    /// a != 0 gives a factor b/a, otherwise b != 0 gives an offset b
    pub fn from_coeffs(a: f64, b: f64) -> Option<Conversion> {
        if a != 0.0 {
            Some(Conversion::factor(b / a))
        } else if b != 0.0 {
            Some(Conversion::offset(b))
        } else {
            None
        }
    }

    pub fn formula(&self) -> &str {
        &self.formula
    }

    pub fn rule(&self) -> Result<LinearRule, ConversionError> {
        let malformed = || ConversionError::Malformed(self.formula.clone());
        let (op, pos) = match (self.formula.find('*'), self.formula.find('+')) {
            (Some(pos), _) => ('*', pos),
            (None, Some(pos)) => ('+', pos),
            (None, None) => return Err(malformed()),
        };
        let variable = self.formula[..pos].trim();
        if variable.is_empty() || !variable.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(malformed());
        }
        let value: f64 = self.formula[pos + 1..].trim().parse().map_err(|_| malformed())?;
        Ok(if op == '*' { LinearRule::Factor(value) } else { LinearRule::Offset(value) })
    }

    pub fn apply(&self, raw: f64) -> Result<f64, ConversionError> {
        Ok(self.rule()?.apply(raw))
    }
}

impl std::fmt::Display for Conversion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.formula)
    }
}
