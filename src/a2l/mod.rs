//-----------------------------------------------------------------------------
// Module a2l
// Parameter definitions extracted from A2L description text
// Types:
//  A2lDataType Copy, Clone
//  ParameterDefinition Clone
//  A2lDescription

use serde::{Deserialize, Serialize};
use thiserror::Error;

use byteorder::{ByteOrder, LittleEndian};

pub mod a2l_reader;
pub use a2l_reader::{a2l_decode, A2lReader, MalformedBlockPolicy};

mod conversion;
pub use conversion::{Conversion, ConversionError, LinearRule};

//-------------------------------------------------------------------------------------------------
// A2lError

#[derive(Error, Debug, Clone, PartialEq)]
pub enum A2lError {
    #[error("malformed A2L description: {0}")]
    MalformedDescription(String),

    #[error("unsupported data type `{0}`")]
    UnsupportedDataType(String),

    #[error("malformed {0}")]
    MalformedBlock(SkippedBlock),
}

//-------------------------------------------------------------------------------------------------
// A2lDataType

/// Basic value type of a parameter in ECU memory
/// Only scalar types with a fixed size are supported
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum A2lDataType {
    Ubyte,
    Sbyte,
    Uword,
    Sword,
    Ulong,
    Slong,
    Float32Ieee,
    Float64Ieee,
}

impl A2lDataType {
    /// Memory size in bytes
    pub fn get_size(self) -> usize {
        match self {
            A2lDataType::Ubyte | A2lDataType::Sbyte => 1,
            A2lDataType::Uword | A2lDataType::Sword => 2,
            A2lDataType::Ulong | A2lDataType::Slong | A2lDataType::Float32Ieee => 4,
            A2lDataType::Float64Ieee => 8,
        }
    }

    /// A2L keyword of the type
    pub fn as_str(self) -> &'static str {
        match self {
            A2lDataType::Ubyte => "UBYTE",
            A2lDataType::Sbyte => "SBYTE",
            A2lDataType::Uword => "UWORD",
            A2lDataType::Sword => "SWORD",
            A2lDataType::Ulong => "ULONG",
            A2lDataType::Slong => "SLONG",
            A2lDataType::Float32Ieee => "FLOAT32_IEEE",
            A2lDataType::Float64Ieee => "FLOAT64_IEEE",
        }
    }

    /// Decode a little endian raw value
    /// Returns None if there are not enough bytes
    pub fn decode(self, bytes: &[u8]) -> Option<f64> {
        if bytes.len() < self.get_size() {
            return None;
        }
        let value = match self {
            A2lDataType::Ubyte => bytes[0] as f64,
            A2lDataType::Sbyte => bytes[0] as i8 as f64,
            A2lDataType::Uword => LittleEndian::read_u16(bytes) as f64,
            A2lDataType::Sword => LittleEndian::read_i16(bytes) as f64,
            A2lDataType::Ulong => LittleEndian::read_u32(bytes) as f64,
            A2lDataType::Slong => LittleEndian::read_i32(bytes) as f64,
            A2lDataType::Float32Ieee => LittleEndian::read_f32(bytes) as f64,
            A2lDataType::Float64Ieee => LittleEndian::read_f64(bytes),
        };
        Some(value)
    }
}

impl std::str::FromStr for A2lDataType {
    type Err = A2lError;

    // Accepts the A2L keywords and the common integer type aliases
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UBYTE" | "UINT8" | "U8" => Ok(A2lDataType::Ubyte),
            "SBYTE" | "BYTE" | "INT8" | "I8" => Ok(A2lDataType::Sbyte),
            "UWORD" | "UINT16" | "U16" => Ok(A2lDataType::Uword),
            "SWORD" | "WORD" | "INT16" | "I16" => Ok(A2lDataType::Sword),
            "ULONG" | "UINT32" | "U32" => Ok(A2lDataType::Ulong),
            "SLONG" | "LONG" | "INT32" | "I32" => Ok(A2lDataType::Slong),
            "FLOAT32_IEEE" | "FLOAT32" | "F32" => Ok(A2lDataType::Float32Ieee),
            "FLOAT64_IEEE" | "FLOAT64" | "F64" => Ok(A2lDataType::Float64Ieee),
            _ => Err(A2lError::UnsupportedDataType(s.to_string())),
        }
    }
}

impl TryFrom<String> for A2lDataType {
    type Error = A2lError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<A2lDataType> for &'static str {
    fn from(t: A2lDataType) -> Self {
        t.as_str()
    }
}

impl std::fmt::Display for A2lDataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

//-------------------------------------------------------------------------------------------------
// ParameterDefinition

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Category {
    #[default]
    Measurement,
    Calibration,
}

/// A measurement or calibration parameter in ECU memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    pub name: String,
    #[serde(with = "hex_address")]
    pub address: u32,
    pub data_type: A2lDataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversion: Option<Conversion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_limit: Option<f64>,
    #[serde(default)]
    pub category: Category,
}

impl ParameterDefinition {
    pub fn new(name: &str, address: u32, data_type: A2lDataType, category: Category) -> ParameterDefinition {
        ParameterDefinition {
            name: name.to_string(),
            address,
            data_type,
            description: None,
            unit: None,
            conversion: None,
            lower_limit: None,
            upper_limit: None,
            category,
        }
    }

    pub fn is_measurement(&self) -> bool {
        self.category == Category::Measurement
    }

    pub fn is_calibration(&self) -> bool {
        self.category == Category::Calibration
    }

    /// Apply the conversion rule, if any, to a raw value
    pub fn convert(&self, raw: f64) -> Result<f64, ConversionError> {
        match &self.conversion {
            Some(conversion) => conversion.apply(raw),
            None => Ok(raw),
        }
    }
}

/// ECU addresses are serialized as hexadecimal text "0x..."
pub mod hex_address {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(addr: &u32, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{:08X}", addr))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse(&s).ok_or_else(|| D::Error::custom(format!("invalid hexadecimal address `{}`", s)))
    }

    /// Parse hex text with or without 0x prefix
    pub fn parse(s: &str) -> Option<u32> {
        let s = s.trim();
        let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
        u32::from_str_radix(digits, 16).ok()
    }
}

//-------------------------------------------------------------------------------------------------
// A2lDescription

/// A block that did not match the required field pattern
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedBlock {
    pub kind: String,
    pub name: String,
    pub reason: String,
}

impl std::fmt::Display for SkippedBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} block `{}`: {}", self.kind, self.name, self.reason)
    }
}

/// Result of decoding an A2L description
#[derive(Debug, Clone, Default)]
pub struct A2lDescription {
    pub project_name: String,
    pub module_name: String,
    pub definitions: Vec<ParameterDefinition>,
    /// Only populated with MalformedBlockPolicy::Report
    pub skipped: Vec<SkippedBlock>,
}

impl A2lDescription {
    pub fn find(&self, name: &str) -> Option<&ParameterDefinition> {
        self.definitions.iter().find(|d| d.name == name)
    }

    pub fn measurements(&self) -> impl Iterator<Item = &ParameterDefinition> {
        self.definitions.iter().filter(|d| d.is_measurement())
    }

    pub fn characteristics(&self) -> impl Iterator<Item = &ParameterDefinition> {
        self.definitions.iter().filter(|d| d.is_calibration())
    }

    /// Find all definitions with a name matching the regular expression
    pub fn find_matching(&self, pattern: &str) -> Result<Vec<&ParameterDefinition>, regex::Error> {
        let re = regex::Regex::new(pattern)?;
        Ok(self.definitions.iter().filter(|d| re.is_match(&d.name)).collect())
    }
}

//-------------------------------------------------------------------------------------------------
