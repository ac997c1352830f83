//-----------------------------------------------------------------------------
// Module a2l_reader
// Best effort A2L reader
// Scans balanced /begin X ... /end X blocks instead of parsing the full A2L grammar
// MEASUREMENT and CHARACTERISTIC blocks are decoded with keyword lookups confined to the block text,
// COMPU_METHOD blocks may appear anywhere in the document

use std::collections::HashMap;

use lazy_static::lazy_static;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use regex::Regex;

use super::*;

lazy_static! {
    // Quoted strings are matched too, so that "//" or "/*" inside a string is not taken as a comment
    static ref COMMENT_RE: Regex = Regex::new(r#""(?:[^"\\]|\\.)*"|/\*[\s\S]*?\*/|//[^\n]*"#).unwrap();
    static ref BLOCK_RE: Regex = Regex::new(r"/(begin|end)\s+(\w+)").unwrap();
    static ref NAME_RE: Regex = Regex::new(r"^\s*([\w.\[\]]+)").unwrap();
    static ref PROJECT_RE: Regex = Regex::new(r"/begin\s+PROJECT\s+([\w.\[\]]+)").unwrap();
    static ref MODULE_RE: Regex = Regex::new(r"/begin\s+MODULE\b(?:\s+([\w.\[\]]+))?").unwrap();
    static ref ADDRESS_RE: Regex = Regex::new(r"\b(?:ECU_ADDRESS|ADDR_EPK)\s+(\S+)").unwrap();
    static ref DATATYPE_RE: Regex = Regex::new(r"\bDATATYPE\s+(\w+)").unwrap();
    static ref TYPE_RE: Regex = Regex::new(r"\bTYPE\s+(\w+)").unwrap();
    static ref LONGIDENTIFIER_RE: Regex = Regex::new(r#"\bLONGIDENTIFIER\s+"([^"]*)""#).unwrap();
    static ref UNIT_RE: Regex = Regex::new(r#"\bUNIT\s+"([^"]*)""#).unwrap();
    static ref COMPU_METHOD_RE: Regex = Regex::new(r"\bCOMPU_METHOD\s+([\w.\[\]]+)").unwrap();
    static ref COEFFS_RE: Regex = Regex::new(r"\bCOEFFS\s+([-+]?[0-9.]+(?:[eE][-+]?[0-9]+)?)\s+([-+]?[0-9.]+(?:[eE][-+]?[0-9]+)?)").unwrap();
    static ref LOWER_LIMIT_RE: Regex = Regex::new(r"\bLOWER_LIMIT\s+([-+]?[0-9.]+(?:[eE][-+]?[0-9]+)?)").unwrap();
    static ref UPPER_LIMIT_RE: Regex = Regex::new(r"\bUPPER_LIMIT\s+([-+]?[0-9.]+(?:[eE][-+]?[0-9]+)?)").unwrap();
}

const MEASUREMENT: &str = "MEASUREMENT";
const CHARACTERISTIC: &str = "CHARACTERISTIC";
const COMPU_METHOD: &str = "COMPU_METHOD";

/// What to do with a MEASUREMENT or CHARACTERISTIC block that does not match the required fields
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum MalformedBlockPolicy {
    /// Silently ignore the block
    #[default]
    Skip,
    /// Ignore the block and record it in A2lDescription::skipped
    Report,
    /// Abort decoding with A2lError::MalformedBlock
    Fail,
}

/// A2L description decoder
#[derive(Debug, Clone, Copy, Default)]
pub struct A2lReader {
    policy: MalformedBlockPolicy,
}

// A balanced block, body is the text between the /begin header and the /end marker
#[derive(Debug)]
struct Block<'a> {
    kind: &'a str,
    name: &'a str,
    body: &'a str,
}

/// Decode with the default policy (skip malformed blocks)
pub fn a2l_decode(text: &str) -> Result<A2lDescription, A2lError> {
    A2lReader::new().decode(text)
}

// Block and line comments are replaced by a blank, quoted strings are kept
fn strip_comments(text: &str) -> std::borrow::Cow<'_, str> {
    COMMENT_RE.replace_all(text, |c: &regex::Captures| if c[0].starts_with('"') { c[0].to_string() } else { " ".to_string() })
}

impl A2lReader {
    pub fn new() -> A2lReader {
        A2lReader::default()
    }

    pub fn with_policy(policy: MalformedBlockPolicy) -> A2lReader {
        A2lReader { policy }
    }

    pub fn policy(&self) -> MalformedBlockPolicy {
        self.policy
    }

    /// Decode the full text of an A2L description
    /// Fails if there is no MODULE block
    pub fn decode(&self, text: &str) -> Result<A2lDescription, A2lError> {
        let text = strip_comments(text);
        let text: &str = &text;

        let module_name = match MODULE_RE.captures(text) {
            Some(c) => c.get(1).map(|m| m.as_str().to_string()).unwrap_or_default(),
            None => return Err(A2lError::MalformedDescription("no MODULE block found".to_string())),
        };
        let project_name = PROJECT_RE.captures(text).map(|c| c[1].to_string()).unwrap_or_default();

        let mut description = A2lDescription {
            project_name,
            module_name,
            definitions: Vec::new(),
            skipped: Vec::new(),
        };

        let (blocks, unclosed) = scan_blocks(text);
        for s in unclosed {
            self.malformed(&mut description, s)?;
        }

        let compu_methods = compu_method_index(&blocks);

        for block in &blocks {
            let category = match block.kind {
                MEASUREMENT => Category::Measurement,
                CHARACTERISTIC => Category::Calibration,
                _ => continue,
            };
            match decode_definition(block, category, &compu_methods) {
                Ok(d) => {
                    trace!("{} {} addr=0x{:08X} type={}", block.kind, d.name, d.address, d.data_type);
                    description.definitions.push(d);
                }
                Err(reason) => {
                    let s = SkippedBlock {
                        kind: block.kind.to_string(),
                        name: block.name.to_string(),
                        reason,
                    };
                    self.malformed(&mut description, s)?;
                }
            }
        }

        debug!(
            "A2L project={} module={}: {} definitions, {} skipped",
            description.project_name,
            description.module_name,
            description.definitions.len(),
            description.skipped.len()
        );
        Ok(description)
    }

    fn malformed(&self, description: &mut A2lDescription, s: SkippedBlock) -> Result<(), A2lError> {
        match self.policy {
            MalformedBlockPolicy::Skip => {
                trace!("Skipped {}", s);
                Ok(())
            }
            MalformedBlockPolicy::Report => {
                warn!("Skipped {}", s);
                description.skipped.push(s);
                Ok(())
            }
            MalformedBlockPolicy::Fail => Err(A2lError::MalformedBlock(s)),
        }
    }
}

// Find all balanced blocks in document order of their /end marker
// Unclosed MEASUREMENT, CHARACTERISTIC and COMPU_METHOD blocks are returned separately
fn scan_blocks(text: &str) -> (Vec<Block<'_>>, Vec<SkippedBlock>) {
    let mut blocks = Vec::new();
    let mut unclosed = Vec::new();
    let mut stack: Vec<(&str, usize)> = Vec::new();

    let report_unclosed = |kind: &str, start: usize, unclosed: &mut Vec<SkippedBlock>| {
        if kind == MEASUREMENT || kind == CHARACTERISTIC || kind == COMPU_METHOD {
            unclosed.push(SkippedBlock {
                kind: kind.to_string(),
                name: block_name(&text[start..]).to_string(),
                reason: "missing /end".to_string(),
            });
        }
    };

    for c in BLOCK_RE.captures_iter(text) {
        let (Some(marker), Some(tag), Some(kind)) = (c.get(0), c.get(1), c.get(2)) else {
            continue;
        };
        let kind = kind.as_str();
        if tag.as_str() == "begin" {
            stack.push((kind, marker.end()));
            continue;
        }
        match stack.iter().rposition(|(k, _)| *k == kind) {
            Some(pos) => {
                for (k, start) in stack.drain(pos + 1..) {
                    report_unclosed(k, start, &mut unclosed);
                }
                if let Some((k, start)) = stack.pop() {
                    let body = &text[start..marker.start()];
                    blocks.push(Block { kind: k, name: block_name(body), body });
                }
            }
            None => {
                debug!("Ignored /end {} without /begin", kind);
            }
        }
    }
    for (k, start) in stack {
        report_unclosed(k, start, &mut unclosed);
    }

    (blocks, unclosed)
}

fn block_name(body: &str) -> &str {
    NAME_RE.captures(body).and_then(|c| c.get(1)).map(|m| m.as_str()).unwrap_or("")
}

fn capture<'a>(re: &Regex, body: &'a str) -> Option<&'a str> {
    re.captures(body).and_then(|c| c.get(1)).map(|m| m.as_str())
}

fn parse_address(s: &str) -> Option<u32> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

// Conversion rules by COMPU_METHOD name, None if the coefficients reduce to the identity
fn compu_method_index<'a>(blocks: &[Block<'a>]) -> HashMap<&'a str, Option<Conversion>> {
    let mut index = HashMap::new();
    for block in blocks.iter().filter(|b| b.kind == COMPU_METHOD && !b.name.is_empty()) {
        let conversion = COEFFS_RE.captures(block.body).and_then(|c| {
            let a: f64 = c[1].parse().ok()?;
            let b: f64 = c[2].parse().ok()?;
            Conversion::from_coeffs(a, b)
        });
        trace!("COMPU_METHOD {} -> {:?}", block.name, conversion);
        index.insert(block.name, conversion);
    }
    index
}

fn decode_definition(block: &Block, category: Category, compu_methods: &HashMap<&str, Option<Conversion>>) -> Result<ParameterDefinition, String> {
    if block.name.is_empty() {
        return Err("missing name".to_string());
    }

    let address = capture(&ADDRESS_RE, block.body).ok_or("missing ECU_ADDRESS")?;
    let address = parse_address(address).ok_or(format!("invalid address `{}`", address))?;

    let (type_re, keyword) = match category {
        Category::Measurement => (&*DATATYPE_RE, "DATATYPE"),
        Category::Calibration => (&*TYPE_RE, "TYPE"),
    };
    let data_type = capture(type_re, block.body).ok_or(format!("missing {}", keyword))?;
    let data_type: A2lDataType = data_type.parse().map_err(|e: A2lError| e.to_string())?;

    let mut d = ParameterDefinition::new(block.name, address, data_type, category);
    d.description = capture(&LONGIDENTIFIER_RE, block.body).map(str::to_string);
    d.unit = capture(&UNIT_RE, block.body).map(str::to_string);
    d.lower_limit = capture(&LOWER_LIMIT_RE, block.body).and_then(|s| s.parse().ok());
    d.upper_limit = capture(&UPPER_LIMIT_RE, block.body).and_then(|s| s.parse().ok());
    if let Some(method) = capture(&COMPU_METHOD_RE, block.body) {
        match compu_methods.get(method) {
            Some(conversion) => d.conversion = conversion.clone(),
            None => debug!("{} {}: COMPU_METHOD {} not found", block.kind, block.name, method),
        }
    }
    Ok(d)
}

//-------------------------------------------------------------------------------------------------
