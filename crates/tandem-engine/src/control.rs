//! OSC-style control boundary.
//!
//! Turns textual messages such as `/mod/osc/freq 440` into validated
//! [`Command`] records. Everything malformed stops here; nothing past this
//! point ever sees an invalid identifier or a non-finite value.

use tracing::warn;

use crate::command::{Command, CommandKind, Ident, PatchOp, Value};
use crate::error::ProtocolError;

/// Documented parameter ranges; values outside are clamped.
pub const PARAM_RANGES: &[(&str, f64, f64)] = &[
    ("freq", 20.0, 20_000.0),
    ("gain", 0.0, 1.0),
    ("cutoff", 20.0, 20_000.0),
    ("q", 0.1, 20.0),
    ("attack", 0.1, 10_000.0),
    ("decay", 0.1, 10_000.0),
    ("sustain", 0.0, 1.0),
    ("release", 0.1, 10_000.0),
];

pub fn param_range(param: &str) -> Option<(f64, f64)> {
    PARAM_RANGES
        .iter()
        .find(|(name, _, _)| *name == param)
        .map(|(_, lo, hi)| (*lo, *hi))
}

/// Clamps a value to the documented range of `param`, if it has one.
pub fn clamp_param(param: &str, value: f64) -> f64 {
    match param_range(param) {
        Some((lo, hi)) => value.clamp(lo, hi),
        None => value,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlArg {
    Float(f64),
    Int(i64),
    Bool(bool),
}

impl ControlArg {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "true" => return Some(ControlArg::Bool(true)),
            "false" => return Some(ControlArg::Bool(false)),
            _ => {}
        }
        if let Ok(int) = token.parse::<i64>() {
            return Some(ControlArg::Int(int));
        }
        token.parse::<f64>().ok().map(ControlArg::Float)
    }

    fn as_value(&self) -> Value {
        match self {
            ControlArg::Float(v) => Value::Float(*v),
            ControlArg::Int(v) => Value::Int(*v),
            ControlArg::Bool(v) => Value::Bool(*v),
        }
    }
}

/// An address plus typed arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    pub address: String,
    pub args: Vec<ControlArg>,
}

impl ControlMessage {
    pub fn new(address: impl Into<String>, args: Vec<ControlArg>) -> Self {
        Self {
            address: address.into(),
            args,
        }
    }

    /// Parses `"/address arg arg ..."`.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let mut tokens = text.split_whitespace();
        let address = tokens
            .next()
            .filter(|a| a.starts_with('/'))
            .ok_or_else(|| ProtocolError::MalformedAddress(text.trim().to_string()))?;
        let mut args = Vec::new();
        for token in tokens {
            let arg = ControlArg::parse(token).ok_or_else(|| ProtocolError::BadArguments {
                address: address.to_string(),
                expected: "numeric or boolean arguments",
            })?;
            args.push(arg);
        }
        Ok(Self::new(address, args))
    }

    fn single_arg(&self, expected: &'static str) -> Result<&ControlArg, ProtocolError> {
        match self.args.as_slice() {
            [arg] => Ok(arg),
            _ => Err(ProtocolError::BadArguments {
                address: self.address.clone(),
                expected,
            }),
        }
    }

    /// Maps the message onto a command, clamping documented ranges.
    pub fn to_kind(&self) -> Result<CommandKind, ProtocolError> {
        let segments: Vec<&str> = self.address.trim_start_matches('/').split('/').collect();
        match segments.as_slice() {
            ["mod", module, param] => {
                let module = Ident::new(module)?;
                let param = Ident::new(param)?;
                let value = match self.single_arg("one numeric argument")? {
                    ControlArg::Float(v) if !v.is_finite() => {
                        return Err(ProtocolError::NonFinite {
                            param: param.to_string(),
                        })
                    }
                    // Ranged parameters are numeric; a flag would land below
                    // their floor.
                    ControlArg::Bool(_) if param_range(param.as_str()).is_some() => {
                        return Err(ProtocolError::BadArguments {
                            address: self.address.clone(),
                            expected: "one numeric argument",
                        })
                    }
                    ControlArg::Bool(v) => Value::Bool(*v),
                    other => Value::Float(clamp_param(param.as_str(), other.as_value().as_f64())),
                };
                Ok(CommandKind::SetParam {
                    module,
                    param,
                    value,
                })
            }
            ["gate", module] => {
                let module = Ident::new(module)?;
                let on = match self.single_arg("0 or 1")? {
                    ControlArg::Int(0) | ControlArg::Bool(false) => false,
                    ControlArg::Int(1) | ControlArg::Bool(true) => true,
                    _ => {
                        return Err(ProtocolError::BadArguments {
                            address: self.address.clone(),
                            expected: "0 or 1",
                        })
                    }
                };
                Ok(CommandKind::SetGate { module, on })
            }
            ["patch", module, op] => {
                let module = Ident::new(module)?;
                let op = match *op {
                    "reset" if self.args.is_empty() => PatchOp::Reset,
                    "reset" => {
                        return Err(ProtocolError::BadArguments {
                            address: self.address.clone(),
                            expected: "no arguments",
                        })
                    }
                    "bypass" => PatchOp::Bypass(self.single_arg("0 or 1")?.as_value().as_bool()),
                    other => return Err(ProtocolError::UnknownPatchOp(other.to_string())),
                };
                Ok(CommandKind::Patch { module, op })
            }
            _ => Err(ProtocolError::MalformedAddress(self.address.clone())),
        }
    }

    pub fn to_command(&self) -> Result<Command, ProtocolError> {
        self.to_kind().map(Command::from_kind)
    }
}

/// Parses one listener line, logging and dropping protocol faults.
pub fn parse_line(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    match ControlMessage::parse(line).and_then(|message| message.to_command()) {
        Ok(command) => Some(command),
        Err(err) => {
            warn!(%err, line, "dropping control message");
            None
        }
    }
}
