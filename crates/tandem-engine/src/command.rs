//! Fixed-size command record carried by the command rings.

use std::fmt;

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

pub const IDENT_LEN: usize = 16;

/// Module or parameter identifier matching `[a-z0-9_]{1,16}`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ident {
    bytes: [u8; IDENT_LEN],
    len: u8,
}

impl Ident {
    pub fn new(text: &str) -> Result<Self, ProtocolError> {
        let raw = text.as_bytes();
        let valid = !raw.is_empty()
            && raw.len() <= IDENT_LEN
            && raw
                .iter()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'_');
        if !valid {
            return Err(ProtocolError::InvalidIdent(text.to_string()));
        }
        let mut bytes = [0u8; IDENT_LEN];
        bytes[..raw.len()].copy_from_slice(raw);
        Ok(Self {
            bytes,
            len: raw.len() as u8,
        })
    }

    /// Builds an identifier from a known-good literal without validation.
    pub(crate) const fn literal(text: &'static str) -> Self {
        let raw = text.as_bytes();
        let mut bytes = [0u8; IDENT_LEN];
        let mut i = 0;
        while i < raw.len() && i < IDENT_LEN {
            bytes[i] = raw[i];
            i += 1;
        }
        Self { bytes, len: i as u8 }
    }

    /// Decodes a zero-padded field from a command record.
    fn from_field(field: &[u8; IDENT_LEN]) -> Result<Self, ProtocolError> {
        let len = field.iter().position(|b| *b == 0).unwrap_or(IDENT_LEN);
        if field[len..].iter().any(|b| *b != 0) {
            return Err(ProtocolError::InvalidIdent(
                String::from_utf8_lossy(field).into_owned(),
            ));
        }
        match std::str::from_utf8(&field[..len]) {
            Ok(text) => Self::new(text),
            Err(_) => Err(ProtocolError::InvalidIdent(
                String::from_utf8_lossy(&field[..len]).into_owned(),
            )),
        }
    }

    pub fn as_str(&self) -> &str {
        // Construction only admits ASCII.
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or_default()
    }

    fn field(&self) -> [u8; IDENT_LEN] {
        self.bytes
    }
}

impl fmt::Debug for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ident({:?})", self.as_str())
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Ident {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ident::new(&value)
    }
}

impl TryFrom<&str> for Ident {
    type Error = ProtocolError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Ident::new(value)
    }
}

impl From<Ident> for String {
    fn from(value: Ident) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    SetParam = 1,
    SetGate = 2,
    PatchOp = 3,
}

impl TryFrom<u8> for Opcode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Opcode::SetParam),
            2 => Ok(Opcode::SetGate),
            3 => Ok(Opcode::PatchOp),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Float(f64),
    Int(i64),
    Bool(bool),
}

impl Value {
    const TAG_FLOAT: u8 = 1;
    const TAG_INT: u8 = 2;
    const TAG_BOOL: u8 = 3;

    pub fn as_f64(self) -> f64 {
        match self {
            Value::Float(v) => v,
            Value::Int(v) => v as f64,
            Value::Bool(v) => {
                if v {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    pub fn as_bool(self) -> bool {
        match self {
            Value::Float(v) => v >= 0.5,
            Value::Int(v) => v != 0,
            Value::Bool(v) => v,
        }
    }

    fn encode(self) -> (u8, [u8; 8]) {
        match self {
            Value::Float(v) => (Self::TAG_FLOAT, v.to_le_bytes()),
            Value::Int(v) => (Self::TAG_INT, v.to_le_bytes()),
            Value::Bool(v) => (Self::TAG_BOOL, (v as u64).to_le_bytes()),
        }
    }

    fn decode(tag: u8, raw: [u8; 8]) -> Result<Self, ProtocolError> {
        match tag {
            Self::TAG_FLOAT => Ok(Value::Float(f64::from_le_bytes(raw))),
            Self::TAG_INT => Ok(Value::Int(i64::from_le_bytes(raw))),
            Self::TAG_BOOL => Ok(Value::Bool(u64::from_le_bytes(raw) != 0)),
            other => Err(ProtocolError::UnknownValueTag(other)),
        }
    }
}

/// Structural operations on a single module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOp {
    /// Clear DSP state (phase, delay elements, envelope level).
    Reset,
    /// Pass input through unchanged while set.
    Bypass(bool),
}

impl PatchOp {
    pub fn name(self) -> &'static str {
        match self {
            PatchOp::Reset => "reset",
            PatchOp::Bypass(_) => "bypass",
        }
    }

    pub fn from_name(name: &str, value: Value) -> Result<Self, ProtocolError> {
        match name {
            "reset" => Ok(PatchOp::Reset),
            "bypass" => Ok(PatchOp::Bypass(value.as_bool())),
            other => Err(ProtocolError::UnknownPatchOp(other.to_string())),
        }
    }
}

/// Decoded form of a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CommandKind {
    SetParam {
        module: Ident,
        param: Ident,
        value: Value,
    },
    SetGate {
        module: Ident,
        on: bool,
    },
    Patch {
        module: Ident,
        op: PatchOp,
    },
}

impl CommandKind {
    pub fn module(&self) -> Ident {
        match self {
            CommandKind::SetParam { module, .. }
            | CommandKind::SetGate { module, .. }
            | CommandKind::Patch { module, .. } => *module,
        }
    }
}

/// 48-byte wire record. Every field is a byte array so the layout has no
/// padding and the record can be copied straight into a mapped slot.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, PartialEq, Eq)]
pub struct Command {
    opcode: u8,
    tag: u8,
    reserved: [u8; 6],
    module: [u8; IDENT_LEN],
    param: [u8; IDENT_LEN],
    value: [u8; 8],
}

impl Command {
    fn encode(opcode: Opcode, module: Ident, param: Option<Ident>, value: Value) -> Self {
        let (tag, value) = value.encode();
        Self {
            opcode: opcode as u8,
            tag,
            reserved: [0; 6],
            module: module.field(),
            param: param.map(|p| p.field()).unwrap_or([0; IDENT_LEN]),
            value,
        }
    }

    pub fn set_param(module: Ident, param: Ident, value: Value) -> Self {
        Self::encode(Opcode::SetParam, module, Some(param), value)
    }

    pub fn set_gate(module: Ident, on: bool) -> Self {
        Self::encode(Opcode::SetGate, module, None, Value::Bool(on))
    }

    pub fn patch_op(module: Ident, op: PatchOp) -> Self {
        let value = match op {
            PatchOp::Reset => Value::Bool(true),
            PatchOp::Bypass(on) => Value::Bool(on),
        };
        Self::encode(Opcode::PatchOp, module, Some(Ident::literal(op.name())), value)
    }

    pub fn from_kind(kind: CommandKind) -> Self {
        match kind {
            CommandKind::SetParam {
                module,
                param,
                value,
            } => Self::set_param(module, param, value),
            CommandKind::SetGate { module, on } => Self::set_gate(module, on),
            CommandKind::Patch { module, op } => Self::patch_op(module, op),
        }
    }

    pub fn opcode(&self) -> Result<Opcode, ProtocolError> {
        Opcode::try_from(self.opcode)
    }

    /// Validates and decodes the record. Never allocates on success.
    pub fn decode(&self) -> Result<CommandKind, ProtocolError> {
        let opcode = self.opcode()?;
        let value = Value::decode(self.tag, self.value)?;
        let module = Ident::from_field(&self.module)?;
        match opcode {
            Opcode::SetParam => Ok(CommandKind::SetParam {
                module,
                param: Ident::from_field(&self.param)?,
                value,
            }),
            Opcode::SetGate => Ok(CommandKind::SetGate {
                module,
                on: value.as_bool(),
            }),
            Opcode::PatchOp => {
                let name = Ident::from_field(&self.param)?;
                Ok(CommandKind::Patch {
                    module,
                    op: PatchOp::from_name(name.as_str(), value)?,
                })
            }
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode() {
            Ok(kind) => write!(f, "Command({kind:?})"),
            Err(err) => write!(f, "Command(<invalid: {err}>)"),
        }
    }
}
