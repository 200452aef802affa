//! In-memory bytecode module image.
//!
//! This is the artifact the toolchain emits and the runtime loads: flat
//! metadata tables addressed by tagged 32-bit tokens (table tag in the high
//! byte, 1-based row index below), plus stack-machine method bodies.
//!
//! Binary format: `[magic "RSPI"][version u16 LE][bincode payload]`.

pub mod instr;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::keys::{FieldKey, MethodKey};
use instr::MethodBody;

/// Tagged metadata token. The high byte selects the table, the low 24 bits
/// are a 1-based row index; 0 rows do not exist.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Token(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    TypeRef,
    TypeDef,
    FieldDef,
    MethodDef,
    MemberRef,
}

impl TableKind {
    fn tag(self) -> u32 {
        match self {
            TableKind::TypeRef => 0x01,
            TableKind::TypeDef => 0x02,
            TableKind::FieldDef => 0x04,
            TableKind::MethodDef => 0x06,
            TableKind::MemberRef => 0x0A,
        }
    }
}

impl Token {
    pub fn new(table: TableKind, row: usize) -> Self {
        Token((table.tag() << 24) | (row as u32 & 0x00FF_FFFF))
    }

    pub fn table(self) -> Option<TableKind> {
        match self.0 >> 24 {
            0x01 => Some(TableKind::TypeRef),
            0x02 => Some(TableKind::TypeDef),
            0x04 => Some(TableKind::FieldDef),
            0x06 => Some(TableKind::MethodDef),
            0x0A => Some(TableKind::MemberRef),
            _ => None,
        }
    }

    /// Zero-based row index. Row 0 does not exist; a zero-row token (e.g.
    /// a corrupt persisted pair) clamps rather than underflowing.
    pub fn index(self) -> usize {
        ((self.0 & 0x00FF_FFFF) as usize).saturating_sub(1)
    }

    pub fn is(self, table: TableKind) -> bool {
        self.table() == Some(table)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeKind {
    Class,
    Struct,
    Interface,
    Enum,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeDef {
    /// Namespaced name; nested types use `/` as the separator.
    pub full_name: String,
    pub kind: TypeKind,
    pub generic_arity: u16,
    pub fields: Vec<Token>,
    pub methods: Vec<Token>,
}

impl TypeDef {
    /// Compiler-generated containers (display classes, state machines) carry
    /// angle brackets in their names and are never patch targets.
    pub fn is_synthetic(&self) -> bool {
        self.full_name.contains('<')
    }

    pub fn is_value_type(&self) -> bool {
        matches!(self.kind, TypeKind::Struct | TypeKind::Enum)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub owner: Token,
    pub name: String,
    pub field_type: String,
    pub is_static: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MethodKind {
    Normal,
    Ctor,
    TypeInit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodDef {
    pub owner: Token,
    pub name: String,
    pub generic_arity: u16,
    pub params: Vec<String>,
    pub ret: String,
    pub is_static: bool,
    pub is_abstract: bool,
    /// Foreign-linked (runtime-internal or native) methods carry no
    /// patchable body.
    pub is_extern: bool,
    pub kind: MethodKind,
    pub body: Option<MethodBody>,
}

/// Reference to a type defined outside this module, by full name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeRefRow {
    pub full_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MemberSig {
    Method {
        has_this: bool,
        generic_arity: u16,
        params: Vec<String>,
        ret: String,
    },
    Field {
        field_type: String,
        is_static: bool,
    },
}

/// Reference to a member defined outside this module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRefRow {
    pub owner: String,
    pub name: String,
    pub sig: MemberSig,
}

/// Uniform view over a method operand, whether it resolves to a MethodDef or
/// a MemberRef row.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodRefView {
    pub owner: String,
    pub name: String,
    pub generic_arity: u16,
    pub params: Vec<String>,
    pub ret: String,
    pub has_this: bool,
}

impl MethodRefView {
    pub fn key(&self) -> MethodKey {
        MethodKey::new(&self.owner, &self.name, self.generic_arity, &self.params, &self.ret)
    }
}

/// Uniform view over a field operand.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRefView {
    pub owner: String,
    pub name: String,
    pub field_type: String,
    pub is_static: bool,
}

impl FieldRefView {
    pub fn key(&self) -> FieldKey {
        FieldKey::new(&self.owner, &self.name, &self.field_type, self.is_static)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleImage {
    pub name: String,
    pub mvid: Uuid,
    pub types: Vec<TypeDef>,
    pub fields: Vec<FieldDef>,
    pub methods: Vec<MethodDef>,
    pub type_refs: Vec<TypeRefRow>,
    pub member_refs: Vec<MemberRefRow>,
}

impl ModuleImage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mvid: Uuid::new_v4(),
            types: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            type_refs: Vec::new(),
            member_refs: Vec::new(),
        }
    }

    // --- Table access ---

    pub fn type_def(&self, token: Token) -> Option<&TypeDef> {
        if !token.is(TableKind::TypeDef) {
            return None;
        }
        self.types.get(token.index())
    }

    pub fn field_def(&self, token: Token) -> Option<&FieldDef> {
        if !token.is(TableKind::FieldDef) {
            return None;
        }
        self.fields.get(token.index())
    }

    pub fn method_def(&self, token: Token) -> Option<&MethodDef> {
        if !token.is(TableKind::MethodDef) {
            return None;
        }
        self.methods.get(token.index())
    }

    pub fn member_ref(&self, token: Token) -> Option<&MemberRefRow> {
        if !token.is(TableKind::MemberRef) {
            return None;
        }
        self.member_refs.get(token.index())
    }

    pub fn type_tokens(&self) -> impl Iterator<Item = Token> + '_ {
        (0..self.types.len()).map(|i| Token::new(TableKind::TypeDef, i + 1))
    }

    pub fn method_tokens(&self) -> impl Iterator<Item = Token> + '_ {
        (0..self.methods.len()).map(|i| Token::new(TableKind::MethodDef, i + 1))
    }

    pub fn field_tokens(&self) -> impl Iterator<Item = Token> + '_ {
        (0..self.fields.len()).map(|i| Token::new(TableKind::FieldDef, i + 1))
    }

    pub fn find_type(&self, full_name: &str) -> Option<Token> {
        self.types
            .iter()
            .position(|t| t.full_name == full_name)
            .map(|i| Token::new(TableKind::TypeDef, i + 1))
    }

    /// Full name behind a type operand (TypeDef or TypeRef token).
    pub fn type_name_of(&self, token: Token) -> Option<&str> {
        match token.table()? {
            TableKind::TypeDef => self.types.get(token.index()).map(|t| t.full_name.as_str()),
            TableKind::TypeRef => self.type_refs.get(token.index()).map(|t| t.full_name.as_str()),
            _ => None,
        }
    }

    // --- Construction (toolchain + import) ---

    pub fn add_type(&mut self, def: TypeDef) -> Token {
        self.types.push(def);
        Token::new(TableKind::TypeDef, self.types.len())
    }

    pub fn add_field(&mut self, def: FieldDef) -> Token {
        let owner = def.owner;
        self.fields.push(def);
        let token = Token::new(TableKind::FieldDef, self.fields.len());
        if let Some(t) = owner.is(TableKind::TypeDef).then(|| owner.index())
            && let Some(ty) = self.types.get_mut(t)
        {
            ty.fields.push(token);
        }
        token
    }

    pub fn add_method(&mut self, def: MethodDef) -> Token {
        let owner = def.owner;
        self.methods.push(def);
        let token = Token::new(TableKind::MethodDef, self.methods.len());
        if let Some(t) = owner.is(TableKind::TypeDef).then(|| owner.index())
            && let Some(ty) = self.types.get_mut(t)
        {
            ty.methods.push(token);
        }
        token
    }

    /// Find-or-add a reference to an external type.
    pub fn import_type_ref(&mut self, full_name: &str) -> Token {
        if let Some(found) = self.find_type(full_name) {
            return found;
        }
        if let Some(i) = self.type_refs.iter().position(|r| r.full_name == full_name) {
            return Token::new(TableKind::TypeRef, i + 1);
        }
        self.type_refs.push(TypeRefRow { full_name: full_name.to_string() });
        Token::new(TableKind::TypeRef, self.type_refs.len())
    }

    /// Find-or-add a member reference row.
    pub fn import_member_ref(&mut self, row: MemberRefRow) -> Token {
        if let Some(i) = self.member_refs.iter().position(|r| *r == row) {
            return Token::new(TableKind::MemberRef, i + 1);
        }
        self.member_refs.push(row);
        Token::new(TableKind::MemberRef, self.member_refs.len())
    }

    // --- Views and keys ---

    pub fn method_view(&self, token: Token) -> Option<MethodRefView> {
        match token.table()? {
            TableKind::MethodDef => {
                let m = self.methods.get(token.index())?;
                let owner = self.type_def(m.owner)?.full_name.clone();
                Some(MethodRefView {
                    owner,
                    name: m.name.clone(),
                    generic_arity: m.generic_arity,
                    params: m.params.clone(),
                    ret: m.ret.clone(),
                    has_this: !m.is_static,
                })
            }
            TableKind::MemberRef => {
                let r = self.member_refs.get(token.index())?;
                match &r.sig {
                    MemberSig::Method { has_this, generic_arity, params, ret } => Some(MethodRefView {
                        owner: r.owner.clone(),
                        name: r.name.clone(),
                        generic_arity: *generic_arity,
                        params: params.clone(),
                        ret: ret.clone(),
                        has_this: *has_this,
                    }),
                    MemberSig::Field { .. } => None,
                }
            }
            _ => None,
        }
    }

    pub fn field_view(&self, token: Token) -> Option<FieldRefView> {
        match token.table()? {
            TableKind::FieldDef => {
                let f = self.fields.get(token.index())?;
                let owner = self.type_def(f.owner)?.full_name.clone();
                Some(FieldRefView {
                    owner,
                    name: f.name.clone(),
                    field_type: f.field_type.clone(),
                    is_static: f.is_static,
                })
            }
            TableKind::MemberRef => {
                let r = self.member_refs.get(token.index())?;
                match &r.sig {
                    MemberSig::Field { field_type, is_static } => Some(FieldRefView {
                        owner: r.owner.clone(),
                        name: r.name.clone(),
                        field_type: field_type.clone(),
                        is_static: *is_static,
                    }),
                    MemberSig::Method { .. } => None,
                }
            }
            _ => None,
        }
    }

    pub fn method_key_of(&self, token: Token) -> Option<MethodKey> {
        self.method_view(token).map(|v| v.key())
    }

    pub fn field_key_of(&self, token: Token) -> Option<FieldKey> {
        self.field_view(token).map(|v| v.key())
    }

    /// Find a declared method by key.
    pub fn find_method_by_key(&self, key: &MethodKey) -> Option<Token> {
        self.method_tokens().find(|t| self.method_key_of(*t).as_ref() == Some(key))
    }

    // --- Binary form ---

    pub fn to_bytes(&self) -> Result<Vec<u8>, ImageError> {
        let config = bincode::config::standard();
        let payload = bincode::serde::encode_to_vec(self, config)
            .map_err(|e| ImageError::Encode(e.to_string()))?;
        let mut out = Vec::with_capacity(payload.len() + 6);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub fn from_bytes(data: &[u8]) -> Result<ModuleImage, ImageError> {
        if data.len() < 6 || &data[..4] != MAGIC {
            return Err(ImageError::BadMagic);
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != VERSION {
            return Err(ImageError::UnsupportedVersion(version));
        }
        let config = bincode::config::standard();
        let (image, _) = bincode::serde::decode_from_slice(&data[6..], config)
            .map_err(|e| ImageError::Decode(e.to_string()))?;
        Ok(image)
    }
}

const MAGIC: &[u8; 4] = b"RSPI";
const VERSION: u16 = 1;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("not a module image (bad magic)")]
    BadMagic,
    #[error("unsupported image version {0}")]
    UnsupportedVersion(u16),
    #[error("image encode error: {0}")]
    Encode(String),
    #[error("image decode error: {0}")]
    Decode(String),
}
