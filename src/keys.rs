//! Canonical method and field identity.
//!
//! Method keys are the universal name for a method slot across the freshly
//! compiled image, the already-loaded runtime module, and the persisted patch
//! history. The 32-bit id derived from a key is the dispatch table's primary
//! key and the identifier embedded in rewritten bodies, so both must be
//! deterministic across processes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Canonical structural name of a method:
/// `` <Owner>::<Name>`<Arity>(<Param>,…)=><Return> ``.
///
/// Nested-type separators are normalized (`+` becomes `/`), so keys computed
/// from different metadata readers compare equal. Equal keys mean the same
/// method slot; the owner type being part of the key rules out cross-type
/// collisions.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodKey(String);

impl MethodKey {
    pub fn new(owner: &str, name: &str, generic_arity: u16, params: &[String], ret: &str) -> Self {
        let mut s = String::with_capacity(owner.len() + name.len() + 16);
        push_normalized(&mut s, owner);
        s.push_str("::");
        s.push_str(name);
        s.push('`');
        s.push_str(&generic_arity.to_string());
        s.push('(');
        for (i, p) in params.iter().enumerate() {
            if i > 0 {
                s.push(',');
            }
            push_normalized(&mut s, p);
        }
        s.push_str(")=>");
        push_normalized(&mut s, ret);
        MethodKey(s)
    }

    /// Wrap an already-normalized key string (e.g. read back from history).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        MethodKey(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The owner type's full name portion of the key.
    pub fn owner(&self) -> &str {
        self.0.split("::").next().unwrap_or("")
    }

    /// Stable 32-bit id for this key.
    pub fn id(&self) -> MethodId {
        MethodId::of(&self.0)
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical name of a field slot:
/// `<Owner>::<Name>:<FieldType>:<instance|static>`.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldKey(String);

impl FieldKey {
    pub fn new(owner: &str, name: &str, field_type: &str, is_static: bool) -> Self {
        let mut s = String::with_capacity(owner.len() + name.len() + field_type.len() + 12);
        push_normalized(&mut s, owner);
        s.push_str("::");
        s.push_str(name);
        s.push(':');
        push_normalized(&mut s, field_type);
        s.push(':');
        s.push_str(if is_static { "static" } else { "instance" });
        FieldKey(s)
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        FieldKey(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The declared field type portion of the key.
    pub fn field_type(&self) -> &str {
        let mut parts = self.0.rsplit(':');
        parts.next();
        parts.next().unwrap_or("object")
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 32-bit FNV-1a hash of a method key. Deterministic across processes, which
/// persisted patches rely on for replay.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodId(pub u32);

const FNV_OFFSET: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

impl MethodId {
    pub fn of(key: &str) -> Self {
        let mut hash = FNV_OFFSET;
        for b in key.as_bytes() {
            hash ^= u32::from(*b);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        MethodId(hash)
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

fn push_normalized(out: &mut String, type_name: &str) {
    for c in type_name.chars() {
        out.push(if c == '+' { '/' } else { c });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_format() {
        let k = MethodKey::new(
            "Game.Player",
            "Tick",
            0,
            &["int".to_string(), "string".to_string()],
            "void",
        );
        assert_eq!(k.as_str(), "Game.Player::Tick`0(int,string)=>void");
        assert_eq!(k.owner(), "Game.Player");
    }

    #[test]
    fn nested_separator_normalized() {
        let plus = MethodKey::new("Game.Outer+Inner", "Run", 0, &[], "void");
        let slash = MethodKey::new("Game.Outer/Inner", "Run", 0, &[], "void");
        assert_eq!(plus, slash);
    }

    #[test]
    fn id_deterministic() {
        let k = MethodKey::new("C", "Tick", 0, &[], "void");
        assert_eq!(k.id(), k.id());
        assert_eq!(k.id(), MethodId::of(k.as_str()));
    }

    #[test]
    fn id_differs_by_owner() {
        let a = MethodKey::new("A", "Tick", 0, &[], "void");
        let b = MethodKey::new("B", "Tick", 0, &[], "void");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn fnv_reference_vector() {
        // FNV-1a("a") = 0xe40c292c
        assert_eq!(MethodId::of("a").0, 0xe40c292c);
    }

    #[test]
    fn field_key_format() {
        let k = FieldKey::new("C", "counter", "int", false);
        assert_eq!(k.as_str(), "C::counter:int:instance");
        assert_eq!(k.field_type(), "int");

        let s = FieldKey::new("C", "total", "int", true);
        assert_eq!(s.as_str(), "C::total:int:static");
    }
}
