//! Well-known member references the rewriter and toolchain emit.
//!
//! Rewritten bodies never link against engine types directly; they call
//! these synthetic static members, which the executing host resolves to the
//! dispatcher, the field store, and its own output sink. The angle-bracket
//! owners keep them out of the patchable-type namespace.

use crate::image::{MemberRefRow, MemberSig};

pub const HOST_TYPE: &str = "<Host>";
pub const HOST_PRINT: &str = "Print";

pub const DISPATCH_TYPE: &str = "<Dispatch>";
pub const DISPATCH_INVOKE: &str = "Invoke";

pub const FIELD_STORE_TYPE: &str = "<FieldStore>";
pub const FIELD_GET_INSTANCE: &str = "GetInstance";
pub const FIELD_SET_INSTANCE: &str = "SetInstance";
pub const FIELD_GET_STATIC: &str = "GetStatic";
pub const FIELD_SET_STATIC: &str = "SetStatic";

pub fn is_intrinsic_owner(owner: &str) -> bool {
    matches!(owner, HOST_TYPE | DISPATCH_TYPE | FIELD_STORE_TYPE)
}

fn static_method(owner: &str, name: &str, params: &[&str], ret: &str) -> MemberRefRow {
    MemberRefRow {
        owner: owner.to_string(),
        name: name.to_string(),
        sig: MemberSig::Method {
            has_this: false,
            generic_arity: 0,
            params: params.iter().map(|p| p.to_string()).collect(),
            ret: ret.to_string(),
        },
    }
}

/// `<Host>::Print(object)`
pub fn print_ref() -> MemberRefRow {
    static_method(HOST_TYPE, HOST_PRINT, &["object"], "void")
}

/// `<Dispatch>::Invoke(object this_or_null, int method_id, object[] argv) => object`
pub fn dispatch_invoke_ref() -> MemberRefRow {
    static_method(DISPATCH_TYPE, DISPATCH_INVOKE, &["object", "int", "object[]"], "object")
}

/// `<FieldStore>::GetInstance(object owner, string key, type) => object`
pub fn field_get_instance_ref() -> MemberRefRow {
    static_method(FIELD_STORE_TYPE, FIELD_GET_INSTANCE, &["object", "string", "type"], "object")
}

/// `<FieldStore>::SetInstance(object owner, string key, object value)`
pub fn field_set_instance_ref() -> MemberRefRow {
    static_method(FIELD_STORE_TYPE, FIELD_SET_INSTANCE, &["object", "string", "object"], "void")
}

/// `<FieldStore>::GetStatic(string key, type) => object`
pub fn field_get_static_ref() -> MemberRefRow {
    static_method(FIELD_STORE_TYPE, FIELD_GET_STATIC, &["string", "type"], "object")
}

/// `<FieldStore>::SetStatic(string key, object value)`
pub fn field_set_static_ref() -> MemberRefRow {
    static_method(FIELD_STORE_TYPE, FIELD_SET_STATIC, &["string", "object"], "void")
}
