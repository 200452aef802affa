//! Key determinism properties: method keys and their 32-bit ids must come
//! out identical across processes and across independent computations, or
//! persisted patches could never replay.

use proptest::prelude::*;
use respatch::keys::{FieldKey, MethodId, MethodKey};

fn ident() -> impl Strategy<Value = String> {
    "[A-Za-z_][A-Za-z0-9_]{0,12}"
}

fn type_name() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("int".to_string()),
        Just("bool".to_string()),
        Just("float".to_string()),
        Just("string".to_string()),
        Just("object".to_string()),
        ident(),
    ]
}

proptest! {
    #[test]
    fn key_and_id_are_deterministic(
        owner in ident(),
        name in ident(),
        arity in 0u16..3,
        params in proptest::collection::vec(type_name(), 0..4),
        ret in type_name(),
    ) {
        let a = MethodKey::new(&owner, &name, arity, &params, &ret);
        let b = MethodKey::new(&owner, &name, arity, &params, &ret);
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(a.id(), b.id());
        prop_assert_eq!(a.id(), MethodId::of(a.as_str()));
    }

    #[test]
    fn key_round_trips_through_raw_string(
        owner in ident(),
        name in ident(),
        params in proptest::collection::vec(type_name(), 0..4),
        ret in type_name(),
    ) {
        let key = MethodKey::new(&owner, &name, 0, &params, &ret);
        let raw = key.as_str().to_string();
        let back = MethodKey::from_raw(raw);
        prop_assert_eq!(&key, &back);
        prop_assert_eq!(key.id(), back.id());
    }

    #[test]
    fn owner_is_always_recoverable(
        owner in ident(),
        name in ident(),
        ret in type_name(),
    ) {
        let key = MethodKey::new(&owner, &name, 0, &[], &ret);
        prop_assert_eq!(key.owner(), owner.as_str());
    }

    #[test]
    fn nested_separators_normalize(
        outer in ident(),
        inner in ident(),
        name in ident(),
    ) {
        let plus = MethodKey::new(&format!("{outer}+{inner}"), &name, 0, &[], "void");
        let slash = MethodKey::new(&format!("{outer}/{inner}"), &name, 0, &[], "void");
        prop_assert_eq!(&plus, &slash);
        prop_assert_eq!(plus.id(), slash.id());
    }

    #[test]
    fn different_owners_never_collide_textually(
        owner_a in ident(),
        owner_b in ident(),
        name in ident(),
    ) {
        prop_assume!(owner_a != owner_b);
        let a = MethodKey::new(&owner_a, &name, 0, &[], "void");
        let b = MethodKey::new(&owner_b, &name, 0, &[], "void");
        prop_assert_ne!(a, b);
    }

    #[test]
    fn field_key_type_is_recoverable(
        owner in ident(),
        name in ident(),
        ty in type_name(),
        is_static in any::<bool>(),
    ) {
        let key = FieldKey::new(&owner, &name, &ty, is_static);
        prop_assert_eq!(key.field_type(), ty.as_str());
        let suffix = if is_static { ":static" } else { ":instance" };
        prop_assert!(key.as_str().ends_with(suffix));
    }
}

#[test]
fn ids_match_known_fnv_vectors() {
    // FNV-1a 32 reference values.
    assert_eq!(MethodId::of("").0, 0x811c9dc5);
    assert_eq!(MethodId::of("a").0, 0xe40c292c);
    assert_eq!(MethodId::of("foobar").0, 0xbf9cf968);
}

#[test]
fn image_method_keys_are_stable_across_compiles() {
    let src = "class C {
    int counter;
    void OnTick() {
        counter++;
    }
    int Add(int a, int b) {
        return a + b;
    }
}
";
    let keys = |_: ()| {
        let image = respatch::compile_source(src, "Scripts", false).unwrap();
        let mut keys: Vec<String> = image
            .method_tokens()
            .filter_map(|t| image.method_key_of(t))
            .map(|k| k.as_str().to_string())
            .collect();
        keys.sort();
        keys
    };
    // Two independent compiles (fresh UUIDs, fresh tables) agree on every
    // key and therefore every method id.
    assert_eq!(keys(()), keys(()));
    assert!(keys(()).iter().any(|k| k == "C::Add`0(int,int)=>int"));
    assert!(keys(()).iter().any(|k| k == "C::OnTick`0()=>void"));
}
