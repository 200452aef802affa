//! Classifier behavior over realistic edit sequences, including the
//! conservatism property: a fast-path verdict implies the method-key sets
//! of the old and new images match.

use std::path::Path;

use respatch::classifier::{ChangeClassifier, ChangeKind, signature_hash};
use respatch::keys::MethodKey;

const BASE: &str = "class C {
    int hp;
    void Tick() {
        print(\"a\");
    }
    int Add(int a, int b) {
        return a + b;
    }
}
";

fn method_keys(source: &str) -> Vec<MethodKey> {
    let image = respatch::compile_source(source, "Scripts", false).unwrap();
    let mut keys: Vec<MethodKey> = image
        .method_tokens()
        .filter_map(|t| image.method_key_of(t))
        .collect();
    keys.sort();
    keys
}

/// Property: whenever the classifier grants the fast path, the method-key
/// set is unchanged.
fn assert_conservative(base: &str, edit: &str) {
    let mut classifier = ChangeClassifier::new();
    let path = Path::new("A.cs");
    classifier.analyze(path, base).unwrap();
    let verdict = classifier.analyze(path, edit).unwrap();
    if verdict.can_fast_path {
        assert_eq!(
            method_keys(base),
            method_keys(edit),
            "fast-path verdict but key sets differ:\n---\n{base}\n---\n{edit}"
        );
    }
}

#[test]
fn body_edits_are_fast_and_conservative() {
    let edits = [
        BASE.replace("\"a\"", "\"b\""),
        BASE.replace("return a + b;", "return a * b + 1;"),
        BASE.replace("print(\"a\");", "print(\"a\");\n        print(\"aa\");"),
    ];
    for edit in &edits {
        assert_conservative(BASE, edit);

        let mut classifier = ChangeClassifier::new();
        classifier.analyze(Path::new("A.cs"), BASE).unwrap();
        let verdict = classifier.analyze(Path::new("A.cs"), edit).unwrap();
        assert_eq!(verdict.kind, ChangeKind::MethodBodyOnly, "edit: {edit}");
    }
}

#[test]
fn structural_edits_are_slow() {
    let edits = [
        BASE.replace("    int hp;", "    int hp;\n    int mp;"),
        BASE.replace("void Tick() {", "void Tick(int n) {"),
        BASE.replace(
            "    int Add(int a, int b) {",
            "    void Hello() {\n    }\n    int Add(int a, int b) {",
        ),
        format!("{BASE}\nclass D {{\n}}\n"),
    ];
    for edit in &edits {
        let mut classifier = ChangeClassifier::new();
        classifier.analyze(Path::new("A.cs"), BASE).unwrap();
        let verdict = classifier.analyze(Path::new("A.cs"), edit).unwrap();
        assert_eq!(verdict.kind, ChangeKind::SignatureChanged, "edit: {edit}");
        assert!(!verdict.can_fast_path);
    }
}

#[test]
fn removed_member_is_slow() {
    let edit = BASE.replace("    int hp;\n", "");
    let mut classifier = ChangeClassifier::new();
    classifier.analyze(Path::new("A.cs"), BASE).unwrap();
    let verdict = classifier.analyze(Path::new("A.cs"), &edit).unwrap();
    assert_eq!(verdict.kind, ChangeKind::SignatureChanged);
}

#[test]
fn whitespace_and_comment_noise_is_body_only() {
    let noisy = BASE
        .replace("int hp;", "int   hp;   // health")
        .replace("print(\"a\");", "/* body */ print(\"a\");");
    assert_eq!(signature_hash(BASE), signature_hash(&noisy));
}

#[test]
fn per_path_caches_are_independent() {
    let mut classifier = ChangeClassifier::new();
    let a = Path::new("A.cs");
    let b = Path::new("B.cs");

    assert_eq!(classifier.analyze(a, BASE).unwrap().kind, ChangeKind::FirstAnalysis);
    assert_eq!(classifier.analyze(b, BASE).unwrap().kind, ChangeKind::FirstAnalysis);
    assert_eq!(classifier.analyze(a, BASE).unwrap().kind, ChangeKind::MethodBodyOnly);
}

#[test]
fn forget_resets_a_path() {
    let mut classifier = ChangeClassifier::new();
    let path = Path::new("A.cs");
    classifier.analyze(path, BASE).unwrap();
    classifier.forget(path);
    assert_eq!(classifier.analyze(path, BASE).unwrap().kind, ChangeKind::FirstAnalysis);
}

#[test]
fn cache_file_round_trips_through_reload() {
    let dir = tempfile::tempdir().unwrap();
    let cache = dir.path().join("signatures.txt");
    let path = Path::new("Scripts/Player.cs");

    {
        let mut classifier = ChangeClassifier::with_cache_file(&cache);
        assert_eq!(classifier.analyze(path, BASE).unwrap().kind, ChangeKind::FirstAnalysis);
    }
    assert!(cache.exists());
    let text = std::fs::read_to_string(&cache).unwrap();
    assert!(text.contains("Scripts/Player.cs|"));

    let mut reloaded = ChangeClassifier::with_cache_file(&cache);
    assert_eq!(reloaded.analyze(path, BASE).unwrap().kind, ChangeKind::MethodBodyOnly);
}
