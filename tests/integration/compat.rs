mod common;

use common::{ASSEMBLY, fixture, fixture_with};
use respatch::diagnostics::PatchError;

#[test]
fn removed_method_aborts_with_no_partial_state() {
    let (fx, _obj) = fixture_with(
        "class C { void OnTick() { print(\"a\"); } void Gone() { } }",
        "C",
    );

    fx.edit("class C { void OnTick() { print(\"b\"); } }");
    let err = fx.engine.reload_now(&fx.source).unwrap_err();
    let PatchError::Incompatible { reason } = err else {
        panic!("expected incompatible, got {err}");
    };
    assert!(reason.contains("Method removed from C"));
    assert!(reason.contains("Gone"));

    // No hook was installed for any method of the assembly.
    assert!(fx.engine.patcher(ASSEMBLY).is_none());
    // The runtime still runs the original code.
    assert_eq!(fx.tick_output(), vec!["a"]);
}

#[test]
fn new_type_aborts_apply() {
    let fx = fixture("class C { void Tick() { } }");
    fx.edit("class C { void Tick() { } } class D { void Helper() { } }");
    let err = fx.engine.reload_now(&fx.source).unwrap_err();
    assert!(matches!(err, PatchError::Incompatible { .. }));
    assert!(err.to_string().contains("New type added: D"));
}

#[test]
fn incompatible_apply_after_good_apply_keeps_existing_hooks() {
    let (fx, _obj) = fixture_with("class C { void OnTick() { print(\"a\"); } void Gone() { } }", "C");

    fx.apply("class C { void OnTick() { print(\"patched\"); } void Gone() { } }");
    assert_eq!(fx.tick_output(), vec!["patched"]);
    let hooks_before = fx.engine.patcher(ASSEMBLY).unwrap().hooked_keys();

    fx.edit("class C { void OnTick() { print(\"never\"); } }");
    assert!(fx.engine.reload_now(&fx.source).is_err());

    // The failed apply neither added nor removed hooks.
    assert_eq!(fx.engine.patcher(ASSEMBLY).unwrap().hooked_keys(), hooks_before);
    assert_eq!(fx.tick_output(), vec!["patched"]);
}

#[test]
fn unsupported_method_body_degrades_to_skip() {
    use respatch::host::{HostServices, RuntimeCtx, SimHost};
    use respatch::image::instr::{Instruction, MethodBody, Op, Operand};
    use respatch::inspect::{PlanOutcome, plan};
    use respatch::install::AssemblyPatcher;
    use std::sync::Arc;

    let ctx = RuntimeCtx::new();
    let host = SimHost::new(Arc::clone(&ctx));
    let module = host.load_assembly(common::compile(
        "class C { void Tick() { print(\"a\"); } void Bad() { } }",
    ));

    // A patch image where Bad's body carries an operand the rewriter cannot
    // move across modules.
    let mut image = common::compile(
        "class C { void Tick() { print(\"b\") ; } void Bad() { } }",
    );
    let bad = image
        .method_tokens()
        .find(|t| image.method_def(*t).unwrap().name == "Bad")
        .unwrap();
    let mut body = MethodBody::new();
    body.instructions.push(Instruction::new(Op::Calli, Operand::Opaque(0x1100_0001)));
    body.instructions.push(Instruction::simple(Op::Ret));
    image.methods[bad.index()].body = Some(body);

    let PlanOutcome::Plan(plan) = plan(&image, &module, false, None) else {
        panic!("expected a plan");
    };
    let patcher = AssemblyPatcher::new(
        Arc::clone(&module),
        Arc::clone(&host) as Arc<dyn HostServices>,
        Arc::clone(&ctx.dispatcher),
        Arc::clone(&ctx.entry_points),
    );
    let result = patcher.apply(&image, &plan);

    // Tick (and the ctor) still patched; Bad skipped with a recorded reason.
    assert!(result.patched >= 1);
    assert_eq!(result.skipped, 1);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("Bad"));
    let summary = result.summary(5);
    assert!(summary.contains("1 method(s) could not be patched"));
}
