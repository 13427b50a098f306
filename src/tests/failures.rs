use super::Sandbox;
use crate::annotation::{optional, precious};
use crate::error::Error;
use crate::{ParamStore, Step, StepRegistry};

#[test]
fn failed_outputs_are_scrubbed_except_precious() {
    let sb = Sandbox::new();
    let mut registry = StepRegistry::default();
    registry
        .register(
            Step::new("fail")
                .output("result")
                .output(precious("log"))
                .run(|ctx| async move {
                    ctx.shell(["echo attempt > log && echo partial > result && false"])
                        .run()
                        .await
                }),
        )
        .unwrap();
    let store = ParamStore::new();

    let err = sb.run(&registry, &store, &["result"]).unwrap_err();
    assert!(err.to_string().contains("exit code 1"), "{err}");
    assert!(!sb.exists("result"));
    assert_eq!(sb.read("log"), "attempt\n");
    // A failure never touches the persistent record.
    assert!(!sb.exists(".dynamake/fail.actions.yaml"));
}

#[test]
fn no_rule_and_no_file_fails() {
    let sb = Sandbox::new();
    let mut registry = StepRegistry::default();
    registry
        .register(Step::new("copy").output("foo").run(|ctx| async move {
            ctx.require("bar")?;
            ctx.shell(["cp", "bar", "foo"]).run().await
        }))
        .unwrap();
    let err = sb.run(&registry, &ParamStore::new(), &["foo"]).unwrap_err();
    assert!(err.to_string().contains("no rule to make target `bar`"), "{err}");
    assert!(!sb.exists("foo"));
}

#[test]
fn optional_absence_is_not_an_error() {
    let sb = Sandbox::new();
    let mut registry = StepRegistry::default();
    registry
        .register(Step::new("gen").output("out").run(|ctx| async move {
            ctx.require(optional("extras.txt"))?;
            ctx.shell(["touch", "out"]).run().await
        }))
        .unwrap();
    let report = sb.run(&registry, &ParamStore::new(), &["out"]).unwrap();
    assert_eq!(report.actions_run, 1);
    assert!(sb.exists("out"));
}

#[test]
fn missing_mandatory_output_fails_the_step() {
    let sb = Sandbox::new();
    let mut registry = StepRegistry::default();
    registry
        .register(Step::new("hollow").output("out").run(|ctx| async move {
            ctx.shell(["true"]).run().await
        }))
        .unwrap();
    let err = sb.run(&registry, &ParamStore::new(), &["out"]).unwrap_err();
    assert!(err.to_string().contains("did not produce output `out`"), "{err}");
}

#[test]
fn cyclic_require_fails() {
    let sb = Sandbox::new();
    let mut registry = StepRegistry::default();
    registry
        .register(Step::new("chicken").output("chicken").run(|ctx| async move {
            ctx.require("egg")?;
            ctx.shell(["touch", "chicken"]).run().await
        }))
        .unwrap();
    registry
        .register(Step::new("egg").output("egg").run(|ctx| async move {
            ctx.require("chicken")?;
            ctx.shell(["touch", "egg"]).run().await
        }))
        .unwrap();
    let err = sb
        .run(&registry, &ParamStore::new(), &["chicken"])
        .unwrap_err();
    assert!(err.to_string().contains("cyclic require"), "{err}");
}

#[test]
fn ambiguous_rule_aborts_the_build() {
    let sb = Sandbox::new();
    let mut registry = StepRegistry::default();
    for name in ["one", "two"] {
        registry
            .register(
                Step::new(name)
                    .output("gen/{*x}.txt")
                    .run(|ctx| async move { ctx.shell(["true"]).run().await }),
            )
            .unwrap();
    }
    let err = sb
        .run(&registry, &ParamStore::new(), &["gen/a.txt"])
        .unwrap_err();
    assert!(err.to_string().contains("ambiguous rule"), "{err}");
}

#[test]
fn priority_resolves_the_overlap() {
    let sb = Sandbox::new();
    let mut registry = StepRegistry::default();
    registry
        .register(
            Step::new("generic")
                .output("gen/{*x}.txt")
                .run(|ctx| async move {
                    let out = ctx.output(0)?;
                    ctx.shell([format!("mkdir -p gen && echo generic > {out}")])
                        .run()
                        .await
                }),
        )
        .unwrap();
    registry
        .register(
            Step::new("special")
                .output("gen/{*x}.txt")
                .priority(1)
                .run(|ctx| async move {
                    let out = ctx.output(0)?;
                    ctx.shell([format!("mkdir -p gen && echo special > {out}")])
                        .run()
                        .await
                }),
        )
        .unwrap();
    sb.run(&registry, &ParamStore::new(), &["gen/a.txt"]).unwrap();
    assert_eq!(sb.read("gen/a.txt"), "special\n");
}

#[test]
fn dependency_failure_propagates() {
    let sb = Sandbox::new();
    let mut registry = StepRegistry::default();
    registry
        .register(Step::new("broken").output("broken").run(|ctx| async move {
            ctx.shell(["false"]).run().await
        }))
        .unwrap();
    registry
        .register(Step::new("needs").output("needs").run(|ctx| async move {
            ctx.require("broken")?;
            ctx.shell(["touch", "needs"]).run().await
        }))
        .unwrap();
    let err = sb.run(&registry, &ParamStore::new(), &["needs"]).unwrap_err();
    assert!(err.to_string().contains("exit code 1"), "{err}");
    assert!(!sb.exists("needs"));
}

#[test]
fn independent_branches_continue_when_aborts_disabled() {
    let sb = Sandbox::new();
    sb.write("bar", "hello");
    let mut registry = StepRegistry::default();
    registry
        .register(Step::new("broken").output("broken").run(|ctx| async move {
            ctx.shell(["false"]).run().await
        }))
        .unwrap();
    registry
        .register(Step::new("copy").output("foo").run(|ctx| async move {
            ctx.require("bar")?;
            ctx.shell(["cp", "bar", "foo"]).run().await
        }))
        .unwrap();
    let mut store = ParamStore::new();
    store.set_override("failure_aborts_build", "false").unwrap();

    // The build still fails, but the independent branch completes.
    let err = sb.run(&registry, &store, &["broken", "foo"]).unwrap_err();
    assert!(err.to_string().contains("exit code 1"), "{err}");
    assert!(sb.exists("foo"));
}

#[test]
fn empty_required_path_is_rejected() {
    let sb = Sandbox::new();
    let mut registry = StepRegistry::default();
    registry
        .register(Step::new("weird").output("out").run(|ctx| async move {
            ctx.require("")?;
            ctx.shell(["touch", "out"]).run().await
        }))
        .unwrap();
    let err = sb.run(&registry, &ParamStore::new(), &["out"]).unwrap_err();
    assert!(err.to_string().contains("empty path"), "{err}");
}

#[test]
fn corrupt_record_is_rebuilt() {
    let sb = Sandbox::new();
    sb.write("bar", "hello");
    let mut registry = StepRegistry::default();
    registry
        .register(Step::new("copy").output("foo").run(|ctx| async move {
            ctx.require("bar")?;
            ctx.shell(["cp", "bar", "foo"]).run().await
        }))
        .unwrap();
    let store = ParamStore::new();
    sb.run(&registry, &store, &["foo"]).unwrap();
    sb.write(".dynamake/copy.actions.yaml", "{not yaml: [");

    let report = sb.run(&registry, &store, &["foo"]).unwrap();
    assert_eq!(report.actions_run, 1);
    // The bad record was replaced by a good one.
    let report = sb.run(&registry, &store, &["foo"]).unwrap();
    assert_eq!(report.actions_run, 0);
}

#[test]
fn downcast_classifies_configuration_errors() {
    assert!(
        Error::AmbiguousRule {
            path: "x".into(),
            steps: vec![],
            priority: 0
        }
        .is_configuration()
    );
    assert!(!Error::NoRule("x".into()).is_configuration());
}
