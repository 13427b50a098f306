use super::Sandbox;
use crate::{ParamStore, Step, StepRegistry};

/// Three steps each draw 60 against a budget of 100, so no two of them may
/// ever run at once. Each action takes a lock directory that a concurrent
/// action would trip over (`mkdir` fails if the directory exists), so any
/// overlap fails the build.
#[test]
fn resource_budget_serializes_actions() {
    let sb = Sandbox::new();
    let mut registry = StepRegistry::default();
    for name in ["r1", "r2", "r3"] {
        registry
            .register(
                Step::new(name)
                    .output(name)
                    .resource("ram", 60)
                    .run(move |ctx| async move {
                        let out = ctx.output(0)?;
                        ctx.shell([format!(
                            "mkdir .lock && sleep 0.2 && touch {out} && rmdir .lock"
                        )])
                        .run()
                        .await
                    }),
            )
            .unwrap();
    }
    let mut store = ParamStore::new();
    store.define("ram", 100, "memory budget").unwrap();
    store.resource_parameter("ram", 10).unwrap();

    let report = sb.run(&registry, &store, &["r1", "r2", "r3"]).unwrap();
    assert_eq!(report.actions_run, 3);
    assert_eq!(report.steps_failed, 0);
    assert!(sb.exists("r1") && sb.exists("r2") && sb.exists("r3"));
}

#[test]
fn unlimited_jobs_still_completes() {
    let sb = Sandbox::new();
    let mut registry = StepRegistry::default();
    for name in ["a", "b", "c"] {
        registry
            .register(Step::new(name).output(name).run(move |ctx| async move {
                let out = ctx.output(0)?;
                ctx.shell([format!("touch {out}")]).run().await
            }))
            .unwrap();
    }
    let mut store = ParamStore::new();
    store.set_override("jobs", "0").unwrap();
    let report = sb.run(&registry, &store, &["a", "b", "c"]).unwrap();
    assert_eq!(report.actions_run, 3);
}

#[test]
fn jobs_cap_of_one_serializes_everything() {
    let sb = Sandbox::new();
    let mut registry = StepRegistry::default();
    for name in ["a", "b", "c"] {
        registry
            .register(Step::new(name).output(name).run(move |ctx| async move {
                let out = ctx.output(0)?;
                ctx.shell([format!(
                    "mkdir .only && sleep 0.1 && touch {out} && rmdir .only"
                )])
                .run()
                .await
            }))
            .unwrap();
    }
    let mut store = ParamStore::new();
    store.set_override("jobs", "1").unwrap();
    let report = sb.run(&registry, &store, &["a", "b", "c"]).unwrap();
    assert_eq!(report.actions_run, 3);
    assert_eq!(report.steps_failed, 0);
}

#[test]
fn draw_over_budget_aborts() {
    let sb = Sandbox::new();
    let mut registry = StepRegistry::default();
    registry
        .register(
            Step::new("hog")
                .output("hog")
                .resource("ram", 150)
                .run(|ctx| async move { ctx.shell(["touch", "hog"]).run().await }),
        )
        .unwrap();
    let mut store = ParamStore::new();
    store.define("ram", 100, "memory budget").unwrap();
    store.resource_parameter("ram", 10).unwrap();
    let err = sb.run(&registry, &store, &["hog"]).unwrap_err();
    assert!(err.to_string().contains("exceeds total budget"), "{err}");
}
