//! End-to-end scenarios driving the engine the way an orchestrator would:
//! assemble a DAG, render in dependency order, build task by task, and let
//! status changes ripple to dependents.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use kiln::testing::{
    ArtifactStore, FailingRunner, InMemoryProduct, NamedClient, StoppingRunner, TouchRunner,
};
use kiln::{
    Client, ConfigError, Dag, DagError, Hook, MetaProduct, Params, Product, Task, TaskError,
    TaskName, TaskSnapshot, TaskStatus,
};

fn name(s: &str) -> TaskName {
    TaskName::new(s)
}

fn touch_task(task_name: &str, store: &ArtifactStore) -> Task {
    let product = InMemoryProduct::with_store(format!("{task_name}.out"), store.clone());
    let runner = TouchRunner::new(store.clone());
    Task::new(task_name, Box::new(runner), Box::new(product), Params::new()).unwrap()
}

#[test]
fn single_task_lifecycle_creates_missing_product() {
    let store = ArtifactStore::new();
    let mut dag = Dag::new("single");
    dag.add_task(touch_task("t1", &store)).unwrap();

    dag.render(&name("t1"), false, true).unwrap();
    assert_eq!(
        dag.task(&name("t1")).unwrap().exec_status(),
        TaskStatus::WaitingExecution
    );

    let (report, metadata) = dag.build(&name("t1"), false, true).unwrap();

    assert!(report.ran);
    assert_eq!(
        dag.task(&name("t1")).unwrap().exec_status(),
        TaskStatus::Executed
    );
    assert!(store.contains("t1.out"));
    assert!(metadata.timestamp.is_some());
}

#[test]
fn building_with_unfinished_upstream_is_a_configuration_error() {
    let store = ArtifactStore::new();
    let mut dag = Dag::new("pair");
    dag.add_task(touch_task("t1", &store)).unwrap();
    dag.add_task(touch_task("t2", &store)).unwrap();
    dag.add_edge(&name("t1"), &name("t2")).unwrap();
    dag.render_all(false, true).unwrap();

    assert_eq!(
        dag.task(&name("t2")).unwrap().exec_status(),
        TaskStatus::WaitingUpstream
    );

    let err = dag.build(&name("t2"), false, true).unwrap_err();
    assert!(matches!(
        err,
        TaskError::Config(ConfigError::UpstreamPending { .. })
    ));
}

#[test]
fn pipeline_templates_on_params_and_upstream_products() {
    let store = ArtifactStore::new();
    let mut dag = Dag::new("etl");

    let extract_product = InMemoryProduct::with_store("raw_{{region}}.csv", store.clone());
    let extract_runner = TouchRunner::with_template(store.clone(), "fetch {{region}} > {{product}}");
    let extract = Task::new(
        "extract",
        Box::new(extract_runner),
        Box::new(extract_product),
        Params::new().with("region", "emea").unwrap(),
    )
    .unwrap();

    let clean_product = InMemoryProduct::with_store("clean.csv", store.clone());
    let clean_runner =
        TouchRunner::with_template(store.clone(), "clean {{upstream.extract}} > {{product}}");
    let clean = Task::new(
        "clean",
        Box::new(clean_runner),
        Box::new(clean_product),
        Params::new(),
    )
    .unwrap();

    dag.add_task(extract).unwrap();
    dag.add_task(clean).unwrap();
    dag.add_edge(&name("extract"), &name("clean")).unwrap();

    dag.render_all(false, true).unwrap();
    dag.build(&name("extract"), false, true).unwrap();
    dag.build(&name("clean"), false, true).unwrap();

    assert!(store.contains("raw_emea.csv"));
    assert!(store.contains("clean.csv"));

    let clean_task = dag.task(&name("clean")).unwrap();
    assert_eq!(
        clean_task.source().code().unwrap(),
        "clean raw_emea.csv > clean.csv"
    );
}

#[test]
fn up_to_date_pipeline_skips_everything_on_second_session() {
    let store = ArtifactStore::new();
    let mut dag = Dag::new("pipeline");
    dag.add_task(touch_task("a", &store)).unwrap();
    dag.add_task(touch_task("b", &store)).unwrap();
    dag.add_edge(&name("a"), &name("b")).unwrap();

    dag.render_all(false, true).unwrap();
    dag.build(&name("a"), false, true).unwrap();
    dag.build(&name("b"), false, true).unwrap();

    // second session: everything is up to date
    dag.render_all(false, true).unwrap();
    assert_eq!(dag.task(&name("a")).unwrap().exec_status(), TaskStatus::Skipped);
    assert_eq!(dag.task(&name("b")).unwrap().exec_status(), TaskStatus::Skipped);

    let (report, _) = dag.build(&name("a"), false, true).unwrap();
    assert!(!report.ran);
}

#[test]
fn force_rebuilds_an_up_to_date_task() {
    let store = ArtifactStore::new();
    let mut dag = Dag::new("force");
    let task = touch_task("t", &store);
    dag.add_task(task).unwrap();

    dag.build(&name("t"), false, true).unwrap();
    let (report, _) = dag.build(&name("t"), true, true).unwrap();

    assert!(report.ran);
}

#[test]
fn diamond_failure_aborts_the_join_task() {
    // a -> b, a -> c, b -> d, c -> d
    let store = ArtifactStore::new();
    let mut dag = Dag::new("diamond");
    let failing = {
        let product = InMemoryProduct::with_store("a.out", store.clone());
        Task::new(
            "a",
            Box::new(FailingRunner::new("upstream blew up")),
            Box::new(product),
            Params::new(),
        )
        .unwrap()
    };
    dag.add_task(failing).unwrap();
    for t in ["b", "c", "d"] {
        dag.add_task(touch_task(t, &store)).unwrap();
    }
    dag.add_edge(&name("a"), &name("b")).unwrap();
    dag.add_edge(&name("a"), &name("c")).unwrap();
    dag.add_edge(&name("b"), &name("d")).unwrap();
    dag.add_edge(&name("c"), &name("d")).unwrap();
    dag.render_all(false, true).unwrap();

    let err = dag.build(&name("a"), false, true).unwrap_err();
    assert!(matches!(err, TaskError::Build(_)));

    // one failed parent path is enough to abort the join
    assert_eq!(dag.task(&name("a")).unwrap().exec_status(), TaskStatus::Errored);
    assert_eq!(dag.task(&name("d")).unwrap().exec_status(), TaskStatus::Aborted);
}

#[test]
fn graceful_stop_surfaces_unwrapped_and_leaves_graph_buildable() {
    let store = ArtifactStore::new();
    let mut dag = Dag::new("stop");
    let stopping = {
        let product = InMemoryProduct::with_store("s.out", store.clone());
        Task::new(
            "s",
            Box::new(StoppingRunner::new("operator requested shutdown")),
            Box::new(product),
            Params::new(),
        )
        .unwrap()
    };
    dag.add_task(stopping).unwrap();
    dag.add_task(touch_task("after", &store)).unwrap();
    dag.add_edge(&name("s"), &name("after")).unwrap();
    dag.render_all(false, true).unwrap();

    let err = dag.build(&name("s"), false, true).unwrap_err();

    assert!(err.is_stop());
    // a stop is not a failure: nothing errored, nothing aborted
    assert_eq!(
        dag.task(&name("s")).unwrap().exec_status(),
        TaskStatus::WaitingExecution
    );
    assert_eq!(
        dag.task(&name("after")).unwrap().exec_status(),
        TaskStatus::WaitingUpstream
    );
}

#[test]
fn worker_process_round_trip_reapplies_status_and_propagates() {
    let store = ArtifactStore::new();
    let mut dag = Dag::new("parent");
    dag.add_task(touch_task("a", &store)).unwrap();
    dag.add_task(touch_task("b", &store)).unwrap();
    dag.add_task(touch_task("c", &store)).unwrap();
    dag.add_edge(&name("a"), &name("b")).unwrap();
    dag.add_edge(&name("b"), &name("c")).unwrap();
    dag.render_all(false, true).unwrap();
    dag.build(&name("a"), false, true).unwrap();

    // ship b's state to a worker process (serialized snapshot, shared storage)
    let outbound = dag.task(&name("b")).unwrap().capture();
    let wire = serde_json::to_string(&outbound).unwrap();

    // worker side: reconstruct the task around fresh runtime handles,
    // restore the shipped state, and build
    let inbound: TaskSnapshot = serde_json::from_str(&wire).unwrap();
    let mut worker_task = touch_task("b", &store);
    worker_task.restore(inbound).unwrap();
    worker_task.build_internal(true).unwrap();
    let result_wire = serde_json::to_string(&worker_task.capture()).unwrap();

    // parent side: bring the result home and re-apply the exec status,
    // which triggers propagation in this process's graph
    let result: TaskSnapshot = serde_json::from_str(&result_wire).unwrap();
    let status = result.status;
    dag.task_mut(&name("b")).unwrap().restore(result).unwrap();
    dag.set_exec_status(&name("b"), status).unwrap();

    assert_eq!(dag.task(&name("b")).unwrap().exec_status(), TaskStatus::Executed);
    assert_eq!(
        dag.task(&name("c")).unwrap().exec_status(),
        TaskStatus::WaitingExecution
    );
    assert!(store.contains("b.out"));
}

#[test]
fn changed_source_marks_task_outdated_by_code() {
    let store = ArtifactStore::new();

    // first session: build with the original source
    let mut original = touch_task("t", &store);
    original.render(&kiln::Upstream::empty(), false, true).unwrap();
    original.build_internal(true).unwrap();
    let snapshot = original.capture();

    // same task, new code revision: restore the recorded state onto it
    let product = InMemoryProduct::with_store("t.out", store.clone());
    let runner = TouchRunner::with_template(store.clone(), "touch --force {{product}}");
    let mut revised = Task::new("t", Box::new(runner), Box::new(product), Params::new()).unwrap();
    revised.restore(snapshot).unwrap();

    revised.render(&kiln::Upstream::empty(), false, true).unwrap();
    assert_eq!(revised.exec_status(), TaskStatus::WaitingExecution);
    let outdated = revised.outdated().unwrap();
    assert!(outdated.code);
    assert!(!outdated.data);

    // with code comparison disabled the task is considered current
    revised.render(&kiln::Upstream::empty(), false, false).unwrap();
    assert_eq!(revised.exec_status(), TaskStatus::Skipped);
}

#[test]
fn render_sweep_reports_failures_and_aborts_dependents() {
    let store = ArtifactStore::new();
    let mut dag = Dag::new("sweep");
    let broken = {
        let product = InMemoryProduct::with_store("{{undefined}}.out", store.clone());
        Task::new(
            "broken",
            Box::new(TouchRunner::new(store.clone())),
            Box::new(product),
            Params::new(),
        )
        .unwrap()
    };
    dag.add_task(broken).unwrap();
    dag.add_task(touch_task("ok", &store)).unwrap();
    dag.add_task(touch_task("child", &store)).unwrap();
    dag.add_edge(&name("broken"), &name("child")).unwrap();

    let err = dag.render_all(false, true).unwrap_err();

    match err {
        TaskError::Dag(DagError::RenderSweep { failures }) => {
            assert_eq!(failures.len(), 1);
            assert!(matches!(failures[0].1, TaskError::Render(_)));
        }
        other => panic!("expected a render sweep failure, got {other:?}"),
    }
    // the healthy sibling rendered normally
    assert_eq!(
        dag.task(&name("ok")).unwrap().exec_status(),
        TaskStatus::WaitingExecution
    );
    assert_eq!(
        dag.task(&name("broken")).unwrap().exec_status(),
        TaskStatus::ErroredRender
    );
    assert_eq!(
        dag.task(&name("child")).unwrap().exec_status(),
        TaskStatus::AbortedRender
    );
}

#[test]
fn hooks_fire_with_current_runtime_values() {
    let store = ArtifactStore::new();
    let mut dag = Dag::new("hooks");

    let client = Arc::new(NamedClient::new("warehouse"));
    let task = touch_task("t", &store).with_client(client);
    dag.add_task(task).unwrap();

    {
        let task = dag.task_mut(&name("t")).unwrap();
        task.set_on_render(
            Hook::new(&["task", "params"], |args| {
                let view = args.task.expect("declared");
                assert_eq!(view.name.as_str(), "t");
                // the engine injected the rendered product before the hook
                assert!(args.params.expect("declared").contains("product"));
                Ok(())
            })
            .unwrap(),
        );
        task.set_on_finish(
            Hook::new(&["client", "product"], |args| {
                assert_eq!(args.client.expect("declared").name(), "warehouse");
                assert!(args.product.expect("declared").exists().unwrap());
                assert!(args.task.is_none());
                Ok(())
            })
            .unwrap(),
        );
    }

    dag.build(&name("t"), false, true).unwrap();
    assert_eq!(dag.task(&name("t")).unwrap().exec_status(), TaskStatus::Executed);
}

#[test]
fn meta_product_task_requires_every_member() {
    let store = ArtifactStore::new();
    let members = vec![
        Box::new(InMemoryProduct::with_store("part1.csv", store.clone())) as Box<dyn Product>,
        Box::new(InMemoryProduct::with_store("part2.csv", store.clone())),
    ];
    let meta = MetaProduct::new(members);
    let runner = TouchRunner::new(store.clone());
    let task = Task::new("split", Box::new(runner), Box::new(meta), Params::new()).unwrap();

    let mut dag = Dag::new("meta");
    dag.add_task(task).unwrap();
    dag.build(&name("split"), false, true).unwrap();

    assert!(store.contains("part1.csv"));
    assert!(store.contains("part2.csv"));
    assert_eq!(dag.task(&name("split")).unwrap().exec_status(), TaskStatus::Executed);

    // losing one member makes the whole task outdated again
    store.remove("part2.csv");
    dag.render(&name("split"), false, true).unwrap();
    assert_eq!(
        dag.task(&name("split")).unwrap().exec_status(),
        TaskStatus::WaitingExecution
    );
}

#[test]
fn finish_sequence_uploads_the_product() {
    let store = ArtifactStore::new();
    let product = InMemoryProduct::with_store("t.out", store.clone());
    let uploads = product.upload_counter();
    let runner = TouchRunner::new(store.clone());
    let task = Task::new("t", Box::new(runner), Box::new(product), Params::new()).unwrap();

    let mut dag = Dag::new("upload");
    dag.add_task(task).unwrap();
    dag.build(&name("t"), false, true).unwrap();

    assert_eq!(uploads.load(Ordering::SeqCst), 1);
}

#[test]
fn status_table_snapshots_the_whole_graph() {
    let store = ArtifactStore::new();
    let mut dag = Dag::new("table");
    dag.add_task(touch_task("a", &store)).unwrap();
    dag.add_task(touch_task("b", &store)).unwrap();
    dag.add_edge(&name("a"), &name("b")).unwrap();
    dag.render_all(false, true).unwrap();
    dag.build(&name("a"), false, true).unwrap();

    let table = dag
        .status_table(&["name", "status", "type", "product", "last_run"])
        .unwrap();

    assert_eq!(table.len(), 2);
    assert_eq!(table[0][0].1, serde_json::json!("a"));
    assert_eq!(table[0][1].1, serde_json::json!("executed"));
    assert_eq!(table[0][2].1, serde_json::json!("touch"));
    assert_eq!(table[0][3].1, serde_json::json!("a.out"));
    assert!(table[0][4].1.is_string());

    assert_eq!(table[1][0].1, serde_json::json!("b"));
    assert_eq!(table[1][1].1, serde_json::json!("waiting_execution"));
    assert!(table[1][4].1.is_null());
}
