mod common;

use std::sync::{Arc, Barrier};
use std::time::Duration;

use vinfer_core::io::CollectingSink;
use vinfer_pipeline::{InferenceStage, ModelConfig, Role, StageConfig, StageKind};

use common::{ManualFactory, frame, registry};

#[test]
fn concurrent_acquire_loads_the_model_once() {
    let factory = ManualFactory::with_load_delay(4, Duration::from_millis(30));
    let registry = registry(&factory);
    let elements: Vec<String> = (0..8).map(|i| format!("element-{i}")).collect();
    for (i, element) in elements.iter().enumerate() {
        let config = (i == 0).then(|| ModelConfig::new("models/shared.xml"));
        registry
            .register(element, "shared", config)
            .expect("register");
    }

    let barrier = Arc::new(Barrier::new(elements.len()));
    let handles: Vec<_> = elements
        .iter()
        .cloned()
        .map(|element| {
            let registry = registry.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                registry.acquire(&element, "shared").expect("acquire")
            })
        })
        .collect();
    let instances: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("acquire thread"))
        .collect();

    assert_eq!(factory.loads(), 1);
    assert!(instances.iter().all(|m| Arc::ptr_eq(m, &instances[0])));
    assert!(registry.uninitialized("shared").is_empty());
}

#[test]
fn releasing_the_last_reference_unloads() {
    let factory = ManualFactory::new(4);
    let registry = registry(&factory);
    registry
        .register("a", "cam1", Some(ModelConfig::new("models/p.xml")))
        .expect("a");
    registry.register("b", "cam1", None).expect("b");
    let model = registry.acquire("a", "cam1").expect("load");

    registry.release("a", "cam1").expect("release a");
    assert!(registry.is_loaded("cam1"), "b still holds a reference");
    assert_eq!(registry.master("cam1"), None, "master has left");
    let again = registry.acquire("b", "cam1").expect("still usable");
    assert!(Arc::ptr_eq(&model, &again));

    registry.release("b", "cam1").expect("release b");
    assert!(!registry.is_loaded("cam1"));
    assert_eq!(registry.refcount("cam1"), 0);

    let err = registry.release("b", "cam1").expect_err("already released");
    assert_eq!(err.error_code(), 104);
}

#[test]
fn stages_sharing_an_instance_unload_after_the_last_shutdown() {
    let factory = ManualFactory::new(4);
    let registry = registry(&factory);
    let mut master = StageConfig::new(StageKind::Detect, "detect0", "cam1");
    master.model = Some(ModelConfig::new("models/p.xml"));
    let first = InferenceStage::new(master, registry.clone(), Arc::new(CollectingSink::new()))
        .expect("master");
    let second = InferenceStage::new(
        StageConfig::new(StageKind::Detect, "detect1", "cam1"),
        registry.clone(),
        Arc::new(CollectingSink::new()),
    )
    .expect("slave");

    first.submit(frame(0)).expect("submit");
    second.submit(frame(0)).expect("submit");
    factory.engine("cam1").complete_reversed();

    first.shutdown().expect("first shutdown");
    assert!(registry.is_loaded("cam1"));
    second.submit(frame(1)).expect("instance still usable");
    factory.engine("cam1").complete(0);

    second.shutdown().expect("second shutdown");
    assert!(!registry.is_loaded("cam1"));
    second.shutdown().expect("idempotent");
    assert_eq!(factory.loads(), 1);
}

#[test]
fn reload_waits_until_the_previous_instance_has_shut_down() {
    let factory = ManualFactory::new(4);
    let registry = registry(&factory);
    registry
        .register("a", "cam1", Some(ModelConfig::new("models/p.xml")))
        .expect("a");
    registry.acquire("a", "cam1").expect("load");

    factory.shutdown_gate().close();
    let releasing = {
        let registry = registry.clone();
        std::thread::spawn(move || registry.release("a", "cam1"))
    };
    factory.shutdown_gate().wait_for_shutdown();
    assert!(!registry.is_loaded("cam1"));

    let role = registry
        .register("b", "cam1", Some(ModelConfig::new("models/q.xml")))
        .expect("b");
    assert_eq!(role, Role::Master, "fresh entry takes the new configuration");
    let acquiring = {
        let registry = registry.clone();
        std::thread::spawn(move || registry.acquire("b", "cam1"))
    };
    std::thread::sleep(Duration::from_millis(50));
    assert!(!acquiring.is_finished(), "acquire waits for the unload");
    assert_eq!(factory.loads(), 1);

    factory.shutdown_gate().open();
    releasing.join().expect("release thread").expect("release");
    let model = acquiring
        .join()
        .expect("acquire thread")
        .expect("reload after unload");
    assert_eq!(model.name, "q");
    assert_eq!(factory.loads(), 2);
    assert_eq!(factory.peak_live(), 1, "never two live instances for cam1");
    assert_eq!(registry.master("cam1").as_deref(), Some("b"));
}
