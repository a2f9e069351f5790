/// Compiler integration tests: loading the clinic fixture script from disk
/// and checking the generated transition table.
use scene_engine::core::compiler::{
    compile, CompileOptions, LoadError, ScriptDefinition, ScriptSource, FAULT_SCENE, PREROLL_SCENE,
};
use scene_engine::core::guard::Guard;
use scene_engine::core::transition::{TransitionKind, MANUAL_FAULT};
use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};

fn fixture() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/clinic")
}

fn source() -> ScriptSource {
    ScriptSource::load_dir(&fixture()).unwrap()
}

fn reachable_from(script: &ScriptDefinition, start: &str) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from([start.to_string()]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        for transition in script.transitions.from_scene(&id) {
            queue.push_back(transition.target.clone());
        }
    }
    seen
}

#[test]
fn loads_fixture_directory() {
    let source = source();
    assert_eq!(source.name, "clinic");
    assert_eq!(source.scenes.len(), 6);
    assert_eq!(source.behaviors.len(), 5);
    assert_eq!(source.personas.len(), 2);
    assert!(source.few_shots.contains_key("stanley"));
    assert!(source.default_overrides.is_some());
    // placeholder files are keyed by token and trimmed
    assert_eq!(
        source.placeholders.get("_CLINIC_NAME").map(String::as_str),
        Some("Sunny Vale Clinic")
    );
}

#[test]
fn every_scene_is_reachable_from_the_initial_scene() {
    let script = compile(&source(), &CompileOptions::default()).unwrap();
    assert_eq!(script.initial_scene, PREROLL_SCENE);
    assert!(script.scenes.contains_key(FAULT_SCENE));

    let reachable = reachable_from(&script, &script.initial_scene);
    let all: BTreeSet<String> = script.scenes.keys().cloned().collect();
    assert_eq!(reachable, all);
}

#[test]
fn non_final_scenes_get_fault_and_tick_edges() {
    let script = compile(&source(), &CompileOptions::default()).unwrap();
    for (id, scene) in &script.scenes {
        let names: Vec<_> = script.transitions.from_scene(id).collect();
        if scene.is_final() {
            assert!(names.is_empty(), "final scene {id} has transitions");
            continue;
        }
        assert!(names
            .iter()
            .any(|t| t.kind == TransitionKind::Tick && t.target == *id));
        let has_fault = script.transitions.manual_from(id, MANUAL_FAULT).is_some();
        assert_eq!(has_fault, id != FAULT_SCENE, "fault edge on {id}");
    }
}

#[test]
fn exits_share_manual_names() {
    let script = compile(&source(), &CompileOptions::default()).unwrap();
    assert_eq!(
        script.transitions.manual_names_from("s_interview"),
        vec!["manual_s_farewell", MANUAL_FAULT]
    );

    let automatic: Vec<_> = script.transitions.automatic_from("s_interview").collect();
    assert_eq!(automatic.len(), 2);
    assert_eq!(
        automatic[0].guard,
        Some(Guard::All(vec![Guard::UserSpokeLast, Guard::Elapsed(600.0)]))
    );
    assert_eq!(automatic[1].guard, Some(Guard::ManualOnly));
}

#[test]
fn simulation_completes_unconditioned_exits() {
    let options = CompileOptions {
        simulation: true,
        ..Default::default()
    };
    let script = compile(&source(), &options).unwrap();
    let automatic: Vec<_> = script.transitions.automatic_from("s_interview").collect();
    assert_eq!(automatic[1].guard, Some(Guard::Complete));
    // explicit conditions are left alone
    let preroll: Vec<_> = script.transitions.automatic_from(PREROLL_SCENE).collect();
    assert_eq!(preroll[0].guard, Some(Guard::Elapsed(1.0)));
}

#[test]
fn pruning_keeps_reachable_scenes_and_rewires_preroll() {
    let options = CompileOptions {
        start_scene: Some("s_interview".to_string()),
        ..Default::default()
    };
    let script = compile(&source(), &options).unwrap();

    let ids: Vec<_> = script.scenes.keys().map(String::as_str).collect();
    assert_eq!(
        ids,
        vec!["s_PREROLL_init", "s_end", "s_farewell", "s_interview", "s_unknown_fault"]
    );
    assert_eq!(script.initial_scene, PREROLL_SCENE);

    let preroll: Vec<_> = script.transitions.automatic_from(PREROLL_SCENE).collect();
    assert_eq!(preroll.len(), 1);
    assert_eq!(preroll[0].target, "s_interview");
    assert_eq!(preroll[0].guard, Some(Guard::Elapsed(1.0)));

    // the fault exit into the pruned welcome scene is gone
    assert_eq!(
        script.transitions.manual_names_from(FAULT_SCENE),
        vec!["manual_s_PREROLL_init"]
    );
    let reachable = reachable_from(&script, PREROLL_SCENE);
    assert_eq!(reachable.len(), script.scenes.len());
}

#[test]
fn unknown_start_scene_is_fatal() {
    let options = CompileOptions {
        start_scene: Some("s_lobby".to_string()),
        ..Default::default()
    };
    assert!(matches!(
        compile(&source(), &options),
        Err(LoadError::UnknownStartScene(name)) if name == "s_lobby"
    ));
}

#[test]
fn dangling_exit_target_is_fatal() {
    let mut source = source();
    source.scenes.push((
        "05_s_broken".to_string(),
        r#"(exits: [(target: "s_nowhere")])"#.to_string(),
    ));
    match compile(&source, &CompileOptions::default()) {
        Err(LoadError::Dangling { scene, kind, name }) => {
            assert_eq!(scene, "s_broken");
            assert_eq!(kind, "exit target");
            assert_eq!(name, "s_nowhere");
        }
        other => panic!("expected a dangling reference, got {other:?}"),
    }
}

#[test]
fn dangling_persona_is_fatal() {
    let mut source = source();
    source.personas.remove("nurse");
    assert!(matches!(
        compile(&source, &CompileOptions::default()),
        Err(LoadError::Dangling { kind: "persona", .. })
    ));
}

#[test]
fn missing_fault_scene_is_fatal() {
    let mut source = source();
    source.scenes.retain(|(stem, _)| !stem.ends_with(FAULT_SCENE));
    assert!(matches!(
        compile(&source, &CompileOptions::default()),
        Err(LoadError::MissingScene(name)) if name == FAULT_SCENE
    ));
}

#[test]
fn invalid_attribute_is_fatal() {
    let mut source = source();
    source.behaviors.push((
        "moody".to_string(),
        r#"(init: [(speak: "Hm.", emotion: "bliss")])"#.to_string(),
    ));
    assert!(matches!(
        compile(&source, &CompileOptions::default()),
        Err(LoadError::Event { document, .. }) if document == "moody"
    ));
}

#[test]
fn compilation_is_deterministic() {
    let options = CompileOptions::default();
    let first = compile(&source(), &options).unwrap();
    let second = compile(&source(), &options).unwrap();
    assert_eq!(first, second);
    let first: Vec<_> = first.transitions.iter().collect();
    let second: Vec<_> = second.transitions.iter().collect();
    assert_eq!(first, second);
}

#[test]
fn directory_without_scenes_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("behaviors")).unwrap();
    assert!(matches!(
        ScriptSource::load_dir(dir.path()),
        Err(LoadError::NoScenes(_))
    ));
}

#[test]
fn copied_script_loads_the_same() {
    let dir = tempfile::tempdir().unwrap();
    copy_dir(&fixture(), dir.path());
    let copied = ScriptSource::load_dir(dir.path()).unwrap();
    let options = CompileOptions::default();
    let original = compile(&source(), &options).unwrap();
    let copied = compile(&copied, &options).unwrap();
    assert_eq!(original.scenes, copied.scenes);
    assert_eq!(original.transitions, copied.transitions);
}

fn copy_dir(from: &Path, to: &Path) {
    for entry in std::fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        let target = to.join(entry.file_name());
        if entry.path().is_dir() {
            std::fs::create_dir_all(&target).unwrap();
            copy_dir(&entry.path(), &target);
        } else {
            std::fs::copy(entry.path(), target).unwrap();
        }
    }
}
