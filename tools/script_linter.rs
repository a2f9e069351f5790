/// Script Linter: compiles a script directory and reports its scene graph.
///
/// Usage: script_linter <script_dir> [--start <scene>] [--simulation]
use scene_engine::core::compiler::{compile, CompileOptions, ScriptDefinition, ScriptSource};
use scene_engine::core::transition::TransitionKind;
use std::collections::BTreeSet;
use std::path::Path;
use std::process;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        println!("Usage: script_linter <script_dir> [--start <scene>] [--simulation]");
        process::exit(0);
    }

    let script_dir = &args[1];
    let mut options = CompileOptions::default();

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--start" if i + 1 < args.len() => {
                i += 1;
                options.start_scene = Some(args[i].clone());
            }
            "--simulation" => options.simulation = true,
            other => {
                eprintln!("Unknown argument: {}", other);
                process::exit(1);
            }
        }
        i += 1;
    }

    let source = match ScriptSource::load_dir(Path::new(script_dir)) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("ERROR: Failed to read script: {}", e);
            process::exit(1);
        }
    };

    let script = match compile(&source, &options) {
        Ok(script) => script,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            process::exit(1);
        }
    };

    print_graph(&script);

    let warnings = lint_script(&script);
    println!("\n=== Script Lint Report ===\n");
    if warnings.is_empty() {
        println!("All checks passed!");
    }
    for warning in &warnings {
        println!("WARNING: {}", warning);
    }
    println!("\nSummary: 0 errors, {} warnings", warnings.len());
}

fn print_graph(script: &ScriptDefinition) {
    println!(
        "Script '{}': {} scenes, {} behaviors, {} transitions",
        script.name,
        script.scenes.len(),
        script.behaviors.len(),
        script.transitions.len()
    );
    println!("Initial scene: {}\n", script.initial_scene);

    for (id, scene) in &script.scenes {
        let mut flags = Vec::new();
        if scene.is_initial() {
            flags.push("initial");
        }
        if scene.is_final() {
            flags.push("final");
        }
        if scene.document.force_mute {
            flags.push("mute");
        }
        if flags.is_empty() {
            println!("{}", id);
        } else {
            println!("{} [{}]", id, flags.join(", "));
        }
        for character in scene.characters() {
            println!(
                "    {} ({}) -> {}",
                character.display_name, character.persona_name, character.behavior
            );
        }
        for transition in script.transitions.from_scene(id) {
            match (transition.kind, &transition.guard) {
                (TransitionKind::Tick, _) => {}
                (_, Some(guard)) => println!(
                    "    {} -> {} when {}",
                    transition.name, transition.target, guard
                ),
                (_, None) => println!("    {} -> {}", transition.name, transition.target),
            }
        }
    }
}

fn lint_script(script: &ScriptDefinition) -> Vec<String> {
    let mut warnings = Vec::new();

    let used_behaviors: BTreeSet<&str> = script
        .scenes
        .values()
        .flat_map(|scene| scene.characters())
        .map(|character| character.behavior.as_str())
        .collect();
    for name in script.behaviors.keys() {
        if !used_behaviors.contains(name.as_str()) {
            warnings.push(format!("Behavior '{}' is not used by any scene", name));
        }
    }

    let used_personas: BTreeSet<&str> = script
        .scenes
        .values()
        .flat_map(|scene| scene.characters())
        .map(|character| character.persona_name.as_str())
        .collect();
    for name in script.personas.keys() {
        if !used_personas.contains(name.as_str()) {
            warnings.push(format!("Persona '{}' is not used by any scene", name));
        }
    }

    for (id, scene) in &script.scenes {
        if scene.is_final() {
            continue;
        }
        if scene.document.exits.is_empty() {
            warnings.push(format!(
                "Scene '{}' can only be left through the fault scene",
                id
            ));
        }
        for character in scene.characters() {
            let Some(behavior) = script.behavior(&character.behavior) else {
                continue;
            };
            if behavior.init.is_none() && behavior.dynamic.is_none() && behavior.end.is_none() {
                warnings.push(format!(
                    "Character '{}' in scene '{}' never speaks",
                    character.display_name, id
                ));
            }
        }
    }

    warnings
}
