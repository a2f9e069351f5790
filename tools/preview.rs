/// Preview: runs a script headless against a canned language model.
///
/// Usage: preview <script_dir> [--config <session.ron>] [--start <scene>]
///                [--simulation] [--seed <n>] [--run <max_ticks>]
///
/// Without `--run` an interactive shell is started:
///   tick [n]                 advance the clock one frame (or n frames)
///   say <text>               chat as the primary user
///   send <transition>        take a manual transition
///   advance                  force every character forward
///   override <name> <key>    trigger an override bucket on a character
///   status                   print the status snapshot
///   transcript               print the transcript so far
///   help                     list commands
///   quit                     exit
use scene_engine::core::capability::{CapabilityError, LanguageModel};
use scene_engine::core::compiler::{compile, ScriptSource};
use scene_engine::core::config::SessionConfig;
use scene_engine::core::inbox::{EventAction, InboundMessage};
use scene_engine::core::scene::SceneGraph;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

const CANNED_REPLIES: &[&str] = &[
    "I see. Please, go on.",
    "That is very interesting. How does that make you feel?",
    "Let us take a moment with that.",
    "Thank you for telling me.",
];

/// Cycles through fixed replies, whatever the prompt.
#[derive(Default)]
struct CannedModel {
    next: AtomicUsize,
}

impl LanguageModel for CannedModel {
    fn complete(&self, _llm_name: &str, _prompt: &str) -> Result<String, CapabilityError> {
        let i = self.next.fetch_add(1, Ordering::Relaxed);
        Ok(CANNED_REPLIES[i % CANNED_REPLIES.len()].to_string())
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage();
        return;
    }

    let script_dir = &args[1];
    let mut config_path = None;
    let mut start_scene = None;
    let mut simulation = false;
    let mut seed = None;
    let mut run_ticks = None;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--config" if i + 1 < args.len() => {
                i += 1;
                config_path = Some(args[i].clone());
            }
            "--start" if i + 1 < args.len() => {
                i += 1;
                start_scene = Some(args[i].clone());
            }
            "--simulation" => simulation = true,
            "--seed" if i + 1 < args.len() => {
                i += 1;
                seed = Some(args[i].parse().unwrap_or(42));
            }
            "--run" if i + 1 < args.len() => {
                i += 1;
                run_ticks = Some(args[i].parse().unwrap_or(1000));
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let mut config = match config_path {
        Some(ref path) => match SessionConfig::load(Path::new(path)) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("ERROR: {}", e);
                std::process::exit(1);
            }
        },
        None => SessionConfig::default(),
    };
    if start_scene.is_some() {
        config.start_scene = start_scene;
    }
    config.simulation |= simulation;
    if seed.is_some() {
        config.seed = seed;
    }

    let script = match ScriptSource::load_dir(Path::new(script_dir))
        .and_then(|source| compile(&source, &config.compile_options()))
    {
        Ok(script) => Arc::new(script),
        Err(e) => {
            eprintln!("ERROR: {}", e);
            std::process::exit(1);
        }
    };

    let mut graph = match SceneGraph::builder(script, config)
        .language_model(Arc::new(CannedModel::default()))
        .build()
    {
        Ok(graph) => graph,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            std::process::exit(1);
        }
    };

    let mut clock = Clock::new();
    match run_ticks {
        Some(max_ticks) => run(&mut graph, &mut clock, max_ticks),
        None => shell(&mut graph, &mut clock),
    }
}

/// Simulated time, one frame interval per tick.
struct Clock {
    now: Instant,
    frames: u64,
}

impl Clock {
    fn new() -> Self {
        Self {
            now: Instant::now(),
            frames: 0,
        }
    }

    fn tick(&mut self, graph: &mut SceneGraph) {
        self.now += graph.config().frame_interval();
        self.frames += 1;
        match graph.tick_at(self.now) {
            Ok(Some(report)) => println!(
                "[frame {}] {} -> {} ({})",
                self.frames, report.from, report.to, report.trigger
            ),
            Ok(None) => {}
            Err(e) => println!("[frame {}] error: {}", self.frames, e),
        }
    }
}

fn run(graph: &mut SceneGraph, clock: &mut Clock, max_ticks: u64) {
    while !graph.is_finished() && clock.frames < max_ticks {
        clock.tick(graph);
    }
    print_transcript(graph);
    if graph.is_finished() {
        println!("\nReached final scene '{}' after {} frames", graph.scene(), clock.frames);
    } else {
        println!("\nStopped in scene '{}' after {} frames", graph.scene(), clock.frames);
        std::process::exit(2);
    }
}

fn shell(graph: &mut SceneGraph, clock: &mut Clock) {
    println!("Scene: {}", graph.scene());
    println!("Type 'help' for commands.\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let user = graph.config().primary_user().to_string();

    loop {
        print!("preview> ");
        stdout.flush().ok();

        let mut line = String::new();
        if stdin.lock().read_line(&mut line).is_err() || line.is_empty() {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();

        match cmd.to_lowercase().as_str() {
            "quit" | "exit" | "q" => {
                println!("Goodbye.");
                break;
            }
            "help" | "h" | "?" => print_help(),
            "tick" | "t" => {
                let n: u64 = rest.parse().unwrap_or(1);
                for _ in 0..n {
                    clock.tick(graph);
                }
                println!("Scene: {}", graph.scene());
            }
            "say" => {
                if rest.is_empty() {
                    println!("Usage: say <text>");
                    continue;
                }
                graph.inbox().push(InboundMessage::chat(&user, rest));
                clock.tick(graph);
            }
            "send" => match graph.send(rest) {
                Ok(report) => println!("{} -> {}", report.from, report.to),
                Err(e) => println!("Rejected: {}", e),
            },
            "advance" => {
                graph
                    .inbox()
                    .push(InboundMessage::Event(EventAction::ForceAdvance));
                clock.tick(graph);
            }
            "override" => {
                let Some((name, bucket)) = rest.rsplit_once(' ') else {
                    println!("Usage: override <name> <key>");
                    continue;
                };
                graph.inbox().push(InboundMessage::Event(EventAction::Override {
                    name: name.trim().to_string(),
                    bucket: bucket.to_string(),
                }));
                clock.tick(graph);
            }
            "status" => match graph.status().to_json() {
                Ok(json) => println!("{}", json),
                Err(e) => println!("Status unavailable: {}", e),
            },
            "transcript" => print_transcript(graph),
            _ => println!("Unknown command '{}'. Type 'help' for commands.", cmd),
        }

        if graph.is_finished() {
            println!("Reached final scene '{}'.", graph.scene());
        }
    }
}

fn print_transcript(graph: &SceneGraph) {
    println!("{}", graph.transcript().render(None));
}

fn print_usage() {
    println!("Usage: preview <script_dir> [--config <session.ron>] [--start <scene>]");
    println!("               [--simulation] [--seed <n>] [--run <max_ticks>]");
}

fn print_help() {
    println!("Commands:");
    println!("  tick [n]                advance the clock one frame (or n frames)");
    println!("  say <text>              chat as the primary user");
    println!("  send <transition>       take a manual transition");
    println!("  advance                 force every character forward");
    println!("  override <name> <key>   trigger an override bucket on a character");
    println!("  status                  print the status snapshot");
    println!("  transcript              print the transcript so far");
    println!("  help                    list commands");
    println!("  quit                    exit");
}
