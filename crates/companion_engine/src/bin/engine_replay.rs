use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use companion_engine::executor::ModuleMemoryBridge;
use companion_engine::store::{FileStoryStore, FileVisionStore};
use companion_engine::{init_tracing, EngineSessionManager, HostConfig};
use serde::Deserialize;
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, PartialEq)]
struct CliOptions {
    config_file: Option<PathBuf>,
    session_id: String,
    character_id: String,
    card_file: Option<PathBuf>,
    engine_config_file: Option<PathBuf>,
    events_file: Option<PathBuf>,
}

impl Default for CliOptions {
    fn default() -> Self {
        Self {
            config_file: None,
            session_id: "replay".to_string(),
            character_id: "companion".to_string(),
            card_file: None,
            engine_config_file: None,
            events_file: None,
        }
    }
}

/// One line of a replay file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ReplayStep {
    WorldDiff {
        #[serde(default)]
        data: JsonValue,
    },
    PlayerMessage {
        #[serde(default)]
        player_id: String,
        text: String,
    },
    Tick {
        elapsed_ms: u64,
    },
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    let options = match parse_options(args.iter().skip(1).map(|arg| arg.as_str())) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("{err}");
            print_help();
            process::exit(1);
        }
    };

    let config = match &options.config_file {
        Some(path) => HostConfig::from_config_file(path),
        None => HostConfig::from_default_sources(),
    };
    let config = match config {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load host config: {err}");
            process::exit(1);
        }
    };
    if let Err(err) = init_tracing(&config.log_level, config.log_file.as_deref()) {
        eprintln!("failed to install logging: {err}");
        process::exit(1);
    }

    let steps = match options.events_file.as_deref().map(read_steps).transpose() {
        Ok(steps) => steps.unwrap_or_default(),
        Err(err) => {
            eprintln!("{err}");
            process::exit(1);
        }
    };
    let card = read_json_or_empty(options.card_file.as_deref()).unwrap_or_else(|err| {
        eprintln!("{err}");
        process::exit(1);
    });
    let engine_config = read_json_or_empty(options.engine_config_file.as_deref())
        .unwrap_or_else(|err| {
            eprintln!("{err}");
            process::exit(1);
        });

    let bridge = match ModuleMemoryBridge::load(config.bridge_config()) {
        Ok(bridge) => bridge,
        Err(err) => {
            eprintln!("failed to load engine module: {err}");
            process::exit(1);
        }
    };
    let manager = EngineSessionManager::new(
        Arc::new(bridge),
        Arc::new(FileVisionStore::new(&config.data_dir)),
        Arc::new(FileStoryStore::new(&config.data_dir)),
    )
    .with_history_limit(config.history_limit);

    let session = match manager
        .get_or_create(
            &options.session_id,
            &options.character_id,
            &card,
            &engine_config,
        )
        .await
    {
        Ok(session) => session,
        Err(err) => {
            eprintln!("failed to start session {}: {err}", options.session_id);
            process::exit(1);
        }
    };
    let ready_events = session.lock().await.ready_events().to_vec();
    for event in ready_events {
        println!("{}", event.into_value());
    }

    let mut failed = false;
    for (index, step) in steps.into_iter().enumerate() {
        let outputs = match step {
            ReplayStep::WorldDiff { data } => {
                match manager.on_world_diff(&options.session_id, &data).await {
                    Ok(outputs) => outputs,
                    Err(err) => {
                        eprintln!("step {}: world diff failed: {err}", index + 1);
                        failed = true;
                        break;
                    }
                }
            }
            ReplayStep::PlayerMessage { player_id, text } => {
                manager
                    .on_player_message(&options.session_id, &player_id, &text)
                    .await
            }
            ReplayStep::Tick { elapsed_ms } => {
                manager.on_tick(&options.session_id, elapsed_ms).await
            }
        };
        for output in outputs {
            println!("{}", output.into_value());
        }
    }

    let idle = manager.cleanup_idle(config.idle_timeout).await;
    if idle > 0 {
        eprintln!("closed {idle} idle sessions");
    }
    manager.close_all().await;
    if failed {
        process::exit(1);
    }
}

fn read_steps(path: &Path) -> Result<Vec<ReplayStep>, String> {
    let content = fs::read_to_string(path)
        .map_err(|err| format!("read events file failed ({}): {err}", path.display()))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line).map_err(|err| {
                format!("parse events file failed ({}:{}): {err}", path.display(), index + 1)
            })
        })
        .collect()
}

fn read_json_or_empty(path: Option<&Path>) -> Result<JsonValue, String> {
    let Some(path) = path else {
        return Ok(JsonValue::Object(Default::default()));
    };
    let content = fs::read_to_string(path)
        .map_err(|err| format!("read json file failed ({}): {err}", path.display()))?;
    serde_json::from_str(&content)
        .map_err(|err| format!("parse json file failed ({}): {err}", path.display()))
}

fn parse_options<'a>(args: impl Iterator<Item = &'a str>) -> Result<CliOptions, String> {
    let mut options = CliOptions::default();

    let mut iter = args.peekable();
    while let Some(arg) = iter.next() {
        match arg {
            "--help" | "-h" => {
                print_help();
                process::exit(0);
            }
            "--config" => {
                options.config_file = Some(PathBuf::from(
                    iter.next()
                        .ok_or_else(|| "--config requires a file path".to_string())?,
                ));
            }
            "--session" => {
                options.session_id = non_empty_value(iter.next(), "--session requires a session id")?;
            }
            "--character" => {
                options.character_id =
                    non_empty_value(iter.next(), "--character requires a character id")?;
            }
            "--card" => {
                options.card_file = Some(PathBuf::from(
                    iter.next()
                        .ok_or_else(|| "--card requires a file path".to_string())?,
                ));
            }
            "--engine-config" => {
                options.engine_config_file = Some(PathBuf::from(
                    iter.next()
                        .ok_or_else(|| "--engine-config requires a file path".to_string())?,
                ));
            }
            _ => {
                if arg.starts_with("--") || options.events_file.is_some() {
                    return Err(format!("unexpected argument: {arg}"));
                }
                options.events_file = Some(PathBuf::from(arg));
            }
        }
    }

    Ok(options)
}

fn non_empty_value(value: Option<&str>, message: &str) -> Result<String, String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| message.to_string())
}

fn print_help() {
    println!("Usage: engine_replay [events.jsonl] [options]");
    println!("Options:");
    println!("  --config <path>         Host config TOML (default: ./config.toml, then env)");
    println!("  --session <id>          Session id (default: replay)");
    println!("  --character <id>        Character id (default: companion)");
    println!("  --card <path>           Character card JSON");
    println!("  --engine-config <path>  Engine config JSON");
    println!("Event lines: {{\"type\":\"world_diff\",\"data\":{{..}}}}, {{\"type\":\"player_message\",\"player_id\":..,\"text\":..}}, {{\"type\":\"tick\",\"elapsed_ms\":N}}");
}
