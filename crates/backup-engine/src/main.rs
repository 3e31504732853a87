//! # backup-engine
//!

use std::{fs, path::PathBuf, thread};

use backup_engine::{
    Config, Engine,
    audit::AuditFilter,
    queue::{JobId, JobState},
    snapshot::RestoreOptions,
    storage::ArtifactFilter,
};
use mimalloc::MiMalloc;
use shared::{ArtifactKind, Failure, init_logger};
use tracing::{Level, error, info};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map_or("run", String::as_str);

    // Initialize config if args include 'init'.
    if command == "init" {
        let config = Config::default();
        let contents =
            toml::to_string_pretty(&config).or_log_and_panic("Could not serialize config file");
        fs::write("config.toml", contents).or_log_and_panic("Could not create config file");
        return;
    }

    // Load config
    let config =
        Config::load_toml(PathBuf::from("./config.toml")).or_log_and_panic("Could not load config");

    let level = config.log_level.parse().unwrap_or(Level::INFO);
    let _logger = init_logger(&config.log_directory, level).or_log_and_panic("Could not create logger");

    let engine = Engine::new(config).or_log_and_panic("Could not create engine");

    match command {
        "run" => {
            engine.start().or_log_and_panic("Could not start engine");
            info!("Running, waiting for jobs");
            loop {
                thread::park();
            }
        }

        "backup" => {
            let target = args
                .get(1)
                .ok_or("missing <target>")
                .or_log_and_panic("Usage: backup <target>");
            engine.start().or_log_and_panic("Could not start engine");
            let id = engine
                .enqueue(target, ArtifactKind::Manual)
                .or_log_and_panic("Could not enqueue backup");
            report(&engine, id);
        }

        "restore" => {
            let artifact = args
                .get(1)
                .ok_or("missing <artifact>")
                .or_log_and_panic("Usage: restore <artifact> [--start]");
            let options = RestoreOptions {
                start: args.iter().any(|arg| arg == "--start"),
                ..Default::default()
            };
            engine.start().or_log_and_panic("Could not start engine");
            let id = engine
                .restore(artifact, options)
                .or_log_and_panic("Could not enqueue restore");
            report(&engine, id);
        }

        "list" => {
            let artifacts = engine
                .list_artifacts(&ArtifactFilter::default())
                .or_log_and_panic("Could not list artifacts");

            for artifact in artifacts {
                let kind = artifact.kind.map_or("unknown", |kind| kind.as_str());
                let server = artifact.server_id.as_deref().unwrap_or("unknown");
                println!(
                    "{}\t{}\t{kind}\t{server}\t{} bytes",
                    artifact.name, artifact.created_at, artifact.size
                );
            }
        }

        "audit" => {
            let filter = AuditFilter {
                limit: Some(50),
                ..Default::default()
            };
            let entries = engine.audit_log(&filter).or_log_and_panic("Could not read audit log");

            for entry in entries {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    entry.timestamp,
                    entry.operation,
                    entry.target,
                    entry.status.as_str(),
                    entry.detail
                );
            }
        }

        other => error!("Unknown command '{other}', expected init, run, backup, restore, list or audit"),
    }

    engine.shutdown();
}

/// Wait for a job and print how it ended.
fn report(engine: &Engine, id: JobId) {
    match engine.wait(id) {
        Some(progress) if progress.state == JobState::Complete => {
            println!("{}: {}", progress.state, progress.detail);
        }
        Some(progress) => {
            error!("Job {id} failed: {}", progress.detail);
            println!("{}: {}", progress.state, progress.detail);
        }
        None => error!("Job {id} was lost"),
    }
}
