use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use quill_core::{AssistIntent, PersistError, SessionConfig, SessionStatus};
use quill_test_utils::{fast_config, png_file, test_document, Harness};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Command::new("quill-sim")
        .version(quill_core::VERSION)
        .about("Drive a Quill editing session against scripted collaborators")
        .subcommand_required(true)
        .subcommand(
            Command::new("simulate")
                .about("Run a scripted session end to end")
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_parser(value_parser!(PathBuf))
                        .help("Session configuration TOML file"),
                )
                .arg(
                    Arg::new("edits")
                        .long("edits")
                        .default_value("5")
                        .value_parser(value_parser!(u32))
                        .help("Number of edits to type"),
                )
                .arg(
                    Arg::new("interval-ms")
                        .long("interval-ms")
                        .default_value("50")
                        .value_parser(value_parser!(u64))
                        .help("Pause between edits"),
                )
                .arg(
                    Arg::new("fail-saves")
                        .long("fail-saves")
                        .default_value("0")
                        .value_parser(value_parser!(u32))
                        .help("Transient failures before saves succeed"),
                )
                .arg(
                    Arg::new("ai")
                        .long("ai")
                        .action(ArgAction::SetTrue)
                        .help("Request an AI improvement after the edits"),
                )
                .arg(
                    Arg::new("upload-bytes")
                        .long("upload-bytes")
                        .value_parser(value_parser!(usize))
                        .help("Upload a PNG of this size"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output status and journal as JSON"),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Print the effective configuration as TOML")
                .arg(
                    Arg::new("file")
                        .long("file")
                        .value_parser(value_parser!(PathBuf))
                        .help("Session configuration TOML file"),
                ),
        );

    let matches = cli.get_matches();

    match matches.subcommand() {
        Some(("simulate", args)) => {
            let config = load_config(args.get_one::<PathBuf>("config"))?;
            simulate(config, args).await
        }
        Some(("config", args)) => {
            let config = load_config(args.get_one::<PathBuf>("file"))?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        _ => Ok(()),
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<SessionConfig> {
    match path {
        Some(path) => SessionConfig::from_toml_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(fast_config()),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn simulate(config: SessionConfig, args: &ArgMatches) -> Result<()> {
    let edits = args.get_one::<u32>("edits").copied().unwrap_or(5);
    let interval = Duration::from_millis(args.get_one::<u64>("interval-ms").copied().unwrap_or(50));
    let fail_saves = args.get_one::<u32>("fail-saves").copied().unwrap_or(0);
    let upload_bytes = args.get_one::<usize>("upload-bytes").copied();
    let json = args.get_flag("json");
    init_tracing(json);

    let harness = Harness::default();
    harness.persistence.fail_next(
        (0..fail_saves).map(|n| PersistError::Transient(format!("scripted failure {}", n + 1))),
    );
    // settle window: every retry plus the debounce, with headroom
    let budget = (0..=config.max_retries)
        .map(|attempt| config.backoff_delay(attempt + 1) + config.operation_timeout())
        .sum::<Duration>()
        + config.debounce() * 2;
    let session = harness
        .session(test_document(""), config)
        .context("opening session")?;

    let mut text = String::new();
    for n in 1..=edits {
        text.push_str(&format!("Sentence {n}. "));
        session.edit(text.clone())?;
        tokio::time::sleep(interval).await;
    }
    if args.get_flag("ai") {
        session.dispatch_assist(AssistIntent::improve(text.clone()))?;
    }
    if let Some(size) = upload_bytes {
        if let Err(error) = session.submit_upload(png_file("sim.png", size)) {
            tracing::warn!(%error, "upload refused");
        }
    }

    let status = match tokio::time::timeout(budget, session.settled()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!(?budget, "session did not settle in time");
            session.status()
        }
    };
    let events = session.events();
    let assists = session.assist_requests();
    let uploads = session.upload_tasks();
    session.close();

    if json {
        let report = serde_json::json!({
            "status": status,
            "content": session.snapshot().content,
            "saves": harness.persistence.save_count(),
            "assists": assists,
            "uploads": uploads,
            "events": events,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&status, harness.persistence.save_count());
        for request in &assists {
            println!("  AI {} ({}): {:?}", request.id, request.kind, request.status);
        }
        for task in &uploads {
            println!("  Upload {} ({}): {:?}", task.id, task.file_name, task.status);
        }
        println!("Journal:");
        for event in &events {
            println!("  #{:<3} r{:<3} {:?}", event.seq, event.revision, event.kind);
        }
    }

    std::process::exit(if status.last_error.is_none() { 0 } else { 1 });
}

fn print_report(status: &SessionStatus, saves: usize) {
    println!("Session {}", status.document_id);
    println!("  Revision: {}", status.revision);
    println!("  Save State: {}", status.save_state);
    println!("  Last Saved Revision: {}", status.last_saved_revision);
    println!("  Save Calls: {saves}");
    match &status.last_error {
        Some(fault) => println!("  Last Error: {:?} ({})", fault.kind, fault.message),
        None => println!("  Last Error: none"),
    }
}
