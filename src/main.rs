use std::env;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "Usage: tollgate serve --config <path>\n       tollgate verify-audit --path <audit.jsonl> [--mirror <path>]";

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn flag(args: &[String], name: &str) -> Option<String> {
    args.iter()
        .position(|a| a == name)
        .and_then(|idx| args.get(idx + 1))
        .cloned()
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().cloned().unwrap_or_default();
    init_tracing();

    match cmd.as_str() {
        "serve" => {
            let config_path = flag(&args, "--config")
                .unwrap_or_else(|| String::from("./config/example-config.yaml"));
            let cfg = match tollgate_config::load_and_validate(&config_path) {
                Ok(v) => v,
                Err(e) => {
                    error!(path = %config_path, "failed to load config: {e}");
                    std::process::exit(1);
                }
            };
            info!(path = %config_path, "config loaded");
            if let Err(e) = tollgate_server::serve(cfg).await {
                error!("server exited with error: {e}");
                std::process::exit(1);
            }
        }
        "verify-audit" => {
            let Some(path) = flag(&args, "--path") else {
                eprintln!("{USAGE}");
                std::process::exit(2);
            };
            let mirror = flag(&args, "--mirror");
            match tollgate_server::verify_audit_chain_with_mirror(&path, mirror.as_deref()) {
                Ok(summary) => println!("{summary}"),
                Err(e) => {
                    error!(path = %path, "audit verification failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }
}
