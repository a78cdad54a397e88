mod client;
mod seed;
mod serve;

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use console::style;
use serde_json::{Map, Value};

use crate::core::config::AppConfig;
use crate::core::terminal::{self, GuideSection, print_error};
use crate::platform::{NativePlatform, Platform};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Server")
        .command("serve", "Start the API, task workers and poller")
        .command("seed <file.json>", "Load executors, capabilities and credentials")
        .print();

    GuideSection::new("Client")
        .command("invoke <capability>", "Run a capability and wait for its outputs")
        .command("enqueue <capability>", "Queue a capability as a background task")
        .command("task <id>", "Show a task, checking its external job if pending")
        .print();

    GuideSection::new("Options")
        .text("--host <host>          Bind address for serve")
        .text("--port <port>          Port for serve")
        .text("--params <json>        Capability parameters, e.g. '{\"prompt\":\"a fox\"}'")
        .text("--image <url>          Input image URL")
        .text("--callback <url>       Completion callback URL")
        .text("--api-url <url>        API to talk to (default: configured host and port)")
        .text("--recheck              With task: revive a failed task whose job still runs")
        .blank()
        .hint("capflow seed demos/catalog.example.json", "")
        .hint("capflow invoke txt2img --params '{\"prompt\":\"a fox\"}'", "")
        .print();

    println!(
        "\n {} {} <command> [options]\n",
        style("Usage:").bold(),
        style("capflow").green()
    );
}

pub(crate) fn parse_api_server_flags(
    args: &[String],
    start: usize,
    mut api_host: String,
    mut api_port: u16,
) -> (String, u16) {
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                if i + 1 < args.len() {
                    api_port = args[i + 1].parse().unwrap_or(api_port);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--host" => {
                if i + 1 < args.len() {
                    api_host = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    (api_host, api_port)
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RequestArgs {
    pub capability: String,
    pub params: Map<String, Value>,
    pub image: Option<String>,
    pub callback_url: Option<String>,
    pub api_url: Option<String>,
}

/// `<capability> [--params JSON] [--image URL] [--callback URL] [--api-url URL]`
pub(crate) fn parse_request_args(args: &[String], start: usize) -> Result<RequestArgs> {
    let mut parsed = RequestArgs {
        capability: String::new(),
        params: Map::new(),
        image: None,
        callback_url: None,
        api_url: None,
    };
    let mut i = start;
    while i < args.len() {
        let value = args.get(i + 1).cloned();
        match (args[i].as_str(), value) {
            ("--params" | "-p", Some(raw)) => {
                parsed.params = match serde_json::from_str::<Value>(&raw) {
                    Ok(Value::Object(map)) => map,
                    Ok(_) => return Err(anyhow!("--params must be a JSON object")),
                    Err(e) => return Err(anyhow!("--params is not valid JSON: {}", e)),
                };
                i += 2;
            }
            ("--image" | "-i", Some(url)) => {
                parsed.image = Some(url);
                i += 2;
            }
            ("--callback", Some(url)) => {
                parsed.callback_url = Some(url);
                i += 2;
            }
            ("--api-url", Some(url)) => {
                parsed.api_url = Some(url);
                i += 2;
            }
            (flag, _) if flag.starts_with('-') => i += 1,
            (positional, _) => {
                if parsed.capability.is_empty() {
                    parsed.capability = positional.to_string();
                }
                i += 1;
            }
        }
    }
    if parsed.capability.is_empty() {
        return Err(anyhow!("a capability id is required"));
    }
    Ok(parsed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TaskArgs {
    pub task_id: String,
    pub recheck: bool,
    pub api_url: Option<String>,
}

pub(crate) fn parse_task_args(args: &[String], start: usize) -> Option<TaskArgs> {
    let mut task_id = None;
    let mut recheck = false;
    let mut api_url = None;
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--recheck" => {
                recheck = true;
                i += 1;
            }
            "--api-url" => {
                if i + 1 < args.len() {
                    api_url = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            id if task_id.is_none() && !id.starts_with("--") => {
                task_id = Some(id.to_string());
                i += 1;
            }
            _ => i += 1,
        }
    }
    task_id.map(|task_id| TaskArgs {
        task_id,
        recheck,
        api_url,
    })
}

fn client_for(config: &AppConfig, api_url: Option<&str>) -> Result<client::ApiClient> {
    let base = match api_url {
        Some(url) => url.to_string(),
        None => format!("http://{}:{}", config.server.host, config.server.port),
    };
    client::ApiClient::new(&base)
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let data_dir = NativePlatform::data_dir();
    let config = AppConfig::load(&data_dir).await?;

    if args.len() <= 1 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "serve" => {
            let (host, port) =
                parse_api_server_flags(&args, 2, config.server.host.clone(), config.server.port);
            serve::run_serve(&data_dir, config, host, port).await
        }
        "seed" => {
            let Some(file) = args.get(2) else {
                print_error("Error: seed needs a catalog file, e.g. 'capflow seed catalog.json'.");
                return Ok(());
            };
            tokio::fs::create_dir_all(&data_dir).await?;
            NativePlatform::restrict_dir_permissions(&data_dir);
            seed::run_seed(&data_dir, &PathBuf::from(file)).await
        }
        "invoke" | "enqueue" => {
            let parsed = match parse_request_args(&args, 2) {
                Ok(parsed) => parsed,
                Err(e) => {
                    print_error(&format!("Error: {}", e));
                    print_help();
                    return Ok(());
                }
            };
            let client = client_for(&config, parsed.api_url.as_deref())?;
            if args[1] == "invoke" {
                client::run_invoke(&client, &parsed).await
            } else {
                client::run_enqueue(&client, &parsed).await
            }
        }
        "task" => {
            let Some(parsed) = parse_task_args(&args, 2) else {
                print_error("Error: task needs a task id.");
                return Ok(());
            };
            let client = client_for(&config, parsed.api_url.as_deref())?;
            client::run_task(&client, &parsed.task_id, parsed.recheck).await
        }
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        cmd => {
            print_error(&format!("Unknown command: {}", cmd));
            print_help();
            Ok(())
        }
    }
}
