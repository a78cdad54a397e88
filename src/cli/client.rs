use std::time::Duration;

use anyhow::{Result, anyhow};
use console::style;
use reqwest::Client;
use serde_json::{Value, json};

use super::RequestArgs;
use crate::core::terminal::{GuideSection, print_error, print_info};

/// Thin client for a running `capflow serve`.
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value> {
        let res = request.send().await.map_err(|e| {
            anyhow!(
                "capflow API unreachable at {} ({}). Is 'capflow serve' running?",
                self.base_url,
                e
            )
        })?;
        let body: Value = res.json().await.unwrap_or(Value::Null);
        if body["success"] == false {
            return Err(anyhow!(
                "{} ({})",
                body["error"].as_str().unwrap_or("request failed"),
                body["kind"].as_str().unwrap_or("error")
            ));
        }
        Ok(body)
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.send(self.client.post(format!("{}{}", self.base_url, path)).json(body))
            .await
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        self.send(self.client.get(format!("{}{}", self.base_url, path)))
            .await
    }
}

pub(crate) fn request_body(args: &RequestArgs) -> Value {
    let mut body = json!({
        "capabilityId": args.capability,
        "params": args.params,
    });
    if let Some(image) = &args.image {
        body["media"] = json!(image);
    }
    if let Some(url) = &args.callback_url {
        body["callbackUrl"] = json!(url);
    }
    body
}

fn print_outputs(body: &Value) {
    for (label, key) in [("Image", "images"), ("Video", "videos"), ("Text", "texts")] {
        for item in body[key].as_array().into_iter().flatten() {
            if let Some(s) = item.as_str() {
                println!("   {} {}", style(format!("{label}:")).bold(), s);
            }
        }
    }
}

pub async fn run_invoke(client: &ApiClient, args: &RequestArgs) -> Result<()> {
    let body = client.post("/api/invoke", &request_body(args)).await?;
    let mut section = GuideSection::new("Invocation")
        .status("Status", body["status"].as_str().unwrap_or("unknown"))
        .status("Request", body["requestId"].as_str().unwrap_or("-"))
        .status("Log", body["logId"].as_str().unwrap_or("-"))
        .status("Duration", &format!("{} ms", body["durationMs"].as_u64().unwrap_or(0)));
    if let Some(task_id) = body["taskId"].as_str() {
        section = section
            .status("Task", task_id)
            .hint(&format!("capflow task {task_id}"), "follow the pending job");
    }
    section.print();
    print_outputs(&body);
    println!();
    Ok(())
}

pub async fn run_enqueue(client: &ApiClient, args: &RequestArgs) -> Result<()> {
    let body = client.post("/api/tasks", &request_body(args)).await?;
    let task_id = body["taskId"].as_str().unwrap_or("-");
    GuideSection::new("Task Queued")
        .status("Task", task_id)
        .status("Status", body["status"].as_str().unwrap_or("queued"))
        .blank()
        .hint(&format!("capflow task {task_id}"), "check progress")
        .print();
    println!();
    Ok(())
}

pub async fn run_task(client: &ApiClient, task_id: &str, recheck: bool) -> Result<()> {
    let body = if recheck {
        client
            .post(&format!("/api/tasks/{task_id}/recheck"), &json!({}))
            .await?
    } else {
        client.get(&format!("/api/tasks/{task_id}")).await?
    };
    let task = &body["task"];
    let status = task["status"].as_str().unwrap_or("unknown");
    let styled = match status {
        "succeeded" => style(status).green().bold(),
        "failed" => style(status).red().bold(),
        _ => style(status).yellow().bold(),
    };

    let mut section = GuideSection::new("Task")
        .status("Task", task_id)
        .status("Capability", task["capabilityId"].as_str().unwrap_or("-"))
        .status("Status", &styled.to_string())
        .status("Attempts", &task["attempts"].to_string());
    if let Some(job_id) = task["jobId"].as_str() {
        section = section.status("Job", job_id);
    }
    section.print();
    print_outputs(task);
    if let Some(error) = task["error"].as_str() {
        print_error(error);
    }
    if status == "running" {
        print_info("Still running; query again later.");
    }
    println!();
    Ok(())
}
