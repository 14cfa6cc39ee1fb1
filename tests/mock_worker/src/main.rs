//! Mock application worker for integration testing
//!
//! Reads the launch settings line from stdin, reports its pid on stdout and
//! echoes every connection on the TCP port or unix socket it was given.
//!
//! An optional `behavior` file in the app directory changes what it does:
//! - `exit-during-init`: write to stderr and exit with code 1
//! - `never-listen`: report launch info but never accept connections
//! - `ignore-sigint`: keep running when sent SIGINT
//! - `slow-start <ms>`: wait before listening

use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpListener, UnixListener};

#[tokio::main]
async fn main() {
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .expect("Failed to read settings from stdin");
    let input: Value = serde_json::from_str(&line).expect("Settings must be JSON");

    let app_dir = input["appDir"].as_str().expect("appDir required").to_string();
    let address = input["port"].as_str().expect("port required").to_string();
    let behavior = std::fs::read_to_string(Path::new(&app_dir).join("behavior")).unwrap_or_default();
    let behavior = behavior.trim();

    eprintln!("Mock worker: starting in {} on {}", app_dir, address);
    println!("worker_launch_info: {{\"pid\":{},\"versions\":{{\"mock\":\"1\"}}}}", std::process::id());
    println!("==END==");
    println!("worker_launch_info: not parsed after the end marker");

    if behavior == "exit-during-init" {
        eprintln!("Mock worker: failing during init");
        std::process::exit(1);
    }
    if behavior == "never-listen" {
        loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }
    if behavior == "ignore-sigint" {
        tokio::spawn(async {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                eprintln!("Mock worker: ignoring SIGINT");
            }
        });
    }
    if let Some(ms) = behavior.strip_prefix("slow-start ") {
        let ms: u64 = ms.trim().parse().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    match address.parse::<u16>() {
        Ok(port) => {
            let listener = TcpListener::bind(("127.0.0.1", port)).await.expect("Failed to bind");
            eprintln!("Mock worker: listening on port {}", port);
            loop {
                if let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(echo(stream));
                }
            }
        }
        Err(_) => {
            let listener = UnixListener::bind(&address).expect("Failed to bind socket");
            eprintln!("Mock worker: listening on {}", address);
            loop {
                if let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(echo(stream));
                }
            }
        }
    }
}

async fn echo<S: AsyncRead + AsyncWrite + Unpin>(stream: S) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let _ = tokio::io::copy(&mut reader, &mut writer).await;
}
