//! Mock worker for integration testing
//!
//! Started by the supervisor as `mock-worker --server <socket>`. Listens on
//! the Unix socket and answers one command per line:
//! - PING: replies PONG
//! - ENV: comma-separated, sorted names of the environment variables it got
//! - CWD: its working directory
//! - PID: its process id
//! - anything else is echoed back
//!
//! A first line that looks like an HTTP request line gets a small HTTP
//! response instead, so the worker can sit behind the proxy.
//!
//! `--mode never-ready` never creates the socket, `--mode exit` exits
//! immediately with status 1.

use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};

#[tokio::main]
async fn main() {
    let mut socket_path: Option<PathBuf> = None;
    let mut mode = String::from("serve");

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--server" => socket_path = args.next().map(PathBuf::from),
            "--mode" => mode = args.next().unwrap_or_default(),
            other => eprintln!("Mock worker: ignoring argument {}", other),
        }
    }
    let socket_path = socket_path.expect("--server <socket> is required");

    match mode.as_str() {
        "exit" => {
            eprintln!("Mock worker: exiting without creating a socket");
            std::process::exit(1);
        }
        "never-ready" => {
            eprintln!("Mock worker: never creating {}", socket_path.display());
            loop {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        }
        _ => {}
    }

    // Installed before binding so a TERM during startup still cleans up
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path).expect("Failed to bind socket");
    eprintln!("Mock worker: listening on {}", socket_path.display());

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        tokio::spawn(handle_connection(stream));
                    }
                    Err(e) => eprintln!("Mock worker: accept error: {}", e),
                }
            }
            _ = sigterm.recv() => {
                eprintln!("Mock worker: received SIGTERM");
                let _ = std::fs::remove_file(&socket_path);
                std::process::exit(0);
            }
        }
    }
}

async fn handle_connection(stream: UnixStream) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let mut first = true;

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let command = line.trim_end();

        if first && command.contains(" HTTP/1.") {
            let _ = respond_http(&mut reader, &mut writer).await;
            return;
        }
        first = false;

        let reply = match command {
            "PING" => "PONG".to_string(),
            "ENV" => {
                let mut names: Vec<String> = std::env::vars_os()
                    .map(|(k, _)| k.to_string_lossy().into_owned())
                    .collect();
                names.sort();
                names.join(",")
            }
            "CWD" => std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            "PID" => std::process::id().to_string(),
            other => other.to_string(),
        };

        if writer.write_all(format!("{}\n", reply).as_bytes()).await.is_err() {
            return;
        }
    }
}

/// Read the remaining request headers and reply with a plain text summary
async fn respond_http<R, W>(reader: &mut R, writer: &mut W) -> std::io::Result<()>
where
    R: AsyncBufReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    let mut forwarded = Vec::new();
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let header = line.trim_end();
        if header.is_empty() {
            break;
        }
        if header.to_ascii_lowercase().starts_with("x-forwarded-") {
            forwarded.push(header.to_ascii_lowercase());
        }
    }

    let cwd = std::env::current_dir().unwrap_or_default();
    let app = cwd
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut body = format!("app={}\npid={}\n", app, std::process::id());
    for header in forwarded {
        body.push_str(&header);
        body.push('\n');
    }

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    writer.write_all(response.as_bytes()).await?;
    writer.shutdown().await
}
