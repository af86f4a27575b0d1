//! Fixture backend for the integration tests
//!
//! Environment:
//! - `PORT`: port to listen on (required)
//! - `STARTUP_DELAY_MS`: wait this long before binding
//! - `LOG_LINES`: print this many lines to stdout and stderr at startup
//! - `EXIT_AFTER_MS`: exit this long after the port is bound
//!
//! Every plain request is answered with a text body describing what arrived
//! (`pid`, `host`, `forwarded-host`, `path`). A request carrying an
//! `Upgrade` header is switched to a raw echo stream.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[tokio::main]
async fn main() {
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .expect("PORT must be set to a valid port");

    let delay_ms: u64 = std::env::var("STARTUP_DELAY_MS")
        .ok()
        .and_then(|d| d.parse().ok())
        .unwrap_or(0);

    let log_lines: usize = std::env::var("LOG_LINES")
        .ok()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0);

    for i in 0..log_lines {
        println!("mock line {}", i);
        eprintln!("mock warning {}", i);
    }

    if delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("failed to bind mock app port");
    println!("mock app listening on {}", port);

    if let Some(exit_ms) = std::env::var("EXIT_AFTER_MS").ok().and_then(|d| d.parse().ok()) {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(exit_ms)).await;
            println!("mock app exiting");
            std::process::exit(0);
        });
    }

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(handle_connection(stream));
            }
            Err(e) => eprintln!("accept error: {}", e),
        }
    }
}

async fn handle_connection(mut stream: TcpStream) {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    // Read until the end of the request head
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => return,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
                if buffer.len() > 64 * 1024 {
                    return;
                }
            }
            Err(_) => return,
        }
    }

    let head_end = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4)
        .unwrap_or(buffer.len());
    let head = String::from_utf8_lossy(&buffer[..head_end]).to_string();
    let leftover = buffer[head_end..].to_vec();

    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let path = request_line.split_whitespace().nth(1).unwrap_or("/").to_string();

    let mut host = String::new();
    let mut forwarded_host = String::new();
    let mut upgrade = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            let value = value.trim().to_string();
            match name.trim().to_ascii_lowercase().as_str() {
                "host" => host = value,
                "x-forwarded-host" => forwarded_host = value,
                "upgrade" => upgrade = Some(value),
                _ => {}
            }
        }
    }

    if let Some(protocol) = upgrade {
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: {}\r\n\
             Connection: Upgrade\r\n\
             \r\n",
            protocol
        );
        if stream.write_all(response.as_bytes()).await.is_err() {
            return;
        }
        if !leftover.is_empty() && stream.write_all(&leftover).await.is_err() {
            return;
        }
        echo(stream).await;
        return;
    }

    let body = format!(
        "pid={}\nhost={}\nforwarded-host={}\npath={}\n",
        std::process::id(),
        host,
        forwarded_host,
        path
    );
    let response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

async fn echo(mut stream: TcpStream) {
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if stream.write_all(&chunk[..n]).await.is_err() {
                    return;
                }
            }
        }
    }
}
