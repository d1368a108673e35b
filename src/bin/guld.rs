//! gul serving daemon
//!
//! Serves an application bundle over TCP: parses each request head into
//! request metadata, then hands the live connection off to the bundle's
//! worker process. Also provides `inspect`, which starts a worker just long
//! enough to report the bundle's package info.

use anyhow::{anyhow, Context, Result};
use gul::bundle::DirStore;
use gul::daemon::supervisor::Supervisor;
use gul::http::{handler, RequestMeta};
use std::env;
use std::io::{BufRead, BufReader, Read};
use std::net::{TcpListener, TcpStream};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "serve" => {
            let bundle = args
                .get(2)
                .ok_or_else(|| anyhow!("serve requires a bundle directory"))?;
            let listen = match args.get(3).map(String::as_str) {
                Some("--listen") => args
                    .get(4)
                    .ok_or_else(|| anyhow!("--listen requires an address"))?
                    .clone(),
                Some(other) => return Err(anyhow!("unknown argument '{}'", other)),
                None => "127.0.0.1:8080".to_string(),
            };
            serve(bundle, &listen)
        }
        "inspect" => {
            let bundle = args
                .get(2)
                .ok_or_else(|| anyhow!("inspect requires a bundle directory"))?;
            inspect(bundle)
        }
        "-h" | "--help" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Error: Unknown command '{}'", other);
            print_usage();
            process::exit(1);
        }
    }
}

fn inspect(bundle: &str) -> Result<()> {
    let store = Arc::new(DirStore::open(bundle)?);
    let supervisor = Supervisor::for_bundle(store);
    let info = supervisor.start(serde_json::json!({}))?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    supervisor.stop();
    Ok(())
}

fn serve(bundle: &str, listen: &str) -> Result<()> {
    let store = Arc::new(DirStore::open(bundle)?);
    let supervisor = Arc::new(Supervisor::for_bundle(store));
    let info = supervisor.start(serde_json::json!({}))?;

    println!("Serving '{}' v{} on {}", info.name, info.version, listen);
    for route in &info.routes {
        println!("  {}", route);
    }
    println!("Press Ctrl-C to stop.");

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.clone())?;

    let listener =
        TcpListener::bind(listen).with_context(|| format!("binding {}", listen))?;
    listener.set_nonblocking(true)?;

    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                let supervisor = supervisor.clone();
                thread::spawn(move || serve_connection(supervisor, stream, addr.to_string()));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                thread::sleep(Duration::from_millis(100));
            }
        }
    }

    println!("Shutting down.");
    supervisor.stop();
    Ok(())
}

fn serve_connection(supervisor: Arc<Supervisor>, stream: TcpStream, addr: String) {
    if stream.set_nonblocking(false).is_err() {
        return;
    }
    let _ = stream.set_read_timeout(Some(Duration::from_secs(30)));

    let meta = match parse_request(&stream, addr) {
        Ok(meta) => meta,
        Err(e) => {
            tracing::debug!(error = %e, "unparseable request head");
            return;
        }
    };

    let fallback = match stream.try_clone() {
        Ok(clone) => clone,
        Err(e) => {
            tracing::warn!(error = %e, "connection clone failed");
            return;
        }
    };
    supervisor.handle_connection(meta, Box::new(stream), move |error| {
        if let Some(e) = error {
            tracing::warn!(error = %e, "request not delivered to worker");
        }
        let mut fallback = fallback;
        let _ = handler::write_not_found(&mut fallback);
        let _ = fallback.shutdown(std::net::Shutdown::Both);
    });
}

/// Parse an HTTP/1.x request head and buffered body into request metadata
fn parse_request(stream: &TcpStream, addr: String) -> Result<RequestMeta> {
    let mut reader = BufReader::new(stream.try_clone()?);

    let mut line = String::new();
    reader.read_line(&mut line)?;
    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| anyhow!("empty request line"))?
        .to_ascii_uppercase();
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("missing request target"))?;
    let http_version = parts
        .next()
        .and_then(|v| v.strip_prefix("HTTP/"))
        .unwrap_or("1.0")
        .to_string();
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (target.to_string(), String::new()),
    };

    let mut headers = Vec::new();
    loop {
        let mut header_line = String::new();
        if reader.read_line(&mut header_line)? == 0 {
            break;
        }
        let header_line = header_line.trim_end();
        if header_line.is_empty() {
            break;
        }
        if let Some((name, value)) = header_line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);
    if content_length > MAX_BODY_SIZE {
        return Err(anyhow!("request body too large: {} bytes", content_length));
    }
    let mut body = vec![0u8; content_length];
    if !body.is_empty() {
        reader.read_exact(&mut body)?;
    }

    let hostname = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("host"))
        .map(|(_, value)| value.split(':').next().unwrap_or(value).to_string())
        .unwrap_or_else(|| "localhost".to_string());

    Ok(RequestMeta {
        method,
        path,
        query,
        headers,
        body,
        http_version,
        hostname,
        remote_addr: Some(addr),
    })
}

fn print_usage() {
    println!("gul serving daemon v0.1.0");
    println!();
    println!("Usage: guld <command> [options]");
    println!();
    println!("Commands:");
    println!("  serve <bundle> [--listen ADDR]  Serve a bundle (default 127.0.0.1:8080)");
    println!("  inspect <bundle>                Print a bundle's package info");
    println!("  -h, --help                      Show this help message");
    println!();
    println!("Examples:");
    println!("  guld serve ./mybundle");
    println!("  guld serve ./mybundle --listen 0.0.0.0:3000");
    println!("  guld inspect ./mybundle");
}
