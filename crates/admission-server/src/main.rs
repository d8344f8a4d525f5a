use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use admission::transport::{ServerConfig, serve};
use admission::{ADMISSION_VERSION, AdmissionConfig, AdmissionService};

#[derive(Debug, Default, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    server: ServerArgs,
}

#[derive(Debug, Default, PartialEq)]
struct ServerArgs {
    host: Option<String>,
    port: Option<u16>,
    status_interval: Option<Duration>,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("Usage: admissiond [--config <file>] [--host <host>] [--port <port>]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --config <file>         JSON limiter config [default: ADMISSION_LIMITERS env]");
            eprintln!("  --host <host>           Bind address [default: 0.0.0.0]");
            eprintln!("  --port <port>           Bind port [default: 5010]");
            eprintln!("  --status-interval <s>   Log limiter status every <s> seconds");
            process::exit(2);
        }
    };

    admission::telemetry::init_tracing();

    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "admissiond failed");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                parsed.config = Some(PathBuf::from(
                    args.get(i).ok_or("--config requires a value")?,
                ));
            }
            "--host" => {
                i += 1;
                parsed.server.host = Some(args.get(i).ok_or("--host requires a value")?.clone());
            }
            "--port" => {
                i += 1;
                let raw = args.get(i).ok_or("--port requires a value")?;
                parsed.server.port = Some(raw.parse().map_err(|_| format!("invalid port: {raw}"))?);
            }
            "--status-interval" => {
                i += 1;
                let raw = args.get(i).ok_or("--status-interval requires a value")?;
                let secs: u64 = raw
                    .parse()
                    .map_err(|_| format!("invalid status interval: {raw}"))?;
                if secs == 0 {
                    return Err("--status-interval must be positive".to_string());
                }
                parsed.server.status_interval = Some(Duration::from_secs(secs));
            }
            "--help" | "-h" => return Err("".to_string()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(parsed)
}

fn server_config(args: ServerArgs) -> ServerConfig {
    let defaults = ServerConfig::default();
    ServerConfig {
        host: args.host.unwrap_or(defaults.host),
        port: args.port.unwrap_or(defaults.port),
        status_log_interval: args.status_interval,
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    tracing::info!(version = ADMISSION_VERSION, "admissiond starting");

    let config = match &args.config {
        Some(path) => AdmissionConfig::from_file(path)?,
        None => AdmissionConfig::from_env()?,
    };
    if config.limiters.is_empty() {
        tracing::warn!("No limiters configured; health check will report STARTING");
    }

    let service = Arc::new(AdmissionService::from_config(&config)?);
    serve(server_config(args.server), service).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(rest: &[&str]) -> Vec<String> {
        std::iter::once("admissiond")
            .chain(rest.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parse_defaults() {
        let args = parse_args(&argv(&[])).unwrap();
        assert_eq!(args, Args::default());

        let config = server_config(args.server);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 5010);
    }

    #[test]
    fn parse_all_flags() {
        let args = parse_args(&argv(&[
            "--config",
            "limits.json",
            "--host",
            "127.0.0.1",
            "--port",
            "8080",
            "--status-interval",
            "30",
        ]))
        .unwrap();

        assert_eq!(args.config, Some(PathBuf::from("limits.json")));
        let config = server_config(args.server);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.status_log_interval, Some(Duration::from_secs(30)));
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(parse_args(&argv(&["--port"])).is_err());
        assert!(parse_args(&argv(&["--port", "http"])).is_err());
        assert!(parse_args(&argv(&["--status-interval", "0"])).is_err());
        assert!(parse_args(&argv(&["serve"])).is_err());
    }
}
