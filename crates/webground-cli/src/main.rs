use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{Read, Write};
use std::ops::ControlFlow;
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use webground_core::{Error, FailureClass};
use webground_local::config::CacheKind;
use webground_local::{ChatEnvelope, Settings};

#[derive(Parser, Debug)]
#[command(name = "webground")]
#[command(about = "Answer chat messages grounded in the content of a linked web page", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Answer one message; a URL in the message grounds the answer on that page (json).
    Ask(AskCmd),
    /// Acquire one URL through cache, static and rendered tiers (json).
    Fetch(FetchCmd),
    /// Diagnose configuration/launch issues (json; no secrets).
    Doctor(DoctorCmd),
    /// Print version info.
    Version(VersionCmd),
}

#[derive(clap::Args, Debug)]
struct AskCmd {
    /// Message text (joined with spaces).
    #[arg(conflicts_with = "json", required_unless_present = "json")]
    message: Vec<String>,
    /// Request body as JSON (`{"message": "..."}`), or `-` to read it from stdin.
    #[arg(long)]
    json: Option<String>,
    /// Write the answer to stdout as it is generated instead of one JSON envelope.
    #[arg(long)]
    stream: bool,
}

#[derive(clap::Args, Debug)]
struct FetchCmd {
    /// Absolute http(s) URL.
    url: String,
}

#[derive(clap::Args, Debug)]
struct DoctorCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
    /// Check that the Node binary used by the rendered tier launches.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    check_node: bool,
    /// Timeout for the Node launch check (ms).
    #[arg(long, default_value_t = 3000)]
    timeout_ms: u64,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

fn init_tracing() {
    // Logs go to stderr; stdout is reserved for JSON and streamed answers.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .init();
}

/// Opt-in env file. Never overrides variables already set in the process environment.
fn load_env_file() -> Option<std::result::Result<std::path::PathBuf, dotenvy::Error>> {
    let p = std::env::var("WEBGROUND_ENV_FILE").ok()?;
    let p = p.trim();
    if p.is_empty() {
        return None;
    }
    Some(dotenvy::from_path(p).map(|()| std::path::PathBuf::from(p)))
}

fn exit_code_for(class: Option<FailureClass>) -> ExitCode {
    match class {
        None => ExitCode::SUCCESS,
        Some(c) if c.is_client_error() => ExitCode::from(2),
        Some(_) => ExitCode::from(1),
    }
}

fn print_json<T: serde::Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string(v)?);
    Ok(())
}

fn emit_envelope(env: &ChatEnvelope) -> Result<ExitCode> {
    print_json(env)?;
    Ok(exit_code_for(env.failure_class()))
}

fn read_payload(arg: &str) -> Result<String> {
    if arg.trim() == "-" {
        let mut s = String::new();
        std::io::stdin()
            .read_to_string(&mut s)
            .context("read request body from stdin")?;
        Ok(s)
    } else {
        Ok(arg.to_string())
    }
}

async fn run_ask(settings: &Settings, args: AskCmd) -> Result<ExitCode> {
    let service = match settings.build_service() {
        Ok(s) => s,
        Err(e) => return emit_envelope(&ChatEnvelope::from_error(&e)),
    };

    let message = match &args.json {
        None => args.message.join(" "),
        Some(raw) => {
            let payload: serde_json::Value = match serde_json::from_str(&read_payload(raw)?) {
                Ok(v) => v,
                Err(e) => {
                    let e = Error::InvalidInput(format!("request body is not JSON: {e}"));
                    return emit_envelope(&ChatEnvelope::from_error(&e));
                }
            };
            if !args.stream {
                let r = service.handle_value(&payload).await;
                return emit_envelope(&ChatEnvelope::from_result(r));
            }
            match payload.get("message").and_then(|m| m.as_str()) {
                Some(m) => m.to_string(),
                None => {
                    let e = Error::InvalidInput("message is required and must be a string".to_string());
                    return emit_envelope(&ChatEnvelope::from_error(&e));
                }
            }
        }
    };

    if !args.stream {
        let r = service.handle(&message).await;
        return emit_envelope(&ChatEnvelope::from_result(r));
    }

    let mut wrote_any = false;
    let mut on_fragment = |f: &str| {
        let mut out = std::io::stdout().lock();
        // A closed stdout (e.g. `| head`) ends the stream.
        if out.write_all(f.as_bytes()).and_then(|()| out.flush()).is_err() {
            return ControlFlow::Break(());
        }
        wrote_any = true;
        ControlFlow::Continue(())
    };
    match service.handle_stream(&message, &mut on_fragment).await {
        Ok(route) => {
            println!();
            tracing::debug!(has_url = route.has_url, url = ?route.url, tier = ?route.extraction_method, "stream finished");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            if wrote_any {
                println!();
            }
            emit_envelope(&ChatEnvelope::from_error(&e))
        }
    }
}

async fn run_fetch(settings: &Settings, args: FetchCmd) -> Result<ExitCode> {
    let acquirer = match settings.build_acquirer() {
        Ok(a) => a,
        Err(e) => return emit_envelope(&ChatEnvelope::from_error(&e)),
    };
    match acquirer.acquire(&args.url).await {
        Ok(content) => {
            print_json(&content)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => emit_envelope(&ChatEnvelope::from_error(&e)),
    }
}

async fn node_launch_check(node_bin: &str, timeout_ms: u64) -> (bool, Option<String>) {
    let child = tokio::process::Command::new(node_bin)
        .arg("--version")
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), child).await {
        Ok(Ok(out)) if out.status.success() => (
            true,
            Some(String::from_utf8_lossy(&out.stdout).trim().to_string()),
        ),
        Ok(Ok(out)) => (false, Some(format!("exit status {}", out.status))),
        Ok(Err(e)) => (false, Some(e.to_string())),
        Err(_) => (false, Some(format!("timed out after {timeout_ms}ms"))),
    }
}

async fn run_doctor(settings: &Settings, args: DoctorCmd) -> Result<ExitCode> {
    let t0 = std::time::Instant::now();
    let summary = settings.summary();
    let mut checks: Vec<serde_json::Value> = Vec::new();

    // Check: cache dir is creatable + writable (fs backend only).
    if settings.cache == CacheKind::Fs {
        let dir = &settings.cache_dir;
        let cache_ok = (|| -> anyhow::Result<()> {
            std::fs::create_dir_all(dir)?;
            let probe = dir.join(format!("webground-doctor-{}.probe", std::process::id()));
            std::fs::write(&probe, b"ok")?;
            let _ = std::fs::remove_file(&probe);
            Ok(())
        })()
        .is_ok();
        checks.push(serde_json::json!({
            "name": "cache_dir_writable",
            "ok": cache_ok,
            "message": if cache_ok { "cache dir is writable" } else { "cache dir is not writable" },
            "hint": if cache_ok { "" } else { "Set WEBGROUND_CACHE_DIR to a writable directory, or WEBGROUND_CACHE=memory." },
        }));
    } else {
        let ok = settings.build_cache_backend().is_ok();
        checks.push(serde_json::json!({
            "name": "cache_backend_configured",
            "ok": ok,
            "message": if ok { "cache backend configured" } else { "cache backend is missing configuration" },
            "hint": if ok { "" } else { "Set UPSTASH_REDIS_REST_URL and UPSTASH_REDIS_REST_TOKEN." },
        }));
    }

    // Check: the rendered tier can at least start Node.
    let skip_node = !args.check_node || settings.render_disabled;
    let (node_ok, node_detail) = if skip_node {
        (true, None)
    } else {
        node_launch_check(&settings.node_bin, args.timeout_ms).await
    };
    checks.push(serde_json::json!({
        "name": "node_launch",
        "ok": node_ok,
        "skipped": skip_node,
        "detail": node_detail,
        "hint": if node_ok { "" } else { "Install Node.js and Playwright (`npm i -g playwright && npx playwright install chromium`), set WEBGROUND_NODE, or set WEBGROUND_RENDER_DISABLE=1." },
    }));

    // Check: the model can be called (credentials only; no request is made).
    let key_needed = summary.llm_provider == webground_local::config::LlmProvider::OpenaiCompat;
    let llm_ok = !key_needed || summary.llm_api_key_present;
    checks.push(serde_json::json!({
        "name": "llm_credentials",
        "ok": llm_ok,
        "message": if llm_ok { "model credentials present" } else { "no API key for the model endpoint" },
        "hint": if llm_ok { "" } else { "Set WEBGROUND_LLM_API_KEY (or GROQ_API_KEY), or WEBGROUND_LLM_PROVIDER=ollama." },
    }));

    let ok = checks.iter().all(|c| c["ok"].as_bool().unwrap_or(false));
    let payload = serde_json::json!({
        "schema_version": 1,
        "kind": "doctor",
        "ok": ok,
        "name": "webground",
        "version": env!("CARGO_PKG_VERSION"),
        "configured": summary,
        "checks": checks,
        "elapsed_ms": t0.elapsed().as_millis() as u64,
    });
    match args.output.to_ascii_lowercase().as_str() {
        "text" => {
            for c in payload["checks"].as_array().into_iter().flatten() {
                let mark = if c["ok"].as_bool().unwrap_or(false) { "ok  " } else { "FAIL" };
                println!("{mark} {}", c["name"].as_str().unwrap_or(""));
            }
        }
        _ => println!("{payload}"),
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let env_file = load_env_file();
    init_tracing();
    match env_file {
        Some(Ok(p)) => tracing::debug!(path = %p.display(), "loaded env file"),
        Some(Err(e)) => tracing::warn!(error = %e, "could not load WEBGROUND_ENV_FILE"),
        None => {}
    }

    let cli = Cli::parse();

    if let Commands::Version(args) = &cli.command {
        let v = serde_json::json!({
            "schema_version": 1,
            "kind": "version",
            "ok": true,
            "name": "webground",
            "version": env!("CARGO_PKG_VERSION"),
        });
        match args.output.to_ascii_lowercase().as_str() {
            "text" => println!("webground {}", env!("CARGO_PKG_VERSION")),
            _ => println!("{v}"),
        }
        return Ok(ExitCode::SUCCESS);
    }

    let settings = match Settings::from_env() {
        Ok(s) => s,
        Err(e) => return emit_envelope(&ChatEnvelope::from_error(&e)),
    };

    match cli.command {
        Commands::Ask(args) => run_ask(&settings, args).await,
        Commands::Fetch(args) => run_fetch(&settings, args).await,
        Commands::Doctor(args) => run_doctor(&settings, args).await,
        Commands::Version(_) => Ok(ExitCode::SUCCESS),
    }
}
