use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "ice-open", about = "Ask the running editor to open a file")]
struct Args {
    /// File to open, absolute or relative to the current directory.
    file: PathBuf,
    #[arg(long, env = "ICE_OPEN_URL", default_value = "http://localhost:3000/openRequest")]
    url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OpenRequest {
    full_path: String,
    path: String,
}

fn resolve_file(file: &Path) -> Result<OpenRequest> {
    let metadata = std::fs::metadata(file)
        .with_context(|| format!("{}: no such file", file.display()))?;
    if !metadata.is_file() {
        bail!("{}: not a regular file", file.display());
    }
    // symlinks are kept so the editor opens the path the user named
    let full = std::path::absolute(file)
        .with_context(|| format!("{}: cannot resolve path", file.display()))?;
    Ok(OpenRequest {
        full_path: full.to_string_lossy().to_string(),
        path: file.to_string_lossy().to_string(),
    })
}

async fn send(url: &str, request: &OpenRequest) -> Result<()> {
    let response = reqwest::Client::new()
        .post(url)
        .json(request)
        .send()
        .await
        .context("request failed")?;
    if !response.status().is_success() {
        bail!("server answered {}", response.status());
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    let request = match resolve_file(&args.file) {
        Ok(value) => value,
        Err(err) => {
            eprintln!("{err:#}");
            return ExitCode::FAILURE;
        }
    };
    if send(&args.url, &request).await.is_err() {
        eprintln!("Service unavailable");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
