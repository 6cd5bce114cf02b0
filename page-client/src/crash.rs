use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{error, info};

pub const RAW_REPORT: &str = "crash_report.bin";
pub const TEXT_REPORT: &str = "crash_report";

const PREVIEW_BYTES: usize = 64;

/// Writes undecodable bytes and their error next to each other in `dir`
pub async fn write_crash_report(
    dir: &Path,
    frame: &[u8],
    error: &dyn std::fmt::Display,
) -> std::io::Result<PathBuf> {
    let preview = &frame[..frame.len().min(PREVIEW_BYTES)];
    error!(
        "Failed to decode {} bytes: {} (starts with {})",
        frame.len(),
        error,
        hex::encode(preview)
    );

    fs::create_dir_all(dir).await?;
    fs::write(dir.join(RAW_REPORT), frame).await?;
    fs::write(dir.join(TEXT_REPORT), error.to_string()).await?;

    info!("Crash report written to {}", dir.display());
    Ok(dir.to_path_buf())
}
