//! Output formatting for the terminal

use tabled::{settings::Style, Table, Tabled};

use bs_core::rpc::{
    ControlInstallResult, InstallProgress, ItemSnapshot, SessionStatusReport, UploadResult,
    UploadSnapshot,
};

#[derive(Tabled)]
struct ItemRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "VERSION")]
    version: String,
    #[tabled(rename = "STATUS")]
    status: String,
}

#[derive(Tabled)]
struct ItemRowDetailed {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "VERSION")]
    version: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "ERROR")]
    error: String,
}

/// Session summary followed by one row per item
pub fn format_session_report(report: &SessionStatusReport) -> String {
    let mut out = format!(
        "Session {}  status: {}  total: {}  completed: {}  failed: {}  pending: {}",
        report.session_id,
        report.status,
        report.total,
        report.completed,
        report.failed,
        report.pending
    );
    if report.items.is_empty() {
        out.push_str("\nNo items queued");
        return out;
    }

    let rows: Vec<ItemRow> = report
        .items
        .iter()
        .map(|item| ItemRow {
            id: item.id.clone(),
            version: item.version.clone(),
            status: item.status.to_string(),
        })
        .collect();
    out.push('\n');
    out.push_str(&Table::new(rows).with(Style::rounded()).to_string());
    out
}

fn format_items(items: &[ItemSnapshot]) -> String {
    let rows: Vec<ItemRowDetailed> = items
        .iter()
        .map(|item| ItemRowDetailed {
            id: item.id.clone(),
            version: item.version.clone(),
            status: item.status.to_string(),
            error: item.error_message.clone().unwrap_or_else(|| "-".to_string()),
        })
        .collect();
    Table::new(rows).with(Style::rounded()).to_string()
}

pub fn format_control_result(result: &ControlInstallResult) -> String {
    let mut out = format!(
        "{}\nStatus: {}  paused: {}  connected: {}\nCurrent item: {}\n\
         Pending: {}  processing: {}  completed: {}  failed: {}",
        result.result,
        result.status,
        result.paused,
        result.connected,
        result.current_item,
        result.pending,
        result.processing,
        result.completed,
        result.failed
    );
    if !result.items.is_empty() {
        out.push('\n');
        out.push_str(&format_items(&result.items));
    }
    out
}

pub fn format_upload_result(result: &UploadResult) -> String {
    let extraction = &result.extraction;
    let extracted = if extraction.success {
        format!(
            "extracted {} files ({} bytes) to {}",
            extraction.file_count,
            extraction.total_bytes,
            extraction
                .destination
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_else(|| "-".to_string())
        )
    } else {
        format!(
            "extraction failed: {}",
            extraction.error.as_deref().unwrap_or("unknown error")
        )
    };
    format!(
        "Stored {} ({} bytes, sha256 {})\n{}",
        result.file_path.display(),
        result.file_size,
        result.checksum,
        extracted
    )
}

pub fn format_upload_snapshot(snapshot: &UploadSnapshot) -> String {
    let mut out = format!(
        "Upload {} ({}) [{}]: {}/{} chunks, {} of {} bytes, {} retries",
        snapshot.session_id,
        snapshot.file_name,
        snapshot.state,
        snapshot.chunks_received,
        snapshot.total_chunks,
        snapshot.bytes_received,
        snapshot.file_size,
        snapshot.retry_count
    );
    if let Some(error) = &snapshot.last_error {
        out.push_str(&format!(", last error: {}", error));
    }
    out
}

pub fn format_progress(progress: &InstallProgress) -> String {
    match &progress.error_message {
        Some(error) if progress.has_error => format!(
            "{} {}: {} ({})",
            progress.id, progress.version, progress.status, error
        ),
        _ => format!("{} {}: {}", progress.id, progress.version, progress.status),
    }
}

/// Print a success message in green with a checkmark prefix
pub fn print_success(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Green),
        Print("✓ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an error message in red with an X prefix
pub fn print_error(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an informational message in cyan with an info symbol prefix
pub fn print_info(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Cyan),
        Print("ℹ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}
