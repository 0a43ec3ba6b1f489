use std::sync::atomic::{AtomicUsize, Ordering};

use owo_colors::AnsiColors;
use stacked_errors::{bail, Result, StackableErr};

// so that concurrently forwarded command outputs are visually separable
const COLOR_CYCLE: [AnsiColors; 6] = [
    AnsiColors::Blue,
    AnsiColors::Green,
    AnsiColors::Magenta,
    AnsiColors::Cyan,
    AnsiColors::Yellow,
    AnsiColors::BrightBlue,
];

static COLOR_NUM: AtomicUsize = AtomicUsize::new(0);

/// Cycles through a small palette of line-prefix colors
pub fn next_terminal_color() -> AnsiColors {
    COLOR_CYCLE[COLOR_NUM.fetch_add(1, Ordering::Relaxed) % COLOR_CYCLE.len()]
}

/// Requests `url` and returns the response body. Any HTTP status of 400 or
/// above is an error.
pub async fn download(url: &str) -> Result<Vec<u8>> {
    let resp = reqwest::get(url)
        .await
        .stack_err_with(|| format!("download(url: {url})"))?;
    let status = resp.status();
    if status.as_u16() >= 400 {
        bail!("download(url: {url}) -> got HTTP status code >= 400: {status}")
    }
    let body = resp
        .bytes()
        .await
        .stack_err_with(|| format!("download(url: {url}) -> failed reading body"))?;
    Ok(body.to_vec())
}
