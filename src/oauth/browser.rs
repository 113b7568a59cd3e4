//! Usage: Hands the authorization URL to the desktop's default browser.

use crate::shared::error::AppResult;
use std::process::Command;

/// Fire-and-forget URL opener. Implementations must not wait for the browser to exit.
pub trait BrowserOpener: Send + Sync {
    fn open(&self, url: &str) -> AppResult<()>;
}

/// Uses the platform's URL handler (`rundll32`, `open` or `xdg-open`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl BrowserOpener for SystemBrowser {
    fn open(&self, url: &str) -> AppResult<()> {
        let mut cmd = browser_command(url).ok_or_else(|| {
            "SYSTEM_ERROR: browser open is unsupported on this platform".to_string()
        })?;
        cmd.spawn()
            .map_err(|e| format!("SYSTEM_ERROR: failed to open browser: {e}"))?;
        Ok(())
    }
}

fn browser_command(url: &str) -> Option<Command> {
    if cfg!(target_os = "windows") {
        // `explorer <url>` may open File Explorer for some URL shapes; the protocol handler does not.
        let mut cmd = Command::new("rundll32.exe");
        cmd.arg("url.dll,FileProtocolHandler").arg(url);
        return Some(cmd);
    }
    if cfg!(target_os = "macos") {
        let mut cmd = Command::new("open");
        cmd.arg(url);
        return Some(cmd);
    }
    if cfg!(unix) {
        let mut cmd = Command::new("xdg-open");
        cmd.arg(url);
        return Some(cmd);
    }
    None
}
