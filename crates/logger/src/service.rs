//! Systemd notification support
//!
//! Sends sd-notify messages when `NOTIFY_SOCKET` is set, so the logger can run
//! as a `Type=notify` unit. Outside systemd every call is a no-op.

use anyhow::{Context, Result};
use std::env;
use std::os::unix::net::UnixDatagram;
use tracing::debug;

fn notify(message: &str) -> Result<bool> {
    let Ok(socket_path) = env::var("NOTIFY_SOCKET") else {
        debug!("NOTIFY_SOCKET not set, skipping systemd notification");
        return Ok(false);
    };

    let socket = UnixDatagram::unbound().context("Failed to create Unix socket")?;
    socket
        .send_to(message.as_bytes(), &socket_path)
        .with_context(|| format!("Failed to send {} to systemd", message))?;
    debug!("Notified systemd: {}", message);
    Ok(true)
}

/// Polling has started
pub fn notify_ready() -> Result<bool> {
    notify("READY=1")
}

/// Shutdown has begun
pub fn notify_stopping() -> Result<bool> {
    notify("STOPPING=1")
}

/// Status line shown by `systemctl status`
pub fn notify_status(status: &str) -> Result<bool> {
    notify(&format!("STATUS={}", status))
}

pub fn is_systemd() -> bool {
    env::var("NOTIFY_SOCKET").is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // Both cases live in one test since they share the process environment
    #[test]
    fn test_notify_with_and_without_socket() {
        unsafe {
            env::remove_var("NOTIFY_SOCKET");
        }
        assert!(!is_systemd());
        assert!(!notify_ready().unwrap());
        assert!(!notify_status("polling").unwrap());

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notify.sock");
        let receiver = UnixDatagram::bind(&path).unwrap();

        unsafe {
            env::set_var("NOTIFY_SOCKET", &path);
        }
        assert!(is_systemd());
        assert!(notify_ready().unwrap());
        assert!(notify_stopping().unwrap());

        let mut buf = [0u8; 64];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"READY=1");
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"STOPPING=1");

        unsafe {
            env::remove_var("NOTIFY_SOCKET");
        }
    }
}
