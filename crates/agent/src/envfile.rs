//! `~/.bot/.env` handling: one `KEY=VALUE` per line, BOM-stripped on
//! load, existing process-level values winning over file values.
//!
//! Recognized keys are listed in [`known_keys`]; unknown keys load fine
//! (the file doubles as user scratch config).

use std::collections::HashMap;
use std::path::Path;

/// Keys the agent actually reads.
pub fn known_keys() -> &'static [&'static str] {
    &[
        "DOTBOT_SERVER",
        "DEVICE_NAME",
        "DOTBOT_INVITE_TOKEN",
        "DOTBOT_TEMP_DIR",
        "HEARTBEAT_ENABLED",
        "HEARTBEAT_INTERVAL_MIN",
        "HEARTBEAT_ACTIVE_START",
        "HEARTBEAT_ACTIVE_END",
        "DISCORD_CHANNEL_CONVERSATION",
        "DISCORD_CHANNEL_UPDATES",
        "DISCORD_CHANNEL_LOGS",
        "DISCORD_AUTHORIZED_USER_ID",
    ]
}

/// Parse `.env` content into a map. Strips a UTF-8 BOM, skips blanks
/// and `#` comments, tolerates `=` in values.
pub fn parse(content: &str) -> HashMap<String, String> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let mut out = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            out.insert(key.to_string(), value.trim().to_string());
        }
    }
    out
}

/// Load the file and overlay process env: a variable already set in the
/// process always wins.
pub fn load(path: &Path) -> HashMap<String, String> {
    let mut values = match std::fs::read_to_string(path) {
        Ok(content) => parse(&content),
        Err(_) => HashMap::new(),
    };
    for key in known_keys() {
        if let Ok(process_value) = std::env::var(key) {
            values.insert((*key).to_string(), process_value);
        }
    }
    values
}

/// Remove a key's line from the file in place (used to consume
/// `DOTBOT_INVITE_TOKEN` after successful registration).
pub fn remove_key(path: &Path, key: &str) -> std::io::Result<()> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let stripped = content.strip_prefix('\u{feff}').unwrap_or(&content);
    let kept: Vec<&str> = stripped
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            match trimmed.split_once('=') {
                Some((k, _)) => k.trim() != key,
                None => true,
            }
        })
        .collect();
    let mut out = kept.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    std::fs::write(path, out)
}

/// Normalize a server URL into the channel endpoint: scheme coerced to
/// ws/wss (wss for anything non-local), `/ws` appended when the path is
/// bare.
pub fn normalize_server_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    let (scheme, rest) = match trimmed.split_once("://") {
        Some((s, r)) => (s, r),
        None => ("", trimmed),
    };
    let host = rest.split([':', '/']).next().unwrap_or("");
    let is_local = host == "localhost" || host == "127.0.0.1" || host == "::1";

    let ws_scheme = match scheme {
        "ws" | "wss" => scheme,
        "http" => "ws",
        "https" => "wss",
        _ if is_local => "ws",
        _ => "wss",
    };

    let mut url = format!("{ws_scheme}://{rest}");
    let path_start = rest.find('/').map(|i| &rest[i..]).unwrap_or("");
    if path_start.is_empty() {
        url.push_str("/ws");
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_strips_bom_and_comments() {
        let content = "\u{feff}# config\nDOTBOT_SERVER=wss://example.com\n\nDEVICE_NAME=laptop\nBAD LINE\nX=a=b\n";
        let map = parse(content);
        assert_eq!(map.get("DOTBOT_SERVER").unwrap(), "wss://example.com");
        assert_eq!(map.get("DEVICE_NAME").unwrap(), "laptop");
        assert_eq!(map.get("X").unwrap(), "a=b");
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn remove_key_deletes_only_that_line() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(
            &path,
            "DOTBOT_SERVER=x\nDOTBOT_INVITE_TOKEN=dbot-AAAA-BBBB-CCCC-DDDD\nDEVICE_NAME=n\n",
        )
        .unwrap();
        remove_key(&path, "DOTBOT_INVITE_TOKEN").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("INVITE"));
        assert!(content.contains("DOTBOT_SERVER=x"));
        assert!(content.contains("DEVICE_NAME=n"));
    }

    #[test]
    fn remove_key_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "A=1\n").unwrap();
        remove_key(&path, "MISSING").unwrap();
        remove_key(&path, "MISSING").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "A=1\n");
    }

    #[test]
    fn url_normalization() {
        assert_eq!(
            normalize_server_url("https://bot.example.com"),
            "wss://bot.example.com/ws"
        );
        assert_eq!(
            normalize_server_url("bot.example.com"),
            "wss://bot.example.com/ws"
        );
        assert_eq!(
            normalize_server_url("http://localhost:3720"),
            "ws://localhost:3720/ws"
        );
        assert_eq!(
            normalize_server_url("localhost:3720"),
            "ws://localhost:3720/ws"
        );
        // Explicit paths are preserved.
        assert_eq!(
            normalize_server_url("wss://bot.example.com/channel"),
            "wss://bot.example.com/channel"
        );
    }
}
