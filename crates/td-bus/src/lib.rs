//! Message Bus (C1): files on disk as the transport.
//!
//! Three logical roots under a configured base directory: `Outbox/<SENDER>`,
//! `Inbox/<RECIPIENT>`, `Archive/<YYYY-MM-DD>/<SENDER>`. Every message is one
//! text file named after its `message_id`. Writes land via a temp file plus
//! rename so a reader never observes a partially written message.

use chrono::Utc;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use td_schemas::{Message, Priority};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed message at {path}: {reason}")]
    SchemaError { path: PathBuf, reason: String },
}

pub struct Bus {
    root: PathBuf,
}

impl Bus {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Bus { root: root.into() }
    }

    fn outbox_dir(&self, sender: &str) -> PathBuf {
        self.root.join("Outbox").join(sender)
    }

    fn inbox_dir(&self, recipient: &str) -> PathBuf {
        self.root.join("Inbox").join(recipient)
    }

    fn archive_dir(&self, date: &str, sender: &str) -> PathBuf {
        self.root.join("Archive").join(date).join(sender)
    }

    fn dead_letter_dir(&self, date: &str) -> PathBuf {
        self.root.join("Archive").join(date).join("DEAD_LETTER")
    }

    /// Writes atomically (temp-file + rename) into `Outbox/<from>`. Returns
    /// the generated `message_id`.
    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &self,
        from: &str,
        to: &str,
        message_type: &str,
        subject: &str,
        body: &str,
        payload: Option<Value>,
        priority: Priority,
        requires_response: bool,
        parent_message_id: Option<String>,
    ) -> Result<String, BusError> {
        let message_id = uuid::Uuid::new_v4().to_string();
        let msg = Message {
            message_id: message_id.clone(),
            from: from.to_string(),
            to: to.to_string(),
            timestamp: Utc::now(),
            message_type: message_type.to_string(),
            priority,
            requires_response,
            parent_message_id,
            subject: subject.to_string(),
            body: body.to_string(),
            payload,
        };

        let dir = self.outbox_dir(from);
        create_dir_all(&dir)?;
        let dest = dir.join(&message_id);
        let encoded = encode(&msg);
        atomic_write(&dest, &encoded)?;

        // Read our own write back; a decode failure here means the encoder
        // produced something unparsable, which should never happen for a
        // message this function itself built, but dead-letter it if so
        // rather than leaving a silently broken file in the outbox.
        if let Err(e) = decode(&dest, &encoded) {
            tracing::warn!(path = %dest.display(), error = %e, "bus write failed schema read-back, dead-lettering");
            let today = Utc::now().format("%Y-%m-%d").to_string();
            let dl_dir = self.dead_letter_dir(&today);
            create_dir_all(&dl_dir)?;
            let dl_dest = dl_dir.join(format!("{from}-{message_id}"));
            atomic_write(&dl_dest, &encoded)?;
            let _ = fs::remove_file(&dest);
            return Err(e);
        }

        Ok(message_id)
    }

    /// Copies the message from `Outbox/<from>` into `Inbox/<to>`. Idempotent:
    /// if the inbox already holds this message, this is a no-op.
    pub fn route(&self, message_id: &str, from: &str, to: &str) -> Result<(), BusError> {
        let src = self.outbox_dir(from).join(message_id);
        let dst_dir = self.inbox_dir(to);
        create_dir_all(&dst_dir)?;
        let dst = dst_dir.join(message_id);

        if dst.exists() {
            return Ok(());
        }

        let contents = fs::read(&src).map_err(|source| BusError::Io {
            path: src.clone(),
            source,
        })?;
        atomic_write(&dst, &contents)
    }

    /// Parses a message file: front matter, body, and an optional single
    /// fenced JSON payload block.
    pub fn read(&self, path: &Path) -> Result<Message, BusError> {
        let raw = fs::read(path).map_err(|source| BusError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        decode(path, &raw)
    }

    /// Moves a processed message file to `Archive/<today>/<SELF>`.
    pub fn archive(&self, path: &Path, self_name: &str) -> Result<(), BusError> {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let dir = self.archive_dir(&today, self_name);
        create_dir_all(&dir)?;
        let file_name = path.file_name().ok_or_else(|| BusError::SchemaError {
            path: path.to_path_buf(),
            reason: "message path has no file name".to_string(),
        })?;
        let dest = dir.join(file_name);
        fs::rename(path, &dest).map_err(|source| BusError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn inbox_messages(&self, recipient: &str) -> Result<Vec<PathBuf>, BusError> {
        let dir = self.inbox_dir(recipient);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|source| BusError::Io {
            path: dir.clone(),
            source,
        })? {
            let entry = entry.map_err(|source| BusError::Io {
                path: dir.clone(),
                source,
            })?;
            if entry.path().is_file() {
                out.push(entry.path());
            }
        }
        out.sort();
        Ok(out)
    }
}

fn create_dir_all(dir: &Path) -> Result<(), BusError> {
    fs::create_dir_all(dir).map_err(|source| BusError::Io {
        path: dir.to_path_buf(),
        source,
    })
}

fn atomic_write(dest: &Path, contents: &[u8]) -> Result<(), BusError> {
    let tmp = dest.with_extension("tmp");
    fs::write(&tmp, contents).map_err(|source| BusError::Io {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, dest).map_err(|source| BusError::Io {
        path: dest.to_path_buf(),
        source,
    })
}

fn encode(msg: &Message) -> Vec<u8> {
    let mut out = String::new();
    out.push_str("---\n");
    out.push_str(&format!("message_id: {}\n", msg.message_id));
    out.push_str(&format!("from: {}\n", msg.from));
    out.push_str(&format!("to: {}\n", msg.to));
    out.push_str(&format!(
        "timestamp: {}\n",
        msg.timestamp.format("%Y-%m-%dT%H:%M:%SZ")
    ));
    out.push_str(&format!("message_type: {}\n", msg.message_type));
    out.push_str(&format!("priority: {}\n", msg.priority.as_str()));
    out.push_str(&format!("requires_response: {}\n", msg.requires_response));
    if let Some(parent) = &msg.parent_message_id {
        out.push_str(&format!("parent_message_id: {parent}\n"));
    }
    out.push_str("---\n\n");
    out.push_str(&format!("# {}\n\n", msg.subject));
    out.push_str(&msg.body);
    out.push('\n');
    if let Some(payload) = &msg.payload {
        out.push_str("\n```json\n");
        out.push_str(&serde_json::to_string_pretty(payload).unwrap_or_default());
        out.push_str("\n```\n");
    }
    out.into_bytes()
}

fn decode(path: &Path, raw: &[u8]) -> Result<Message, BusError> {
    let text = std::str::from_utf8(raw).map_err(|e| BusError::SchemaError {
        path: path.to_path_buf(),
        reason: format!("not valid utf-8: {e}"),
    })?;

    let mut parts = text.splitn(3, "---\n");
    let _empty = parts.next();
    let front_matter = parts.next().ok_or_else(|| BusError::SchemaError {
        path: path.to_path_buf(),
        reason: "missing front matter delimiter".to_string(),
    })?;
    let rest = parts.next().ok_or_else(|| BusError::SchemaError {
        path: path.to_path_buf(),
        reason: "missing closing front matter delimiter".to_string(),
    })?;

    let mut fields = std::collections::HashMap::new();
    for line in front_matter.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (k, v) = line.split_once(':').ok_or_else(|| BusError::SchemaError {
            path: path.to_path_buf(),
            reason: format!("front matter line is not key: value: {line}"),
        })?;
        fields.insert(k.trim().to_string(), v.trim().to_string());
    }

    let require = |key: &str| -> Result<String, BusError> {
        fields.get(key).cloned().ok_or_else(|| BusError::SchemaError {
            path: path.to_path_buf(),
            reason: format!("missing required front matter key: {key}"),
        })
    };

    let message_id = require("message_id")?;
    let from = require("from")?;
    let to = require("to")?;
    let timestamp_str = require("timestamp")?;
    let message_type = require("message_type")?;
    let priority_str = require("priority")?;
    let requires_response_str = require("requires_response")?;
    let parent_message_id = fields.get("parent_message_id").cloned();

    let timestamp = chrono::DateTime::parse_from_rfc3339(&timestamp_str)
        .map_err(|e| BusError::SchemaError {
            path: path.to_path_buf(),
            reason: format!("bad timestamp '{timestamp_str}': {e}"),
        })?
        .with_timezone(&Utc);

    let priority = Priority::parse(&priority_str).ok_or_else(|| BusError::SchemaError {
        path: path.to_path_buf(),
        reason: format!("unknown priority: {priority_str}"),
    })?;

    let requires_response: bool =
        requires_response_str.parse().map_err(|_| BusError::SchemaError {
            path: path.to_path_buf(),
            reason: format!("requires_response not a bool: {requires_response_str}"),
        })?;

    let rest = rest.trim_start_matches('\n');
    let (subject, body_and_payload) = match rest.strip_prefix('#') {
        Some(after_hash) => {
            let after_hash = after_hash.trim_start();
            match after_hash.split_once('\n') {
                Some((subject, body)) => (subject.trim().to_string(), body),
                None => (after_hash.trim().to_string(), ""),
            }
        }
        None => (String::new(), rest),
    };

    let (body, payload) = extract_json_block(body_and_payload).map_err(|reason| {
        BusError::SchemaError {
            path: path.to_path_buf(),
            reason,
        }
    })?;

    Ok(Message {
        message_id,
        from,
        to,
        timestamp,
        message_type,
        priority,
        requires_response,
        parent_message_id,
        subject,
        body,
        payload,
    })
}

fn extract_json_block(text: &str) -> Result<(String, Option<Value>), String> {
    match text.find("```json") {
        None => Ok((text.trim().to_string(), None)),
        Some(start) => {
            let after = &text[start + "```json".len()..];
            let end = after.find("```").ok_or("unterminated fenced JSON block")?;
            let json_str = after[..end].trim();
            let payload: Value =
                serde_json::from_str(json_str).map_err(|e| format!("invalid JSON payload: {e}"))?;
            let body = text[..start].trim().to_string();
            Ok((body, Some(payload)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_route_read_archive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Bus::new(dir.path());

        let id = bus
            .write(
                "RESEARCH",
                "RISK",
                "DailyBriefing",
                "Morning candidates",
                "Five candidates identified.",
                Some(serde_json::json!({"count": 5})),
                Priority::Routine,
                false,
                None,
            )
            .unwrap();

        bus.route(&id, "RESEARCH", "RISK").unwrap();
        // routing twice is a no-op, not an error
        bus.route(&id, "RESEARCH", "RISK").unwrap();

        let inbox = bus.inbox_messages("RISK").unwrap();
        assert_eq!(inbox.len(), 1);

        let msg = bus.read(&inbox[0]).unwrap();
        assert_eq!(msg.message_id, id);
        assert_eq!(msg.subject, "Morning candidates");
        assert_eq!(msg.payload.unwrap()["count"], 5);

        bus.archive(&inbox[0], "RISK").unwrap();
        assert!(!inbox[0].exists());
    }

    #[test]
    fn malformed_front_matter_is_schema_error() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Bus::new(dir.path());
        let bad_path = dir.path().join("bad.txt");
        fs::write(&bad_path, b"no front matter here").unwrap();
        let err = bus.read(&bad_path).unwrap_err();
        assert!(matches!(err, BusError::SchemaError { .. }));
    }
}
