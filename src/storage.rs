//! Transcript persistence.
//!
//! Conversations are saved as plain text, by default under the platform data
//! directory (`<data>/handbook-chat/transcripts`), one file per save with a
//! timestamped name.

use crate::model::{now_rfc3339, Author, Institution, Message};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const APP_DIR: &str = "handbook-chat";

fn default_transcript_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().context("could not determine the platform data directory")?;
    Ok(base.join(APP_DIR).join("transcripts"))
}

/// Save the conversation to the default transcripts directory. Returns the
/// path written.
pub fn save_transcript(institution: &Institution, messages: &[Message]) -> Result<PathBuf> {
    let dir = default_transcript_dir()?;
    save_transcript_to(&dir.join(transcript_filename(institution)), institution, messages)
}

/// Save the conversation to an explicit path, creating parent directories.
pub fn save_transcript_to(
    path: &Path,
    institution: &Institution,
    messages: &[Message],
) -> Result<PathBuf> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(path, render_transcript(institution, messages))
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path.to_path_buf())
}

fn transcript_filename(institution: &Institution) -> String {
    // RFC3339 contains ':', which some filesystems reject.
    let stamp = now_rfc3339().replace(':', "-");
    format!("{}-{stamp}.txt", slug(&institution.display_name))
}

fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

fn render_transcript(institution: &Institution, messages: &[Message]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Handbook conversation - {}\n",
        institution.display_name
    ));
    out.push_str(&format!("Saved at {}\n\n", now_rfc3339()));
    for msg in messages {
        let who = match msg.author {
            Author::User => "You",
            Author::Assistant => "Assistant",
        };
        let marker = if msg.is_error { " (error)" } else { "" };
        out.push_str(&format!("[{}] {who}{marker}:\n{}\n", msg.created_at, msg.text));
        for ev in &msg.evidence {
            out.push_str(&format!(
                "    source: {} ({}) similarity {:.2}\n",
                ev.title, ev.category, ev.similarity
            ));
        }
        if let Some(confidence) = msg.confidence {
            out.push_str(&format!("    confidence: {confidence:.2}\n"));
        }
        out.push('\n');
    }
    out
}
