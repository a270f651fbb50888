//! Timestamped session directories for generated sprites: one directory per
//! run holding per-provider PNG files, grid previews, `metadata.json` and an
//! append-only `events.jsonl`.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use image::RgbImage;
use log::info;
use serde_json::json;
use spriteforge_contracts::events::{payload, EventWriter};
use spriteforge_contracts::manifest::{self, SessionManifest};

const SESSION_ID_FORMAT: &str = "%Y%m%d-%H%M%S";

pub struct OutputStore {
    base_dir: PathBuf,
}

/// One generation run. The id doubles as the directory name.
pub struct Session {
    id: String,
    path: PathBuf,
    events: EventWriter,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn events(&self) -> &EventWriter {
        &self.events
    }
}

impl OutputStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("failed creating output directory {}", base_dir.display()))?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Creates a session directory named after the local wall-clock time.
    /// Sub-second collisions get a numeric suffix rather than sharing a
    /// directory.
    pub fn create_session(&self) -> Result<Session> {
        let stamp = Local::now().format(SESSION_ID_FORMAT).to_string();
        let mut id = stamp.clone();
        let mut attempt = 1;
        while self.base_dir.join(&id).exists() {
            id = format!("{stamp}-{attempt}");
            attempt += 1;
        }

        let path = self.base_dir.join(&id);
        fs::create_dir_all(&path)
            .with_context(|| format!("failed creating session directory {}", path.display()))?;

        let events = EventWriter::new(path.join("events.jsonl"), &id);
        events.emit(
            "session_started",
            payload(json!({"session_folder": path.to_string_lossy()})),
        )?;
        info!("created session {} at {}", id, path.display());
        Ok(Session { id, path, events })
    }

    /// Saves one normalized sprite (and optionally its grid preview) under
    /// the provider's subdirectory. Variation numbering is 1-based.
    pub fn save_variation(
        &self,
        session: &Session,
        provider: &str,
        variation: u32,
        sprite: &RgbImage,
        preview: Option<&RgbImage>,
    ) -> Result<PathBuf> {
        let provider_dir = session.path.join(provider);
        fs::create_dir_all(&provider_dir).with_context(|| {
            format!("failed creating provider directory {}", provider_dir.display())
        })?;

        let sprite_path = provider_dir.join(format!("variation_{variation}.png"));
        sprite
            .save(&sprite_path)
            .with_context(|| format!("failed saving sprite {}", sprite_path.display()))?;

        let mut preview_name: Option<String> = None;
        if let Some(preview) = preview {
            let preview_path = provider_dir.join(format!("variation_{variation}_preview.png"));
            preview
                .save(&preview_path)
                .with_context(|| format!("failed saving preview {}", preview_path.display()))?;
            preview_name = preview_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned());
        }

        session.events.emit(
            "artifact_saved",
            payload(json!({
                "provider": provider,
                "variation": variation,
                "file": sprite_path.to_string_lossy(),
                "preview": preview_name,
            })),
        )?;
        Ok(sprite_path)
    }

    /// Writes the session's `metadata.json`.
    pub fn write_manifest(&self, session: &Session, manifest: &SessionManifest) -> Result<()> {
        let path = session.path.join("metadata.json");
        manifest::write_manifest(&path, manifest)
            .with_context(|| format!("failed writing manifest {}", path.display()))?;
        session.events.emit(
            "manifest_written",
            payload(json!({
                "file": path.to_string_lossy(),
                "total_images_generated": manifest.total_images_generated,
            })),
        )?;
        Ok(())
    }

    /// Human-readable recap of what a session directory contains, counting
    /// saved sprites per provider (previews excluded).
    pub fn session_summary(&self, session: &Session) -> Result<String> {
        let separator = "-".repeat(40);
        let mut text = String::new();
        writeln!(text, "{separator}").ok();
        writeln!(text, "Session: {}", session.path.display()).ok();

        let mut total = 0usize;
        let mut entries: Vec<(String, usize)> = Vec::new();
        for entry in fs::read_dir(&session.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let provider = entry.file_name().to_string_lossy().into_owned();
            let count = count_sprites(&entry.path())?;
            total += count;
            entries.push((provider, count));
        }
        entries.sort();

        for (provider, count) in entries {
            writeln!(text, "  {provider}: {count} image(s)").ok();
        }
        writeln!(text, "Total: {total} image(s)").ok();
        writeln!(text, "{separator}").ok();
        Ok(text)
    }
}

fn count_sprites(provider_dir: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in fs::read_dir(provider_dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name.starts_with("variation_")
            && name.ends_with(".png")
            && !name.ends_with("_preview.png")
        {
            count += 1;
        }
    }
    Ok(count)
}
