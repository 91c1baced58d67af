//! Cue sheet and NFO sidecar content

use super::transform::AudioMetadata;
use crate::ChapterInfo;
use std::fmt::Write;
use std::time::Duration;

/// Renders sidecar text files for a finished output
pub trait SidecarWriter: Send + Sync {
    /// Cue sheet referencing `audio_file_name`
    fn cue_sheet(&self, audio_file_name: &str, chapters: &ChapterInfo) -> String;

    /// NFO description of the book
    fn nfo(&self, metadata: &AudioMetadata, chapters: &ChapterInfo) -> String;
}

/// Minimal plain-text sidecars
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainSidecars;

impl SidecarWriter for PlainSidecars {
    fn cue_sheet(&self, audio_file_name: &str, chapters: &ChapterInfo) -> String {
        let mut cue = String::new();
        let _ = writeln!(cue, "FILE \"{}\" MP4", quote(audio_file_name));
        for (i, chapter) in chapters.iter().enumerate() {
            let _ = writeln!(cue, "  TRACK {:02} AUDIO", i + 1);
            let _ = writeln!(cue, "    TITLE \"{}\"", quote(&chapter.title));
            let _ = writeln!(cue, "    INDEX 01 {}", cue_timestamp(chapter.start_offset()));
        }
        cue
    }

    fn nfo(&self, metadata: &AudioMetadata, chapters: &ChapterInfo) -> String {
        let tags = &metadata.tags;
        let unknown = "Unknown";
        let length = if metadata.duration.is_zero() {
            chapters.total_duration()
        } else {
            metadata.duration
        };

        let mut nfo = String::new();
        let _ = writeln!(nfo, "General Information");
        let _ = writeln!(nfo, "===================");
        let _ = writeln!(nfo, " Title:         {}", tags.title.as_deref().unwrap_or(unknown));
        let _ = writeln!(nfo, " Author:        {}", tags.author.as_deref().unwrap_or(unknown));
        let _ = writeln!(nfo, " Narrator:      {}", tags.narrator.as_deref().unwrap_or(unknown));
        let _ = writeln!(nfo, " Publisher:     {}", tags.publisher.as_deref().unwrap_or(unknown));
        let _ = writeln!(nfo, " Release Year:  {}", tags.year.as_deref().unwrap_or(unknown));
        let _ = writeln!(nfo, " Chapters:      {}", chapters.len());
        let _ = writeln!(nfo, " Total Length:  {}", clock(length));

        if let Some(comment) = tags.comment.as_deref().filter(|c| !c.trim().is_empty()) {
            let _ = writeln!(nfo);
            let _ = writeln!(nfo, "Book Description");
            let _ = writeln!(nfo, "================");
            let _ = writeln!(nfo, "{}", comment.trim());
        }
        nfo
    }
}

/// Cue sheet time `MM:SS:FF` with 75 frames per second
pub fn cue_timestamp(offset: Duration) -> String {
    let frames_total = offset.as_millis() * 75 / 1000;
    let frames = frames_total % 75;
    let seconds_total = frames_total / 75;
    format!("{:02}:{:02}:{:02}", seconds_total / 60, seconds_total % 60, frames)
}

fn clock(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

fn quote(value: &str) -> String {
    value.replace('"', "'")
}
