use std::fmt;

use serde::{Deserialize, Serialize};

/// External tools vidgrab provisions into its support directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    Ffmpeg,
    Ffprobe,
    YtDlp,
    AtomicParsley,
}

impl Tool {
    /// Startup check order.
    pub const ALL: [Tool; 4] = [Tool::Ffmpeg, Tool::Ffprobe, Tool::YtDlp, Tool::AtomicParsley];

    /// Binary name inside the install directory (no extension on the target platform).
    pub fn as_str(&self) -> &'static str {
        match self {
            Tool::Ffmpeg => "ffmpeg",
            Tool::Ffprobe => "ffprobe",
            Tool::YtDlp => "yt-dlp",
            Tool::AtomicParsley => "AtomicParsley",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "ffmpeg" => Tool::Ffmpeg,
            "ffprobe" => Tool::Ffprobe,
            "yt-dlp" => Tool::YtDlp,
            "AtomicParsley" => Tool::AtomicParsley,
            _ => return None,
        })
    }

    pub fn spec(&self) -> &'static ToolSpec {
        match self {
            Tool::Ffmpeg => &FFMPEG,
            Tool::Ffprobe => &FFPROBE,
            Tool::YtDlp => &YT_DLP,
            Tool::AtomicParsley => &ATOMIC_PARSLEY,
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape of the payload served at a tool's source URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveKind {
    /// The payload is the executable itself.
    None,
    Zip,
}

/// Where a tool comes from and what to pull out of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSpec {
    pub tool: Tool,
    pub source_url: &'static str,
    pub archive: ArchiveKind,
    /// Top-level archive entry that becomes the installed binary.
    pub member: &'static str,
}

impl ToolSpec {
    pub fn name(&self) -> &'static str {
        self.tool.as_str()
    }
}

pub static FFMPEG: ToolSpec = ToolSpec {
    tool: Tool::Ffmpeg,
    source_url: "https://evermeet.cx/ffmpeg/ffmpeg-118315-g4f3c9f2f03.zip",
    archive: ArchiveKind::Zip,
    member: "ffmpeg",
};

pub static FFPROBE: ToolSpec = ToolSpec {
    tool: Tool::Ffprobe,
    source_url: "https://evermeet.cx/ffmpeg/ffprobe-118315-g4f3c9f2f03.zip",
    archive: ArchiveKind::Zip,
    member: "ffprobe",
};

pub static YT_DLP: ToolSpec = ToolSpec {
    tool: Tool::YtDlp,
    source_url: "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp_macos",
    archive: ArchiveKind::None,
    member: "yt-dlp",
};

pub static ATOMIC_PARSLEY: ToolSpec = ToolSpec {
    tool: Tool::AtomicParsley,
    source_url: "https://github.com/wez/atomicparsley/releases/download/20240608.083822.1ed9031/AtomicParsleyMacOS.zip",
    archive: ArchiveKind::Zip,
    member: "AtomicParsley",
};

/// Quality choices offered to the user, highest first.
pub const QUALITY_OPTIONS: [&str; 7] = [
    "4320p (8K)",
    "2160p (4K)",
    "1440p (2K, WQHD)",
    "1080p (Full HD)",
    "720p (HD)",
    "480p (SD)",
    "360p (Low)",
];

pub const DEFAULT_QUALITY_INDEX: usize = 3;

pub fn default_quality() -> &'static str {
    QUALITY_OPTIONS[DEFAULT_QUALITY_INDEX]
}

/// Maximum video height parsed from a quality label such as `"1080p (Full HD)"`.
///
/// Only the first whitespace-separated token matters, so bare `"720p"` and
/// `"720"` are accepted too.
pub fn quality_height(label: &str) -> Option<u32> {
    let token = label.split_whitespace().next()?;
    let digits = token.strip_suffix('p').unwrap_or(token);
    match digits.parse::<u32>() {
        Ok(0) | Err(_) => None,
        Ok(h) => Some(h),
    }
}

/// Lifecycle phase of the single download session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Preparing,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// How a session ended. Exactly one is recorded per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed(String),
    Cancelled,
}

impl Outcome {
    pub fn phase(&self) -> SessionPhase {
        match self {
            Outcome::Succeeded => SessionPhase::Succeeded,
            Outcome::Failed(_) => SessionPhase::Failed,
            Outcome::Cancelled => SessionPhase::Cancelled,
        }
    }
}

/// Progress as last shown to the user.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// 0..=100
    pub percent: f64,
    pub status: String,
    pub terminal: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_height() {
        assert_eq!(quality_height("1080p (Full HD)"), Some(1080));
        assert_eq!(quality_height("1440p (2K, WQHD)"), Some(1440));
        assert_eq!(quality_height("720"), Some(720));
        assert_eq!(quality_height(""), None);
        assert_eq!(quality_height("best"), None);
        assert_eq!(quality_height("0p"), None);
    }

    #[test]
    fn test_every_quality_option_parses() {
        for label in QUALITY_OPTIONS {
            assert!(quality_height(label).is_some(), "{label}");
        }
        assert_eq!(quality_height(default_quality()), Some(1080));
    }

    #[test]
    fn test_tool_specs_match_names() {
        for tool in Tool::ALL {
            let spec = tool.spec();
            assert_eq!(spec.tool, tool);
            assert_eq!(spec.member, tool.as_str());
            assert_eq!(Tool::from_str(tool.as_str()), Some(tool));
        }
        assert_eq!(Tool::YtDlp.spec().archive, ArchiveKind::None);
        assert_eq!(Tool::Ffmpeg.spec().archive, ArchiveKind::Zip);
    }
}
