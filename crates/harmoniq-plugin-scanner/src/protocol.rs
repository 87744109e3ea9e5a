//! Text messages exchanged between the scan supervisor and its worker.
//!
//! A message is `tag:payload`, split on the first `:`. The payload is
//! trimmed. Anything that does not carry a known tag decodes to
//! [`Tag::Unknown`] instead of an error so that the receiving side can log
//! and drop it.

use std::fmt;

pub const DELIMITER: char = ':';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tag {
    /// Master to worker: comma separated format names to scan.
    Scan,
    /// Master to worker: shut down.
    Quit,
    /// Worker to master: lifecycle phase.
    State,
    /// Worker to master: file about to be probed.
    Name,
    /// Worker to master: fraction of the current format done.
    Progress,
    Unknown(String),
}

impl Tag {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "scan" => Tag::Scan,
            "quit" => Tag::Quit,
            "state" => Tag::State,
            "name" => Tag::Name,
            "progress" => Tag::Progress,
            other => Tag::Unknown(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Tag::Scan => "scan",
            Tag::Quit => "quit",
            Tag::State => "state",
            Tag::Name => "name",
            Tag::Progress => "progress",
            Tag::Unknown(raw) => raw,
        }
    }
}

/// Lifecycle phase reported by the worker. `Idle` is only ever assigned by
/// the master once a session is over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerPhase {
    Waiting,
    Ready,
    Scanning,
    Finished,
    Quitting,
    Idle,
    Unknown(String),
}

impl WorkerPhase {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "waiting" => WorkerPhase::Waiting,
            "ready" => WorkerPhase::Ready,
            "scanning" => WorkerPhase::Scanning,
            "finished" => WorkerPhase::Finished,
            "quitting" => WorkerPhase::Quitting,
            "idle" => WorkerPhase::Idle,
            other => WorkerPhase::Unknown(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            WorkerPhase::Waiting => "waiting",
            WorkerPhase::Ready => "ready",
            WorkerPhase::Scanning => "scanning",
            WorkerPhase::Finished => "finished",
            WorkerPhase::Quitting => "quitting",
            WorkerPhase::Idle => "idle",
            WorkerPhase::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tag: Tag,
    pub payload: String,
}

impl Message {
    pub fn new(tag: Tag, payload: impl Into<String>) -> Self {
        Self {
            tag,
            payload: payload.into().trim().to_owned(),
        }
    }

    pub fn scan<S: AsRef<str>>(formats: &[S]) -> Self {
        let joined = formats
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join(",");
        Self::new(Tag::Scan, joined)
    }

    pub fn quit() -> Self {
        Self::new(Tag::Quit, "")
    }

    pub fn state(phase: &WorkerPhase) -> Self {
        Self::new(Tag::State, phase.as_str())
    }

    pub fn name(file: &str) -> Self {
        Self::new(Tag::Name, file)
    }

    pub fn progress(fraction: f32) -> Self {
        Self::new(Tag::Progress, fraction.to_string())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::with_capacity(self.tag.as_str().len() + 1 + self.payload.len());
        out.push_str(self.tag.as_str());
        if !self.payload.is_empty() {
            out.push(DELIMITER);
            out.push_str(&self.payload);
        }
        out.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let text = String::from_utf8_lossy(bytes);
        let (tag, payload) = text.split_once(DELIMITER).unwrap_or((&*text, ""));
        Self::new(Tag::parse(tag), payload)
    }

    /// Format names carried by a `scan` message.
    pub fn formats(&self) -> Vec<String> {
        self.payload
            .split(',')
            .map(|name| name.trim().trim_matches('\'').trim())
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
            .collect()
    }

    pub fn phase(&self) -> WorkerPhase {
        WorkerPhase::parse(&self.payload)
    }

    /// Progress fraction clamped to `[0, 1]`, or `None` when the payload is
    /// not a finite number.
    pub fn fraction(&self) -> Option<f32> {
        let value: f32 = self.payload.parse().ok()?;
        value.is_finite().then(|| value.clamp(0.0, 1.0))
    }
}
