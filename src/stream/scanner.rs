use serde_json::Value;
use strum_macros::{AsRefStr, Display};

use crate::error::StreamError;
use crate::models::{ArtifactEvent, DelegationEvent, ProvenanceInfo, WireEvent};

/// `sourceTool` stamped on artifacts extracted from the text stream itself.
pub const INLINE_SOURCE_TOOL: &str = "inline_marker";

const MAX_NAME_LEN: usize = 64;
/// Longest marker body held while waiting for its closing tag.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

// ============================================================================
// Marker Kinds
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum MarkerKind {
    Artifact,
    Delegate,
}

impl MarkerKind {
    const ALL: [MarkerKind; 2] = [MarkerKind::Artifact, MarkerKind::Delegate];

    /// Everything of the opening tag up to the attribute value.
    fn open_prefix(&self) -> &'static str {
        match self {
            Self::Artifact => "<artifact type=\"",
            Self::Delegate => "<delegate to=\"",
        }
    }

    fn close_tag(&self) -> &'static str {
        match self {
            Self::Artifact => "</artifact>",
            Self::Delegate => "</delegate>",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Artifact => "artifact",
            Self::Delegate => "delegate",
        }
    }
}

// ============================================================================
// Scanner State
// ============================================================================

/// Who is speaking and on whose behalf, for events built from markers.
#[derive(Debug, Clone)]
pub struct ScanContext {
    pub agent_name: String,
    pub user_id: String,
    pub conversation_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Plain,
    MaybeOpen,
    InBody,
}

#[derive(Debug)]
struct OpenMarker {
    kind: MarkerKind,
    name: String,
    open_tag: String,
}

#[derive(Debug)]
struct ScannerState {
    mode: Mode,
    /// Bytes not yet classified: a candidate opening tag, or a marker body.
    buffer: String,
    marker: Option<OpenMarker>,
    /// Body bytes already searched for the closing tag.
    searched: usize,
}

enum OpenMatch {
    Partial,
    Complete {
        kind: MarkerKind,
        name: String,
        len: usize,
    },
    NoMatch,
}

/// Incremental parser that splits a fragmented text stream into plain text
/// and the `<artifact>` / `<delegate>` markers embedded in it.
///
/// Text that could still be the start of an opening tag is held back until
/// the next fragment decides it, so a `TextDelta` never contains marker bytes.
#[derive(Debug)]
pub struct MarkerScanner {
    context: ScanContext,
    state: ScannerState,
}

impl MarkerScanner {
    pub fn new(context: ScanContext) -> Self {
        Self {
            context,
            state: ScannerState {
                mode: Mode::Plain,
                buffer: String::new(),
                marker: None,
                searched: 0,
            },
        }
    }

    pub fn context(&self) -> &ScanContext {
        &self.context
    }

    /// Feed one fragment and drain every event it completes.
    pub fn feed(&mut self, fragment: &str) -> Vec<WireEvent> {
        self.state.buffer.push_str(fragment);

        let mut events = Vec::new();
        let mut text = String::new();

        loop {
            match self.state.mode {
                Mode::Plain => match self.state.buffer.find('<') {
                    None => {
                        text.push_str(&self.state.buffer);
                        self.state.buffer.clear();
                        break;
                    }
                    Some(idx) => {
                        text.push_str(&self.state.buffer[..idx]);
                        self.state.buffer.drain(..idx);
                        self.state.mode = Mode::MaybeOpen;
                    }
                },
                Mode::MaybeOpen => match match_open(&self.state.buffer) {
                    OpenMatch::Partial => break,
                    OpenMatch::NoMatch => {
                        text.push('<');
                        self.state.buffer.drain(..1);
                        self.state.mode = Mode::Plain;
                    }
                    OpenMatch::Complete { kind, name, len } => {
                        let open_tag: String = self.state.buffer.drain(..len).collect();
                        self.state.marker = Some(OpenMarker {
                            kind,
                            name,
                            open_tag,
                        });
                        self.state.searched = 0;
                        self.state.mode = Mode::InBody;
                    }
                },
                Mode::InBody => {
                    let Some(kind) = self.state.marker.as_ref().map(|m| m.kind) else {
                        self.state.mode = Mode::Plain;
                        continue;
                    };
                    let close = kind.close_tag();
                    let from = self.state.searched;

                    match self.state.buffer[from..].find(close) {
                        Some(rel) => {
                            let end = from + rel;
                            let body: String = self.state.buffer.drain(..end).collect();
                            self.state.buffer.drain(..close.len());
                            self.state.searched = 0;
                            self.state.mode = Mode::Plain;

                            if let Some(marker) = self.state.marker.take() {
                                flush_text(&mut events, &mut text);
                                events.push(self.build_event(marker, &body));
                            }
                        }
                        None if self.state.buffer.len() > MAX_BODY_BYTES => {
                            // give up on the marker: report it, then treat the
                            // opening tag and body as ordinary text
                            if let Some(marker) = self.state.marker.take() {
                                log::warn!(
                                    "{} marker '{}' exceeded {} bytes without a closing tag",
                                    marker.kind,
                                    marker.name,
                                    MAX_BODY_BYTES
                                );
                                flush_text(&mut events, &mut text);
                                let err = StreamError::MarkerParse {
                                    kind: kind.label(),
                                    reason: format!(
                                        "body exceeds {} bytes without a closing tag",
                                        MAX_BODY_BYTES
                                    ),
                                };
                                events.push(WireEvent::error(err.to_string()));
                                text.push_str(&marker.open_tag);
                            }
                            self.state.searched = 0;
                            self.state.mode = Mode::Plain;
                        }
                        None => {
                            // The tail may hold the start of the closing tag.
                            let keep = self.state.buffer.len().saturating_sub(close.len() - 1);
                            self.state.searched = floor_char_boundary(&self.state.buffer, keep);
                            break;
                        }
                    }
                }
            }
        }

        flush_text(&mut events, &mut text);
        events
    }

    /// End of turn: whatever never became a complete marker is plain text.
    pub fn flush(&mut self) -> Vec<WireEvent> {
        let mut text = std::mem::take(&mut self.state.buffer);
        if let Some(marker) = self.state.marker.take() {
            log::debug!(
                "unterminated {} marker '{}' flushed as text",
                marker.kind,
                marker.name
            );
            text.insert_str(0, &marker.open_tag);
        }
        self.state.mode = Mode::Plain;
        self.state.searched = 0;

        let mut events = Vec::new();
        flush_text(&mut events, &mut text);
        events
    }

    /// Scan a complete text in one call.
    pub fn scan_all(&mut self, text: &str) -> Vec<WireEvent> {
        let mut events = self.feed(text);
        events.extend(self.flush());
        events
    }

    pub fn has_pending(&self) -> bool {
        !self.state.buffer.is_empty() || self.state.marker.is_some()
    }

    fn build_event(&self, marker: OpenMarker, body: &str) -> WireEvent {
        let payload = match parse_body(marker.kind, body) {
            Ok(payload) => payload,
            Err(err) => {
                log::warn!("dropping {} marker '{}': {}", marker.kind, marker.name, err);
                return WireEvent::error(err.to_string());
            }
        };

        match marker.kind {
            MarkerKind::Artifact => WireEvent::Artifact(ArtifactEvent {
                artifact_type: marker.name,
                payload,
                metadata: ProvenanceInfo::now(
                    INLINE_SOURCE_TOOL,
                    &self.context.user_id,
                    &self.context.conversation_id,
                ),
            }),
            MarkerKind::Delegate => WireEvent::Delegation(DelegationEvent {
                from_agent: self.context.agent_name.clone(),
                to_agent: marker.name,
                payload,
            }),
        }
    }
}

fn parse_body(kind: MarkerKind, body: &str) -> Result<Value, StreamError> {
    let value: Value =
        serde_json::from_str(body.trim()).map_err(|e| StreamError::MarkerParse {
            kind: kind.label(),
            reason: format!("invalid JSON body: {}", e),
        })?;

    if !value.is_object() {
        return Err(StreamError::MarkerParse {
            kind: kind.label(),
            reason: "body must be a JSON object".to_string(),
        });
    }

    Ok(value)
}

/// Classify a buffer that starts with `<` against the known opening tags.
fn match_open(candidate: &str) -> OpenMatch {
    let mut partial = false;

    for kind in MarkerKind::ALL {
        let prefix = kind.open_prefix();

        if candidate.len() < prefix.len() {
            if prefix.starts_with(candidate) {
                partial = true;
            }
            continue;
        }

        let Some(rest) = candidate.strip_prefix(prefix) else {
            continue;
        };

        match rest.find('"') {
            Some(end) => {
                let name = &rest[..end];
                if !is_valid_name(name) {
                    continue;
                }
                match rest[end + 1..].chars().next() {
                    None => partial = true,
                    Some('>') => {
                        return OpenMatch::Complete {
                            kind,
                            name: name.to_string(),
                            len: prefix.len() + end + 2,
                        };
                    }
                    Some(_) => {}
                }
            }
            None => {
                if rest.chars().count() <= MAX_NAME_LEN && !rest.contains(['<', '>', '\n']) {
                    partial = true;
                }
            }
        }
    }

    if partial {
        OpenMatch::Partial
    } else {
        OpenMatch::NoMatch
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.chars().count() <= MAX_NAME_LEN
        && !name.contains(['<', '>', '\n'])
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn flush_text(events: &mut Vec<WireEvent>, text: &mut String) {
    if !text.is_empty() {
        events.push(WireEvent::text(std::mem::take(text)));
    }
}

// ============================================================================
// Tests
// ============================================================================
