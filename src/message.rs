//! Messages exchanged with the display surface.
//!
//! `ForwardMsg` travels from the runtime to a client, `BackMsg` from a client
//! to the runtime. Both are JSON-serializable with serde tags so a transport
//! can frame them however it likes.

use serde::{Deserialize, Serialize};

use crate::controls::ControlSnapshot;
use crate::hashing::Fingerprint;

/// Position of an element in the output tree: the root container followed
/// by one index per nesting level.
pub type DeltaPath = Vec<u32>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Element {
    Title {
        body: String,
    },
    Header {
        body: String,
    },
    Text {
        body: String,
    },
    Markdown {
        body: String,
    },
    Exception {
        kind: String,
        message: String,
        #[serde(default)]
        trace: Vec<String>,
    },
    Image {
        url: String,
        mimetype: String,
    },
    Checkbox {
        id: String,
        label: String,
        value: bool,
    },
    Slider {
        id: String,
        label: String,
        min: i64,
        max: i64,
        value: i64,
    },
    TextInput {
        id: String,
        label: String,
        value: String,
    },
    Button {
        id: String,
        label: String,
    },
    Selectbox {
        id: String,
        label: String,
        options: Vec<String>,
        index: usize,
    },
}

impl Element {
    pub fn exception(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Exception {
            kind: kind.into(),
            message: message.into(),
            trace: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Vertical,
    Expander { label: String },
    Fragment { id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Delta {
    NewElement { element: Element },
    AddBlock { block: Block },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptFinishedStatus {
    FinishedSuccessfully,
    FinishedWithCompileError,
    FinishedEarlyForRerun,
    FinishedFragmentRunSuccessfully,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    ScriptCompilationException { message: String, report: String },
    CacheCleared,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ForwardBody {
    NewSession {
        session_id: String,
        script_run_id: String,
        script_name: String,
        #[serde(default)]
        fragment_id: Option<String>,
    },
    SessionStatusChanged {
        script_is_running: bool,
    },
    Delta {
        delta: Delta,
        #[serde(default)]
        fragment_id: Option<String>,
    },
    RefHash {
        hash: Fingerprint,
    },
    ScriptFinished {
        status: ScriptFinishedStatus,
    },
    SessionEvent {
        event: SessionEvent,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardMsgMetadata {
    #[serde(default)]
    pub delta_path: DeltaPath,
    #[serde(default)]
    pub cacheable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardMsg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<Fingerprint>,
    #[serde(default)]
    pub metadata: ForwardMsgMetadata,
    pub body: ForwardBody,
}

impl ForwardMsg {
    pub fn new(body: ForwardBody) -> Self {
        Self {
            hash: None,
            metadata: ForwardMsgMetadata::default(),
            body,
        }
    }

    pub fn delta(path: DeltaPath, delta: Delta, fragment_id: Option<String>) -> Self {
        Self {
            hash: None,
            metadata: ForwardMsgMetadata {
                delta_path: path,
                cacheable: false,
            },
            body: ForwardBody::Delta { delta, fragment_id },
        }
    }

    pub fn script_finished(status: ScriptFinishedStatus) -> Self {
        Self::new(ForwardBody::ScriptFinished { status })
    }

    pub fn status_changed(script_is_running: bool) -> Self {
        Self::new(ForwardBody::SessionStatusChanged { script_is_running })
    }

    pub fn is_delta(&self) -> bool {
        matches!(self.body, ForwardBody::Delta { .. })
    }

    pub fn is_new_element(&self) -> bool {
        matches!(
            self.body,
            ForwardBody::Delta {
                delta: Delta::NewElement { .. },
                ..
            }
        )
    }

    pub fn delta_path(&self) -> &[u32] {
        &self.metadata.delta_path
    }

    pub fn element(&self) -> Option<&Element> {
        match &self.body {
            ForwardBody::Delta {
                delta: Delta::NewElement { element },
                ..
            } => Some(element),
            _ => None,
        }
    }

    pub fn finished_status(&self) -> Option<ScriptFinishedStatus> {
        match &self.body {
            ForwardBody::ScriptFinished { status } => Some(*status),
            _ => None,
        }
    }

    /// Serialized bytes of the body; the part that content hashing covers.
    pub fn body_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.body)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum BackMsg {
    Rerun {
        #[serde(default)]
        controls: Option<ControlSnapshot>,
        #[serde(default)]
        fragment_id: Option<String>,
    },
    StopScript,
    ClearCache,
    AppHeartbeat,
}
