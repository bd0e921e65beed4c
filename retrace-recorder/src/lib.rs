//! Browser session recording
//!
//! A [`RecordingSession`] drives one page with an injected capture overlay,
//! turns what the user does into canonical [`Step`]s and persists them as a
//! [`RecordingFile`]. The [`normalizer`] converts raw capture logs offline.

pub mod bridge_event;
pub mod error;
pub mod events;
pub mod normalizer;
pub mod overlay;
pub mod recorder;
pub mod storage;

pub use bridge_event::{BridgeEvent, ControlAction};
pub use error::{RecorderError, Result};
pub use events::{
    CaptureEvent, CaptureKind, RecordingFile, Step, StepExpectation, StepKind, StepList,
};
pub use normalizer::{
    normalize, parse_session, prepare_builder_material, BuilderMaterial, Normalizer,
    VisualAttachment,
};
pub use overlay::{
    InputMode, InputRequest, Overlay, OverlayCommand, OverlayScript, OverlayStatus, PageOverlay,
};
pub use recorder::{
    RecorderConfig, RecordingSession, SessionEvent, SessionHandle, SessionPhase,
    SessionSnapshot, OVERLAY_LOG_LIMIT,
};
pub use storage::{load_capture_log, load_recording, RecordingStore};
