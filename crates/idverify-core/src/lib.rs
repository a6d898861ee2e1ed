//! idverify-core: live face-to-ID-card verification.
//!
//! Captures camera frames, requests feature extraction from an external
//! recognition engine, and compares the live feature against one extracted
//! from a reference (ID-card) image. All session state lives in
//! [`VerificationMachine`], which is driven from a single task by the
//! [`orchestrator`].

pub mod capture;
pub mod config;
pub mod engine;
pub mod geometry;
pub mod machine;
pub mod orchestrator;
pub mod overlay;
pub mod presentation;
pub mod reference;
pub mod timers;
pub mod tracker;
pub mod types;

pub use capture::{
    CameraDriver, CaptureError, CaptureEvent, CaptureListener, CaptureSource, DeviceInfo,
    FrameStream,
};
pub use config::{CaptureConfig, ConfigError, VerifyConfig};
pub use engine::{EngineError, EngineHandle, FaceEngine, FeatureResponse, Recognizer};
pub use geometry::{CaptureGeometry, Facing, Size};
pub use machine::{MachineSettings, MachineState, VerificationMachine};
pub use orchestrator::{Orchestrator, OrchestratorHandle};
pub use presentation::{Cue, PresentationSink, Prompt, Verdict};
pub use reference::{CardReader, ReaderLoop, ReferenceError, ReferenceSubject};
pub use timers::{Scheduler, TimerKind, TokioScheduler};
pub use tracker::{RequestStatus, RequestTracker};
pub use types::{DetectedFace, Feature, Image, PixelFormat, Rect, RequestTag, Subject, TrackId};
