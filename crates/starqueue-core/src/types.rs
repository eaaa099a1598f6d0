//! Shared types used across starqueue crates.
//!
//! A task is described by immutable [`TaskParameters`] plus the
//! [`DeviceBindings`] it was submitted with. Its mutable lifecycle lives in
//! [`TaskEntry`], which is what the record store persists.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unique identifier of a task, assigned at submission and never reused.
pub type TaskId = u64;

// ── Task state ─────────────────────────────────────────────────────

/// Lifecycle state of a task.
///
/// `Pending -> Executing -> {Failed, Cancelled, Complete}`, or
/// `Pending -> Cancelled` when a task is cancelled before it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Executing,
    Failed,
    Cancelled,
    Complete,
}

impl TaskState {
    pub const ALL: [TaskState; 5] = [
        TaskState::Pending,
        TaskState::Executing,
        TaskState::Failed,
        TaskState::Cancelled,
        TaskState::Complete,
    ];

    /// Terminal states are final: a row in one of them is never modified again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Failed | TaskState::Cancelled | TaskState::Complete
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Executing => "executing",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
            TaskState::Complete => "complete",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid task state name: {0}")]
pub struct ParseStateError(pub String);

impl FromStr for TaskState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ParseStateError(s.to_string()))
    }
}

// ── Parameters ─────────────────────────────────────────────────────

/// Kind of work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    Exposure,
    Dither,
    Sleep,
    Focus,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Exposure => "exposure",
            TaskType::Dither => "dither",
            TaskType::Sleep => "sleep",
            TaskType::Focus => "focus",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pixel coordinates of a rectangle origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImagePoint {
    pub x: u32,
    pub y: u32,
}

/// Width and height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

/// A rectangular region of the sensor or of a produced image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImageFrame {
    pub origin: ImagePoint,
    pub size: ImageSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binning {
    pub x: u32,
    pub y: u32,
}

impl Default for Binning {
    fn default() -> Self {
        Self { x: 1, y: 1 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shutter {
    #[default]
    Open,
    Closed,
}

/// What an exposure is taken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExposurePurpose {
    #[default]
    Light,
    Dark,
    Flat,
    Bias,
    Test,
    Guide,
    Focus,
    Flood,
    Preview,
}

/// Exposure configuration for a single image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Exposure {
    pub frame: ImageFrame,
    /// Exposure time in seconds.
    pub exposure_time: f64,
    pub gain: f64,
    /// Upper pixel value limit.
    pub limit: f64,
    pub binning: Binning,
    pub shutter: Shutter,
    pub purpose: ExposurePurpose,
}

impl Default for Exposure {
    fn default() -> Self {
        Self {
            frame: ImageFrame::default(),
            exposure_time: 1.0,
            gain: 1.0,
            limit: f64::MAX,
            binning: Binning::default(),
            shutter: Shutter::Open,
            purpose: ExposurePurpose::Light,
        }
    }
}

/// Immutable description of the work a task performs.
///
/// Device indices refer to the instrument's component list; `-1` means the
/// component is not used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskParameters {
    pub task_type: TaskType,
    pub instrument: String,
    pub camera_index: i32,
    pub ccd_index: i32,
    pub cooler_index: i32,
    /// Target CCD temperature in Kelvin, `None` leaves the cooler alone.
    pub ccd_temperature: Option<f64>,
    pub filterwheel_index: i32,
    pub filter: String,
    pub mount_index: i32,
    pub focuser_index: i32,
    pub exposure: Exposure,
    pub project: String,
    pub repository: String,
    pub repodb: String,
}

impl Default for TaskParameters {
    fn default() -> Self {
        Self {
            task_type: TaskType::Exposure,
            instrument: String::new(),
            camera_index: -1,
            ccd_index: -1,
            cooler_index: -1,
            ccd_temperature: None,
            filterwheel_index: -1,
            filter: String::new(),
            mount_index: -1,
            focuser_index: -1,
            exposure: Exposure::default(),
            project: String::new(),
            repository: String::new(),
            repodb: String::new(),
        }
    }
}

/// Names of the physical devices a task holds while it executes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceBindings {
    pub camera: Option<String>,
    pub ccd: Option<String>,
    pub cooler: Option<String>,
    pub filterwheel: Option<String>,
    pub mount: Option<String>,
    pub focuser: Option<String>,
}

impl DeviceBindings {
    /// Iterate over the bound (non-empty) device names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        [
            &self.camera,
            &self.ccd,
            &self.cooler,
            &self.filterwheel,
            &self.mount,
            &self.focuser,
        ]
        .into_iter()
        .filter_map(|name| name.as_deref())
        .filter(|name| !name.is_empty())
    }

    /// True when both bindings hold at least one device in common.
    pub fn conflicts_with(&self, other: &DeviceBindings) -> bool {
        self.names()
            .any(|mine| other.names().any(|theirs| theirs == mine))
    }
}

// ── Task entry ─────────────────────────────────────────────────────

/// Lifecycle snapshot of a task, as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub state: TaskState,
    /// Unix timestamp (seconds) of the last state change.
    pub lastchange: u64,
    pub cause: Option<String>,
    pub filename: Option<String>,
    pub frame: Option<ImageFrame>,
}

/// A persisted task row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub id: TaskId,
    pub parameters: TaskParameters,
    pub devices: DeviceBindings,
    pub state: TaskState,
    /// Unix timestamp (seconds) of the last state change.
    pub lastchange: u64,
    /// Failure or cancellation cause, only set on `failed`/`cancelled`.
    pub cause: Option<String>,
    /// Reference to the produced artifact, only set on `complete`.
    pub filename: Option<String>,
    /// Frame of the produced image, only set on `complete`.
    pub frame: Option<ImageFrame>,
}

impl TaskEntry {
    /// A fresh pending entry. The id is assigned by the record store.
    pub fn pending(parameters: TaskParameters, devices: DeviceBindings) -> Self {
        Self {
            id: 0,
            parameters,
            devices,
            state: TaskState::Pending,
            lastchange: epoch_secs(),
            cause: None,
            filename: None,
            frame: None,
        }
    }

    /// Move to `state` and stamp the change time.
    pub fn transition(&mut self, state: TaskState) {
        self.state = state;
        self.lastchange = epoch_secs();
    }

    /// Move to `failed` or `cancelled` with a cause.
    pub fn terminate(&mut self, state: TaskState, cause: impl Into<String>) {
        self.transition(state);
        self.cause = Some(cause.into());
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id,
            state: self.state,
            lastchange: self.lastchange,
            cause: self.cause.clone(),
            filename: self.filename.clone(),
            frame: self.frame,
        }
    }
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
