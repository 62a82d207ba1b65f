// Activity classes
// Maps model output indices to the recorded activity protocol

use serde::{Deserialize, Serialize};

/// Number of classes the model emits
pub const CLASS_COUNT: usize = 5;

/// Activities from the collection protocol, in model output order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityClass {
    /// Standing still for 30 seconds
    Standing,

    /// Walking a 4 m loop
    Walking,

    /// Falling forward while trying to sit down
    FallForward,

    /// Falling backward while trying to sit down
    FallBackward,

    /// Falling sideways while trying to sit down
    FallSideways,
}

impl ActivityClass {
    pub const ALL: [ActivityClass; CLASS_COUNT] = [
        ActivityClass::Standing,
        ActivityClass::Walking,
        ActivityClass::FallForward,
        ActivityClass::FallBackward,
        ActivityClass::FallSideways,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(&self) -> usize {
        match self {
            ActivityClass::Standing => 0,
            ActivityClass::Walking => 1,
            ActivityClass::FallForward => 2,
            ActivityClass::FallBackward => 3,
            ActivityClass::FallSideways => 4,
        }
    }

    /// Stable label used in records and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityClass::Standing => "standing",
            ActivityClass::Walking => "walking",
            ActivityClass::FallForward => "fall_forward",
            ActivityClass::FallBackward => "fall_backward",
            ActivityClass::FallSideways => "fall_sideways",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == s)
    }

    /// Human-readable name for operator output
    pub fn display_name(&self) -> &'static str {
        match self {
            ActivityClass::Standing => "Standing (30 s)",
            ActivityClass::Walking => "Walking (4 m loop)",
            ActivityClass::FallForward => "Forward fall while sitting down",
            ActivityClass::FallBackward => "Backward fall while sitting down",
            ActivityClass::FallSideways => "Sideways fall while sitting down",
        }
    }

    pub fn is_fall(&self) -> bool {
        matches!(
            self,
            ActivityClass::FallForward | ActivityClass::FallBackward | ActivityClass::FallSideways
        )
    }

    /// Plain-text payload published on the alert topic
    pub fn alert_message(&self) -> &'static str {
        match self {
            ActivityClass::Standing => "Activity alert: standing detected",
            ActivityClass::Walking => "Activity alert: walking detected",
            ActivityClass::FallForward => "Fall detected: forward fall",
            ActivityClass::FallBackward => "Fall detected: backward fall",
            ActivityClass::FallSideways => "Fall detected: sideways fall",
        }
    }
}
