// Windowing module
// Decides when buffered samples form a window and resamples them to a fixed grid

pub mod resample;
pub mod trigger;

pub use resample::{resample, Channel, ResampleError, TargetLength, Window, WindowRecord};
pub use trigger::{
    AfterDrain, DrainedWindow, StopAction, TriggerPolicy, TriggerReason, TriggerState, WindowTrigger,
};
