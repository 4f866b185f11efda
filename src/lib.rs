//! Sentinel Personal-Safety Core
//!
//! Detects falls and impacts from a phone's motion sensors and runs the
//! emergency response that follows: local alarms, a cancellable countdown,
//! then SMS to the user's emergency contacts with their location.
//!
//! # Design Philosophy
//!
//! - **Detection never stops for the response side**: the detection pipeline
//!   is synchronous and allocation-light; everything that can block (GPS, SMS)
//!   lives behind the responder, whose failures are caught at its boundary.
//! - **One owner for the emergency**: foreground and background contexts
//!   coordinate only through a shared `EmergencyCoordinator`, keyed by alert id.
//! - **No send after cancel**: the countdown and the cancel button race for a
//!   single compare-and-swap flag before the irreversible SMS step.
//! - **Degrade, don't crash**: a denied permission or dead actuator removes
//!   that capability and the rest of the workflow carries on.
//!
//! # Layout
//!
//! - Detection: [`signal`], [`fall_detection`], [`impact_detection`],
//!   [`pipeline`], [`monitor`]
//! - Response: [`coordinator`], [`responder`], [`alarms`], [`dispatch`],
//!   [`location`], [`contacts`], [`history`]
//! - Platform seams: [`capabilities`], [`store`], [`sim`], [`ffi`]
//!
//! # Example
//!
//! ```ignore
//! use sentinel_safety::pipeline::DetectionPipeline;
//! use sentinel_safety::types::SensorSample;
//!
//! let mut pipeline = DetectionPipeline::default();
//! let output = pipeline.process_sample(&SensorSample::new(0, [0.0, 0.0, 9.81], [0.0; 3]));
//! for event in output.events {
//!     println!("{event:?}");
//! }
//! ```

pub mod alarms;
pub mod capabilities;
pub mod config;
pub mod contacts;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod fall_detection;
pub mod ffi;
pub mod history;
pub mod impact_detection;
pub mod location;
pub mod monitor;
pub mod pipeline;
pub mod responder;
pub mod signal;
pub mod sim;
pub mod store;
pub mod types;


// Re-export commonly used types
pub use config::SentinelConfig;
pub use coordinator::EmergencyCoordinator;
pub use error::{SentinelError, SentinelResult};
pub use monitor::{Detection, MotionMonitor};
pub use pipeline::{DetectionConfig, DetectionPipeline};
pub use responder::{EmergencyResponder, ResponderParts, ResponseEvent, ResponsePhase};
pub use types::{
    Alert, AlertSeverity, AlertStatus, AlertType, DetectionEvent, EmergencyContact,
    SensorSample, SensorSnapshot, TriggerSource,
};
