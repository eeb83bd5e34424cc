mod document;
mod outcome;

pub use document::{Acknowledgement, ReportDocument, ShadowDocument, StateMap};
pub use outcome::{ActuatorState, FaultCode, Outcome, ReconciliationResult};
