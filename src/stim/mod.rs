//! rTMS stimulation: protocol, field conversion, pulse scheduling and
//! application to an engine session.
//!
//! Flow: [`StimulationProtocol`] → [`PulseScheduler`] (using
//! [`FieldConverter`]) → [`PulseTrain`] → [`StimulationApplicator`] →
//! [`StimulusSet`].

pub mod apply;
pub mod field;
pub mod protocol;
pub mod schedule;

pub use apply::{InjectionSite, StimulationApplicator, StimulusSet};
pub use field::{Compartment, FieldConverter, SpatialField};
pub use protocol::{StimulationProtocol, TmsParams};
pub use schedule::{pulse_count, pulse_onsets, CurrentInjection, Pulse, PulseScheduler, PulseTrain};
