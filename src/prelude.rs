pub use crate::action::{ActionEvent, ActionGenerator, SiteSettings, TrackingRequest};
pub use crate::behavior::{BehaviorModel, BehaviorWeights, Weighted, WeightedTable};
pub use crate::config::{TrackloadConfiguration, TrackloadDefault, TrackloadDefaultType};
pub use crate::dispatcher::{
    DispatchError, DispatchResponse, Dispatcher, HttpDispatcher, RequestMethod,
};
pub use crate::metrics::{MetricsAggregator, MetricsSummary};
pub use crate::pacer::PacingProfile;
pub use crate::ramp::{RampPlan, Stage};
pub use crate::report::SimulationReport;
pub use crate::session::IdentityPolicy;
pub use crate::threshold::ThresholdRule;
pub use crate::{Simulation, TrackloadError};
