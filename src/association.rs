//! Association pipeline: control-plane client, document parser and processor.
pub mod http;
pub mod locks;
pub mod model;
pub mod parser;
pub mod processor;
pub mod service;
pub mod stop_policy;

pub use model::{AgentInfo, AssociationPage, AssociationRawData, AssociationStatus, UpdateStatusOutput};
pub use parser::{AssociationParser, CommandPayload, DocumentParser, ParseError};
pub use processor::{
    AssociationOutcome, AssociationResult, InstanceReport, ProcessError, Processor, ProcessorSettings, SweepStats,
    TickReport,
};
pub use service::{AssociationService, AssociationServiceType, ControlPlane, ServiceError};
pub use stop_policy::StopPolicy;
