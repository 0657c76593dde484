pub mod actions;
pub mod destination;
pub mod error;
pub mod fingerprint;
pub mod records;
pub mod resource;

pub use destination::{DestinationUrl, HandoffRequest, HandoffTarget, TransportScheme, ValidatedHandoff};
pub use error::{HandoffError, HandoffResult};
pub use fingerprint::BaseVmFingerprint;
pub use records::{
    CloudletType, ComputeNode, CreateServerRequest, FlavorRecord, FlavorSpec, HandoffDescriptor,
    ImageProperties, ImageRecord, ServerRecord, TaskState, VmState,
};
pub use resource::ResourceShape;
