//! `dynconf` core: cluster topology model, settings, configuration
//! expressions, change descriptors and validation.

pub mod configuration;
pub mod endpoint;
pub mod error;
pub mod model;
pub mod names;
pub mod nomad;
pub mod setting;
pub mod state;
pub mod uid;
pub mod validator;

pub use configuration::{apply_all, validate_all, AppliedConfigurations, ConfigScope, Configuration};
pub use endpoint::{join_endpoints, AddressGroup, Endpoint, HostPort};
pub use error::ModelError;
pub use model::{Authc, Cluster, FailoverPriority, LockContext, Node, NodeContext, Stripe};
pub use names::NameGenerator;
pub use nomad::{
    ChangeDetails, ChangeRequestState, DiscoverResponse, NomadChange, NomadChangeInfo, NomadServerMode,
};
pub use setting::{ClusterState, Operation, Requirement, Setting, SettingChange, SettingLevel, SettingTarget};
pub use state::LogicalServerState;
pub use uid::Uid;
pub use validator::ClusterValidator;
