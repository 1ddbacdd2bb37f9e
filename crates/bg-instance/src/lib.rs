mod id;
mod meta;

pub use id::{IdError, InstanceId, InstanceName, ParsedInstanceId};
pub use meta::{ActiveMap, InstanceMeta, InstanceState, LaunchMode};
