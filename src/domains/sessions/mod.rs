pub mod instance;
pub mod storage;
pub mod ticker;

pub use instance::{Instance, InstanceOptions, MAX_INSTANCES, MAX_TITLE_LEN, Status};
pub use storage::{InstanceRecord, Storage};
pub use ticker::{METADATA_TICK, PREVIEW_TICK, tick_instances};
