pub mod backend;
pub mod config;
pub mod context;
pub mod device;
pub mod err;
pub mod layout;
pub mod session;
pub mod transport;
pub mod util;

pub use backend::Backend;
pub use backend::ObjectStore;
pub use config::Config;
pub use config::ResavePolicy;

pub use context::Context;
pub use device::{connect_to_device, Device, DeviceAttributes, DeviceHandle, DeviceType};
pub use err::DeviceError;
pub use layout::{FileInfo, FileType, Handle};
