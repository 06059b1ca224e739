pub mod path;
pub mod semaphore;

pub use semaphore::{AdmissionPermit, HandleSemaphore};
