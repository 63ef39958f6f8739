pub mod authority;
pub mod storage;

pub use authority::{AuthorityError, PermissionAuthorityClient};
pub use storage::{BackendError, BackendRouter, StorageBackend};
