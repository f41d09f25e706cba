pub mod cache;
pub mod error;
pub mod id;
pub mod resolver;
pub mod store;
pub mod validator;

pub use cache::{CacheEntry, TenantCache, DEFAULT_TENANT_CACHE_TTL};
pub use error::TenantError;
pub use id::{TenantId, TenantRecord};
pub use resolver::{AuthenticatedPrincipal, Resolution, TenantResolver, TenantSource};
pub use store::{PgTenantStore, TenantStore};
pub use validator::TenantValidator;
