pub mod tenant;

pub use tenant::{tenant_context_middleware, RequestTenantContext, TenantGate};
