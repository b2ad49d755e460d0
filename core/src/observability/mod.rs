//! Observability for the incident engine: structured logging setup and an
//! append-only audit log of rule changes and dispatched actions.

pub mod audit;
pub mod logging;


pub use audit::{AuditEvent, AuditEventType, AuditLog};
pub use logging::{init_logging, LoggingConfig};
